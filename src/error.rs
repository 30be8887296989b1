// Copyright 2022-2023 pyke.io
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// 	http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use thiserror::Error;

/// Why a sampling run stopped without a result.
///
/// Every variant is terminal for the call that produced it; the engine never retries.
#[derive(Debug, Error)]
pub enum SamplerError {
	/// A `NaN` was found in a denoised estimate or in the final sample.
	#[error("numerical divergence: NaN detected at step {step}")]
	NumericalDivergence {
		/// Schedule step at which the `NaN` was observed.
		step: usize
	},
	/// The progress callback asked to stop.
	#[error("sampling cancelled at step {step}")]
	Cancelled {
		/// Step index (relative to the start step) passed to the callback that returned `false`.
		step: usize
	},
	/// The inputs do not satisfy the requirements of the configured modifier or step range.
	#[error("invalid configuration: {0}")]
	InvalidConfiguration(String),
	/// The denoiser, an adapter, or another collaborator failed.
	#[error(transparent)]
	Denoiser(#[from] anyhow::Error),
	/// Tensors could not be combined.
	#[error(transparent)]
	Shape(#[from] ndarray::ShapeError)
}

impl SamplerError {
	/// Whether the run stopped because it was asked to, rather than because it failed.
	pub fn is_cancelled(&self) -> bool {
		matches!(self, Self::Cancelled { .. })
	}

	pub(crate) fn invalid(message: impl Into<String>) -> Self {
		Self::InvalidConfiguration(message.into())
	}
}
