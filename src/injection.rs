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

//! External conditioning injection: control adapters queried once per network call.

use ndarray::{ArrayD, ArrayView4, ArrayViewD, Zip};

use crate::{CompileShape, Conditioning, InjectionFlags, SamplerError};

/// What an adapter contributes to the denoiser invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControlKind {
	/// Residuals added to the denoiser's intermediate activations.
	ControlNet,
	/// Lightweight residuals added to the encoder blocks.
	T2IAdapter,
	/// Image embeddings appended to the attention context.
	IPAdapter
}

/// Hints merged from every adapter, grouped by kind.
#[derive(Debug, Clone, Default)]
pub struct InjectedHints {
	/// Summed ControlNet residuals, one tensor per injection point.
	pub controls: Vec<ArrayD<f32>>,
	/// Summed T2I-Adapter residuals, one tensor per injection point.
	pub t2i_adapters: Vec<ArrayD<f32>>,
	/// IP-Adapter embeddings, in adapter order.
	pub ip_adapters: Vec<ArrayD<f32>>
}

impl InjectedHints {
	/// Whether no adapter contributed anything.
	pub fn is_empty(&self) -> bool {
		self.controls.is_empty() && self.t2i_adapters.is_empty() && self.ip_adapters.is_empty()
	}

	/// Merges one adapter's output. Residuals of the same kind are summed element-wise; IP-Adapter embeddings are
	/// appended.
	///
	/// # Errors
	/// Returns [`SamplerError::InvalidConfiguration`] if residuals of the same kind disagree in count or shape.
	pub fn merge(&mut self, kind: ControlKind, hints: Vec<ArrayD<f32>>) -> Result<(), SamplerError> {
		let residuals = match kind {
			ControlKind::IPAdapter => {
				self.ip_adapters.extend(hints);
				return Ok(());
			}
			ControlKind::ControlNet => &mut self.controls,
			ControlKind::T2IAdapter => &mut self.t2i_adapters
		};
		if residuals.is_empty() {
			*residuals = hints;
			return Ok(());
		}
		if residuals.len() != hints.len() {
			return Err(SamplerError::invalid(format!("{kind:?} adapters disagree on injection points ({} vs {})", residuals.len(), hints.len())));
		}
		for (sum, hint) in residuals.iter_mut().zip(hints.iter()) {
			if sum.shape() != hint.shape() {
				return Err(SamplerError::invalid(format!("{kind:?} residual shapes differ: {:?} vs {:?}", sum.shape(), hint.shape())));
			}
			Zip::from(sum).and(hint).par_for_each(|s, &h| *s += h);
		}
		Ok(())
	}
}

/// What an adapter sees at each network call.
pub struct InjectionContext<'a> {
	/// Step index within the schedule.
	pub step: usize,
	/// Value the time embedding was computed from.
	pub timestep: f32,
	/// The assembled model input.
	pub input: ArrayView4<'a, f32>,
	/// Time embedding of the current call.
	pub time_embedding: ArrayViewD<'a, f32>,
	/// This adapter's hint tensors and their strengths.
	pub hints: &'a [(Vec<ArrayD<f32>>, f32)],
	/// This adapter's output of [`ControlAdapter::encode`].
	pub encoded: &'a [ArrayD<f32>],
	/// Compiled shape of the denoiser the hints are destined for.
	pub compiled_shape: Option<&'a CompileShape>
}

/// A ControlNet, T2I-Adapter or IP-Adapter style model.
///
/// Adapters never see the sample state, only the assembled input.
pub trait ControlAdapter {
	/// The kind of hints this adapter produces.
	fn kind(&self) -> ControlKind;

	/// Encodes conditioning once per run. Adapters that do not consume conditioning keep the default.
	fn encode(&mut self, conditioning: &Conditioning, hints: &[(Vec<ArrayD<f32>>, f32)], batch_size: usize) -> anyhow::Result<Vec<ArrayD<f32>>> {
		let _ = (conditioning, hints, batch_size);
		Ok(Vec::new())
	}

	/// Produces hints for one network call.
	fn hints(&mut self, context: &InjectionContext<'_>) -> anyhow::Result<Vec<ArrayD<f32>>>;
}

/// An adapter together with the hints it should be driven with.
pub struct InjectedControl<'a> {
	/// The adapter.
	pub adapter: &'a mut dyn ControlAdapter,
	/// Hint tensors (e.g. a preprocessed edge map) and their strengths.
	pub hints: Vec<(Vec<ArrayD<f32>>, f32)>
}

impl<'a> InjectedControl<'a> {
	/// Pairs an adapter with its hints.
	pub fn new(adapter: &'a mut dyn ControlAdapter, hints: Vec<(Vec<ArrayD<f32>>, f32)>) -> Self {
		Self { adapter, hints }
	}
}

/// Drives every configured adapter for one sampling run.
pub(crate) struct Injector<'a> {
	controls: Vec<InjectedControl<'a>>,
	encoded: Vec<Vec<ArrayD<f32>>>
}

impl<'a> Injector<'a> {
	pub(crate) fn new(controls: Vec<InjectedControl<'a>>) -> Self {
		Self { controls, encoded: Vec::new() }
	}

	/// Runs every adapter's encoder. Called once per run, before the first step.
	pub(crate) fn encode(&mut self, conditioning: &Conditioning, batch_size: usize) -> Result<(), SamplerError> {
		self.encoded = self
			.controls
			.iter_mut()
			.map(|control| control.adapter.encode(conditioning, &control.hints, batch_size))
			.collect::<anyhow::Result<Vec<_>>>()?;
		Ok(())
	}

	/// Hint kinds the denoiser must be compiled to accept, on top of `flags`.
	pub(crate) fn flags(&self, flags: &InjectionFlags) -> InjectionFlags {
		let mut flags = flags.clone();
		for (control, encoded) in self.controls.iter().zip(self.encoded.iter()) {
			match control.adapter.kind() {
				ControlKind::ControlNet => flags.controls = true,
				ControlKind::T2IAdapter => flags.t2i_adapters = true,
				ControlKind::IPAdapter => {
					for embedding in encoded {
						if embedding.ndim() == 3 && !flags.ip_adapter_lengths.contains(&embedding.shape()[1]) {
							flags.ip_adapter_lengths.push(embedding.shape()[1]);
						}
					}
				}
			}
		}
		flags
	}

	/// Queries every adapter and merges the results.
	pub(crate) fn collect(
		&mut self,
		step: usize,
		timestep: f32,
		input: ArrayView4<'_, f32>,
		time_embedding: ArrayViewD<'_, f32>,
		compiled_shape: Option<&CompileShape>
	) -> Result<InjectedHints, SamplerError> {
		let mut merged = InjectedHints::default();
		for (control, encoded) in self.controls.iter_mut().zip(self.encoded.iter()) {
			let context = InjectionContext {
				step,
				timestep,
				input: input.view(),
				time_embedding: time_embedding.view(),
				hints: &control.hints,
				encoded,
				compiled_shape
			};
			let hints = control.adapter.hints(&context)?;
			merged.merge(control.adapter.kind(), hints)?;
		}
		Ok(merged)
	}
}
