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

use ndarray::Array1;
use serde::{Deserialize, Serialize};

use super::{alpha_cumprod_for, shift_normalized, sigma_for, Objective};
use crate::util::interpolation::LinearInterpolatorAccelerated;

/// How the training betas are spaced between `linear_start` and `linear_end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DdpmLinspace {
	/// Betas are spaced linearly.
	LinearWrtBeta,
	/// `sqrt(beta)` is spaced linearly (the "scaled linear" schedule of Stable Diffusion).
	LinearWrtSigma
}

/// Variance-preserving schedule backed by a trained beta table.
///
/// Lookups interpolate `ln(sigma)` linearly between integral training timesteps, in both directions, so that
/// [`DdpmDiscretization::timestep`] is the exact inverse of [`DdpmDiscretization::alpha_cumprod`] without shift.
#[derive(Debug, Clone)]
pub struct DdpmDiscretization {
	/// The objective of the model trained on this schedule.
	pub objective: Objective,
	linear_start: f64,
	linear_end: f64,
	linspace: DdpmLinspace,
	train_timesteps: Array1<f64>,
	log_sigmas: Array1<f64>
}

impl Default for DdpmDiscretization {
	fn default() -> Self {
		Self::stable_diffusion(Objective::Epsilon)
	}
}

impl DdpmDiscretization {
	/// Creates a new schedule.
	///
	/// # Errors
	/// Can error if:
	/// - `timesteps` is less than 2
	/// - `linear_start` or `linear_end` are not normal numbers (not zero, infinite, `NaN`, or subnormal)
	/// - `linear_end` is less than or equal to `linear_start`, or is not below 1
	pub fn new(linear_start: f64, linear_end: f64, timesteps: usize, linspace: DdpmLinspace, objective: Objective) -> anyhow::Result<Self> {
		if timesteps < 2 {
			anyhow::bail!("timesteps ({timesteps}) must be >1");
		}
		if !linear_start.is_normal() || !linear_end.is_normal() {
			anyhow::bail!("linear_start ({linear_start}) and linear_end ({linear_end}) must be normal (not zero, infinite, NaN, or subnormal)");
		}
		if linear_start >= linear_end || linear_end >= 1.0 {
			anyhow::bail!("linear_start must be < linear_end < 1");
		}

		let betas = match linspace {
			DdpmLinspace::LinearWrtBeta => Array1::linspace(linear_start, linear_end, timesteps),
			DdpmLinspace::LinearWrtSigma => {
				let mut betas = Array1::linspace(linear_start.sqrt(), linear_end.sqrt(), timesteps);
				betas.par_map_inplace(|f| *f = f.powi(2));
				betas
			}
		};

		let log_sigmas = betas
			.iter()
			.scan(1.0, |prod, beta| {
				*prod *= 1.0 - *beta;
				Some(*prod)
			})
			.map(|alpha_cumprod| sigma_for(alpha_cumprod).ln())
			.collect::<Array1<f64>>();
		let train_timesteps = Array1::range(0.0, timesteps as f64, 1.0);

		Ok(Self {
			objective,
			linear_start,
			linear_end,
			linspace,
			train_timesteps,
			log_sigmas
		})
	}

	/// The Stable Diffusion v1/v2/XL schedule: scaled linear betas from 0.00085 to 0.012 over 1000 timesteps.
	pub fn stable_diffusion(objective: Objective) -> Self {
		Self::new(0.00085, 0.012, 1000, DdpmLinspace::LinearWrtSigma, objective).expect("constant schedule parameters are valid")
	}

	/// Beta range and spacing this schedule was built from.
	pub fn parameters(&self) -> (f64, f64, DdpmLinspace) {
		(self.linear_start, self.linear_end, self.linspace)
	}

	pub(crate) fn timesteps(&self) -> f32 {
		self.train_timesteps.len() as f32
	}

	fn last_timestep(&self) -> f64 {
		(self.train_timesteps.len() - 1) as f64
	}

	pub(crate) fn alphas_cumprod(&self, steps: usize, shift: f64) -> Vec<f64> {
		let last = self.last_timestep();
		(0..steps)
			.map(|j| self.alpha_cumprod(((j + 1) as f64 * last / steps as f64) as f32, shift))
			.collect()
	}

	pub(crate) fn alpha_cumprod(&self, timestep: f32, shift: f64) -> f64 {
		let last = self.last_timestep();
		let u = (timestep as f64 / last).clamp(0.0, 1.0);
		let timestep = shift_normalized(u, shift) * last;
		let mut interpolator = LinearInterpolatorAccelerated::new(self.train_timesteps.view(), self.log_sigmas.view());
		alpha_cumprod_for(interpolator.eval_clamped(timestep).exp())
	}

	pub(crate) fn timestep(&self, alpha_cumprod: f64) -> f32 {
		let log_sigma = sigma_for(alpha_cumprod).ln();
		let mut interpolator = LinearInterpolatorAccelerated::new(self.log_sigmas.view(), self.train_timesteps.view());
		interpolator.eval_clamped(log_sigma) as f32
	}
}
