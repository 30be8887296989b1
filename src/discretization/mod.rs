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

//! Noise schedules: conversions between step index, timestep, and noise level.
//!
//! Every schedule point is expressed as an `alphaCumprod` value `a`, the cumulative signal-retention fraction. The
//! noise level follows as `sigma = sqrt((1 - a) / a)`. Two families are provided:
//! * [`DdpmDiscretization`]: variance-preserving, backed by a trained beta table.
//! * [`EdmDiscretization`]: variance-exploding, log-linear between `sigma_min` and `sigma_max`.

use serde::{Deserialize, Serialize};

mod ddpm;
mod edm;

pub use self::ddpm::{DdpmDiscretization, DdpmLinspace};
pub use self::edm::EdmDiscretization;

/// What the denoiser is trained to predict. Fixed by the model, never by the sampler.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Objective {
	/// Noise prediction.
	Epsilon,
	/// Velocity prediction.
	V,
	/// EDM preconditioned target.
	#[serde(rename_all = "kebab-case")]
	Edm {
		/// Standard deviation of the data distribution.
		sigma_data: f64
	}
}

impl Default for Objective {
	fn default() -> Self {
		Self::Epsilon
	}
}

/// The value a denoiser's time embedding is computed from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TimestepConditioning {
	/// The schedule timestep, `0..timesteps`.
	Timestep,
	/// The discretization's noise value (`0.25 * ln(sigma)` for EDM models).
	Noise
}

impl Default for TimestepConditioning {
	fn default() -> Self {
		Self::Timestep
	}
}

/// Step count and schedule warping for one sampling run.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sampling {
	/// Number of schedule steps.
	pub steps: usize,
	/// Timestep warping factor; `1.0` leaves the schedule untouched.
	pub shift: f64
}

impl Sampling {
	/// A run of `steps` steps without schedule warping.
	pub fn new(steps: usize) -> Self {
		Self { steps, shift: 1.0 }
	}

	/// Sets the timestep warping factor.
	pub fn with_shift(mut self, shift: f64) -> Self {
		self.shift = shift;
		self
	}
}

impl Default for Sampling {
	fn default() -> Self {
		Self::new(20)
	}
}

/// Noise level for a given `alphaCumprod`.
#[inline]
pub fn sigma_for(alpha_cumprod: f64) -> f64 {
	((1.0 - alpha_cumprod) / alpha_cumprod).sqrt()
}

/// `alphaCumprod` for a given noise level.
#[inline]
pub fn alpha_cumprod_for(sigma: f64) -> f64 {
	1.0 / (sigma * sigma + 1.0)
}

/// Warps a normalized timestep `u` in `[0, 1]`, keeping both ends fixed.
#[inline]
pub(crate) fn shift_normalized(u: f64, shift: f64) -> f64 {
	if shift == 1.0 { u } else { shift * u / (1.0 + (shift - 1.0) * u) }
}

/// A noise schedule.
#[derive(Debug, Clone)]
pub enum Discretization {
	/// Variance-preserving schedule.
	Ddpm(DdpmDiscretization),
	/// Variance-exploding schedule.
	Edm(EdmDiscretization)
}

impl Default for Discretization {
	fn default() -> Self {
		Self::Ddpm(DdpmDiscretization::default())
	}
}

impl Discretization {
	/// Total schedule timesteps.
	pub fn timesteps(&self) -> f32 {
		match self {
			Self::Ddpm(d) => d.timesteps(),
			Self::Edm(d) => d.timesteps()
		}
	}

	/// The objective of the model this schedule belongs to.
	pub fn objective(&self) -> Objective {
		match self {
			Self::Ddpm(d) => d.objective,
			Self::Edm(d) => d.objective
		}
	}

	/// Returns `steps` grid points, strictly decreasing: index 0 is the least noisy point, index `steps - 1` the
	/// noisiest.
	///
	/// # Panics
	/// Panics if `steps` is 0.
	pub fn alphas_cumprod(&self, steps: usize, shift: f64) -> Vec<f64> {
		assert!(steps > 0, "a schedule needs at least one step");
		match self {
			Self::Ddpm(d) => d.alphas_cumprod(steps, shift),
			Self::Edm(d) => d.alphas_cumprod(steps, shift)
		}
	}

	/// The grid in sampling order (noisiest first), terminated by the clean point `alphaCumprod = 1`. Has
	/// `steps + 1` entries.
	pub fn schedule(&self, steps: usize, shift: f64) -> Vec<f64> {
		let mut schedule = self.alphas_cumprod(steps, shift);
		schedule.reverse();
		schedule.push(1.0);
		schedule
	}

	/// Noise levels of [`Discretization::schedule`], strictly decreasing to 0.
	pub fn sigmas(&self, steps: usize, shift: f64) -> Vec<f64> {
		self.schedule(steps, shift).into_iter().map(sigma_for).collect()
	}

	/// The (fractional) timestep at which the schedule reaches `alpha_cumprod`.
	pub fn timestep(&self, alpha_cumprod: f64) -> f32 {
		match self {
			Self::Ddpm(d) => d.timestep(alpha_cumprod),
			Self::Edm(d) => d.timestep(alpha_cumprod)
		}
	}

	/// The `alphaCumprod` reached at `timestep`, after warping the timestep by `shift`.
	pub fn alpha_cumprod(&self, timestep: f32, shift: f64) -> f64 {
		match self {
			Self::Ddpm(d) => d.alpha_cumprod(timestep, shift),
			Self::Edm(d) => d.alpha_cumprod(timestep, shift)
		}
	}

	/// The value fed to models conditioned on [`TimestepConditioning::Noise`].
	pub fn noise(&self, alpha_cumprod: f64) -> f32 {
		match self {
			Self::Ddpm(d) => d.timestep(alpha_cumprod),
			Self::Edm(_) => (0.25 * sigma_for(alpha_cumprod).ln()) as f32
		}
	}
}
