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

use super::{alpha_cumprod_for, shift_normalized, sigma_for, Objective};

const EDM_TIMESTEPS: f64 = 1_000.0;

/// Variance-exploding schedule with noise levels spaced log-linearly between `sigma_min` and `sigma_max`.
#[derive(Debug, Clone)]
pub struct EdmDiscretization {
	/// The objective of the model trained on this schedule.
	pub objective: Objective,
	sigma_min: f64,
	sigma_max: f64
}

impl Default for EdmDiscretization {
	fn default() -> Self {
		Self {
			objective: Objective::Edm { sigma_data: 0.5 },
			sigma_min: 0.002,
			sigma_max: 80.0
		}
	}
}

impl EdmDiscretization {
	/// Creates a new schedule.
	///
	/// # Errors
	/// Can error if either bound is not a positive normal number, or if `sigma_min >= sigma_max`.
	pub fn new(sigma_min: f64, sigma_max: f64, objective: Objective) -> anyhow::Result<Self> {
		if !sigma_min.is_normal() || !sigma_max.is_normal() || sigma_min < 0.0 {
			anyhow::bail!("sigma_min ({sigma_min}) and sigma_max ({sigma_max}) must be positive normal numbers");
		}
		if sigma_min >= sigma_max {
			anyhow::bail!("sigma_min must be < sigma_max");
		}
		Ok(Self { objective, sigma_min, sigma_max })
	}

	/// The noise level range of this schedule.
	pub fn sigma_range(&self) -> (f64, f64) {
		(self.sigma_min, self.sigma_max)
	}

	pub(crate) fn timesteps(&self) -> f32 {
		EDM_TIMESTEPS as f32
	}

	fn log_range(&self) -> (f64, f64) {
		let low = self.sigma_min.ln();
		(low, self.sigma_max.ln() - low)
	}

	pub(crate) fn alphas_cumprod(&self, steps: usize, shift: f64) -> Vec<f64> {
		if steps == 1 {
			return vec![self.alpha_cumprod(EDM_TIMESTEPS as f32, shift)];
		}
		(0..steps)
			.map(|j| self.alpha_cumprod((j as f64 / (steps - 1) as f64 * EDM_TIMESTEPS) as f32, shift))
			.collect()
	}

	pub(crate) fn alpha_cumprod(&self, timestep: f32, shift: f64) -> f64 {
		let (low, range) = self.log_range();
		let u = shift_normalized((timestep as f64 / EDM_TIMESTEPS).clamp(0.0, 1.0), shift);
		alpha_cumprod_for((low + u * range).exp())
	}

	pub(crate) fn timestep(&self, alpha_cumprod: f64) -> f32 {
		let (low, range) = self.log_range();
		let u = (sigma_for(alpha_cumprod).ln() - low) / range;
		(u.clamp(0.0, 1.0) * EDM_TIMESTEPS) as f32
	}
}
