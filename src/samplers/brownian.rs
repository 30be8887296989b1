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

use ndarray::{Array4, Zip};
use ndarray_rand::{rand_distr::StandardNormal, RandomExt};
use rand::Rng;

/// A Brownian motion over noise levels, observed lazily.
///
/// `value` holds `W(at)`, the accumulated increment from noise level 0 up to `at`. Moving the observation point to
/// a lower level `to` samples `W(to)` from the Brownian bridge between `W(0) = 0` and `W(at)`, so successive
/// observations stay consistent with one continuous path instead of being independent draws.
#[derive(Debug, Clone)]
pub struct BrownianPath {
	value: Array4<f32>,
	at: f64
}

impl BrownianPath {
	/// Draws a standard normal path state with the shape of `shape`, anchored at noise level 1.
	pub fn new<R: Rng + ?Sized>(shape: (usize, usize, usize, usize), rng: &mut R) -> Self {
		Self {
			value: Array4::<f32>::random_using(shape, StandardNormal, rng),
			at: 1.0
		}
	}

	/// Re-anchors the standard normal state at noise level `sigma`, scaling it by `sqrt(sigma)`.
	pub fn anchor(&mut self, sigma: f64) {
		let scale = (sigma / self.at).sqrt() as f32;
		self.value.par_map_inplace(|v| *v *= scale);
		self.at = sigma;
	}

	/// Noise level of the current observation.
	pub fn at(&self) -> f64 {
		self.at
	}

	/// The current observation `W(at)`.
	pub fn value(&self) -> &Array4<f32> {
		&self.value
	}

	/// Splits the path at `to < at` and moves the observation there. Returns the right increment `W(at) - W(to)`.
	///
	/// `W(to) = (to / at) * W(at) + sqrt((at - to) * to / at) * z` with fresh standard normal `z`.
	/// Targets outside `[0, at]` are clamped into it.
	pub fn bridge<R: Rng + ?Sized>(&mut self, to: f64, rng: &mut R) -> Array4<f32> {
		let to = to.max(0.0).min(self.at);
		let left_over_h = if self.at > 0.0 { to / self.at } else { 0.0 };
		let spread = ((self.at - to) * left_over_h).sqrt() as f32;
		let left_over_h = left_over_h as f32;
		let z = Array4::<f32>::random_using(self.value.raw_dim(), StandardNormal, rng);
		let mut right = Array4::<f32>::zeros(self.value.raw_dim());
		Zip::from(&mut right).and(&mut self.value).and(&z).par_for_each(|right, value, &z| {
			let left = left_over_h * *value + spread * z;
			*right = *value - left;
			*value = left;
		});
		self.at = to;
		right
	}
}
