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

//! Piecewise-linear interpolation over monotone tables, with a cached bracket for sequential lookups.

use ndarray::ArrayView1;
use num_traits::Float;

/// Remembers the last bracket found so that nearby lookups skip the binary search.
#[derive(Debug, Default, Clone)]
pub struct InterpolationAccelerator {
	cache: usize
}

pub(super) fn bsearch<F: Float>(xarr: &ArrayView1<'_, F>, x: F, idx_low: usize, idx_high: usize) -> usize {
	let mut ilow = idx_low;
	let mut ihigh = idx_high;

	while ihigh > ilow + 1 {
		let i = (ihigh + ilow) / 2;
		if xarr[i] > x {
			ihigh = i;
		} else {
			ilow = i;
		}
	}
	ilow
}

pub(super) fn accel_find<F: Float>(xarr: &ArrayView1<'_, F>, x: F, acc: &mut InterpolationAccelerator) -> usize {
	let xidx = acc.cache;

	if x < xarr[xidx] {
		acc.cache = bsearch(xarr, x, 0, xidx);
	} else if x >= xarr[xidx + 1] {
		acc.cache = bsearch(xarr, x, xidx, xarr.len() - 1);
	}
	acc.cache
}

/// Linear interpolator over a strictly increasing `x` table.
pub struct LinearInterpolatorAccelerated<'x, 'y, F: Float> {
	x: ArrayView1<'x, F>,
	y: ArrayView1<'y, F>,
	acc: InterpolationAccelerator
}

impl<'x, 'y, F: Float> LinearInterpolatorAccelerated<'x, 'y, F> {
	/// # Panics
	/// Panics if the tables differ in length or hold fewer than two points.
	pub fn new(x: ArrayView1<'x, F>, y: ArrayView1<'y, F>) -> Self {
		assert_eq!(x.len(), y.len(), "interpolation tables must have the same length");
		assert!(x.len() >= 2, "interpolation needs at least two points");
		Self {
			x,
			y,
			acc: InterpolationAccelerator::default()
		}
	}

	fn accel_find(&mut self, x: F) -> usize {
		accel_find(&self.x, x, &mut self.acc)
	}

	/// Evaluates the interpolant at `x`, returning `NaN` outside of the table.
	pub fn eval(&mut self, x: F) -> F {
		if x < self.x[0] || x > self.x[self.x.len() - 1] {
			return F::nan();
		}

		let idx = self.accel_find(x);

		let x_l = self.x[idx];
		let x_h = self.x[idx + 1];
		let y_l = self.y[idx];
		let y_h = self.y[idx + 1];
		let dx = x_h - x_l;
		if dx > F::zero() { y_l + (x - x_l) / dx * (y_h - y_l) } else { F::nan() }
	}

	/// Evaluates the interpolant at `x`, holding the end values outside of the table.
	pub fn eval_clamped(&mut self, x: F) -> F {
		let last = self.x.len() - 1;
		if x <= self.x[0] {
			self.y[0]
		} else if x >= self.x[last] {
			self.y[last]
		} else {
			self.eval(x)
		}
	}
}
