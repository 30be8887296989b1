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

//! Separable Gaussian low-pass filter over NHWC tensors.

use ndarray::{Array1, Array3, Array4, ArrayView3, ArrayView4, ArrayViewMut3, Zip};

/// A normalized 1-D Gaussian kernel of odd length `size`.
pub fn gaussian_kernel(sigma: f32, size: usize) -> Array1<f32> {
	assert!(size % 2 == 1, "blur kernel size must be odd");
	let radius = (size / 2) as f32;
	let mut kernel = Array1::from_shape_fn(size, |i| {
		let d = i as f32 - radius;
		(-(d * d) / (2.0 * sigma * sigma)).exp()
	});
	let sum = kernel.sum();
	kernel /= sum;
	kernel
}

/// Per-channel Gaussian blur, edges clamped. Batch elements are filtered in parallel.
pub fn gaussian_blur(input: ArrayView4<'_, f32>, sigma: f32, size: usize) -> Array4<f32> {
	let kernel = gaussian_kernel(sigma, size);
	let mut output = Array4::<f32>::zeros(input.raw_dim());
	Zip::from(output.outer_iter_mut())
		.and(input.outer_iter())
		.par_for_each(|out, image| blur_image(image, out, &kernel));
	output
}

fn blur_image(image: ArrayView3<'_, f32>, mut out: ArrayViewMut3<'_, f32>, kernel: &Array1<f32>) {
	let (height, width, channels) = image.dim();
	let radius = (kernel.len() / 2) as isize;
	let clamp = |v: isize, len: usize| v.clamp(0, len as isize - 1) as usize;

	let mut horizontal = Array3::<f32>::zeros((height, width, channels));
	for y in 0..height {
		for x in 0..width {
			for c in 0..channels {
				let mut acc = 0.0;
				for (k, w) in kernel.iter().enumerate() {
					let sx = clamp(x as isize + k as isize - radius, width);
					acc += w * image[[y, sx, c]];
				}
				horizontal[[y, x, c]] = acc;
			}
		}
	}
	for y in 0..height {
		for x in 0..width {
			for c in 0..channels {
				let mut acc = 0.0;
				for (k, w) in kernel.iter().enumerate() {
					let sy = clamp(y as isize + k as isize - radius, height);
					acc += w * horizontal[[sy, x, c]];
				}
				out[[y, x, c]] = acc;
			}
		}
	}
}
