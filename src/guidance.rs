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

//! Combination of guidance branch predictions into one guided prediction.

use ndarray::{s, Array1, Array4, ArrayView4, Axis, Zip};

use crate::{util::blur::gaussian_blur, GuidanceLayout, Modifier, SamplerError};

const SHARPNESS_BLUR_SIGMA: f32 = 3.0;
const SHARPNESS_BLUR_SIZE: usize = 13;

/// Guidance strengths of one run.
#[derive(Debug, Clone, PartialEq)]
pub struct GuidanceScales {
	/// Text (classifier-free) guidance scale. `1.0` disables guidance.
	pub text: f32,
	/// Image guidance scale, used by instruction editing.
	pub image: f32,
	/// Guidance scale of the first video frame; later frames interpolate towards `text`.
	pub start_frame_cfg: f32,
	/// Blend factor of a blurred copy of the conditional prediction. `0.0` disables sharpening.
	pub sharpness: f32
}

impl Default for GuidanceScales {
	fn default() -> Self {
		Self {
			text: 7.5,
			image: 1.5,
			start_frame_cfg: 1.0,
			sharpness: 0.0
		}
	}
}

impl GuidanceScales {
	/// Sets the text guidance scale.
	pub fn with_text(mut self, text: f32) -> Self {
		self.text = text;
		self
	}

	/// Sets the image guidance scale.
	pub fn with_image(mut self, image: f32) -> Self {
		self.image = image;
		self
	}

	/// Sets the guidance scale of the first video frame.
	pub fn with_start_frame_cfg(mut self, start_frame_cfg: f32) -> Self {
		self.start_frame_cfg = start_frame_cfg;
		self
	}

	/// Sets the sharpness.
	pub fn with_sharpness(mut self, sharpness: f32) -> Self {
		self.sharpness = sharpness;
		self
	}
}

/// A guidance scale applied to every sample, or one per sample along the batch axis.
#[derive(Debug, Clone, PartialEq)]
pub enum GuidanceScale {
	/// Same scale for the whole batch.
	Scalar(f32),
	/// One scale per batch element.
	PerSample(Array1<f32>)
}

impl GuidanceScale {
	/// Scale of batch element `index`.
	pub fn at(&self, index: usize) -> f32 {
		match self {
			Self::Scalar(scale) => *scale,
			Self::PerSample(scales) => scales[index]
		}
	}
}

/// Image-to-video guidance: frame `i` of `frames` gets a scale linearly interpolated from `start_frame_cfg` (first
/// frame) to `text` (last frame).
pub fn per_frame_scales(frames: usize, text: f32, start_frame_cfg: f32) -> Array1<f32> {
	if frames <= 1 {
		return Array1::from_elem(frames, start_frame_cfg);
	}
	let step = (text - start_frame_cfg) / (frames - 1) as f32;
	Array1::from_shape_fn(frames, |i| start_frame_cfg + i as f32 * step)
}

/// Combines the batched branch predictions of each network call.
#[derive(Debug, Clone)]
pub struct GuidanceCompositor {
	modifier: Modifier,
	cfg_enabled: bool,
	batch_size: usize,
	scales: GuidanceScales,
	timesteps: f32
}

impl GuidanceCompositor {
	/// Creates a compositor for `layout`; `timesteps` is the schedule's total timestep count.
	pub fn new(layout: &GuidanceLayout, scales: GuidanceScales, timesteps: f32) -> Self {
		Self {
			modifier: layout.modifier,
			cfg_enabled: layout.cfg_enabled,
			batch_size: layout.batch_size,
			scales,
			timesteps
		}
	}

	/// The text guidance scale in effect, per frame for image-to-video.
	pub fn text_scale(&self) -> GuidanceScale {
		match self.modifier {
			Modifier::ImageToVideo => GuidanceScale::PerSample(per_frame_scales(self.batch_size, self.scales.text, self.scales.start_frame_cfg)),
			_ => GuidanceScale::Scalar(self.scales.text)
		}
	}

	/// Sharpening blend weight at `timestep`: `0.001 * sharpness * t / T`, reaching 0 at `t = 0`.
	pub fn sharpness_alpha(&self, timestep: f32) -> f32 {
		if self.scales.sharpness <= 0.0 {
			return 0.0;
		}
		0.001 * self.scales.sharpness * timestep.max(0.0) / self.timesteps
	}

	/// Blends `prediction` with its blurred copy, in place.
	pub fn sharpen(&self, prediction: &mut Array4<f32>, timestep: f32) {
		let alpha = self.sharpness_alpha(timestep);
		if alpha <= 0.0 {
			return;
		}
		let blurred = gaussian_blur(prediction.view(), SHARPNESS_BLUR_SIGMA, SHARPNESS_BLUR_SIZE);
		Zip::from(prediction).and(&blurred).par_for_each(|p, &b| *p = alpha * b + (1.0 - alpha) * *p);
	}

	/// Composes the output of a single network call over all stacked branches.
	///
	/// # Errors
	/// Returns [`SamplerError::InvalidConfiguration`] if `et` does not hold the expected number of branches.
	pub fn compose(&self, et: Array4<f32>, timestep: f32) -> Result<Array4<f32>, SamplerError> {
		let batch_size = self.batch_size;
		let branches = et.len_of(Axis(0)) / batch_size.max(1);
		let expected = match self.modifier {
			Modifier::Editing => 3,
			Modifier::ImageToVideo => 1,
			_ if self.cfg_enabled => 2,
			_ => 1
		};
		if branches != expected || et.len_of(Axis(0)) != expected * batch_size {
			return Err(SamplerError::invalid(format!(
				"denoiser returned batch {} but {expected} branches of {batch_size} were evaluated",
				et.len_of(Axis(0))
			)));
		}
		if expected == 1 {
			let mut et = et;
			self.sharpen(&mut et, timestep);
			return Ok(et);
		}

		let uncond = et.slice(s![..batch_size, .., .., ..]);
		let mut cond = et.slice(s![batch_size..batch_size * 2, .., .., ..]).to_owned();
		self.sharpen(&mut cond, timestep);
		if self.modifier == Modifier::Editing {
			let all_uncond = et.slice(s![batch_size * 2.., .., .., ..]);
			let (text, image) = (self.scales.text, self.scales.image);
			let mut guided = all_uncond.to_owned();
			Zip::from(&mut guided)
				.and(&cond)
				.and(&uncond)
				.par_for_each(|g, &c, &u| *g += text * (c - u) + image * (u - *g));
			Ok(guided)
		} else {
			Ok(guide(uncond, cond.view(), &GuidanceScale::Scalar(self.scales.text)))
		}
	}

	/// Composes predictions obtained from two separate network calls (image-to-video).
	pub fn compose_split(&self, mut cond: Array4<f32>, uncond: ArrayView4<'_, f32>, timestep: f32) -> Array4<f32> {
		self.sharpen(&mut cond, timestep);
		guide(uncond, cond.view(), &self.text_scale())
	}
}

/// `uncond + scale * (cond - uncond)`, with the scale chosen per batch element.
fn guide(uncond: ArrayView4<'_, f32>, cond: ArrayView4<'_, f32>, scale: &GuidanceScale) -> Array4<f32> {
	let mut guided = uncond.to_owned();
	for (i, (mut guided, cond)) in guided.outer_iter_mut().zip(cond.outer_iter()).enumerate() {
		let scale = scale.at(i);
		Zip::from(&mut guided).and(&cond).par_for_each(|g, &c| *g += scale * (c - *g));
	}
	guided
}

#[cfg(test)]
mod tests {
	use ndarray::{concatenate, Array4, Axis};

	use super::*;

	fn layout(modifier: Modifier, cfg_enabled: bool, batch_size: usize) -> GuidanceLayout {
		let scales = if cfg_enabled { GuidanceScales::default() } else { GuidanceScales::default().with_text(1.0) };
		GuidanceLayout::new(modifier, true, &scales, (batch_size, 4, 4, 2))
	}

	#[test]
	fn test_standard_cfg() {
		let compositor = GuidanceCompositor::new(&layout(Modifier::None, true, 1), GuidanceScales::default().with_text(3.0), 1000.0);
		let uncond = Array4::<f32>::from_elem((1, 4, 4, 2), 1.0);
		let cond = Array4::<f32>::from_elem((1, 4, 4, 2), 2.0);
		let et = concatenate(Axis(0), &[uncond.view(), cond.view()]).unwrap();
		let guided = compositor.compose(et, 500.0).unwrap();
		assert!(guided.iter().all(|&v| (v - 4.0).abs() < 1e-6));
	}

	#[test]
	fn test_editing_cfg() {
		let scales = GuidanceScales::default().with_text(2.0).with_image(1.5);
		let compositor = GuidanceCompositor::new(&layout(Modifier::Editing, true, 1), scales, 1000.0);
		let uncond = Array4::<f32>::from_elem((1, 4, 4, 2), 1.0);
		let cond = Array4::<f32>::from_elem((1, 4, 4, 2), 3.0);
		let all_uncond = Array4::<f32>::from_elem((1, 4, 4, 2), 0.5);
		let et = concatenate(Axis(0), &[uncond.view(), cond.view(), all_uncond.view()]).unwrap();
		let guided = compositor.compose(et, 500.0).unwrap();
		// 0.5 + 2 * (3 - 1) + 1.5 * (1 - 0.5)
		assert!(guided.iter().all(|&v| (v - 5.25).abs() < 1e-6));
	}

	#[test]
	fn test_wrong_branch_count() {
		let compositor = GuidanceCompositor::new(&layout(Modifier::None, true, 1), GuidanceScales::default(), 1000.0);
		assert!(compositor.compose(Array4::zeros((1, 4, 4, 2)), 0.0).is_err());
	}

	#[test]
	fn test_per_frame_scales() {
		let scales = per_frame_scales(5, 3.0, 1.0);
		assert_eq!(scales.to_vec(), vec![1.0, 1.5, 2.0, 2.5, 3.0]);
		assert_eq!(per_frame_scales(1, 3.0, 1.0).to_vec(), vec![1.0]);
	}

	#[test]
	fn test_video_split_composition() {
		let layout = GuidanceLayout::new(Modifier::ImageToVideo, true, &GuidanceScales::default(), (3, 2, 2, 2));
		let scales = GuidanceScales::default().with_text(3.0).with_start_frame_cfg(1.0);
		let compositor = GuidanceCompositor::new(&layout, scales, 1000.0);
		let cond = Array4::<f32>::from_elem((3, 2, 2, 2), 1.0);
		let uncond = Array4::<f32>::zeros((3, 2, 2, 2));
		let guided = compositor.compose_split(cond, uncond.view(), 0.0);
		assert_eq!(guided[[0, 0, 0, 0]], 1.0);
		assert_eq!(guided[[1, 0, 0, 0]], 2.0);
		assert_eq!(guided[[2, 1, 1, 1]], 3.0);
	}

	#[test]
	fn test_sharpness_alpha_decays() {
		let scales = GuidanceScales::default().with_sharpness(10.0);
		let compositor = GuidanceCompositor::new(&layout(Modifier::None, true, 1), scales, 1000.0);
		assert!((compositor.sharpness_alpha(1000.0) - 0.01).abs() < 1e-7);
		assert!((compositor.sharpness_alpha(500.0) - 0.005).abs() < 1e-7);
		assert_eq!(compositor.sharpness_alpha(0.0), 0.0);

		let off = GuidanceCompositor::new(&layout(Modifier::None, true, 1), GuidanceScales::default(), 1000.0);
		assert_eq!(off.sharpness_alpha(1000.0), 0.0);
	}

	#[test]
	fn test_sharpen_keeps_constant_prediction() {
		let scales = GuidanceScales::default().with_sharpness(100.0);
		let compositor = GuidanceCompositor::new(&layout(Modifier::None, false, 1), scales, 1000.0);
		let et = Array4::<f32>::from_elem((1, 4, 4, 2), 0.25);
		let guided = compositor.compose(et, 999.0).unwrap();
		assert!(guided.iter().all(|&v| (v - 0.25).abs() < 1e-6));
	}
}
