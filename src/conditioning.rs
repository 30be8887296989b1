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

//! Assembly of the per-step model input and of the batched guidance layout.
//!
//! Guidance branches are stacked along the batch axis in a fixed order: unconditional first, then conditional, then
//! (for instruction editing) all-unconditional. Conditioning tensors follow the same order.

use ndarray::{concatenate, s, Array4, ArrayD, ArrayView4, Axis, Slice};
use ndarray_rand::{rand_distr::Normal, RandomExt};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::{GuidanceScales, ModelVersion, SamplerError};

/// The task variant, which decides the input channel layout and the guidance branches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Modifier {
	/// Plain generation.
	None,
	/// Inpainting model: mask and masked image appended to the input.
	Inpainting,
	/// Depth-conditioned model: a depth map appended to the input.
	Depth,
	/// Instruction editing: a reference image appended, three guidance branches.
	Editing,
	/// Image-to-video: a conditioning frame appended to every frame.
	ImageToVideo
}

impl Default for Modifier {
	fn default() -> Self {
		Self::None
	}
}

impl Modifier {
	/// Channels of the model input for latents with `channels` channels.
	pub fn in_channels(&self, channels: usize) -> usize {
		match self {
			Self::None => channels,
			Self::Inpainting => channels * 2 + 1,
			Self::Depth => channels + 1,
			Self::Editing | Self::ImageToVideo => channels * 2
		}
	}
}

/// Opaque conditioning produced by the text/image encoders, batched as `[uncond; cond]` along axis 0.
#[derive(Debug, Clone, Default)]
pub struct Conditioning {
	/// Conditioning tensors. Rank-3 tensors are `(batch, tokens, features)`, rank-2 tensors `(batch, features)`.
	pub tensors: Vec<ArrayD<f32>>,
	/// Number of meaningful tokens in the unconditional half.
	pub token_length_uncond: usize,
	/// Number of meaningful tokens in the conditional half.
	pub token_length_cond: usize,
	/// Optional pooled projection, batched like the tensors.
	pub extra_projection: Option<ArrayD<f32>>
}

impl Conditioning {
	/// Wraps encoder output.
	pub fn new(tensors: Vec<ArrayD<f32>>, token_length_uncond: usize, token_length_cond: usize) -> Self {
		Self {
			tensors,
			token_length_uncond,
			token_length_cond,
			extra_projection: None
		}
	}

	/// Sets the pooled projection.
	pub fn with_extra_projection(mut self, extra_projection: ArrayD<f32>) -> Self {
		self.extra_projection = Some(extra_projection);
		self
	}

	/// Keeps only the conditional half of every tensor; rank-3 tensors are also cut to `token_length_cond` tokens
	/// unless `keep_all_tokens`. The pooled projection keeps all of its tokens. Afterwards there is no separate
	/// unconditional token length.
	pub(crate) fn conditional_half(&self, batch_size: usize, keep_all_tokens: bool) -> Result<Self, SamplerError> {
		let slice = |tensor: &ArrayD<f32>, limit_tokens: bool| -> Result<ArrayD<f32>, SamplerError> {
			if tensor.ndim() < 2 {
				return Ok(tensor.clone());
			}
			if tensor.shape()[0] < batch_size * 2 {
				return Err(SamplerError::invalid(format!(
					"conditioning batch ({}) must hold both guidance halves of {batch_size}",
					tensor.shape()[0]
				)));
			}
			let mut view = tensor.slice_axis(Axis(0), Slice::from(batch_size..batch_size * 2));
			if limit_tokens && view.ndim() == 3 {
				let tokens = self.token_length_cond.min(view.shape()[1]);
				view.slice_axis_inplace(Axis(1), Slice::from(0..tokens));
			}
			Ok(view.to_owned())
		};
		let tensors = self
			.tensors
			.iter()
			.map(|tensor| slice(tensor, !keep_all_tokens))
			.collect::<Result<Vec<_>, _>>()?;
		let extra_projection = self.extra_projection.as_ref().map(|p| slice(p, false)).transpose()?;
		Ok(Self {
			tensors,
			token_length_uncond: self.token_length_cond,
			token_length_cond: self.token_length_cond,
			extra_projection
		})
	}

	/// Appends the unconditional half of the first tensor once more, yielding `[uncond; cond; uncond]`.
	pub(crate) fn expanded_for_editing(&self, batch_size: usize) -> Result<Self, SamplerError> {
		let mut expanded = self.clone();
		if let Some(first) = expanded.tensors.first_mut() {
			if first.ndim() == 0 || first.shape()[0] < batch_size * 2 {
				return Err(SamplerError::invalid("editing requires conditioning with both guidance halves"));
			}
			let uncond = first.slice_axis(Axis(0), Slice::from(0..batch_size));
			*first = concatenate(Axis(0), &[first.view(), uncond])?;
		}
		Ok(expanded)
	}

	/// Splits image-to-video conditioning into the tensors of the conditional and the unconditional evaluation.
	pub(crate) fn split_video(tensors: &[ArrayD<f32>]) -> (Vec<ArrayD<f32>>, Vec<ArrayD<f32>>) {
		if tensors.is_empty() {
			return (Vec::new(), Vec::new());
		}
		let half = 1 + (tensors.len() - 1) / 2;
		let cond = tensors[..half].to_vec();
		let uncond = std::iter::once(tensors[0].clone()).chain(tensors[half..].iter().cloned()).collect();
		(cond, uncond)
	}
}

/// Whether classifier-free guidance changes the prediction at all for these scales.
pub fn is_cfg_enabled(modifier: Modifier, text_guidance_scale: f32, start_frame_cfg: f32) -> bool {
	match modifier {
		Modifier::Editing => true,
		Modifier::ImageToVideo => (text_guidance_scale - 1.0).abs() > f32::EPSILON || (start_frame_cfg - 1.0).abs() > f32::EPSILON,
		_ => (text_guidance_scale - 1.0).abs() > f32::EPSILON
	}
}

/// Shape of the batched model input for one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuidanceLayout {
	/// Task variant.
	pub modifier: Modifier,
	/// Whether more than the conditional branch is evaluated.
	pub cfg_enabled: bool,
	/// Number of branches stacked into one network call.
	pub cfg_channels: usize,
	/// Samples per branch.
	pub batch_size: usize,
	/// Latent height.
	pub height: usize,
	/// Latent width.
	pub width: usize,
	/// Latent channels.
	pub channels: usize,
	/// Channels of the model input.
	pub in_channels: usize
}

impl GuidanceLayout {
	/// Lays out the branches for latents of shape `(batch, height, width, channels)`.
	pub fn new(modifier: Modifier, classifier_free_guidance: bool, scales: &GuidanceScales, shape: (usize, usize, usize, usize)) -> Self {
		let (batch_size, height, width, channels) = shape;
		let cfg_enabled =
			modifier == Modifier::Editing || (classifier_free_guidance && is_cfg_enabled(modifier, scales.text, scales.start_frame_cfg));
		let cfg_channels = match modifier {
			Modifier::ImageToVideo => 1,
			Modifier::Editing => 3,
			_ if cfg_enabled => 2,
			_ => 1
		};
		Self {
			modifier,
			cfg_enabled,
			cfg_channels,
			batch_size,
			height,
			width,
			channels,
			in_channels: modifier.in_channels(channels)
		}
	}

	/// NHWC shape of the model input.
	pub fn input_shape(&self) -> [usize; 4] {
		[self.cfg_channels * self.batch_size, self.height, self.width, self.in_channels]
	}

	/// Applies CFG elision (or the editing expansion) to the encoder output. Runs once per sampling call.
	pub fn prepare_conditioning(&self, conditioning: &Conditioning, version: ModelVersion) -> Result<Conditioning, SamplerError> {
		match self.modifier {
			Modifier::ImageToVideo => Ok(conditioning.clone()),
			Modifier::Editing => conditioning.expanded_for_editing(self.batch_size),
			_ if !self.cfg_enabled => conditioning.conditional_half(self.batch_size, version == ModelVersion::Kandinsky21),
			_ => Ok(conditioning.clone())
		}
	}
}

/// Picks sample `index` of a tensor whose batch is either 1 (shared) or the full batch.
fn batch_item<'a>(tensor: &'a Array4<f32>, index: usize) -> ArrayView4<'a, f32> {
	let index = if tensor.shape()[0] == 1 { 0 } else { index };
	tensor.slice(s![index..index + 1, .., .., ..])
}

/// Owns the batched model input and keeps the modifier-specific channels in place between steps.
pub struct ConditioningAssembler {
	layout: GuidanceLayout,
	x_in: Array4<f32>,
	frames: Option<Array4<f32>>
}

impl ConditioningAssembler {
	/// Allocates the model input and writes the static extra channels.
	pub fn new(
		layout: &GuidanceLayout,
		masked_image: Option<&Array4<f32>>,
		depth_image: Option<&Array4<f32>>,
		mask: Option<&Array4<f32>>
	) -> Result<Self, SamplerError> {
		let [n, height, width, in_channels] = layout.input_shape();
		let mut x_in = Array4::<f32>::zeros((n, height, width, in_channels));
		let batch_size = layout.batch_size;
		let channels = layout.channels;
		let missing = |what: &str| SamplerError::invalid(format!("{:?} requires {what}", layout.modifier));
		match layout.modifier {
			Modifier::Inpainting => {
				let masked_image = masked_image.ok_or_else(|| missing("a masked image"))?;
				let mask = mask.ok_or_else(|| missing("a mask"))?;
				let branches = if layout.cfg_enabled { 2 } else { 1 };
				for branch in 0..branches {
					for i in 0..batch_size {
						let row = branch * batch_size + i;
						x_in.slice_mut(s![row..row + 1, .., .., channels..channels + 1]).assign(&batch_item(mask, i));
						x_in.slice_mut(s![row..row + 1, .., .., channels + 1..channels * 2 + 1])
							.assign(&batch_item(masked_image, i));
					}
				}
			}
			Modifier::Depth => {
				let depth_image = depth_image.ok_or_else(|| missing("a depth image"))?;
				let branches = if layout.cfg_enabled { 2 } else { 1 };
				for branch in 0..branches {
					for i in 0..batch_size {
						let row = branch * batch_size + i;
						x_in.slice_mut(s![row..row + 1, .., .., channels..channels + 1]).assign(&batch_item(depth_image, i));
					}
				}
			}
			Modifier::Editing => {
				let masked_image = masked_image.ok_or_else(|| missing("a reference image"))?;
				// the third branch keeps zeros in the reference channels
				for branch in 0..2 {
					for i in 0..batch_size {
						let row = branch * batch_size + i;
						x_in.slice_mut(s![row..row + 1, .., .., channels..channels * 2]).assign(&batch_item(masked_image, i));
					}
				}
			}
			Modifier::ImageToVideo => {
				masked_image.ok_or_else(|| missing("a conditioning frame"))?;
			}
			Modifier::None => ()
		}
		Ok(Self {
			layout: layout.clone(),
			x_in,
			frames: None
		})
	}

	/// Broadcasts the conditioning frame to every video frame, adding `N(0, cond_aug)` noise when positive.
	pub fn prepare_frames<R: Rng + ?Sized>(&mut self, masked_image: &Array4<f32>, cond_aug: f32, rng: &mut R) -> Result<(), SamplerError> {
		if self.layout.modifier != Modifier::ImageToVideo {
			return Ok(());
		}
		let shape = (self.layout.batch_size, self.layout.height, self.layout.width, self.layout.channels);
		let mut frames = Array4::<f32>::zeros(shape);
		for i in 0..self.layout.batch_size {
			frames.slice_mut(s![i..i + 1, .., .., ..]).assign(&batch_item(masked_image, i));
		}
		if cond_aug > 0.0 {
			let normal = Normal::new(0.0, cond_aug).map_err(|e| SamplerError::invalid(format!("cond_aug: {e}")))?;
			frames += &Array4::<f32>::random_using(shape, normal, rng);
		}
		self.frames = Some(frames);
		Ok(())
	}

	/// Writes the scaled sample into the latent channels of every branch.
	pub fn load(&mut self, input: &Array4<f32>) {
		let batch_size = self.layout.batch_size;
		let channels = self.layout.channels;
		for branch in 0..self.layout.cfg_channels {
			self.x_in
				.slice_mut(s![branch * batch_size..(branch + 1) * batch_size, .., .., ..channels])
				.assign(input);
		}
		self.show_frames(true);
	}

	/// For image-to-video, fills the frame channels with the conditioning frames (`true`) or zeros (`false`).
	pub fn show_frames(&mut self, visible: bool) {
		let channels = self.layout.channels;
		if let Some(frames) = &self.frames {
			let mut target = self.x_in.slice_mut(s![.., .., .., channels..channels * 2]);
			if visible {
				target.assign(frames);
			} else {
				target.fill(0.0);
			}
		}
	}

	/// The assembled model input.
	pub fn input(&self) -> ArrayView4<'_, f32> {
		self.x_in.view()
	}

	/// The layout this assembler was built for.
	pub fn layout(&self) -> &GuidanceLayout {
		&self.layout
	}
}
