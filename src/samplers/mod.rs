//! Samplers drive a [`Denoiser`] from noise to a sample.
//!
//! A sampler owns the schedule math and the loop; everything model specific (the network, its encoders, the control
//! adapters) is supplied per call through [`SampleInputs`].

use ndarray::Array4;
use rand::Rng;

use crate::{Conditioning, Denoiser, GuidanceScales, InjectedControl, Modifier, Sampling, SamplerError};

mod brownian;
mod refiner;

pub use self::brownian::BrownianPath;
pub use self::refiner::{ActiveModel, ModelStage, Refiner};

cfg_if::cfg_if! {
	if #[cfg(feature = "sampler-dpmpp-sde")] {
		mod dpmpp_sde;
		pub use self::dpmpp_sde::*;
	}
}

/// A (possibly fractional) position in the schedule.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepPosition {
	/// `floor(fractional)`.
	pub integral: usize,
	/// Exact position.
	pub fractional: f32
}

impl StepPosition {
	/// The first step of a text-to-image run.
	pub fn start() -> Self {
		Self { integral: 0, fractional: 0.0 }
	}

	/// One past the last step of a run of `steps` steps.
	pub fn end(steps: usize) -> Self {
		Self {
			integral: steps,
			fractional: steps as f32
		}
	}

	/// The position `fractional`, e.g. from [`StrengthTimestep::start_step`].
	pub fn at(fractional: f32) -> Self {
		Self {
			integral: fractional.max(0.0).floor() as usize,
			fractional: fractional.max(0.0)
		}
	}

	pub(crate) fn is_integral(&self) -> bool {
		self.integral as f32 == self.fractional
	}
}

/// Where an image-to-image run of a given strength enters the schedule.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StrengthTimestep {
	/// Timestep the initial sample should be noised to.
	pub timestep: f32,
	/// Fractional start step.
	pub start_step: f32,
	/// Last schedule step at or before `start_step`.
	pub rounded_down_start_step: usize,
	/// First schedule step at or after `start_step`.
	pub rounded_up_start_step: usize
}

/// Per-call inputs of [`Sampler::sample`].
pub struct SampleInputs<'a, D> {
	/// Encoder output, batched `[uncond; cond]`.
	pub conditioning: &'a Conditioning,
	/// Image-to-image source the masked area is re-noised from.
	pub sample: Option<&'a Array4<f32>>,
	/// Masked image (inpainting), reference image (editing) or conditioning frame (image-to-video).
	pub masked_image: Option<&'a Array4<f32>>,
	/// Depth map, one channel.
	pub depth_image: Option<&'a Array4<f32>>,
	/// One channel; 1 keeps the generated content, 0 keeps `sample`.
	pub mask: Option<&'a Array4<f32>>,
	/// Complement of `mask`; `1 - mask` when absent.
	pub neg_mask: Option<&'a Array4<f32>>,
	/// Control adapters and their hints.
	pub injected_controls: Vec<InjectedControl<'a>>,
	/// Guidance strengths.
	pub guidance: GuidanceScales,
	/// First step to run.
	pub start_step: StepPosition,
	/// One past the last step to run.
	pub end_step: StepPosition,
	/// Step count and shift.
	pub sampling: Sampling,
	/// Refiner taking over the tail of the schedule.
	pub refiner: Option<Refiner<'a, D>>,
	/// Standard deviation of the noise added to image-to-video conditioning frames.
	pub cond_aug: f32
}

impl<'a, D: Denoiser> SampleInputs<'a, D> {
	/// Inputs for a full text-to-image run over `sampling`.
	pub fn new(conditioning: &'a Conditioning, sampling: Sampling) -> Self {
		Self {
			conditioning,
			sample: None,
			masked_image: None,
			depth_image: None,
			mask: None,
			neg_mask: None,
			injected_controls: Vec::new(),
			guidance: GuidanceScales::default(),
			start_step: StepPosition::start(),
			end_step: StepPosition::end(sampling.steps),
			sampling,
			refiner: None,
			cond_aug: 0.0
		}
	}

	/// Sets the guidance strengths.
	pub fn with_guidance(mut self, guidance: GuidanceScales) -> Self {
		self.guidance = guidance;
		self
	}

	/// Runs only `start..end`.
	pub fn with_steps(mut self, start: StepPosition, end: StepPosition) -> Self {
		self.start_step = start;
		self.end_step = end;
		self
	}

	/// Blends `sample` back in wherever `mask` is 0, before every step but the last.
	pub fn with_sample(mut self, sample: &'a Array4<f32>, mask: &'a Array4<f32>) -> Self {
		self.sample = Some(sample);
		self.mask = Some(mask);
		self
	}

	/// Overrides the `1 - mask` default.
	pub fn with_neg_mask(mut self, neg_mask: &'a Array4<f32>) -> Self {
		self.neg_mask = Some(neg_mask);
		self
	}

	/// Sets the inpainting mask without image-to-image blending.
	pub fn with_mask(mut self, mask: &'a Array4<f32>) -> Self {
		self.mask = Some(mask);
		self
	}

	/// Sets the masked image, reference image or conditioning frame.
	pub fn with_masked_image(mut self, masked_image: &'a Array4<f32>) -> Self {
		self.masked_image = Some(masked_image);
		self
	}

	/// Sets the depth map.
	pub fn with_depth_image(mut self, depth_image: &'a Array4<f32>) -> Self {
		self.depth_image = Some(depth_image);
		self
	}

	/// Adds a control adapter.
	pub fn with_control(mut self, control: InjectedControl<'a>) -> Self {
		self.injected_controls.push(control);
		self
	}

	/// Hands the tail of the schedule to `refiner`.
	pub fn with_refiner(mut self, refiner: Refiner<'a, D>) -> Self {
		self.refiner = Some(refiner);
		self
	}

	/// Sets the conditioning frame noise of image-to-video runs.
	pub fn with_cond_aug(mut self, cond_aug: f32) -> Self {
		self.cond_aug = cond_aug;
		self
	}

	/// Checks the inputs against `modifier` and the latent shape before any network work.
	pub(crate) fn validate(&self, modifier: Modifier, shape: (usize, usize, usize, usize)) -> Result<(), SamplerError> {
		let (batch_size, height, width, channels) = shape;
		if self.sampling.steps == 0 {
			return Err(SamplerError::invalid("sampling needs at least one step"));
		}
		if !(self.sampling.shift.is_finite() && self.sampling.shift > 0.0) {
			return Err(SamplerError::invalid(format!("shift {} must be a positive finite number", self.sampling.shift)));
		}
		if !(self.start_step.integral <= self.end_step.integral && self.end_step.integral <= self.sampling.steps) {
			return Err(SamplerError::invalid(format!(
				"step range {}..{} does not fit a schedule of {} steps",
				self.start_step.integral, self.end_step.integral, self.sampling.steps
			)));
		}
		if self.start_step.fractional < self.start_step.integral as f32 || self.start_step.fractional >= self.start_step.integral as f32 + 1.0 {
			return Err(SamplerError::invalid(format!(
				"start step {} is not the floor of {}",
				self.start_step.integral, self.start_step.fractional
			)));
		}
		if let Some(refiner) = &self.refiner {
			if !(0.0..=1.0).contains(&refiner.start) {
				return Err(SamplerError::invalid(format!("refiner start {} is not a fraction", refiner.start)));
			}
		}

		let require = |tensor: Option<&Array4<f32>>, what: &str| {
			tensor.map(|_| ()).ok_or_else(|| SamplerError::invalid(format!("{modifier:?} requires {what}")))
		};
		match modifier {
			Modifier::Inpainting => {
				require(self.masked_image, "a masked image")?;
				require(self.mask, "a mask")?;
			}
			Modifier::Editing => require(self.masked_image, "a reference image")?,
			Modifier::ImageToVideo => require(self.masked_image, "a conditioning frame")?,
			Modifier::Depth => require(self.depth_image, "a depth image")?,
			Modifier::None => ()
		}

		let check = |tensor: Option<&Array4<f32>>, what: &str, expected_channels: usize| -> Result<(), SamplerError> {
			let Some(tensor) = tensor else { return Ok(()) };
			let (b, h, w, c) = tensor.dim();
			if (b != 1 && b != batch_size) || h != height || w != width || c != expected_channels {
				return Err(SamplerError::invalid(format!(
					"{what} has shape {:?}, expected ({batch_size} or 1, {height}, {width}, {expected_channels})",
					tensor.shape()
				)));
			}
			Ok(())
		};
		check(self.masked_image, "masked image", channels)?;
		check(self.depth_image, "depth image", 1)?;
		check(self.mask, "mask", 1)?;
		check(self.neg_mask, "negative mask", 1)?;
		if let Some(sample) = self.sample {
			if sample.dim() != shape {
				return Err(SamplerError::invalid(format!("sample has shape {:?}, expected {:?}", sample.shape(), shape)));
			}
		}
		Ok(())
	}
}

/// The result of a sampling run.
#[derive(Debug, Clone)]
pub struct SamplerOutput {
	/// The final sample.
	pub x: Array4<f32>,
	/// Which model ran which steps.
	pub stages: Vec<ModelStage>
}

/// A diffusion sampler.
pub trait Sampler<D: Denoiser> {
	/// Runs the sampler from `x_t` (standard normal noise, or a noised image for image-to-image).
	///
	/// `feedback` is called exactly once per step with the step index relative to the start step and, when one was
	/// decoded, a preview of the previous denoised estimate. Returning `false` cancels the run.
	///
	/// # Errors
	/// See [`SamplerError`].
	fn sample<R, F>(
		&self,
		x_t: Array4<f32>,
		denoiser: &mut D,
		inputs: SampleInputs<'_, D>,
		rng: &mut R,
		feedback: F
	) -> Result<SamplerOutput, SamplerError>
	where
		R: Rng + ?Sized,
		F: FnMut(usize, Option<&Array4<f32>>) -> bool;

	/// Where a run of `strength` (1.0 = from pure noise) enters the schedule.
	fn timestep_for_strength(&self, strength: f32, sampling: &Sampling) -> StrengthTimestep;

	/// Scale applied to the initial sample at `step`.
	fn sample_scale_factor(&self, step: f32, sampling: &Sampling) -> f32 {
		let _ = (step, sampling);
		1.0
	}

	/// Scale of the noise added to the initial sample at `step`.
	fn noise_scale_factor(&self, step: f32, sampling: &Sampling) -> f32;
}
