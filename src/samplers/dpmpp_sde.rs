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

use ndarray::{Array4, ArrayD, Zip};
use ndarray_rand::{rand_distr::StandardNormal, RandomExt};
use rand::Rng;
use tracing::{debug, info, warn};

use super::{
	brownian::BrownianPath,
	refiner::HotSwap,
	SampleInputs, Sampler, SamplerOutput, StrengthTimestep
};
use crate::{
	alpha_cumprod_for, injection::Injector, sigma_for, CompileOptions, CompileShape, Conditioning, ConditioningAssembler, Denoiser,
	DenoiserInput, Discretization, GuidanceCompositor, GuidanceLayout, InjectionFlags, ModelDescriptor, Modifier, Objective, Sampling,
	SamplerConfig, SamplerError, TimestepConditioning
};

/// Second order stochastic DPM-Solver++ with Karras-style noise levels.
///
/// Each step evaluates the denoiser twice: at the current noise level and at the geometric midpoint towards the
/// next one. The noise injected by both half steps comes from one Brownian path, split with a Brownian bridge, so
/// consecutive steps draw consistent noise. The final schedule step is a deterministic Euler step.
///
/// ```ignore
/// let sampler = DpmPpSdeSampler::new(SamplerConfig::from_catalog(&catalog, "sd_v1.5_f16.ckpt")?);
/// let mut rng = StdRng::seed_from_u64(seed);
/// let noise = Array4::<f32>::random_using((1, 64, 64, 4), StandardNormal, &mut rng);
/// let inputs = SampleInputs::new(&conditioning, Sampling::new(20)).with_guidance(GuidanceScales::default().with_text(7.5));
/// let output = sampler.sample(noise, &mut unet, inputs, &mut rng, |_, _| true)?;
/// ```
#[derive(Debug, Clone)]
pub struct DpmPpSdeSampler {
	config: SamplerConfig
}

impl DpmPpSdeSampler {
	/// Creates a sampler for the model described by `config`.
	pub fn new(config: SamplerConfig) -> Self {
		Self { config }
	}

	/// The configuration this sampler was built with.
	pub fn config(&self) -> &SamplerConfig {
		&self.config
	}

	/// Where a run of `strength` enters the schedule: exactly on a grid point, within `1e-3` of one, or between two.
	pub fn timestep_for_strength(&self, strength: f32, sampling: &Sampling) -> StrengthTimestep {
		let discretization = self.discretization();
		let init_timestep = strength * discretization.timesteps();
		let schedule = discretization.schedule(sampling.steps, sampling.shift);
		let mut previous_timestep = discretization.timesteps();
		for (i, &alpha_cumprod) in schedule.iter().enumerate() {
			let timestep = discretization.timestep(alpha_cumprod);
			if init_timestep >= timestep {
				if i == 0 {
					return StrengthTimestep {
						timestep,
						start_step: 0.0,
						rounded_down_start_step: 0,
						rounded_up_start_step: 0
					};
				}
				if init_timestep <= timestep + 1e-3 {
					return StrengthTimestep {
						timestep: init_timestep,
						start_step: i as f32,
						rounded_down_start_step: i,
						rounded_up_start_step: i
					};
				}
				return StrengthTimestep {
					timestep: init_timestep,
					start_step: (i - 1) as f32 + (init_timestep - previous_timestep) / (timestep - previous_timestep),
					rounded_down_start_step: i - 1,
					rounded_up_start_step: i
				};
			}
			previous_timestep = timestep;
		}
		let last = schedule.len() - 1;
		StrengthTimestep {
			timestep: discretization.timestep(schedule[last]),
			start_step: last as f32,
			rounded_down_start_step: last,
			rounded_up_start_step: last
		}
	}

	/// Noise level at fractional schedule position `step`.
	pub fn noise_scale_factor(&self, step: f32, sampling: &Sampling) -> f32 {
		let schedule = self.discretization().schedule(sampling.steps, sampling.shift);
		let timestep = self.interpolated_timestep(&schedule, step);
		sigma_for(self.discretization().alpha_cumprod(timestep, 1.0)) as f32
	}

	fn discretization(&self) -> &Discretization {
		&self.config.discretization
	}

	/// Timestep reached at fractional schedule position `step`, interpolating between the neighbouring grid points.
	fn interpolated_timestep(&self, schedule: &[f64], step: f32) -> f32 {
		let last = schedule.len() - 1;
		let low = (step.floor().max(0.0) as usize).min(last);
		let high = (step.ceil().max(0.0) as usize).min(last);
		let low_timestep = self.discretization().timestep(schedule[low]);
		let high_timestep = self.discretization().timestep(schedule[high]);
		low_timestep + (high_timestep - low_timestep) * (step - step.floor())
	}

	fn compile<D: Denoiser>(
		&self,
		denoiser: &mut D,
		model: &ModelDescriptor,
		layout: &GuidanceLayout,
		encoded: &[ArrayD<f32>],
		conditioning: &Conditioning,
		injection: &InjectionFlags,
		steps: usize
	) -> Result<(), SamplerError> {
		let timesteps = self.discretization().timesteps();
		let first_timestep = timesteps - timesteps / steps as f32 + 1.0;
		let time_embedding = denoiser.time_embed(layout.cfg_channels * layout.batch_size, first_timestep, model.version)?;
		let visible = match layout.modifier {
			Modifier::ImageToVideo if !encoded.is_empty() => 1 + (encoded.len() - 1) / 2,
			_ => encoded.len()
		};
		let shape = CompileShape {
			input: layout.input_shape(),
			time_embedding: time_embedding.shape().to_vec(),
			conditioning: encoded[..visible].iter().map(|tensor| tensor.shape().to_vec()).collect(),
			token_length_uncond: conditioning.token_length_uncond,
			token_length_cond: conditioning.token_length_cond,
			injection: injection.clone(),
			options: CompileOptions {
				model: model.clone(),
				upcast_attention: self.config.upcast_attention,
				uses_flash_attention: self.config.uses_flash_attention,
				tiled_diffusion: self.config.tiled_diffusion
			}
		};
		info!(
			model = %model.file_path,
			version = model.version.human_readable_name(),
			input = ?shape.input,
			"compiling denoiser"
		);
		denoiser.compile(&shape)?;
		Ok(())
	}
}

/// Per-run state shared by both network evaluations of a step.
struct Run<'r, 'm, 'c, D> {
	config: &'r SamplerConfig,
	models: HotSwap<'m, D>,
	assembler: ConditioningAssembler,
	compositor: GuidanceCompositor,
	injector: Injector<'c>,
	conditioning: Conditioning,
	encoded: Vec<ArrayD<f32>>
}

impl<'r, 'm, 'c, D: Denoiser> Run<'r, 'm, 'c, D> {
	/// Guided model prediction for `x` at noise level `sigma`.
	///
	/// EDM inputs are preconditioned with `step_sigma`, the noise level the step started from, on
	/// both evaluations of a step.
	fn predict(&mut self, x: &Array4<f32>, sigma: f64, step_sigma: f64, step: usize) -> Result<Array4<f32>, SamplerError> {
		let discretization = &self.config.discretization;
		let alpha_cumprod = alpha_cumprod_for(sigma);
		let scale = match discretization.objective() {
			Objective::Epsilon | Objective::V => alpha_cumprod.sqrt(),
			Objective::Edm { sigma_data } => 1.0 / (step_sigma * step_sigma + sigma_data * sigma_data).sqrt()
		};
		let timestep = discretization.timestep(alpha_cumprod);
		let c_noise = match self.config.conditioning {
			TimestepConditioning::Noise => discretization.noise(alpha_cumprod),
			TimestepConditioning::Timestep => timestep
		};
		let layout = self.assembler.layout().clone();
		let version = self.models.model().version;
		let tiled_diffusion = self.config.tiled_diffusion;

		self.assembler.load(&(x * scale as f32));
		let denoiser = self.models.denoiser();
		let time_embedding = denoiser.time_embed(layout.cfg_channels * layout.batch_size, c_noise, version)?;
		let hints = self
			.injector
			.collect(step, c_noise, self.assembler.input(), time_embedding.view(), denoiser.compiled_shape())?;

		if layout.modifier == Modifier::ImageToVideo {
			let (cond, uncond) = Conditioning::split_video(&self.encoded);
			let et_cond = denoiser.invoke(DenoiserInput {
				timestep: c_noise,
				input: self.assembler.input(),
				time_embedding: time_embedding.view(),
				conditioning: &cond,
				extra_projection: self.conditioning.extra_projection.as_ref().map(|p| p.view()),
				hints: &hints,
				tiled_diffusion
			})?;
			if !layout.cfg_enabled {
				return self.compositor.compose(et_cond, timestep);
			}
			self.assembler.show_frames(false);
			let et_uncond = denoiser.invoke(DenoiserInput {
				timestep: c_noise,
				input: self.assembler.input(),
				time_embedding: time_embedding.view(),
				conditioning: &uncond,
				extra_projection: self.conditioning.extra_projection.as_ref().map(|p| p.view()),
				hints: &hints,
				tiled_diffusion
			})?;
			Ok(self.compositor.compose_split(et_cond, et_uncond.view(), timestep))
		} else {
			let et = denoiser.invoke(DenoiserInput {
				timestep: c_noise,
				input: self.assembler.input(),
				time_embedding: time_embedding.view(),
				conditioning: &self.encoded,
				extra_projection: self.conditioning.extra_projection.as_ref().map(|p| p.view()),
				hints: &hints,
				tiled_diffusion
			})?;
			self.compositor.compose(et, timestep)
		}
	}

	/// Recovers the denoised estimate from a prediction `et` at `sigma`.
	fn denoised(&self, x: &Array4<f32>, et: &Array4<f32>, sigma: f64) -> Array4<f32> {
		let objective = self.config.discretization.objective();
		let (x_scale, et_scale) = match objective {
			Objective::Epsilon => (1.0, -sigma),
			Objective::V => (1.0 / (sigma * sigma + 1.0), -sigma * alpha_cumprod_for(sigma).sqrt()),
			Objective::Edm { sigma_data } => {
				let sigma_data2 = sigma_data * sigma_data;
				(sigma_data2 / (sigma * sigma + sigma_data2), sigma * sigma_data / (sigma * sigma + sigma_data2).sqrt())
			}
		};
		let (x_scale, et_scale) = (x_scale as f32, et_scale as f32);
		let mut denoised = Zip::from(x).and(et).par_map_collect(|&x, &e| x_scale * x + et_scale * e);
		if objective == Objective::Epsilon {
			self.models.model().version.clip_denoised(&mut denoised);
		}
		denoised
	}

	/// Derivative `(x - denoised) / sigma` of the probability flow ODE.
	fn derivative(&self, x: &Array4<f32>, et: &Array4<f32>, sigma: f64) -> Array4<f32> {
		let (x_scale, et_scale) = match self.config.discretization.objective() {
			Objective::Epsilon => return et.clone(),
			Objective::V => (sigma / (sigma * sigma + 1.0), alpha_cumprod_for(sigma).sqrt()),
			Objective::Edm { sigma_data } => {
				let sigma_data2 = sigma_data * sigma_data;
				(sigma / (sigma * sigma + sigma_data2), -sigma_data / (sigma * sigma + sigma_data2).sqrt())
			}
		};
		let (x_scale, et_scale) = (x_scale as f32, et_scale as f32);
		Zip::from(x).and(et).par_map_collect(|&x, &e| x_scale * x + et_scale * e)
	}
}

fn has_nan(tensor: &Array4<f32>) -> bool {
	tensor.iter().any(|v| v.is_nan())
}

impl<D: Denoiser> Sampler<D> for DpmPpSdeSampler {
	fn sample<R, F>(
		&self,
		x_t: Array4<f32>,
		denoiser: &mut D,
		inputs: SampleInputs<'_, D>,
		rng: &mut R,
		mut feedback: F
	) -> Result<SamplerOutput, SamplerError>
	where
		R: Rng + ?Sized,
		F: FnMut(usize, Option<&Array4<f32>>) -> bool
	{
		let config = &self.config;
		let shape = x_t.dim();
		inputs.validate(config.modifier, shape)?;
		let SampleInputs {
			conditioning,
			sample,
			masked_image,
			depth_image,
			mask,
			neg_mask,
			injected_controls,
			guidance,
			start_step,
			end_step,
			sampling,
			refiner,
			cond_aug
		} = inputs;
		let batch_size = shape.0;

		let layout = GuidanceLayout::new(config.modifier, config.classifier_free_guidance, &guidance, shape);
		let conditioning = layout.prepare_conditioning(conditioning, config.model.version)?;
		let assembler = ConditioningAssembler::new(&layout, masked_image, depth_image, mask)?;
		let compositor = GuidanceCompositor::new(&layout, guidance, self.discretization().timesteps());
		let mut injector = Injector::new(injected_controls);
		injector.encode(&conditioning, batch_size)?;
		let injection = injector.flags(&config.injection_flags());

		let mut models = HotSwap::new(denoiser, config.model.clone(), refiner, self.discretization().timesteps(), start_step.integral);
		let encoded = models.denoiser().encode_conditioning(&conditioning, batch_size)?;
		self.compile(models.denoiser(), &config.model, &layout, &encoded, &conditioning, &injection, sampling.steps)?;

		let mut run = Run {
			config,
			models,
			assembler,
			compositor,
			injector,
			conditioning,
			encoded
		};

		let schedule = self.discretization().schedule(sampling.steps, sampling.shift);
		let sigmas: Vec<f64> = schedule.iter().copied().map(sigma_for).collect();
		let mut brownian = BrownianPath::new(shape, rng);
		if let Some(frames) = masked_image.filter(|_| layout.modifier == Modifier::ImageToVideo) {
			run.assembler.prepare_frames(frames, cond_aug, rng)?;
		}
		let blend = match (sample, mask) {
			(Some(sample), Some(mask)) => {
				let mask = mask
					.broadcast(shape)
					.ok_or_else(|| SamplerError::invalid("mask does not broadcast to the sample"))?
					.to_owned();
				let neg_mask = match neg_mask {
					Some(neg_mask) => neg_mask
						.broadcast(shape)
						.ok_or_else(|| SamplerError::invalid("negative mask does not broadcast to the sample"))?
						.to_owned(),
					None => mask.mapv(|m| 1.0 - m)
				};
				Some((sample, mask, neg_mask))
			}
			_ => None
		};

		let mut x = x_t;
		if start_step.fractional == 0.0 {
			let sigma_max = sigmas[0] as f32;
			x.par_map_inplace(|v| *v *= sigma_max);
		}
		let mut old_denoised: Option<Array4<f32>> = None;
		for i in start_step.integral..end_step.integral {
			let sigma = if i == start_step.integral && !start_step.is_integral() {
				let timestep = self.interpolated_timestep(&schedule, start_step.fractional);
				// timesteps read back from the grid are already warped
				sigma_for(self.discretization().alpha_cumprod(timestep, 1.0))
			} else {
				sigmas[i]
			};
			if i == start_step.integral {
				brownian.anchor(sigma);
			}
			let alpha_cumprod = alpha_cumprod_for(sigma);

			let preview = if i > start_step.integral.max(sampling.steps / 2) || i % 5 == 4 {
				match &old_denoised {
					Some(denoised) => Some(run.models.denoiser().decode(denoised.view())?),
					None => None
				}
			} else {
				None
			};
			if i % 5 == 4 && preview.as_ref().map_or(false, has_nan) {
				warn!(step = i, "NaN in denoised estimate");
				return Err(SamplerError::NumericalDivergence { step: i });
			}
			if !feedback(i - start_step.integral, preview.as_ref()) {
				warn!(step = i, "sampling cancelled");
				return Err(SamplerError::Cancelled { step: i - start_step.integral });
			}

			let timestep = self.discretization().timestep(alpha_cumprod);
			if run.models.should_swap(timestep) {
				run.models.swap(i, timestep);
				run.encoded = run.models.denoiser().encode_conditioning(&run.conditioning, batch_size)?;
				let model = run.models.model().clone();
				self.compile(run.models.denoiser(), &model, &layout, &run.encoded, &run.conditioning, &injection, sampling.steps)?;
			}
			debug!(step = i, sigma, timestep, model = ?run.models.active(), "dpm++ sde step");

			let et = run.predict(&x, sigma, sigma, i)?;
			let sigma_next = sigmas[i + 1];
			if i < sampling.steps - 1 {
				let denoised = run.denoised(&x, &et, sigma);

				let sigma_s = (sigma * sigma_next).sqrt();
				let sigma_up = sigma_s.min((sigma_s * sigma_s * (sigma * sigma - sigma_s * sigma_s) / (sigma * sigma)).sqrt());
				let sigma_down = (sigma_s * sigma_s - sigma_up * sigma_up).sqrt();
				let w = (sigma_down / sigma) as f32;
				let noise_scale = (sigma_up / (sigma - sigma_s).sqrt()) as f32;
				let right = brownian.bridge(sigma_s, rng);
				let x2 = Zip::from(&x)
					.and(&denoised)
					.and(&right)
					.par_map_collect(|&x, &d, &r| w * x + (1.0 - w) * d + noise_scale * r);

				let et2 = run.predict(&x2, sigma_s, sigma, i)?;
				let denoised2 = run.denoised(&x2, &et2, sigma_s);

				let sigma_up2 = sigma_next.min((sigma_next * sigma_next * (sigma * sigma - sigma_next * sigma_next) / (sigma * sigma)).sqrt());
				let sigma_down2 = (sigma_next * sigma_next - sigma_up2 * sigma_up2).sqrt();
				let w2 = (sigma_down2 / sigma) as f32;
				let noise_scale2 = (sigma_up2 / (sigma - sigma_next).sqrt()) as f32;
				let right2 = brownian.bridge(sigma_next, rng);
				// the second half step spans the whole interval, so its increment is the sum of both right halves
				Zip::from(&mut x)
					.and(&denoised2)
					.and(&right)
					.and(&right2)
					.par_for_each(|x, &d, &r, &r2| *x = w2 * *x + (1.0 - w2) * d + noise_scale2 * (r + r2));
				old_denoised = Some(denoised);
			} else {
				let dt = (sigma_next - sigma) as f32;
				let d = run.derivative(&x, &et, sigma);
				Zip::from(&mut x).and(&d).par_for_each(|x, &d| *x += dt * d);
			}

			if i + 1 < end_step.integral {
				if let Some((sample, mask, neg_mask)) = &blend {
					let sigma_next = sigma_next as f32;
					let noise = Array4::<f32>::random_using(shape, StandardNormal, rng);
					Zip::from(&mut x)
						.and(*sample)
						.and(&noise)
						.and(mask)
						.and(neg_mask)
						.par_for_each(|x, &s, &n, &m, &nm| *x = (s + sigma_next * n) * nm + *x * m);
				}
			}
			if i + 1 == end_step.integral && has_nan(&x) {
				warn!(step = i, "NaN in sample");
				return Err(SamplerError::NumericalDivergence { step: i });
			}
		}

		let active = run.models.active();
		let stages = run.models.finish(end_step.integral);
		debug!(?active, stages = stages.len(), "sampling finished");
		Ok(SamplerOutput { x, stages })
	}

	fn timestep_for_strength(&self, strength: f32, sampling: &Sampling) -> StrengthTimestep {
		DpmPpSdeSampler::timestep_for_strength(self, strength, sampling)
	}

	fn noise_scale_factor(&self, step: f32, sampling: &Sampling) -> f32 {
		DpmPpSdeSampler::noise_scale_factor(self, step, sampling)
	}
}
