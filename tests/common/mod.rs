#![allow(dead_code)]

use ndarray::{s, Array, Array4, ArrayD, ArrayView4, IxDyn, Zip};
use sde_diffusers::{
	sigma_for, CompileShape, Conditioning, ControlAdapter, ControlKind, Denoiser, DenoiserInput, Discretization, InjectionContext, ModelVersion,
	Objective, TiledDiffusion, TimestepConditioning
};

/// What a [`ScriptedDenoiser`] predicts.
#[derive(Debug, Clone, Copy)]
pub enum Behaviour {
	/// The exact prediction for a clean image that is `target` everywhere.
	Oracle { target: f32 },
	/// Always predicts zero.
	Zero,
	/// Predicts zero for the first `n` invocations and `NaN` afterwards.
	NanFrom(usize)
}

#[derive(Debug, Clone)]
pub struct Invocation {
	pub timestep: f32,
	pub batch: usize,
	pub conditioning_shapes: Vec<Vec<usize>>,
	/// Sum over the channels following the latent channels.
	pub extra_channel_sum: f32,
	/// Root mean square of the latent channels.
	pub latent_rms: f32,
	pub extra_projection_shape: Option<Vec<usize>>,
	pub tiled_diffusion: Option<TiledDiffusion>,
	pub controls: usize,
	pub control_sum: f32,
	pub ip_adapters: usize
}

/// A denoiser that records every call.
pub struct ScriptedDenoiser {
	pub behaviour: Behaviour,
	pub discretization: Discretization,
	pub conditioning: TimestepConditioning,
	pub channels: usize,
	pub invocations: Vec<Invocation>,
	pub compiles: Vec<CompileShape>,
	pub discards: usize,
	pub decodes: usize,
	pub encodes: usize,
	shape: Option<CompileShape>,
	last_sigma: Option<f64>,
	step_sigma: f64,
	second_half: bool
}

impl ScriptedDenoiser {
	pub fn new(behaviour: Behaviour, discretization: Discretization, channels: usize) -> Self {
		Self {
			behaviour,
			discretization,
			conditioning: TimestepConditioning::Timestep,
			channels,
			invocations: Vec::new(),
			compiles: Vec::new(),
			discards: 0,
			decodes: 0,
			encodes: 0,
			shape: None,
			last_sigma: None,
			step_sigma: 0.0,
			second_half: false
		}
	}

	pub fn with_conditioning(mut self, conditioning: TimestepConditioning) -> Self {
		self.conditioning = conditioning;
		self
	}

	fn sigma(&self, timestep: f32) -> f64 {
		match self.conditioning {
			TimestepConditioning::Timestep => sigma_for(self.discretization.alpha_cumprod(timestep, 1.0)),
			TimestepConditioning::Noise => (4.0 * timestep as f64).exp()
		}
	}

	/// Noise level the input was preconditioned with. Calls at a new noise level alternate between the
	/// start of a step and its midpoint, and both evaluations of a step share the start's level.
	fn input_sigma(&mut self, sigma: f64) -> f64 {
		if self.last_sigma != Some(sigma) {
			self.second_half = self.last_sigma.is_some() && !self.second_half;
			if !self.second_half {
				self.step_sigma = sigma;
			}
			self.last_sigma = Some(sigma);
		}
		self.step_sigma
	}

	fn oracle(&mut self, input: ArrayView4<'_, f32>, timestep: f32, target: f32) -> Array4<f32> {
		let sigma = self.sigma(timestep);
		let input_sigma = self.input_sigma(sigma);
		let latent = input.slice(s![.., .., .., ..self.channels]);
		let objective = self.discretization.objective();
		let prediction = |v: f32| -> f32 {
			let v = v as f64;
			let target = target as f64;
			let e = match objective {
				Objective::Epsilon => {
					let x = v * (sigma * sigma + 1.0).sqrt();
					(x - target) / sigma
				}
				Objective::V => {
					let sqrt_alpha = 1.0 / (sigma * sigma + 1.0).sqrt();
					let x = v / sqrt_alpha;
					(x / (sigma * sigma + 1.0) - target) / (sigma * sqrt_alpha)
				}
				Objective::Edm { sigma_data } => {
					let norm = (sigma * sigma + sigma_data * sigma_data).sqrt();
					let x = v * (input_sigma * input_sigma + sigma_data * sigma_data).sqrt();
					(target - sigma_data * sigma_data / (norm * norm) * x) * norm / (sigma * sigma_data)
				}
			};
			e as f32
		};
		latent.mapv(prediction)
	}
}

impl Denoiser for ScriptedDenoiser {
	fn compile(&mut self, shape: &CompileShape) -> anyhow::Result<()> {
		self.compiles.push(shape.clone());
		self.shape = Some(shape.clone());
		Ok(())
	}

	fn compiled_shape(&self) -> Option<&CompileShape> {
		self.shape.as_ref()
	}

	fn discard(&mut self) {
		self.discards += 1;
		self.shape = None;
	}

	fn time_embed(&self, batch_size: usize, _timestep: f32, _version: ModelVersion) -> anyhow::Result<ArrayD<f32>> {
		Ok(ArrayD::zeros(IxDyn(&[batch_size, 8])))
	}

	fn encode_conditioning(&mut self, conditioning: &Conditioning, _batch_size: usize) -> anyhow::Result<Vec<ArrayD<f32>>> {
		self.encodes += 1;
		Ok(conditioning.tensors.clone())
	}

	fn invoke(&mut self, input: DenoiserInput<'_>) -> anyhow::Result<Array4<f32>> {
		if self.shape.is_none() {
			anyhow::bail!("invoked before compile");
		}
		let (batch, height, width, _) = input.input.dim();
		let latent = input.input.slice(s![.., .., .., ..self.channels]);
		self.invocations.push(Invocation {
			timestep: input.timestep,
			batch,
			conditioning_shapes: input.conditioning.iter().map(|c| c.shape().to_vec()).collect(),
			extra_channel_sum: input.input.slice(s![.., .., .., self.channels..]).sum(),
			latent_rms: latent.mapv(|v| v * v).mean().unwrap_or(0.0).sqrt(),
			extra_projection_shape: input.extra_projection.as_ref().map(|p| p.shape().to_vec()),
			tiled_diffusion: input.tiled_diffusion,
			controls: input.hints.controls.len(),
			control_sum: input.hints.controls.iter().map(|c| c.sum()).sum(),
			ip_adapters: input.hints.ip_adapters.len()
		});
		let shape = (batch, height, width, self.channels);
		Ok(match self.behaviour {
			Behaviour::Oracle { target } => self.oracle(input.input, input.timestep, target),
			Behaviour::Zero => Array4::zeros(shape),
			Behaviour::NanFrom(n) if self.invocations.len() > n => Array4::from_elem(shape, f32::NAN),
			Behaviour::NanFrom(_) => Array4::zeros(shape)
		})
	}

	fn decode(&mut self, latent: ArrayView4<'_, f32>) -> anyhow::Result<Array4<f32>> {
		self.decodes += 1;
		Ok(latent.to_owned())
	}
}

/// A ControlNet that returns one residual per call, scaled by its hint strength, and remembers the steps it saw.
#[derive(Default)]
pub struct CountingControlNet {
	pub steps: Vec<usize>,
	pub encodes: usize
}

impl ControlAdapter for CountingControlNet {
	fn kind(&self) -> ControlKind {
		ControlKind::ControlNet
	}

	fn encode(&mut self, _conditioning: &Conditioning, _hints: &[(Vec<ArrayD<f32>>, f32)], _batch_size: usize) -> anyhow::Result<Vec<ArrayD<f32>>> {
		self.encodes += 1;
		Ok(Vec::new())
	}

	fn hints(&mut self, context: &InjectionContext<'_>) -> anyhow::Result<Vec<ArrayD<f32>>> {
		if context.compiled_shape.is_none() {
			anyhow::bail!("queried before the denoiser was compiled");
		}
		self.steps.push(context.step);
		let strength = context.hints.iter().map(|(_, strength)| strength).sum::<f32>();
		Ok(vec![ArrayD::from_elem(IxDyn(&[context.input.shape()[0], 2]), strength)])
	}
}

/// Text conditioning for `batch_size` samples: one `(2 * batch_size, tokens, 8)` tensor and a pooled
/// `(2 * batch_size, 4)` tensor. The unconditional half is 0, the conditional half 1.
pub fn text_conditioning(batch_size: usize, tokens: usize) -> Conditioning {
	let hidden = Array::from_shape_fn(IxDyn(&[batch_size * 2, tokens, 8]), |idx| if idx[0] < batch_size { 0.0 } else { 1.0 });
	let pooled = Array::from_shape_fn(IxDyn(&[batch_size * 2, 4]), |idx| if idx[0] < batch_size { 0.0 } else { 1.0 });
	Conditioning::new(vec![hidden, pooled], tokens, tokens)
}

pub fn max_abs_diff(a: &Array4<f32>, b: &Array4<f32>) -> f32 {
	Zip::from(a).and(b).fold(0.0f32, |acc, &a, &b| acc.max((a - b).abs()))
}
