//! Model catalog and sampler configuration.

use serde::{Deserialize, Serialize};

use crate::{
	DdpmDiscretization, DdpmLinspace, Discretization, EdmDiscretization, InjectionFlags, ModelDescriptor, ModelVersion, Modifier, Objective,
	TiledDiffusion, TimestepConditioning
};

/// Noise schedule parameters as stored in the catalog.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum NoiseDiscretization {
	/// See [`DdpmDiscretization::new`].
	#[serde(rename_all = "kebab-case")]
	#[allow(missing_docs)]
	Ddpm {
		linear_start: f64,
		linear_end: f64,
		timesteps: usize,
		linspace: DdpmLinspace
	},
	/// See [`EdmDiscretization::new`].
	#[serde(rename_all = "kebab-case")]
	#[allow(missing_docs)]
	Edm {
		#[serde(default = "default_sigma_min")]
		sigma_min: f64,
		sigma_max: f64
	}
}

fn default_sigma_min() -> f64 {
	0.002
}

impl NoiseDiscretization {
	fn stable_diffusion(linspace: DdpmLinspace) -> Self {
		Self::Ddpm {
			linear_start: 0.00085,
			linear_end: 0.012,
			timesteps: 1_000,
			linspace
		}
	}

	/// Builds the schedule for a model trained with `objective`.
	///
	/// # Errors
	/// Errors if the stored parameters are out of range.
	pub fn discretization(&self, objective: Objective) -> anyhow::Result<Discretization> {
		Ok(match *self {
			Self::Ddpm {
				linear_start,
				linear_end,
				timesteps,
				linspace
			} => Discretization::Ddpm(DdpmDiscretization::new(linear_start, linear_end, timesteps, linspace, objective)?),
			Self::Edm { sigma_min, sigma_max } => Discretization::Edm(EdmDiscretization::new(sigma_min, sigma_max, objective)?)
		})
	}
}

impl Default for NoiseDiscretization {
	fn default() -> Self {
		Self::stable_diffusion(DdpmLinspace::LinearWrtSigma)
	}
}

/// One catalog entry. Optional fields fall back to defaults derived from `version`.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct ModelSpecification {
	/// Display name.
	pub name: String,
	/// Weight file name; the catalog key.
	pub file: String,
	/// Text prepended to every prompt.
	#[serde(default)]
	pub prefix: String,
	/// Architecture.
	pub version: ModelVersion,
	/// Whether attention must run in full precision.
	#[serde(default)]
	pub upcast_attention: bool,
	/// Default output scale, in units of 64 pixels.
	#[serde(default = "default_scale")]
	pub default_scale: u16,
	/// Task variant, [`Modifier::None`] if absent.
	pub modifier: Option<Modifier>,
	/// File of the refiner usually paired with this model.
	pub default_refiner: Option<String>,
	/// Legacy flag for v-prediction models, superseded by `objective`.
	pub predict_v: Option<bool>,
	/// Time embedding input.
	pub conditioning: Option<TimestepConditioning>,
	/// Training objective.
	pub objective: Option<Objective>,
	/// Noise schedule.
	pub noise_discretization: Option<NoiseDiscretization>,
	/// Hidden from model pickers.
	pub deprecated: Option<bool>
}

fn default_scale() -> u16 {
	8
}

/// Known models, keyed by weight file name.
///
/// Lookups of unknown files fall back to the Stable Diffusion v1 defaults.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(transparent)]
pub struct ModelCatalog {
	specifications: Vec<ModelSpecification>
}

impl ModelCatalog {
	/// A catalog of `specifications`.
	pub fn new(specifications: Vec<ModelSpecification>) -> Self {
		Self { specifications }
	}

	/// Parses a JSON array of specifications.
	///
	/// # Errors
	/// Errors if `json` is not a valid catalog.
	pub fn from_json(json: &str) -> anyhow::Result<Self> {
		Ok(serde_json::from_str(json)?)
	}

	/// Adds or replaces the specification of `specification.file`.
	pub fn insert(&mut self, specification: ModelSpecification) {
		match self.specifications.iter_mut().find(|s| s.file == specification.file) {
			Some(existing) => *existing = specification,
			None => self.specifications.push(specification)
		}
	}

	/// All entries, in insertion order.
	pub fn specifications(&self) -> &[ModelSpecification] {
		&self.specifications
	}

	/// The entry for `file`, if known.
	pub fn specification_for_model(&self, file: &str) -> Option<&ModelSpecification> {
		self.specifications.iter().find(|s| s.file == file)
	}

	/// Architecture of `file`; Stable Diffusion v1 if unknown.
	pub fn version_for_model(&self, file: &str) -> ModelVersion {
		self.specification_for_model(file).map(|s| s.version).unwrap_or_default()
	}

	/// Training objective of `file`; epsilon if unknown.
	pub fn objective_for_model(&self, file: &str) -> Objective {
		let Some(specification) = self.specification_for_model(file) else { return Objective::Epsilon };
		specification
			.objective
			.unwrap_or(if specification.predict_v == Some(true) { Objective::V } else { Objective::Epsilon })
	}

	/// Time embedding input of `file`. Video models are conditioned on noise, everything else on the timestep.
	pub fn conditioning_for_model(&self, file: &str) -> TimestepConditioning {
		let Some(specification) = self.specification_for_model(file) else { return TimestepConditioning::Timestep };
		specification.conditioning.unwrap_or(match specification.version {
			ModelVersion::SvdI2v => TimestepConditioning::Noise,
			_ => TimestepConditioning::Timestep
		})
	}

	/// Noise schedule of `file`; the Stable Diffusion schedule if unknown.
	pub fn noise_discretization_for_model(&self, file: &str) -> NoiseDiscretization {
		let Some(specification) = self.specification_for_model(file) else { return NoiseDiscretization::default() };
		if let Some(noise_discretization) = specification.noise_discretization {
			return noise_discretization;
		}
		match specification.version {
			ModelVersion::Kandinsky21 => NoiseDiscretization::stable_diffusion(DdpmLinspace::LinearWrtBeta),
			ModelVersion::V1 | ModelVersion::V2 | ModelVersion::SdxlBase | ModelVersion::SdxlRefiner | ModelVersion::Ssd1b => {
				NoiseDiscretization::stable_diffusion(DdpmLinspace::LinearWrtSigma)
			}
			ModelVersion::SvdI2v => NoiseDiscretization::Edm {
				sigma_min: default_sigma_min(),
				sigma_max: 700.0
			},
			ModelVersion::WurstchenStageC | ModelVersion::WurstchenStageB => NoiseDiscretization::Edm { sigma_min: 0.01, sigma_max: 99.995 }
		}
	}

	/// Task variant of `file`.
	pub fn modifier_for_model(&self, file: &str) -> Modifier {
		self.specification_for_model(file).and_then(|s| s.modifier).unwrap_or_default()
	}

	/// Refiner usually paired with `file`.
	pub fn default_refiner_for_model(&self, file: &str) -> Option<&str> {
		self.specification_for_model(file).and_then(|s| s.default_refiner.as_deref())
	}

	/// Whether `file` needs full precision attention.
	pub fn is_upcast_attention_for_model(&self, file: &str) -> bool {
		self.specification_for_model(file).map_or(false, |s| s.upcast_attention)
	}

	/// Whether `file` is deprecated.
	pub fn is_model_deprecated(&self, file: &str) -> bool {
		self.specification_for_model(file).and_then(|s| s.deprecated).unwrap_or(false)
	}

	/// Default output scale of `file`.
	pub fn default_scale_for_model(&self, file: &str) -> u16 {
		self.specification_for_model(file).map_or(default_scale(), |s| s.default_scale)
	}

	/// Whether a weight file of `file_size` bytes (external tensor store included) holds 8-bit weights.
	pub fn is_8bit_model(&self, file: &str, file_size: u64) -> bool {
		const GIB: u64 = 1_024 * 1_024 * 1_024;
		let limit = match self.version_for_model(file) {
			ModelVersion::SdxlBase | ModelVersion::SdxlRefiner => 3 * GIB,
			ModelVersion::V1 | ModelVersion::V2 => GIB,
			ModelVersion::WurstchenStageC => 4 * GIB,
			ModelVersion::Ssd1b | ModelVersion::Kandinsky21 | ModelVersion::SvdI2v | ModelVersion::WurstchenStageB => 2 * GIB
		};
		file_size < limit
	}
}

/// Everything about a sampler that stays fixed across runs.
#[derive(Debug, Clone)]
pub struct SamplerConfig {
	/// The base denoiser's weights.
	pub model: ModelDescriptor,
	/// Task variant.
	pub modifier: Modifier,
	/// Use fused flash attention kernels.
	pub uses_flash_attention: bool,
	/// Run attention in full precision.
	pub upcast_attention: bool,
	/// Compile the denoiser to accept ControlNet residuals.
	pub inject_controls: bool,
	/// Compile the denoiser to accept T2I-Adapter residuals.
	pub inject_t2i_adapters: bool,
	/// Token lengths of IP-Adapter embeddings the denoiser accepts.
	pub inject_ip_adapter_lengths: Vec<usize>,
	/// Whether the model supports classifier-free guidance at all.
	pub classifier_free_guidance: bool,
	/// What the time embedding is computed from.
	pub conditioning: TimestepConditioning,
	/// Tiled evaluation, if any.
	pub tiled_diffusion: Option<TiledDiffusion>,
	/// The noise schedule.
	pub discretization: Discretization
}

impl SamplerConfig {
	/// A configuration with classifier-free guidance and no injection.
	pub fn new(model: ModelDescriptor, discretization: Discretization) -> Self {
		Self {
			model,
			modifier: Modifier::None,
			uses_flash_attention: false,
			upcast_attention: false,
			inject_controls: false,
			inject_t2i_adapters: false,
			inject_ip_adapter_lengths: Vec::new(),
			classifier_free_guidance: true,
			conditioning: TimestepConditioning::Timestep,
			tiled_diffusion: None,
			discretization
		}
	}

	/// Resolves the configuration of `file` from `catalog`.
	///
	/// # Errors
	/// Errors if the catalog's schedule parameters for `file` are invalid.
	pub fn from_catalog(catalog: &ModelCatalog, file: &str) -> anyhow::Result<Self> {
		let objective = catalog.objective_for_model(file);
		let discretization = catalog.noise_discretization_for_model(file).discretization(objective)?;
		let model = ModelDescriptor::new(file, catalog.version_for_model(file));
		Ok(Self::new(model, discretization)
			.with_modifier(catalog.modifier_for_model(file))
			.with_conditioning(catalog.conditioning_for_model(file))
			.with_upcast_attention(catalog.is_upcast_attention_for_model(file)))
	}

	/// Sets the task variant.
	pub fn with_modifier(mut self, modifier: Modifier) -> Self {
		self.modifier = modifier;
		self
	}

	/// Sets the time embedding input.
	pub fn with_conditioning(mut self, conditioning: TimestepConditioning) -> Self {
		self.conditioning = conditioning;
		self
	}

	/// Runs attention in full precision.
	pub fn with_upcast_attention(mut self, upcast_attention: bool) -> Self {
		self.upcast_attention = upcast_attention;
		self
	}

	/// Uses fused flash attention kernels.
	pub fn with_flash_attention(mut self, uses_flash_attention: bool) -> Self {
		self.uses_flash_attention = uses_flash_attention;
		self
	}

	/// Enables or disables classifier-free guidance regardless of the guidance scale.
	pub fn with_classifier_free_guidance(mut self, classifier_free_guidance: bool) -> Self {
		self.classifier_free_guidance = classifier_free_guidance;
		self
	}

	/// Enables tiled evaluation.
	pub fn with_tiled_diffusion(mut self, tiled_diffusion: TiledDiffusion) -> Self {
		self.tiled_diffusion = Some(tiled_diffusion);
		self
	}

	/// Compiles the denoiser with ControlNet and/or T2I-Adapter inputs, and IP-Adapter contexts of the given
	/// token lengths.
	pub fn with_injection(mut self, controls: bool, t2i_adapters: bool, ip_adapter_lengths: Vec<usize>) -> Self {
		self.inject_controls = controls;
		self.inject_t2i_adapters = t2i_adapters;
		self.inject_ip_adapter_lengths = ip_adapter_lengths;
		self
	}

	pub(crate) fn injection_flags(&self) -> InjectionFlags {
		InjectionFlags {
			controls: self.inject_controls,
			t2i_adapters: self.inject_t2i_adapters,
			ip_adapter_lengths: self.inject_ip_adapter_lengths.clone()
		}
	}
}
