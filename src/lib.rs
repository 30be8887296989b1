//! `sde-diffusers` is a diffusion sampling engine: it drives a trained denoising network from noise to a sample
//! with the second order stochastic DPM-Solver++ (DPM++ SDE, Karras).
//!
//! The network itself is a black box behind the [`Denoiser`] trait. The engine owns everything around it:
//! - noise schedules ([`Discretization`]) for variance-preserving and variance-exploding models,
//! - the batched model input for inpainting, depth, instruction editing and image-to-video models
//!   ([`ConditioningAssembler`]),
//! - classifier-free guidance ([`GuidanceCompositor`]),
//! - control adapters ([`ControlAdapter`]),
//! - and a mid-run hand-off to a refiner model ([`Refiner`]).
//!
//! ```ignore
//! use rand::{rngs::StdRng, SeedableRng};
//! use sde_diffusers::{DpmPpSdeSampler, GuidanceScales, ModelCatalog, SampleInputs, Sampler, SamplerConfig, Sampling};
//!
//! let catalog = ModelCatalog::from_json(&std::fs::read_to_string("models.json")?)?;
//! let sampler = DpmPpSdeSampler::new(SamplerConfig::from_catalog(&catalog, "sd_xl_base_1.0_f16.ckpt")?);
//! let mut rng = StdRng::seed_from_u64(42);
//! let inputs = SampleInputs::new(&conditioning, Sampling::new(30)).with_guidance(GuidanceScales::default().with_text(5.0));
//! let output = sampler.sample(noise, &mut unet, inputs, &mut rng, |step, _preview| {
//! 	println!("step {step}");
//! 	true
//! })?;
//! ```
//!
//! With the `onnx` feature, [`OrtDenoiser`] runs an ONNX Runtime UNet session as the denoiser.

#![warn(missing_docs)]
#![warn(rustdoc::all)]
#![warn(clippy::correctness, clippy::suspicious, clippy::complexity, clippy::perf, clippy::style)]
#![allow(clippy::tabs_in_doc_comments)]

pub mod conditioning;
pub mod config;
pub mod denoiser;
pub mod discretization;
mod error;
pub mod guidance;
pub mod injection;
pub mod samplers;
pub(crate) mod util;

pub use self::conditioning::{is_cfg_enabled, Conditioning, ConditioningAssembler, GuidanceLayout, Modifier};
pub use self::config::{ModelCatalog, ModelSpecification, NoiseDiscretization, SamplerConfig};
pub use self::denoiser::*;
pub use self::discretization::*;
pub use self::error::SamplerError;
pub use self::guidance::{per_frame_scales, GuidanceCompositor, GuidanceScale, GuidanceScales};
pub use self::injection::{ControlAdapter, ControlKind, InjectedControl, InjectedHints, InjectionContext};
pub use self::samplers::*;
