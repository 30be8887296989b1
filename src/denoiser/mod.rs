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

//! The network collaborator: a black box mapping `(timestep, input, conditioning)` to a prediction.

use ndarray::{Array4, ArrayD, ArrayView4, ArrayViewD};
use serde::{Deserialize, Serialize};

use crate::{Conditioning, InjectedHints};

cfg_if::cfg_if! {
	if #[cfg(feature = "onnx")] {
		mod onnx;
		pub use self::onnx::OrtDenoiser;
	}
}

/// Model architecture families known to the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ModelVersion {
	/// Stable Diffusion v1.
	V1,
	/// Stable Diffusion v2.
	V2,
	/// Kandinsky 2.1.
	Kandinsky21,
	/// Stable Diffusion XL base.
	SdxlBase,
	/// Stable Diffusion XL refiner.
	SdxlRefiner,
	/// Segmind Stable Diffusion XL 1B.
	Ssd1b,
	/// Stable Video Diffusion, image-to-video.
	SvdI2v,
	/// Stable Cascade stage C.
	WurstchenStageC,
	/// Stable Cascade stage B.
	WurstchenStageB
}

impl Default for ModelVersion {
	fn default() -> Self {
		Self::V1
	}
}

impl ModelVersion {
	/// A display name for this architecture.
	pub fn human_readable_name(&self) -> &'static str {
		match self {
			Self::V1 => "Stable Diffusion v1",
			Self::V2 => "Stable Diffusion v2",
			Self::Kandinsky21 => "Kandinsky v2.1",
			Self::SdxlBase => "Stable Diffusion XL Base",
			Self::SdxlRefiner => "Stable Diffusion XL Refiner",
			Self::Ssd1b => "Segmind Stable Diffusion XL 1B",
			Self::SvdI2v => "Stable Video Diffusion",
			Self::WurstchenStageC | Self::WurstchenStageB => "Stable Cascade (Wurstchen v3.0)"
		}
	}

	/// Range the epsilon-recovered denoised estimate is clipped to, for architectures that need it.
	pub fn denoised_clip_range(&self) -> Option<(f32, f32)> {
		match self {
			Self::Kandinsky21 => Some((-1.0, 1.0)),
			_ => None
		}
	}

	/// Applies [`ModelVersion::denoised_clip_range`] in place.
	pub fn clip_denoised(&self, denoised: &mut Array4<f32>) {
		if let Some((low, high)) = self.denoised_clip_range() {
			denoised.par_map_inplace(|f| *f = f.clamp(low, high));
		}
	}
}

/// Identifies a set of denoiser weights and how they are stored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ModelDescriptor {
	/// Weight file the denoiser is loaded from.
	pub file_path: String,
	/// Architecture of the weights.
	pub version: ModelVersion,
	/// Whether the weights are 8-bit quantized.
	pub is_8bit: bool,
	/// Whether weights are paged in from disk on demand.
	pub external_on_demand: bool
}

impl ModelDescriptor {
	/// Describes full-precision weights at `file_path`.
	pub fn new(file_path: impl Into<String>, version: ModelVersion) -> Self {
		Self {
			file_path: file_path.into(),
			version,
			..Default::default()
		}
	}
}

/// Tiled evaluation settings forwarded to the denoiser untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct TiledDiffusion {
	/// Tile width and height, in latent pixels.
	pub tile_size: (usize, usize),
	/// Overlap between neighbouring tiles, in latent pixels.
	pub tile_overlap: usize
}

/// Which kinds of injected hints the compiled graph must accept.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InjectionFlags {
	/// ControlNet residuals.
	pub controls: bool,
	/// T2I-Adapter residuals.
	pub t2i_adapters: bool,
	/// Token lengths of IP-Adapter embeddings.
	pub ip_adapter_lengths: Vec<usize>
}

/// Options that change the compiled graph without changing tensor shapes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompileOptions {
	/// The weights to compile.
	pub model: ModelDescriptor,
	/// Run attention in full precision.
	pub upcast_attention: bool,
	/// Use fused flash attention kernels.
	pub uses_flash_attention: bool,
	/// Tiled evaluation, if any.
	pub tiled_diffusion: Option<TiledDiffusion>
}

/// Everything a denoiser needs to build its compute graph for a run.
///
/// Compiling is expected to be idempotent per shape: compiling again with an equal [`CompileShape`] is a no-op.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileShape {
	/// NHWC shape of the model input, all guidance branches included.
	pub input: [usize; 4],
	/// Shape of the time embedding.
	pub time_embedding: Vec<usize>,
	/// Shapes of the encoded conditioning tensors.
	pub conditioning: Vec<Vec<usize>>,
	/// Token length of the unconditional branch.
	pub token_length_uncond: usize,
	/// Token length of the conditional branch.
	pub token_length_cond: usize,
	/// Injected hint kinds.
	pub injection: InjectionFlags,
	/// Non-shape options.
	pub options: CompileOptions
}

/// Arguments of a single network evaluation.
pub struct DenoiserInput<'a> {
	/// Value the time embedding was computed from (timestep or noise).
	pub timestep: f32,
	/// Assembled model input, NHWC.
	pub input: ArrayView4<'a, f32>,
	/// Output of [`Denoiser::time_embed`].
	pub time_embedding: ArrayViewD<'a, f32>,
	/// Encoded conditioning tensors for the branches being evaluated.
	pub conditioning: &'a [ArrayD<f32>],
	/// Optional pooled projection.
	pub extra_projection: Option<ArrayViewD<'a, f32>>,
	/// Hints from control adapters.
	pub hints: &'a InjectedHints,
	/// Tiled evaluation, if any.
	pub tiled_diffusion: Option<TiledDiffusion>
}

/// A trained diffusion network.
///
/// Implementations own their compiled graph. The sampler compiles once per run, reuses the graph for every step,
/// and calls [`Denoiser::discard`] when the model is swapped out mid-run.
pub trait Denoiser {
	/// Builds the compute graph for `shape`. Must either fully succeed or leave the previous state untouched.
	fn compile(&mut self, shape: &CompileShape) -> anyhow::Result<()>;

	/// The shape of the currently compiled graph.
	fn compiled_shape(&self) -> Option<&CompileShape>;

	/// Drops the compiled graph.
	fn discard(&mut self);

	/// Time embedding for a batch of `batch_size` evaluated at `timestep`.
	fn time_embed(&self, batch_size: usize, timestep: f32, version: ModelVersion) -> anyhow::Result<ArrayD<f32>>;

	/// Turns text-encoder output into the conditioning tensors this model consumes. Identity by default.
	fn encode_conditioning(&mut self, conditioning: &Conditioning, batch_size: usize) -> anyhow::Result<Vec<ArrayD<f32>>> {
		let _ = batch_size;
		Ok(conditioning.tensors.clone())
	}

	/// Evaluates the network.
	fn invoke(&mut self, input: DenoiserInput<'_>) -> anyhow::Result<Array4<f32>>;

	/// Cheap, low fidelity decode of a latent, used for progress previews.
	fn decode(&mut self, latent: ArrayView4<'_, f32>) -> anyhow::Result<Array4<f32>>;
}
