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

use std::{path::PathBuf, sync::Arc};

use ndarray::{Array1, Array2, Array4, ArrayD, ArrayView4, IxDyn};
use ort::{
	tensor::{FromArray, InputTensor, OrtOwnedTensor},
	Environment, ExecutionProvider, Session, SessionBuilder
};
use tracing::info;

use super::{CompileShape, Denoiser, DenoiserInput, ModelVersion};

/// A Stable Diffusion UNet exported to ONNX, run with ONNX Runtime.
///
/// The session takes `(sample, timestep, encoder_hidden_states)` in NCHW layout and predicts the model objective.
/// Weight files are resolved relative to `root`.
///
/// ```ignore
/// let environment = Environment::builder().build()?.into_arc();
/// let mut unet = OrtDenoiser::new(&environment, "./stable-diffusion-v1-5/").with_execution_provider(ExecutionProvider::cuda());
/// ```
pub struct OrtDenoiser {
	environment: Arc<Environment>,
	root: PathBuf,
	execution_provider: Option<ExecutionProvider>,
	session: Option<Session>,
	shape: Option<CompileShape>
}

impl OrtDenoiser {
	/// Creates a denoiser loading its weights from under `root`. Nothing is loaded until the first compile.
	pub fn new(environment: &Arc<Environment>, root: impl Into<PathBuf>) -> Self {
		Self {
			environment: Arc::clone(environment),
			root: root.into(),
			execution_provider: None,
			session: None,
			shape: None
		}
	}

	/// Places the UNet on `execution_provider` instead of the CPU.
	pub fn with_execution_provider(mut self, execution_provider: ExecutionProvider) -> Self {
		self.execution_provider = Some(execution_provider);
		self
	}
}

impl Denoiser for OrtDenoiser {
	fn compile(&mut self, shape: &CompileShape) -> anyhow::Result<()> {
		if self.shape.as_ref() == Some(shape) {
			return Ok(());
		}
		if shape.injection.controls || shape.injection.t2i_adapters || !shape.injection.ip_adapter_lengths.is_empty() {
			anyhow::bail!("ONNX UNet exports do not accept injected controls");
		}
		let path = self.root.join(&shape.options.model.file_path);
		info!(path = %path.display(), "loading ONNX UNet");
		let mut builder = SessionBuilder::new(&self.environment)?;
		if let Some(execution_provider) = &self.execution_provider {
			builder = builder.with_execution_providers([execution_provider.clone()])?;
		}
		let session = builder.with_model_from_file(path)?;
		self.session = Some(session);
		self.shape = Some(shape.clone());
		Ok(())
	}

	fn compiled_shape(&self) -> Option<&CompileShape> {
		self.shape.as_ref()
	}

	fn discard(&mut self) {
		self.session = None;
		self.shape = None;
	}

	fn time_embed(&self, _batch_size: usize, timestep: f32, _version: ModelVersion) -> anyhow::Result<ArrayD<f32>> {
		// the exported graph embeds the raw timestep itself
		Ok(Array1::from_iter([timestep]).into_dyn())
	}

	fn invoke(&mut self, input: DenoiserInput<'_>) -> anyhow::Result<Array4<f32>> {
		let Some(session) = self.session.as_ref() else {
			anyhow::bail!("denoiser invoked before compile");
		};
		let encoder_hidden_states = input
			.conditioning
			.first()
			.ok_or_else(|| anyhow::anyhow!("missing encoder hidden states"))?
			.clone();
		let sample: ArrayD<f32> = input.input.permuted_axes([0, 3, 1, 2]).as_standard_layout().to_owned().into_dyn();
		let outputs = session.run(vec![
			InputTensor::from_array(sample),
			InputTensor::from_array(input.time_embedding.to_owned()),
			InputTensor::from_array(encoder_hidden_states),
		])?;
		let prediction: OrtOwnedTensor<'_, f32, IxDyn> = outputs[0].try_extract()?;
		let prediction: Array4<f32> = prediction.view().to_owned().into_dimensionality()?;
		Ok(prediction.permuted_axes([0, 2, 3, 1]).as_standard_layout().to_owned())
	}

	/// Cheap linear latent-to-RGB approximation; no VAE involved.
	fn decode(&mut self, latent: ArrayView4<'_, f32>) -> anyhow::Result<Array4<f32>> {
		let (batch_size, height, width, channels) = latent.dim();
		if channels != 4 {
			anyhow::bail!("approximate decode needs 4 latent channels, got {channels}");
		}
		let coefs = Array2::from_shape_vec((4, 3), vec![0.298, 0.207, 0.208, 0.187, 0.286, 0.173, -0.158, 0.189, 0.264, -0.184, -0.271, -0.473])?;
		let pixels = latent.as_standard_layout().into_shape((batch_size * height * width, channels))?.dot(&coefs);
		Ok(pixels.into_shape((batch_size, height, width, 3))?)
	}
}
