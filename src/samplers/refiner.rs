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

use std::ops::Range;

use tracing::info;

use crate::{Denoiser, ModelDescriptor};

/// A second denoiser that takes over for the low-noise tail of the schedule.
pub struct Refiner<'a, D> {
	/// The refiner network.
	pub denoiser: &'a mut D,
	/// Weights the refiner is compiled from.
	pub model: ModelDescriptor,
	/// Fraction of the schedule, counted from the clean end, handled by the refiner.
	pub start: f32
}

impl<'a, D: Denoiser> Refiner<'a, D> {
	/// Hands the final `start` fraction of the schedule to `denoiser`.
	pub fn new(denoiser: &'a mut D, model: ModelDescriptor, start: f32) -> Self {
		Self { denoiser, model, start }
	}

	/// Timestep below which the refiner is active.
	pub fn kick_in(&self, timesteps: f32) -> f32 {
		(1.0 - self.start) * timesteps
	}
}

/// Which network produced a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActiveModel {
	/// The model the sampler was called with.
	Base,
	/// The refiner.
	Refiner
}

/// The steps handled by one model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelStage {
	/// The model.
	pub model: ActiveModel,
	/// Schedule steps it ran.
	pub steps: Range<usize>
}

/// One-way switch from the base denoiser to the refiner.
pub(crate) struct HotSwap<'a, D> {
	base: &'a mut D,
	base_model: ModelDescriptor,
	refiner: Option<Refiner<'a, D>>,
	active: ActiveModel,
	kick_in: f32,
	stages: Vec<ModelStage>,
	stage_start: usize
}

impl<'a, D: Denoiser> HotSwap<'a, D> {
	pub(crate) fn new(base: &'a mut D, base_model: ModelDescriptor, refiner: Option<Refiner<'a, D>>, timesteps: f32, start_step: usize) -> Self {
		let kick_in = refiner.as_ref().map_or(-1.0, |refiner| refiner.kick_in(timesteps));
		Self {
			base,
			base_model,
			refiner,
			active: ActiveModel::Base,
			kick_in,
			stages: Vec::new(),
			stage_start: start_step
		}
	}

	pub(crate) fn denoiser(&mut self) -> &mut D {
		match (self.active, self.refiner.as_mut()) {
			(ActiveModel::Refiner, Some(refiner)) => &mut *refiner.denoiser,
			_ => &mut *self.base
		}
	}

	pub(crate) fn model(&self) -> &ModelDescriptor {
		match (self.active, self.refiner.as_ref()) {
			(ActiveModel::Refiner, Some(refiner)) => &refiner.model,
			_ => &self.base_model
		}
	}

	pub(crate) fn active(&self) -> ActiveModel {
		self.active
	}

	/// Whether the refiner should take over at `timestep`.
	pub(crate) fn should_swap(&self, timestep: f32) -> bool {
		self.active == ActiveModel::Base && self.refiner.is_some() && timestep < self.kick_in
	}

	/// Discards the base graph and makes the refiner active from `step` on. The caller compiles the refiner.
	pub(crate) fn swap(&mut self, step: usize, timestep: f32) {
		info!(step, timestep, from = %self.base_model.file_path, to = %self.model_after_swap(), "switching to refiner");
		self.base.discard();
		self.close_stage(step);
		self.active = ActiveModel::Refiner;
		self.kick_in = -1.0;
	}

	fn model_after_swap(&self) -> &str {
		self.refiner.as_ref().map_or("", |refiner| refiner.model.file_path.as_str())
	}

	fn close_stage(&mut self, step: usize) {
		if step > self.stage_start {
			self.stages.push(ModelStage {
				model: self.active,
				steps: self.stage_start..step
			});
		}
		self.stage_start = step;
	}

	/// Stages run so far, with the active stage closed at `end_step`.
	pub(crate) fn finish(mut self, end_step: usize) -> Vec<ModelStage> {
		self.close_stage(end_step);
		self.stages
	}
}
