//! Deterministic DDIM scheduler (η = 0).
//!
//! ```text
//! x_0 = (x - √(1 - α_t²) ε) / α_t
//! x'  = α_prev x_0 + √(1 - α_prev²) ε
//! ```
//! Uses "leading" timestep spacing; the last step lands on training
//! timestep 0.

use candle_core::{DType, Device, Tensor};

use super::{Scheduler, SchedulerConfig, SchedulerCore, TimestepSpacing};
use crate::Result;

/// DDIM scheduler. Stateless between steps.
#[derive(Debug, Clone)]
pub struct Ddim {
    core: SchedulerCore,
}

impl Ddim {
    pub fn new(
        num_inference_steps: usize,
        config: SchedulerConfig,
        device: &Device,
        dtype: DType,
    ) -> Result<Self> {
        let core = SchedulerCore::new(
            num_inference_steps,
            config,
            TimestepSpacing::Leading,
            device,
            dtype,
        )?;
        Ok(Self { core })
    }

    fn previous_timestep(&self, step: usize) -> Result<usize> {
        if step + 1 < self.core.num_inference_steps() {
            self.core.timestep(step + 1)
        } else {
            Ok(0)
        }
    }
}

impl Scheduler for Ddim {
    fn core(&self) -> &SchedulerCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut SchedulerCore {
        &mut self.core
    }

    fn step(&mut self, x: &Tensor, noise_prediction: &Tensor, step: usize) -> Result<Tensor> {
        let timestep = self.core.timestep(step)?;
        self.core.check_sample(x, noise_prediction)?;
        let previous_timestep = self.previous_timestep(step)?;

        let alpha = self.core.coefficients(timestep)?.cumulative_scale_factor;
        let alpha_prev = self
            .core
            .coefficients(previous_timestep)?
            .cumulative_scale_factor;

        tracing::debug!(step, timestep, previous_timestep, "ddim step");

        // √(1 - α²)
        let noise_scale = alpha.sqr()?.affine(-1.0, 1.0)?.sqrt()?;
        let noise_scale_prev = alpha_prev.sqr()?.affine(-1.0, 1.0)?.sqrt()?;

        let predicted_x = (x - noise_prediction.broadcast_mul(&noise_scale)?)?.broadcast_div(&alpha)?;
        let denoised = (predicted_x.broadcast_mul(&alpha_prev)?
            + noise_prediction.broadcast_mul(&noise_scale_prev)?)?;
        Ok(denoised)
    }
}
