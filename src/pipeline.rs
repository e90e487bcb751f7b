//! Denoising loop.
//!
//! The model that predicts noise lives outside this crate; it plugs in
//! through [`Denoiser`]. The loop is:
//! 1. (optional) noise an initial sample to the level of the start step
//! 2. for each remaining step: predict ε, then `scheduler.step`

use candle_core::Tensor;

use crate::scheduler::Scheduler;
use crate::{Error, Result};

/// Noise predictor, e.g. a UNet with its conditioning already bound.
pub trait Denoiser {
    /// Predict the noise in `x` at training timestep `timestep`.
    fn predict_noise(&mut self, x: &Tensor, timestep: usize) -> Result<Tensor>;
}

impl<F> Denoiser for F
where
    F: FnMut(&Tensor, usize) -> Result<Tensor>,
{
    fn predict_noise(&mut self, x: &Tensor, timestep: usize) -> Result<Tensor> {
        self(x, timestep)
    }
}

/// Run every step starting from pure noise `x`.
pub fn denoise<S, D>(scheduler: &mut S, denoiser: &mut D, x: Tensor) -> Result<Tensor>
where
    S: Scheduler,
    D: Denoiser + ?Sized,
{
    run(scheduler, denoiser, x, 0)
}

/// Noise `init` to the level of `first_step`, then denoise from there.
///
/// Skipping the noisiest steps keeps the overall structure of `init`
/// (image-to-image).
pub fn denoise_from<S, D>(
    scheduler: &mut S,
    denoiser: &mut D,
    init: &Tensor,
    noise: &Tensor,
    first_step: usize,
) -> Result<Tensor>
where
    S: Scheduler,
    D: Denoiser + ?Sized,
{
    let x = scheduler.add_noise(init, noise, first_step)?;
    run(scheduler, denoiser, x, first_step)
}

fn run<S, D>(scheduler: &mut S, denoiser: &mut D, mut x: Tensor, first_step: usize) -> Result<Tensor>
where
    S: Scheduler,
    D: Denoiser + ?Sized,
{
    let num_steps = scheduler.num_inference_steps();
    if first_step >= num_steps {
        return Err(Error::StepOutOfRange {
            step: first_step,
            num_steps,
        });
    }

    scheduler.reset();
    tracing::info!(num_steps, first_step, shape = ?x.dims(), "denoising");

    for step in scheduler.steps().skip(first_step) {
        let timestep = scheduler.timesteps()[step];
        let noise_prediction = denoiser.predict_noise(&x, timestep)?;
        x = scheduler.step(&x, &noise_prediction, step)?;
    }

    tracing::info!("denoising done");
    Ok(x)
}
