//! Inference timestep sequences.
//!
//! A sampler never visits all `T` training timesteps; it walks a strictly
//! descending subsequence of them. How that subsequence is chosen is a
//! per-solver policy ([`TimestepSpacing`]).

use candle_core::{Device, Tensor};

use crate::{Error, Result};

/// How inference timesteps are spread over the training range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimestepSpacing {
    /// `N + 1` evenly spaced points over `[0, T - 1]`, rounded, first dropped.
    ///
    /// Always computed in f64: at f32 the half-integer rounding boundary
    /// lands differently (e.g. `15 * 999 / 30` is `499.49999999999994`
    /// in f64 but `499.5` in f32), which changes the sequence.
    Linspace,
    /// `i * (T / N) + 1` for `i` in `0..N`.
    Leading,
}

impl TimestepSpacing {
    /// Generate the descending timestep sequence for `num_inference_steps`.
    pub fn generate(self, num_train_timesteps: usize, num_inference_steps: usize) -> Vec<usize> {
        let mut timesteps: Vec<usize> = match self {
            Self::Linspace => linspace(
                0.0,
                (num_train_timesteps - 1) as f64,
                num_inference_steps + 1,
            )
            .into_iter()
            .skip(1)
            .map(|t| t.round_ties_even() as usize)
            .collect(),
            Self::Leading => {
                let step_ratio = num_train_timesteps / num_inference_steps;
                (0..num_inference_steps).map(|i| i * step_ratio + 1).collect()
            }
        };
        timesteps.reverse();
        timesteps
    }
}

/// Evenly spaced values over `[start, stop]`, endpoint pinned.
pub(crate) fn linspace(start: f64, stop: f64, num: usize) -> Vec<f64> {
    match num {
        0 => Vec::new(),
        1 => vec![start],
        _ => {
            let step = (stop - start) / (num - 1) as f64;
            let mut values: Vec<f64> = (0..num).map(|i| start + i as f64 * step).collect();
            values[num - 1] = stop;
            values
        }
    }
}

/// The timesteps actually visited during sampling, noisiest first.
#[derive(Debug, Clone)]
pub struct TimestepSequence {
    values: Vec<usize>,
    /// Same values as a `U32` tensor, for the denoiser's timestep embedding.
    tensor: Tensor,
}

impl TimestepSequence {
    /// Build and validate the sequence for `spacing`.
    ///
    /// Fails if the generated values are not strictly descending within
    /// `[0, num_train_timesteps)`, which happens when too many inference
    /// steps are requested for the training range.
    pub fn new(
        spacing: TimestepSpacing,
        num_train_timesteps: usize,
        num_inference_steps: usize,
        device: &Device,
    ) -> Result<Self> {
        if num_inference_steps == 0 {
            return Err(Error::config("num_inference_steps must be positive"));
        }
        let values = spacing.generate(num_train_timesteps, num_inference_steps);

        if let Some(&first) = values.first()
            && first >= num_train_timesteps
        {
            return Err(Error::config(format!(
                "{spacing:?} spacing with {num_inference_steps} steps reaches timestep {first}, \
                 beyond the {num_train_timesteps} training timesteps"
            )));
        }
        if values.windows(2).any(|w| w[0] <= w[1]) {
            return Err(Error::config(format!(
                "{num_inference_steps} inference steps do not yield distinct timesteps \
                 over {num_train_timesteps} training timesteps"
            )));
        }

        let as_u32: Vec<u32> = values.iter().map(|&t| t as u32).collect();
        let tensor = Tensor::from_vec(as_u32, values.len(), device)?;
        Ok(Self { values, tensor })
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Timestep visited at `step`, or [`Error::StepOutOfRange`].
    pub fn get(&self, step: usize) -> Result<usize> {
        self.values
            .get(step)
            .copied()
            .ok_or(Error::StepOutOfRange {
                step,
                num_steps: self.values.len(),
            })
    }

    pub fn as_slice(&self) -> &[usize] {
        &self.values
    }

    pub fn tensor(&self) -> &Tensor {
        &self.tensor
    }

    /// Move the timestep tensor. Integer values never change dtype.
    pub(crate) fn to_device(&mut self, device: &Device) -> Result<()> {
        self.tensor = self.tensor.to_device(device)?;
        Ok(())
    }
}
