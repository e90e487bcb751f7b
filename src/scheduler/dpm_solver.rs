//! DPM-Solver++ multistep scheduler (2M), noise-prediction models only.
//!
//! Works in data space: each noise prediction is first turned into an
//! estimate of the clean sample, `D = (x - σ_t ε) / α_t`, and the ODE is
//! integrated in log-SNR `λ`.
//!
//! First call (no history):
//! ```text
//! h  = exp(-(λ_prev - λ_cur))
//! x' = (σ_prev / σ_cur) x - α_prev (h - 1) D
//! ```
//! Later calls extrapolate from the two most recent estimates:
//! ```text
//! r  = (λ_cur - λ_next) / (λ_prev - λ_cur)
//! ΔD = (D_cur - D_next) / r
//! x' = (σ_prev / σ_cur) x - α_prev (h - 1) D_cur - ½ α_prev (h - 1) ΔD
//! ```
//! Here `prev` is the timestep the step lands on and `next` the one the
//! previous call started from.
//!
//! See <https://arxiv.org/abs/2211.01095>.

use candle_core::{DType, Device, Tensor};

use super::{DataHistory, Scheduler, SchedulerConfig, SchedulerCore, TimestepSpacing};
use crate::{Error, Result};

/// Target of the final second-order step: the clean end of the schedule.
const FINAL_TIMESTEP: usize = 0;

/// Per-trajectory solver state.
#[derive(Debug, Clone, Default)]
pub struct SolverState {
    history: DataHistory<2>,
    /// Calls already processed, saturating at 2.
    initial_steps: u8,
}

impl SolverState {
    /// Most recent data-space estimates, newest at `back(0)`.
    pub fn history(&self) -> &DataHistory<2> {
        &self.history
    }

    pub fn initial_steps(&self) -> usize {
        self.initial_steps as usize
    }

    fn advance(&mut self) {
        if self.initial_steps < 2 {
            self.initial_steps += 1;
        }
    }

    fn clear(&mut self) {
        self.history.clear();
        self.initial_steps = 0;
    }
}

/// DPM-Solver++ (2M) scheduler.
#[derive(Debug, Clone)]
pub struct DpmSolver {
    core: SchedulerCore,
    state: SolverState,
}

impl DpmSolver {
    pub fn new(
        num_inference_steps: usize,
        config: SchedulerConfig,
        device: &Device,
        dtype: DType,
    ) -> Result<Self> {
        let core = SchedulerCore::new(
            num_inference_steps,
            config,
            TimestepSpacing::Linspace,
            device,
            dtype,
        )?;
        Ok(Self {
            core,
            state: SolverState::default(),
        })
    }

    pub fn state(&self) -> &SolverState {
        &self.state
    }

    /// Timestep the step at `step` lands on. The last step has no
    /// successor in the sequence and reuses the first one.
    fn first_order_target(&self, step: usize) -> Result<usize> {
        if step + 1 < self.core.num_inference_steps() {
            self.core.timestep(step + 1)
        } else {
            self.core.timestep(0)
        }
    }

    /// Timestep the step at `step` lands on. The last step goes all the
    /// way to the clean end of the schedule.
    fn second_order_target(&self, step: usize) -> Result<usize> {
        if step + 1 < self.core.num_inference_steps() {
            self.core.timestep(step + 1)
        } else {
            Ok(FINAL_TIMESTEP)
        }
    }

    fn first_order_update(&self, x: &Tensor, data_estimate: &Tensor, step: usize) -> Result<Tensor> {
        let current = self.core.coefficients(self.core.timestep(step)?)?;
        let previous = self.core.coefficients(self.first_order_target(step)?)?;

        let h = (&previous.signal_to_noise_ratio - &current.signal_to_noise_ratio)?
            .neg()?
            .exp()?;
        let x_coef = (&previous.noise_std / &current.noise_std)?;
        let data_coef = (&previous.cumulative_scale_factor * (h - 1.0)?)?;

        let denoised = (x.broadcast_mul(&x_coef)? - data_estimate.broadcast_mul(&data_coef)?)?;
        Ok(denoised)
    }

    fn second_order_update(&self, x: &Tensor, step: usize) -> Result<Tensor> {
        let history = self.state.history();
        let (Some(current_data), Some(next_data)) = (history.back(0), history.back(1)) else {
            return Err(Error::Trajectory(format!(
                "second-order update at step {step} needs two data estimates, have {}",
                history.len()
            )));
        };

        let current = self.core.coefficients(self.core.timestep(step)?)?;
        let next = self.core.coefficients(self.core.timestep(step - 1)?)?;
        let previous = self.core.coefficients(self.second_order_target(step)?)?;

        let ratio = ((&current.signal_to_noise_ratio - &next.signal_to_noise_ratio)?
            / (&previous.signal_to_noise_ratio - &current.signal_to_noise_ratio)?)?;
        let data_delta = (current_data - next_data)?.broadcast_div(&ratio)?;

        let h = (&previous.signal_to_noise_ratio - &current.signal_to_noise_ratio)?
            .neg()?
            .exp()?;
        let x_coef = (&previous.noise_std / &current.noise_std)?;
        let data_coef = (&previous.cumulative_scale_factor * (h - 1.0)?)?;
        let delta_coef = (&data_coef * 0.5)?;

        let denoised = ((x.broadcast_mul(&x_coef)? - current_data.broadcast_mul(&data_coef)?)?
            - data_delta.broadcast_mul(&delta_coef)?)?;
        Ok(denoised)
    }
}

impl Scheduler for DpmSolver {
    fn core(&self) -> &SchedulerCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut SchedulerCore {
        &mut self.core
    }

    fn step(&mut self, x: &Tensor, noise_prediction: &Tensor, step: usize) -> Result<Tensor> {
        let timestep = self.core.timestep(step)?;
        self.core.check_sample(x, noise_prediction)?;

        let first_order = self.state.initial_steps == 0;
        if !first_order && step == 0 {
            return Err(Error::Trajectory(
                "second-order update requested at step 0; reset the solver between trajectories"
                    .into(),
            ));
        }

        // D = (x - σ_t ε) / α_t
        let c = self.core.coefficients(timestep)?;
        let data_estimate = (x - noise_prediction.broadcast_mul(&c.noise_std)?)?
            .broadcast_div(&c.cumulative_scale_factor)?;
        self.state.history.push(data_estimate.clone());

        tracing::debug!(
            step,
            timestep,
            order = if first_order { 1 } else { 2 },
            "dpm-solver step"
        );

        let denoised = if first_order {
            self.first_order_update(x, &data_estimate, step)?
        } else {
            self.second_order_update(x, step)?
        };
        self.state.advance();
        Ok(denoised)
    }

    fn reset(&mut self) {
        self.state.clear();
    }

    fn convert_state(&mut self, device: Option<&Device>, dtype: Option<DType>) -> Result<()> {
        self.state.history.to(device, dtype)
    }
}
