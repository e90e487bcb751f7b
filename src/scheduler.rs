//! Noise schedulers for latent diffusion.
//!
//! All schedulers share the same precomputed schedule (see [`schedule`])
//! and differ in two things only: which training timesteps they visit
//! ([`TimestepSpacing`]) and how one step of the reverse process is taken.
//!
//! - [`dpm_solver`]: DPM-Solver++ (2M), multistep, second order
//! - [`ddim`]: deterministic DDIM, first order, stateless
//!
//! ## Forward process
//!
//! `x_t = α_t * x_0 + σ_t * ε`, with `α_t² + σ_t² = 1`. The model predicts
//! `ε`; schedulers turn that prediction into `x_{t-1}`.

pub mod ddim;
pub mod dpm_solver;
pub mod history;
pub mod schedule;
pub mod timesteps;

use std::ops::Range;
use std::str::FromStr;

use candle_core::{DType, Device, Tensor};
use serde::{Deserialize, Serialize};

pub use ddim::Ddim;
pub use dpm_solver::{DpmSolver, SolverState};
pub use history::DataHistory;
pub use schedule::{Coefficients, DiffusionSchedule};
pub use timesteps::{TimestepSequence, TimestepSpacing};

use crate::{Error, Result};

/// Common interface for all schedulers.
pub trait Scheduler {
    /// Shared schedule, timesteps and placement.
    fn core(&self) -> &SchedulerCore;

    fn core_mut(&mut self) -> &mut SchedulerCore;

    /// Perform one scheduler step.
    ///
    /// - `x`: current noisy sample
    /// - `noise_prediction`: the denoiser's ε estimate for `x`
    /// - `step`: index into [`Scheduler::timesteps`]
    fn step(&mut self, x: &Tensor, noise_prediction: &Tensor, step: usize) -> Result<Tensor>;

    /// Drop any per-trajectory state.
    fn reset(&mut self) {}

    /// Convert per-trajectory state alongside the schedule in [`Scheduler::to`].
    fn convert_state(&mut self, _device: Option<&Device>, _dtype: Option<DType>) -> Result<()> {
        Ok(())
    }

    /// Step indices `0..num_inference_steps`.
    fn steps(&self) -> Range<usize> {
        self.core().steps()
    }

    /// Training timesteps visited, noisiest first.
    fn timesteps(&self) -> &[usize] {
        self.core().timesteps().as_slice()
    }

    fn num_inference_steps(&self) -> usize {
        self.core().num_inference_steps()
    }

    /// Noise `x` to the level of `step`: `α_t * x + σ_t * noise`.
    fn add_noise(&self, x: &Tensor, noise: &Tensor, step: usize) -> Result<Tensor> {
        self.core().add_noise(x, noise, step)
    }

    /// Regenerate timesteps for a new step count and start a fresh trajectory.
    fn set_num_inference_steps(&mut self, num_inference_steps: usize) -> Result<()> {
        self.core_mut().set_num_inference_steps(num_inference_steps)?;
        self.reset();
        Ok(())
    }

    /// Move and/or convert in place, returning `self` for chaining.
    fn to(&mut self, device: Option<&Device>, dtype: Option<DType>) -> Result<&mut Self>
    where
        Self: Sized,
    {
        self.core_mut().to(device, dtype)?;
        self.convert_state(device, dtype)?;
        Ok(self)
    }
}

/// Hyperparameters of the diffusion schedule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Number of training timesteps (default: 1000).
    #[serde(default = "default_num_train_timesteps")]
    pub num_train_timesteps: usize,

    /// β at the first training timestep (default: 8.5e-4).
    #[serde(default = "default_initial_diffusion_rate")]
    pub initial_diffusion_rate: f64,

    /// β at the last training timestep (default: 1.2e-2).
    #[serde(default = "default_final_diffusion_rate")]
    pub final_diffusion_rate: f64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            num_train_timesteps: default_num_train_timesteps(),
            initial_diffusion_rate: default_initial_diffusion_rate(),
            final_diffusion_rate: default_final_diffusion_rate(),
        }
    }
}

impl SchedulerConfig {
    /// Requires `T > 0` and `0 < initial < final < 1`.
    pub fn validate(&self) -> Result<()> {
        if self.num_train_timesteps == 0 {
            return Err(Error::config("num_train_timesteps must be positive"));
        }
        let (initial, last) = (self.initial_diffusion_rate, self.final_diffusion_rate);
        if !(0.0 < initial && initial < last && last < 1.0) {
            return Err(Error::config(format!(
                "diffusion rates must satisfy 0 < initial < final < 1, got {initial} and {last}"
            )));
        }
        Ok(())
    }
}

fn default_num_train_timesteps() -> usize {
    1000
}

fn default_initial_diffusion_rate() -> f64 {
    8.5e-4
}

fn default_final_diffusion_rate() -> f64 {
    1.2e-2
}

/// State shared by every scheduler: the schedule, the visited timesteps,
/// and where and in which precision they live.
#[derive(Debug, Clone)]
pub struct SchedulerCore {
    config: SchedulerConfig,
    spacing: TimestepSpacing,
    schedule: DiffusionSchedule,
    timesteps: TimestepSequence,
    device: Device,
    dtype: DType,
}

impl SchedulerCore {
    /// Validate arguments, then build the schedule and timestep sequence.
    pub fn new(
        num_inference_steps: usize,
        config: SchedulerConfig,
        spacing: TimestepSpacing,
        device: &Device,
        dtype: DType,
    ) -> Result<Self> {
        config.validate()?;
        if !dtype.is_float() {
            return Err(Error::config(format!(
                "scheduler dtype must be a float type, got {dtype:?}"
            )));
        }
        let timesteps = TimestepSequence::new(
            spacing,
            config.num_train_timesteps,
            num_inference_steps,
            device,
        )?;
        let schedule = DiffusionSchedule::new(
            config.num_train_timesteps,
            config.initial_diffusion_rate,
            config.final_diffusion_rate,
            device,
            dtype,
        )?;

        tracing::debug!(
            num_inference_steps,
            num_train_timesteps = config.num_train_timesteps,
            ?spacing,
            ?dtype,
            "scheduler built"
        );

        Ok(Self {
            config,
            spacing,
            schedule,
            timesteps,
            device: device.clone(),
            dtype,
        })
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn schedule(&self) -> &DiffusionSchedule {
        &self.schedule
    }

    pub fn timesteps(&self) -> &TimestepSequence {
        &self.timesteps
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn num_inference_steps(&self) -> usize {
        self.timesteps.len()
    }

    pub fn steps(&self) -> Range<usize> {
        0..self.num_inference_steps()
    }

    /// Training timestep visited at `step`.
    pub fn timestep(&self, step: usize) -> Result<usize> {
        self.timesteps.get(step)
    }

    /// Schedule scalars at training timestep `t`.
    pub fn coefficients(&self, t: usize) -> Result<Coefficients> {
        self.schedule.coefficients(t)
    }

    pub fn add_noise(&self, x: &Tensor, noise: &Tensor, step: usize) -> Result<Tensor> {
        let t = self.timestep(step)?;
        self.check_sample(x, noise)?;
        let c = self.coefficients(t)?;
        let noised = (x.broadcast_mul(&c.cumulative_scale_factor)?
            + noise.broadcast_mul(&c.noise_std)?)?;
        Ok(noised)
    }

    /// `x` and `other` must agree in shape and match the working dtype.
    pub fn check_sample(&self, x: &Tensor, other: &Tensor) -> Result<()> {
        if x.shape() != other.shape() {
            return Err(Error::ShapeMismatch {
                expected: x.shape().clone(),
                actual: other.shape().clone(),
            });
        }
        for tensor in [x, other] {
            if tensor.dtype() != self.dtype {
                return Err(Error::DTypeMismatch {
                    expected: self.dtype,
                    actual: tensor.dtype(),
                });
            }
        }
        Ok(())
    }

    pub fn set_num_inference_steps(&mut self, num_inference_steps: usize) -> Result<()> {
        self.timesteps = TimestepSequence::new(
            self.spacing,
            self.config.num_train_timesteps,
            num_inference_steps,
            &self.device,
        )?;
        Ok(())
    }

    /// Schedule values are rounded to `dtype`; timesteps keep their values.
    pub fn to(&mut self, device: Option<&Device>, dtype: Option<DType>) -> Result<&mut Self> {
        if let Some(dtype) = dtype
            && !dtype.is_float()
        {
            return Err(Error::config(format!(
                "scheduler dtype must be a float type, got {dtype:?}"
            )));
        }
        self.schedule.to(device, dtype)?;
        if let Some(device) = device {
            self.timesteps.to_device(device)?;
            self.device = device.clone();
        }
        if let Some(dtype) = dtype {
            self.dtype = dtype;
        }
        Ok(self)
    }
}

/// The available step-update strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SchedulerKind {
    #[default]
    DpmSolver,
    Ddim,
}

impl SchedulerKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::DpmSolver => "dpm-solver",
            Self::Ddim => "ddim",
        }
    }

    pub fn build(
        self,
        num_inference_steps: usize,
        config: SchedulerConfig,
        device: &Device,
        dtype: DType,
    ) -> Result<AnyScheduler> {
        Ok(match self {
            Self::DpmSolver => {
                AnyScheduler::DpmSolver(DpmSolver::new(num_inference_steps, config, device, dtype)?)
            }
            Self::Ddim => AnyScheduler::Ddim(Ddim::new(num_inference_steps, config, device, dtype)?),
        })
    }
}

impl FromStr for SchedulerKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('_', "-").as_str() {
            "dpm-solver" | "dpm" | "dpmsolver" => Ok(Self::DpmSolver),
            "ddim" => Ok(Self::Ddim),
            other => Err(format!("unknown scheduler '{other}' (expected dpm-solver or ddim)")),
        }
    }
}

/// A scheduler chosen at construction time.
#[derive(Debug, Clone)]
pub enum AnyScheduler {
    DpmSolver(DpmSolver),
    Ddim(Ddim),
}

impl AnyScheduler {
    pub fn kind(&self) -> SchedulerKind {
        match self {
            Self::DpmSolver(_) => SchedulerKind::DpmSolver,
            Self::Ddim(_) => SchedulerKind::Ddim,
        }
    }
}

impl Scheduler for AnyScheduler {
    fn core(&self) -> &SchedulerCore {
        match self {
            Self::DpmSolver(s) => s.core(),
            Self::Ddim(s) => s.core(),
        }
    }

    fn core_mut(&mut self) -> &mut SchedulerCore {
        match self {
            Self::DpmSolver(s) => s.core_mut(),
            Self::Ddim(s) => s.core_mut(),
        }
    }

    fn step(&mut self, x: &Tensor, noise_prediction: &Tensor, step: usize) -> Result<Tensor> {
        match self {
            Self::DpmSolver(s) => s.step(x, noise_prediction, step),
            Self::Ddim(s) => s.step(x, noise_prediction, step),
        }
    }

    fn reset(&mut self) {
        match self {
            Self::DpmSolver(s) => s.reset(),
            Self::Ddim(s) => s.reset(),
        }
    }

    fn convert_state(&mut self, device: Option<&Device>, dtype: Option<DType>) -> Result<()> {
        match self {
            Self::DpmSolver(s) => s.convert_state(device, dtype),
            Self::Ddim(s) => s.convert_state(device, dtype),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sd_core(num_inference_steps: usize, dtype: DType) -> SchedulerCore {
        SchedulerCore::new(
            num_inference_steps,
            SchedulerConfig::default(),
            TimestepSpacing::Linspace,
            &Device::Cpu,
            dtype,
        )
        .unwrap()
    }

    fn max_abs_diff(a: &Tensor, b: &Tensor) -> f32 {
        (a - b)
            .unwrap()
            .abs()
            .unwrap()
            .max_all()
            .unwrap()
            .to_dtype(DType::F32)
            .unwrap()
            .to_scalar()
            .unwrap()
    }

    #[test]
    fn default_config() {
        let config = SchedulerConfig::default();
        assert_eq!(config.num_train_timesteps, 1000);
        assert_eq!(config.initial_diffusion_rate, 8.5e-4);
        assert_eq!(config.final_diffusion_rate, 1.2e-2);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn config_serde_defaults() {
        let config: SchedulerConfig = serde_json::from_str(r#"{"num_train_timesteps": 500}"#).unwrap();
        assert_eq!(config.num_train_timesteps, 500);
        assert_eq!(config.final_diffusion_rate, 1.2e-2);
    }

    #[test]
    fn config_rejects_bad_rates() {
        for (initial, last) in [(1.2e-2, 8.5e-4), (0.0, 1.2e-2), (8.5e-4, 1.0), (0.5, 0.5)] {
            let config = SchedulerConfig {
                initial_diffusion_rate: initial,
                final_diffusion_rate: last,
                ..Default::default()
            };
            assert!(
                matches!(config.validate(), Err(Error::Config(_))),
                "accepted rates {initial}, {last}"
            );
        }
        let config = SchedulerConfig {
            num_train_timesteps: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn core_rejects_zero_steps() {
        let result = SchedulerCore::new(
            0,
            SchedulerConfig::default(),
            TimestepSpacing::Linspace,
            &Device::Cpu,
            DType::F32,
        );
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn steps_are_restartable() {
        let core = sd_core(30, DType::F32);
        assert_eq!(core.steps().count(), 30);
        assert_eq!(core.steps().collect::<Vec<_>>(), (0..30).collect::<Vec<_>>());
        assert_eq!(core.timestep(0).unwrap(), 999);
    }

    #[test]
    fn add_noise_matches_closed_form() {
        let core = sd_core(30, DType::F32);
        let device = Device::Cpu;
        let x = Tensor::randn(0.0_f32, 1.0, (2, 4, 8, 8), &device).unwrap();
        let noise = Tensor::randn(0.0_f32, 1.0, (2, 4, 8, 8), &device).unwrap();

        let noised = core.add_noise(&x, &noise, 10).unwrap();
        assert_eq!(noised.dims(), &[2, 4, 8, 8]);

        let t = core.timestep(10).unwrap();
        let alpha = core.schedule().cumulative_scale_factors.to_vec1::<f32>().unwrap()[t];
        let sigma = core.schedule().noise_std.to_vec1::<f32>().unwrap()[t];
        let expected = ((&x * alpha as f64).unwrap() + (&noise * sigma as f64).unwrap()).unwrap();
        let diff = max_abs_diff(&noised, &expected);
        assert!(diff < 1e-5, "add_noise diff = {diff}");
    }

    #[test]
    fn add_noise_near_clean_end_is_identity() {
        // With 999 steps the last visited timestep is 1, where α ≈ 1 and σ ≈ 0.
        let core = sd_core(999, DType::F32);
        let last = core.num_inference_steps() - 1;
        assert_eq!(core.timestep(last).unwrap(), 1);

        let device = Device::Cpu;
        let x = Tensor::ones((1, 4, 8, 8), DType::F32, &device).unwrap();
        let noise = Tensor::ones((1, 4, 8, 8), DType::F32, &device).unwrap();
        let noised = core.add_noise(&x, &noise, last).unwrap();
        let diff = max_abs_diff(&noised, &x);
        assert!(diff < 0.05, "expected add_noise ≈ x at the clean end, diff = {diff}");
    }

    #[test]
    fn add_noise_errors() {
        let core = sd_core(10, DType::F32);
        let device = Device::Cpu;
        let x = Tensor::ones((1, 4, 8, 8), DType::F32, &device).unwrap();
        let noise = Tensor::ones((1, 4, 8, 4), DType::F32, &device).unwrap();
        assert!(matches!(
            core.add_noise(&x, &noise, 0),
            Err(Error::ShapeMismatch { .. })
        ));
        assert!(matches!(
            core.add_noise(&x, &x, 10),
            Err(Error::StepOutOfRange {
                step: 10,
                num_steps: 10
            })
        ));
        let x64 = x.to_dtype(DType::F64).unwrap();
        assert!(matches!(
            core.add_noise(&x64, &x64, 0),
            Err(Error::DTypeMismatch {
                expected: DType::F32,
                actual: DType::F64
            })
        ));
    }

    #[test]
    fn to_half_rounds_without_recomputing() {
        let mut core = sd_core(30, DType::F32);
        let timesteps = core.timesteps().as_slice().to_vec();
        let before = core.schedule().noise_std.to_vec1::<f32>().unwrap();

        core.to(None, Some(DType::F16)).unwrap();

        assert_eq!(core.dtype(), DType::F16);
        assert_eq!(core.timesteps().as_slice(), timesteps.as_slice());
        assert_eq!(core.timesteps().tensor().dtype(), DType::U32);

        let after = core.schedule().noise_std.to_vec1::<half::f16>().unwrap();
        for (b, a) in before.iter().zip(&after) {
            assert_eq!(half::f16::from_f32(*b).to_bits(), a.to_bits());
        }
    }

    #[test]
    fn to_chains_and_rejects_integer_dtype() {
        let mut core = sd_core(10, DType::F32);
        let dtype = core
            .to(Some(&Device::Cpu), Some(DType::F64))
            .unwrap()
            .dtype();
        assert_eq!(dtype, DType::F64);
        assert!(core.to(None, Some(DType::U8)).is_err());
        assert_eq!(core.dtype(), DType::F64);
    }

    #[test]
    fn set_num_inference_steps_regenerates() {
        let mut core = sd_core(30, DType::F32);
        core.set_num_inference_steps(10).unwrap();
        assert_eq!(core.num_inference_steps(), 10);
        assert_eq!(core.timestep(0).unwrap(), 999);
        assert!(core.set_num_inference_steps(0).is_err());
    }

    #[test]
    fn scheduler_kind_parse_and_build() {
        assert_eq!("dpm-solver".parse::<SchedulerKind>().unwrap(), SchedulerKind::DpmSolver);
        assert_eq!("DDIM".parse::<SchedulerKind>().unwrap(), SchedulerKind::Ddim);
        assert!("euler".parse::<SchedulerKind>().is_err());

        let kind: SchedulerKind = serde_json::from_str(r#""ddim""#).unwrap();
        let scheduler = kind
            .build(20, SchedulerConfig::default(), &Device::Cpu, DType::F32)
            .unwrap();
        assert_eq!(scheduler.kind(), SchedulerKind::Ddim);
        assert_eq!(scheduler.timesteps()[0], 951);
    }
}
