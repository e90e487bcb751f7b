//! ldm-trace: inspect a scheduler and run a trajectory against an
//! analytic denoiser.
//!
//! The denoiser predicts noise exactly for data concentrated at a single
//! value (`--target`), so a correct scheduler must end close to it. Useful
//! for comparing schedulers, step counts and precisions without a model.
//!
//! # Output
//!
//! Prints a one-line JSON summary to stdout:
//!
//! ```json
//! {"scheduler":"dpm-solver","dtype":"F32","timesteps":[999,966,...],"target":0.5,"final_mean":0.52,"max_error":0.03}
//! ```
//!
//! Exit code 0 on success, non-zero on error.

use std::path::PathBuf;

use anyhow::Context;
use candle_core::{DType, Device, Tensor};
use clap::Parser;
use ldm_schedulers::{
    Scheduler, SchedulerKind,
    config::{SamplingConfig, parse_dtype},
    pipeline::{denoise, denoise_from},
};
use serde::Serialize;

#[derive(Parser, Debug)]
#[command(
    name = "ldm-trace",
    about = "Run a latent-diffusion scheduler against an analytic denoiser"
)]
struct Args {
    /// JSON sampling config. Command-line flags override its fields.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Scheduler: dpm-solver or ddim.
    #[arg(long)]
    scheduler: Option<SchedulerKind>,

    /// Number of inference steps.
    #[arg(long, short = 'n')]
    steps: Option<usize>,

    /// Working precision: f64, f32, f16, bf16.
    #[arg(long)]
    dtype: Option<String>,

    /// Value the data distribution is concentrated at.
    #[arg(long, default_value_t = 0.5, allow_hyphen_values = true)]
    target: f64,

    /// Start from a noised constant sample at this step instead of pure noise.
    #[arg(long)]
    first_step: Option<usize>,

    /// Latent shape as comma-separated dims.
    #[arg(long, default_value = "1,4,64,64")]
    shape: String,

    /// Use CUDA if available.
    #[arg(long)]
    gpu: bool,
}

#[derive(Serialize)]
struct Summary {
    scheduler: &'static str,
    dtype: String,
    timesteps: Vec<usize>,
    target: f64,
    final_mean: f64,
    max_error: f64,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => SamplingConfig::from_file(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => SamplingConfig::default(),
    };
    if let Some(kind) = args.scheduler {
        config.scheduler = kind;
    }
    if let Some(steps) = args.steps {
        config.num_inference_steps = steps;
    }
    if let Some(dtype) = &args.dtype {
        parse_dtype(dtype)?;
        config.dtype = dtype.clone();
    }
    config.validate()?;

    let shape: Vec<usize> = args
        .shape
        .split(',')
        .map(|d| d.trim().parse::<usize>())
        .collect::<Result<_, _>>()
        .with_context(|| format!("invalid shape '{}'", args.shape))?;

    let device = if args.gpu {
        Device::cuda_if_available(0)?
    } else {
        Device::Cpu
    };
    let dtype = config.dtype()?;
    tracing::info!(?device, ?dtype, scheduler = config.scheduler.name(), "building scheduler");

    let mut scheduler = config.build(&device)?;
    let timesteps = scheduler.timesteps().to_vec();

    // Schedule scalars for the analytic denoiser, read once on the host.
    let schedule = scheduler.core().schedule();
    let alphas = schedule
        .cumulative_scale_factors
        .to_dtype(DType::F64)?
        .to_vec1::<f64>()?;
    let sigmas = schedule.noise_std.to_dtype(DType::F64)?.to_vec1::<f64>()?;
    let target = args.target;
    let mut denoiser = |x: &Tensor, t: usize| -> ldm_schedulers::Result<Tensor> {
        Ok(((x - alphas[t] * target)? / sigmas[t])?)
    };

    let noise = Tensor::randn(0.0_f32, 1.0, shape.as_slice(), &device)?.to_dtype(dtype)?;
    let result = match args.first_step {
        Some(first_step) => {
            let init = (Tensor::ones(shape.as_slice(), dtype, &device)? * target)?;
            denoise_from(&mut scheduler, &mut denoiser, &init, &noise, first_step)?
        }
        None => denoise(&mut scheduler, &mut denoiser, noise)?,
    };

    let result = result.to_dtype(DType::F64)?;
    let final_mean = result.mean_all()?.to_scalar::<f64>()?;
    let max_error = (result - target)?.abs()?.max_all()?.to_scalar::<f64>()?;
    tracing::info!(final_mean, max_error, "trajectory finished");

    let summary = Summary {
        scheduler: config.scheduler.name(),
        dtype: format!("{dtype:?}"),
        timesteps,
        target,
        final_mean,
        max_error,
    };
    println!("{}", serde_json::to_string(&summary)?);

    Ok(())
}
