//! Latent-diffusion noise schedulers in pure Rust.
//!
//! A candle-based implementation of the scaled-linear diffusion schedule
//! and of the samplers that walk it backward: given a noisy sample and a
//! model's noise prediction at each step, produce the next, less noisy
//! sample.
//!
//! ## Sampling loop
//!
//! ```text
//! x_T ~ N(0, I)
//!   for step in scheduler.steps():
//!     ε   = denoiser(x, timesteps[step])     (external model)
//!     x   = scheduler.step(x, ε, step)
//! x_0
//! ```
//!
//! ## Modules
//!
//! - [`scheduler`]: schedule, timesteps, DPM-Solver++ (2M) and DDIM
//! - [`pipeline`]: the denoising loop around a [`pipeline::Denoiser`]
//! - [`config`]: JSON sampling configuration

pub mod config;
pub mod pipeline;
pub mod scheduler;

mod error;

pub use error::{Error, Result};
pub use scheduler::{AnyScheduler, Ddim, DpmSolver, Scheduler, SchedulerConfig, SchedulerKind};
