//! Error types for ldm-schedulers.

use candle_core::{DType, Shape};

/// Result type alias using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Candle tensor error.
    #[error("candle: {0}")]
    Candle(#[from] candle_core::Error),

    /// Invalid scheduler or sampling configuration.
    #[error("config: {0}")]
    Config(String),

    /// Caller-supplied step index outside `0..num_steps`.
    #[error("step {step} out of range for {num_steps} inference steps")]
    StepOutOfRange { step: usize, num_steps: usize },

    /// Sample and noise (or noise prediction) shapes differ.
    #[error("shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch { expected: Shape, actual: Shape },

    /// Sample dtype differs from the scheduler's working dtype.
    #[error("dtype mismatch: scheduler works in {expected:?}, got {actual:?}")]
    DTypeMismatch { expected: DType, actual: DType },

    /// Solver state cannot serve the requested step (e.g. a second-order
    /// update at step 0 without a reset in between).
    #[error("trajectory: {0}")]
    Trajectory(String),

    /// I/O error.
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error.
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub(crate) fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }
}
