//! Sampling configuration.
//!
//! Everything needed to rebuild a scheduler: which strategy, how many
//! steps, the schedule hyperparameters and the working precision. Loaded
//! from JSON; every field has a default.
//!
//! ```json
//! {"scheduler": "dpm-solver", "num_inference_steps": 30, "dtype": "f16"}
//! ```

use std::path::Path;

use candle_core::{DType, Device};
use serde::{Deserialize, Serialize};

use crate::scheduler::{AnyScheduler, SchedulerConfig, SchedulerKind};
use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplingConfig {
    #[serde(default)]
    pub scheduler: SchedulerKind,

    /// Number of denoising steps (default: 30).
    #[serde(default = "default_num_inference_steps")]
    pub num_inference_steps: usize,

    #[serde(flatten)]
    pub schedule: SchedulerConfig,

    /// Working precision: "f64", "f32", "f16" or "bf16" (default: "f32").
    #[serde(default = "default_dtype")]
    pub dtype: String,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            scheduler: SchedulerKind::default(),
            num_inference_steps: default_num_inference_steps(),
            schedule: SchedulerConfig::default(),
            dtype: default_dtype(),
        }
    }
}

impl SamplingConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json(&content)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.num_inference_steps == 0 {
            return Err(Error::config("num_inference_steps must be positive"));
        }
        self.schedule.validate()?;
        self.dtype()?;
        Ok(())
    }

    /// Parsed working dtype.
    pub fn dtype(&self) -> Result<DType> {
        parse_dtype(&self.dtype)
    }

    pub fn build(&self, device: &Device) -> Result<AnyScheduler> {
        self.scheduler.build(
            self.num_inference_steps,
            self.schedule.clone(),
            device,
            self.dtype()?,
        )
    }
}

/// Float dtypes a schedule can be computed in.
pub fn parse_dtype(name: &str) -> Result<DType> {
    match name.to_ascii_lowercase().as_str() {
        "f64" | "float64" | "double" => Ok(DType::F64),
        "f32" | "float32" | "float" => Ok(DType::F32),
        "f16" | "float16" | "half" => Ok(DType::F16),
        "bf16" | "bfloat16" => Ok(DType::BF16),
        other => Err(Error::config(format!(
            "unsupported dtype '{other}' (expected f64, f32, f16 or bf16)"
        ))),
    }
}

fn default_num_inference_steps() -> usize {
    30
}

fn default_dtype() -> String {
    "f32".to_string()
}
