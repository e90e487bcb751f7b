//! Precomputed diffusion schedule.
//!
//! Linear-in-sqrt beta schedule (the "scaled linear" schedule of SD 1.x):
//! ```text
//! β_t  = linspace(√β_0, √β_T, T)²
//! α_t  = √(∏_{s≤t} (1 - β_s))        cumulative scale factor
//! σ_t  = √(1 - ∏_{s≤t} (1 - β_s))    noise std
//! λ_t  = log α_t - log σ_t            log signal-to-noise ratio
//! ```

use std::ops::Mul;

use candle_core::{DType, Device, Tensor, WithDType};

use super::timesteps::linspace;
use crate::{Error, Result};

/// Four parallel 1-D tensors indexed by training timestep.
#[derive(Debug, Clone)]
pub struct DiffusionSchedule {
    pub scale_factors: Tensor,
    pub cumulative_scale_factors: Tensor,
    pub noise_std: Tensor,
    pub signal_to_noise_ratios: Tensor,
}

impl DiffusionSchedule {
    /// Build the schedule in `dtype` on `device`.
    ///
    /// Only the initial linspace is evaluated in f64; everything after the
    /// cast runs in the working dtype.
    pub fn new(
        num_train_timesteps: usize,
        initial_diffusion_rate: f64,
        final_diffusion_rate: f64,
        device: &Device,
        dtype: DType,
    ) -> Result<Self> {
        if !dtype.is_float() {
            return Err(Error::config(format!(
                "diffusion schedule needs a float dtype, got {dtype:?}"
            )));
        }
        let sqrt_betas = linspace(
            initial_diffusion_rate.sqrt(),
            final_diffusion_rate.sqrt(),
            num_train_timesteps,
        );
        let sqrt_betas = Tensor::from_vec(sqrt_betas, num_train_timesteps, device)?.to_dtype(dtype)?;

        // 1 - β
        let scale_factors = sqrt_betas.sqr()?.affine(-1.0, 1.0)?;
        let cumprod = cumulative_product(&scale_factors)?;
        let cumulative_scale_factors = cumprod.sqrt()?;
        let noise_std = cumprod.affine(-1.0, 1.0)?.sqrt()?;
        let signal_to_noise_ratios = (cumulative_scale_factors.log()? - noise_std.log()?)?;

        Ok(Self {
            scale_factors,
            cumulative_scale_factors,
            noise_std,
            signal_to_noise_ratios,
        })
    }

    pub fn len(&self) -> usize {
        self.scale_factors.dim(0).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dtype(&self) -> DType {
        self.scale_factors.dtype()
    }

    /// `(α_t, σ_t, λ_t)` at training timestep `t`, as 0-d tensors.
    pub fn coefficients(&self, t: usize) -> Result<Coefficients> {
        Ok(Coefficients {
            cumulative_scale_factor: self.cumulative_scale_factors.get(t)?,
            noise_std: self.noise_std.get(t)?,
            signal_to_noise_ratio: self.signal_to_noise_ratios.get(t)?,
        })
    }

    /// Convert in place. Values are rounded to `dtype`, never recomputed.
    pub(crate) fn to(&mut self, device: Option<&Device>, dtype: Option<DType>) -> Result<()> {
        for tensor in [
            &mut self.scale_factors,
            &mut self.cumulative_scale_factors,
            &mut self.noise_std,
            &mut self.signal_to_noise_ratios,
        ] {
            if let Some(device) = device {
                *tensor = tensor.to_device(device)?;
            }
            if let Some(dtype) = dtype {
                *tensor = tensor.to_dtype(dtype)?;
            }
        }
        Ok(())
    }
}

/// Per-timestep scalars, in the schedule's dtype and on its device.
#[derive(Debug, Clone)]
pub struct Coefficients {
    pub cumulative_scale_factor: Tensor,
    pub noise_std: Tensor,
    pub signal_to_noise_ratio: Tensor,
}

/// Running product along a 1-D tensor, accumulated in its own dtype.
fn cumulative_product(values: &Tensor) -> Result<Tensor> {
    match values.dtype() {
        DType::F64 => cumprod_as::<f64>(values),
        DType::F32 => cumprod_as::<f32>(values),
        DType::F16 => cumprod_as::<half::f16>(values),
        DType::BF16 => cumprod_as::<half::bf16>(values),
        other => Err(Error::config(format!("no cumulative product for {other:?}"))),
    }
}

fn cumprod_as<T: WithDType + Mul<Output = T>>(values: &Tensor) -> Result<Tensor> {
    let host = values.to_vec1::<T>()?;
    let mut acc = T::from_f64(1.0);
    let products: Vec<T> = host
        .into_iter()
        .map(|v| {
            acc = acc * v;
            acc
        })
        .collect();
    let len = products.len();
    Ok(Tensor::from_vec(products, len, values.device())?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sd1_schedule(dtype: DType) -> DiffusionSchedule {
        DiffusionSchedule::new(1000, 8.5e-4, 1.2e-2, &Device::Cpu, dtype).unwrap()
    }

    #[test]
    fn schedule_monotonic() {
        let schedule = sd1_schedule(DType::F32);
        assert_eq!(schedule.len(), 1000);

        let alphas = schedule.cumulative_scale_factors.to_vec1::<f32>().unwrap();
        let sigmas = schedule.noise_std.to_vec1::<f32>().unwrap();
        let lambdas = schedule.signal_to_noise_ratios.to_vec1::<f32>().unwrap();

        for t in 0..1000 {
            assert!(alphas[t] > 0.0 && alphas[t] < 1.0, "alpha[{t}] = {}", alphas[t]);
            assert!(sigmas[t] > 0.0 && sigmas[t] < 1.0, "sigma[{t}] = {}", sigmas[t]);
        }
        for t in 0..999 {
            assert!(alphas[t] > alphas[t + 1], "alpha not decreasing at {t}");
            assert!(sigmas[t] < sigmas[t + 1], "sigma not increasing at {t}");
            assert!(lambdas[t] > lambdas[t + 1], "log-SNR not decreasing at {t}");
        }
    }

    #[test]
    fn schedule_endpoints() {
        let schedule = sd1_schedule(DType::F64);
        let betas = schedule
            .scale_factors
            .affine(-1.0, 1.0)
            .unwrap()
            .to_vec1::<f64>()
            .unwrap();
        assert!((betas[0] - 8.5e-4).abs() < 1e-12, "beta[0] = {}", betas[0]);
        assert!((betas[999] - 1.2e-2).abs() < 1e-12, "beta[999] = {}", betas[999]);

        let sigma0 = schedule.noise_std.to_vec1::<f64>().unwrap()[0];
        assert!((sigma0 - 8.5e-4_f64.sqrt()).abs() < 1e-9, "sigma[0] = {sigma0}");

        // α² + σ² = 1 everywhere.
        let alphas = schedule.cumulative_scale_factors.to_vec1::<f64>().unwrap();
        let sigmas = schedule.noise_std.to_vec1::<f64>().unwrap();
        for (a, s) in alphas.iter().zip(&sigmas) {
            assert!((a * a + s * s - 1.0).abs() < 1e-12);
        }
    }

    #[test]
    fn schedule_deterministic() {
        let a = sd1_schedule(DType::F32);
        let b = sd1_schedule(DType::F32);
        for (x, y) in [
            (&a.scale_factors, &b.scale_factors),
            (&a.cumulative_scale_factors, &b.cumulative_scale_factors),
            (&a.noise_std, &b.noise_std),
            (&a.signal_to_noise_ratios, &b.signal_to_noise_ratios),
        ] {
            let x = x.to_vec1::<f32>().unwrap();
            let y = y.to_vec1::<f32>().unwrap();
            assert!(
                x.iter().zip(&y).all(|(p, q)| p.to_bits() == q.to_bits()),
                "schedule not bit-identical across builds"
            );
        }
    }

    #[test]
    fn schedule_half_precision_stays_half() {
        let schedule = sd1_schedule(DType::F16);
        assert_eq!(schedule.dtype(), DType::F16);
        assert_eq!(schedule.noise_std.dtype(), DType::F16);
        assert_eq!(schedule.signal_to_noise_ratios.dtype(), DType::F16);

        let c = schedule.coefficients(999).unwrap();
        assert_eq!(c.cumulative_scale_factor.dims(), &[] as &[usize]);
        assert_eq!(c.noise_std.dtype(), DType::F16);
    }

    #[test]
    fn schedule_rejects_integer_dtype() {
        let result = DiffusionSchedule::new(10, 8.5e-4, 1.2e-2, &Device::Cpu, DType::U32);
        assert!(result.is_err());
    }
}
