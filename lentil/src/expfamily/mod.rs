//! Conjugate exponential-family distributions.
//!
//! A distribution is identified by its [`Family`] and a flat vector of
//! natural parameters `η`. The expected sufficient statistics are the
//! gradient of the log-normalizer, `E[T] = ∇A(η)`, obtained by
//! automatic differentiation on the CPU.

mod constructors;
mod family;
mod stats;

pub use constructors::*;
pub use family::Family;
pub use stats::StatsBlocks;

use crate::error::ModelError;
use candle_util::candle_core::{DType, Device, Tensor, Var};

#[derive(Clone)]
pub struct ExpFamilyPrior {
    family: Family,
    natural_hparams: Tensor,
    expected_sufficient_statistics: Tensor,
}

impl std::fmt::Debug for ExpFamilyPrior {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExpFamilyPrior")
            .field("family", &self.family)
            .field("dtype", &self.natural_hparams.dtype())
            .field("device", &self.natural_hparams.device())
            .finish()
    }
}

impl ExpFamilyPrior {
    /// * `family` - family and dimensions
    /// * `natural_hparams` - flat natural parameters
    pub fn new(family: Family, natural_hparams: Tensor) -> anyhow::Result<Self> {
        check_layout(&family, &natural_hparams)?;
        let natural_hparams = natural_hparams.detach();
        let expected_sufficient_statistics = gradient_log_norm(&family, &natural_hparams)?;
        Ok(Self {
            family,
            natural_hparams,
            expected_sufficient_statistics,
        })
    }

    pub fn family(&self) -> Family {
        self.family
    }

    pub fn natural_hparams(&self) -> &Tensor {
        &self.natural_hparams
    }

    pub fn expected_sufficient_statistics(&self) -> &Tensor {
        &self.expected_sufficient_statistics
    }

    pub fn dtype(&self) -> DType {
        self.natural_hparams.dtype()
    }

    pub fn device(&self) -> &Device {
        self.natural_hparams.device()
    }

    /// Log-normalizer at `natural_hparams` (any natural parameters of
    /// this family), returned on the device of the input
    pub fn log_norm(&self, natural_hparams: &Tensor) -> anyhow::Result<Tensor> {
        check_layout(&self.family, natural_hparams)?;
        let device = natural_hparams.device();
        let ret = self
            .family
            .log_norm(&natural_hparams.to_device(&Device::Cpu)?)?;
        Ok(ret.to_device(device)?)
    }

    /// Cut a flat vector of this family into its named blocks
    pub fn split_sufficient_statistics(&self, vector: &Tensor) -> anyhow::Result<StatsBlocks> {
        check_layout(&self.family, vector)?;
        Ok(self.family.split(vector)?)
    }

    /// Replace the natural parameters and recompute the expectations
    pub fn set_natural_hparams(&mut self, value: Tensor) -> anyhow::Result<()> {
        check_layout(&self.family, &value)?;
        let value = value.detach();
        let ess = gradient_log_norm(&self.family, &value)?;
        self.natural_hparams = value;
        self.expected_sufficient_statistics = ess;
        Ok(())
    }

    pub fn to_dtype(&self, dtype: DType) -> anyhow::Result<Self> {
        Self::new(self.family, self.natural_hparams.to_dtype(dtype)?)
    }

    pub fn to_device(&self, device: &Device) -> anyhow::Result<Self> {
        Ok(Self {
            family: self.family,
            natural_hparams: self.natural_hparams.to_device(device)?,
            expected_sufficient_statistics: self.expected_sufficient_statistics.to_device(device)?,
        })
    }
}

/// `KL(posterior || prior)` through the Bregman divergence of the
/// log-normalizer
///
/// `A(η_prior) - A(η_post) - <E_post[T], η_prior - η_post>`
pub fn kl_div(posterior: &ExpFamilyPrior, prior: &ExpFamilyPrior) -> anyhow::Result<Tensor> {
    if posterior.family != prior.family {
        return Err(ModelError::FamilyMismatch {
            posterior: posterior.family.to_string(),
            prior: prior.family.to_string(),
        }
        .into());
    }

    let np_post = posterior.natural_hparams();
    let np_prior = prior.natural_hparams().to_device(np_post.device())?;

    let delta = (&np_prior - np_post)?;
    let inner = posterior
        .expected_sufficient_statistics()
        .mul(&delta)?
        .sum_all()?;

    let ret = ((prior.log_norm(&np_prior)? - posterior.log_norm(np_post)?)? - inner)?;
    Ok(ret)
}

fn check_layout(family: &Family, vector: &Tensor) -> anyhow::Result<()> {
    let dims = vector.dims();
    if dims.len() != 1 || dims[0] != family.num_params() {
        crate::invalid_arg!(
            "{} expects a flat vector of {} parameters, got shape {:?}",
            family,
            family.num_params(),
            dims
        );
    }
    Ok(())
}

/// `∇A(η)` on the CPU, moved back to the device of `natural_hparams`
fn gradient_log_norm(family: &Family, natural_hparams: &Tensor) -> anyhow::Result<Tensor> {
    let device = natural_hparams.device();
    let eta = Var::from_tensor(&natural_hparams.to_device(&Device::Cpu)?)?;
    let log_norm = family.log_norm(eta.as_tensor())?;
    let grads = log_norm.backward()?;
    let ret = match grads.get(eta.as_tensor()) {
        Some(g) => g.clone(),
        None => eta.as_tensor().zeros_like()?,
    };
    Ok(ret.to_device(device)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vec_f64(x: &Tensor) -> Vec<f64> {
        x.to_dtype(DType::F64).unwrap().to_vec1::<f64>().unwrap()
    }

    #[test]
    fn set_natural_hparams_refreshes_expectation() -> anyhow::Result<()> {
        let c = Tensor::new(&[1_f64, 2., 3.], &Device::Cpu)?;
        let mut prior = dirichlet_prior(&c)?;
        let before = vec_f64(prior.expected_sufficient_statistics());

        prior.set_natural_hparams(Tensor::new(&[4_f64, 4., 4.], &Device::Cpu)?)?;
        let after = vec_f64(prior.expected_sufficient_statistics());
        assert_ne!(before, after);
        approx::assert_abs_diff_eq!(after[0], after[2], epsilon = 1e-12);

        let err = prior
            .set_natural_hparams(Tensor::new(&[1_f64, 2.], &Device::Cpu)?)
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ModelError>(),
            Some(ModelError::InvalidArgument(_))
        ));
        Ok(())
    }

    #[test]
    fn kl_div_rejects_other_families() -> anyhow::Result<()> {
        let dev = Device::Cpu;
        let d2 = dirichlet_prior(&Tensor::new(&[1_f64, 1.], &dev)?)?;
        let d3 = dirichlet_prior(&Tensor::new(&[1_f64, 1., 1.], &dev)?)?;
        let g = gamma_prior(1.0, 1.0, DType::F64, &dev)?;

        for (a, b) in [(&d2, &d3), (&d2, &g)] {
            let err = kl_div(a, b).unwrap_err();
            assert!(matches!(
                err.downcast_ref::<ModelError>(),
                Some(ModelError::FamilyMismatch { .. })
            ));
        }
        Ok(())
    }

    #[test]
    fn dtype_round_trip_keeps_family() -> anyhow::Result<()> {
        let prior = gamma_prior(2.0, 3.0, DType::F64, &Device::Cpu)?;
        let prior32 = prior.to_dtype(DType::F32)?;
        assert_eq!(prior32.family(), Family::Gamma);
        assert_eq!(prior32.dtype(), DType::F32);
        let ess = vec_f64(prior32.expected_sufficient_statistics());
        // E[lambda] = shape / rate
        approx::assert_abs_diff_eq!(ess[1], 2. / 3., epsilon = 1e-5);
        Ok(())
    }
}
