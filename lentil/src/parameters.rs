use crate::expfamily::{kl_div, ExpFamilyPrior, StatsBlocks};
use candle_util::candle_core::{DType, Device, Tensor};
use fnv::FnvHashMap;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_PARAM_ID: AtomicU64 = AtomicU64::new(0);

/// Process-unique identity of a [`BayesianParameter`]. Two parameters
/// with equal values are still different keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ParamId(u64);

impl ParamId {
    fn fresh() -> Self {
        ParamId(NEXT_PARAM_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Accumulated sufficient statistics routed to their parameter
pub type AccumulatedStats = FnvHashMap<ParamId, Tensor>;

/// A parameter with a prior and a (variational) posterior of the same
/// family, plus a natural gradient buffer in the shape of their
/// natural parameters
#[derive(Debug)]
pub struct BayesianParameter {
    id: ParamId,
    prior: ExpFamilyPrior,
    posterior: ExpFamilyPrior,
    natural_grad: Tensor,
}

impl BayesianParameter {
    pub fn new(prior: ExpFamilyPrior, posterior: ExpFamilyPrior) -> anyhow::Result<Self> {
        if prior.family() != posterior.family() {
            return Err(crate::error::ModelError::FamilyMismatch {
                posterior: posterior.family().to_string(),
                prior: prior.family().to_string(),
            }
            .into());
        }
        let natural_grad = posterior.natural_hparams().zeros_like()?;
        Ok(Self {
            id: ParamId::fresh(),
            prior,
            posterior,
            natural_grad,
        })
    }

    /// Prior and posterior both start from `prior`
    pub fn from_prior(prior: ExpFamilyPrior) -> anyhow::Result<Self> {
        let posterior = prior.clone();
        Self::new(prior, posterior)
    }

    pub fn id(&self) -> ParamId {
        self.id
    }

    pub fn prior(&self) -> &ExpFamilyPrior {
        &self.prior
    }

    pub fn posterior(&self) -> &ExpFamilyPrior {
        &self.posterior
    }

    pub fn natural_grad(&self) -> &Tensor {
        &self.natural_grad
    }

    /// Posterior expectation of the sufficient statistics
    pub fn expected_value(&self) -> &Tensor {
        self.posterior.expected_sufficient_statistics()
    }

    pub fn expected_value_split(&self) -> anyhow::Result<StatsBlocks> {
        self.posterior
            .split_sufficient_statistics(self.posterior.expected_sufficient_statistics())
    }

    pub fn zero_natural_grad(&mut self) -> anyhow::Result<()> {
        self.natural_grad = self.natural_grad.zeros_like()?;
        Ok(())
    }

    pub fn add_natural_grad(&mut self, delta: &Tensor) -> anyhow::Result<()> {
        let delta = delta
            .detach()
            .to_dtype(self.natural_grad.dtype())?
            .to_device(self.natural_grad.device())?;
        if delta.dims() != self.natural_grad.dims() {
            crate::invalid_arg!(
                "natural gradient of shape {:?} for a parameter of shape {:?}",
                delta.dims(),
                self.natural_grad.dims()
            );
        }
        self.natural_grad = (&self.natural_grad + delta)?;
        Ok(())
    }

    /// `posterior.η <- posterior.η + lr * natural_grad`
    pub fn natural_grad_step(&mut self, learning_rate: f64) -> anyhow::Result<()> {
        let updated = (self.posterior.natural_hparams() + (&self.natural_grad * learning_rate)?)?;
        self.posterior.set_natural_hparams(updated)
    }

    /// Replace the posterior natural parameters
    pub fn set_posterior_natural_hparams(&mut self, value: Tensor) -> anyhow::Result<()> {
        self.posterior.set_natural_hparams(value)
    }

    /// `KL(posterior || prior)`, a scalar
    pub fn kl_div(&self) -> anyhow::Result<Tensor> {
        kl_div(&self.posterior, &self.prior)
    }

    pub fn to_dtype_(&mut self, dtype: DType) -> anyhow::Result<()> {
        self.prior = self.prior.to_dtype(dtype)?;
        self.posterior = self.posterior.to_dtype(dtype)?;
        self.natural_grad = self.natural_grad.to_dtype(dtype)?;
        Ok(())
    }

    pub fn to_device_(&mut self, device: &Device) -> anyhow::Result<()> {
        self.prior = self.prior.to_device(device)?;
        self.posterior = self.posterior.to_device(device)?;
        self.natural_grad = self.natural_grad.to_device(device)?;
        Ok(())
    }

    /// A converted copy; the copy gets its own identity
    pub(crate) fn converted(&self, dtype: DType, device: &Device) -> anyhow::Result<Self> {
        Self::new(
            self.prior.to_dtype(dtype)?.to_device(device)?,
            self.posterior.to_dtype(dtype)?.to_device(device)?,
        )
    }
}

/// Fixed-size ordered collection of parameters
#[derive(Debug, Default)]
pub struct BayesianParameterSet {
    parameters: Vec<BayesianParameter>,
}

impl BayesianParameterSet {
    pub fn new(parameters: Vec<BayesianParameter>) -> Self {
        Self { parameters }
    }

    pub fn len(&self) -> usize {
        self.parameters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parameters.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&BayesianParameter> {
        self.parameters.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut BayesianParameter> {
        self.parameters.get_mut(index)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, BayesianParameter> {
        self.parameters.iter()
    }

    pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, BayesianParameter> {
        self.parameters.iter_mut()
    }

    pub fn ids(&self) -> Vec<ParamId> {
        self.parameters.iter().map(|p| p.id()).collect()
    }

    pub fn to_dtype_(&mut self, dtype: DType) -> anyhow::Result<()> {
        for param in self.parameters.iter_mut() {
            param.to_dtype_(dtype)?;
        }
        Ok(())
    }

    pub fn to_device_(&mut self, device: &Device) -> anyhow::Result<()> {
        for param in self.parameters.iter_mut() {
            param.to_device_(device)?;
        }
        Ok(())
    }

    pub(crate) fn converted(&self, dtype: DType, device: &Device) -> anyhow::Result<Self> {
        Ok(Self::new(
            self.parameters
                .iter()
                .map(|p| p.converted(dtype, device))
                .collect::<anyhow::Result<Vec<_>>>()?,
        ))
    }
}

impl<'a> IntoIterator for &'a BayesianParameterSet {
    type Item = &'a BayesianParameter;
    type IntoIter = std::slice::Iter<'a, BayesianParameter>;

    fn into_iter(self) -> Self::IntoIter {
        self.parameters.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expfamily::{dirichlet_prior, gamma_prior};

    #[test]
    fn identity_is_not_value() -> anyhow::Result<()> {
        let dev = Device::Cpu;
        let c = Tensor::new(&[1_f64, 1.], &dev)?;
        let a = BayesianParameter::from_prior(dirichlet_prior(&c)?)?;
        let b = BayesianParameter::from_prior(dirichlet_prior(&c)?)?;
        assert_ne!(a.id(), b.id());

        let mut acc = AccumulatedStats::default();
        acc.insert(a.id(), c.clone());
        assert!(!acc.contains_key(&b.id()));
        Ok(())
    }

    #[test]
    fn natural_grad_buffer() -> anyhow::Result<()> {
        let dev = Device::Cpu;
        let mut p = BayesianParameter::from_prior(gamma_prior(1.0, 1.0, DType::F64, &dev)?)?;
        approx::assert_abs_diff_eq!(p.kl_div()?.to_scalar::<f64>()?, 0.0, epsilon = 1e-10);

        p.add_natural_grad(&Tensor::new(&[1_f64, -1.], &dev)?)?;
        p.add_natural_grad(&Tensor::new(&[1_f64, -1.], &dev)?)?;
        assert_eq!(p.natural_grad().to_vec1::<f64>()?, vec![2., -2.]);

        p.natural_grad_step(0.5)?;
        // shape 2, rate 2
        assert_eq!(p.posterior().natural_hparams().to_vec1::<f64>()?, vec![1., -2.]);
        assert!(p.kl_div()?.to_scalar::<f64>()? > 0.);

        p.zero_natural_grad()?;
        assert_eq!(p.natural_grad().to_vec1::<f64>()?, vec![0., 0.]);

        assert!(p.add_natural_grad(&Tensor::new(&[1_f64], &dev)?).is_err());
        Ok(())
    }

    #[test]
    fn in_place_dtype_keeps_identity() -> anyhow::Result<()> {
        let dev = Device::Cpu;
        let c = Tensor::new(&[1_f64, 2., 3.], &dev)?;
        let mut set = BayesianParameterSet::new(vec![
            BayesianParameter::from_prior(dirichlet_prior(&c)?)?,
            BayesianParameter::from_prior(dirichlet_prior(&c)?)?,
        ]);
        let ids = set.ids();
        set.to_dtype_(DType::F32)?;
        assert_eq!(set.ids(), ids);
        for p in set.iter() {
            assert_eq!(p.posterior().dtype(), DType::F32);
            assert_eq!(p.natural_grad().dtype(), DType::F32);
        }
        Ok(())
    }
}
