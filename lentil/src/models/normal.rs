//! Normal densities with conjugate priors over their mean and
//! precision.
//!
//! Each model works with data statistics laid out like the expected
//! sufficient statistics of its prior, so that the expected
//! log-likelihood is `stats · E[T] - D/2 ln 2π`:
//!
//! | model | prior | data statistics |
//! |---|---|---|
//! | [`NormalDiagonalCovariance`] | NormalGamma | `[x², x, 1, 1]` |
//! | [`NormalFullCovariance`] | NormalWishart | `[vec(x xᵀ), x, 1, 1]` |
//! | [`NormalIsotropicCovariance`] | IsotropicNormalGamma | `[|x|², x, 1, D]` |

use crate::expfamily::*;
use crate::models::traits::*;
use crate::parameters::*;
use crate::utils::{matrix_inverse, outer_rows};
use candle_util::candle_core::{DType, Device, Tensor, D};
use candle_util::candle_loss_functions::diag_normal_expected_stats;

/// Expected mean and covariance `(D, D)` of a normal component
#[derive(Debug, Clone)]
pub struct NormalView {
    pub mean: Tensor,
    pub cov: Tensor,
}

/// Sum of the statistics over samples, weighted by `parent_msg (N)`
/// if given
pub(crate) fn weighted_stats(stats: &Tensor, parent_msg: Option<&Tensor>) -> anyhow::Result<Tensor> {
    match parent_msg {
        None => Ok(stats.sum(0)?),
        Some(w) => {
            let nn = stats.dim(0)?;
            if w.elem_count() != nn {
                crate::invalid_arg!(
                    "parent message of shape {:?} for {} samples",
                    w.dims(),
                    nn
                );
            }
            let w_1n = w.reshape((1, nn))?.to_dtype(stats.dtype())?;
            Ok(w_1n.matmul(stats)?.squeeze(0)?)
        }
    }
}

/// `stats (N, F) · ess (F)`
pub(crate) fn linear_llh(stats: &Tensor, ess: &Tensor, dim: usize) -> anyhow::Result<Tensor> {
    let llh = stats.matmul(&ess.unsqueeze(1)?)?.squeeze(1)?;
    Ok((llh + gaussian_log_partition(dim))?)
}

pub(crate) fn expect_data(data: &Tensor, dim: usize) -> anyhow::Result<usize> {
    match data.dims() {
        [nn, dd] if *dd == dim => Ok(*nn),
        dims => crate::invalid_arg!("expected data of shape (N, {}), got {:?}", dim, dims),
    }
}

pub(crate) fn diagonal_stats(data: &Tensor) -> anyhow::Result<Tensor> {
    let ones = data.ones_like()?;
    Ok(Tensor::cat(&[data.sqr()?, data.clone(), ones.clone(), ones], 1)?)
}

pub(crate) fn full_stats(data: &Tensor) -> anyhow::Result<Tensor> {
    let nn = data.dim(0)?;
    let ones = Tensor::ones((nn, 1), data.dtype(), data.device())?;
    Ok(Tensor::cat(&[outer_rows(data)?, data.clone(), ones.clone(), ones], 1)?)
}

/// Mean and covariance from the NormalGamma blocks `E[-λ/2], E[λμ]`
pub(crate) fn diagonal_view(prec: &Tensor, prec_mean: &Tensor) -> anyhow::Result<NormalView> {
    let lambda = (prec * (-2.))?;
    let var = lambda.recip()?;
    let dim = var.dim(0)?;
    let eye = Tensor::eye(dim, var.dtype(), var.device())?;
    Ok(NormalView {
        mean: prec_mean.div(&lambda)?,
        cov: eye.broadcast_mul(&var.unsqueeze(0)?)?,
    })
}

/// Mean and covariance from the NormalWishart blocks `E[-Λ/2], E[Λμ]`
pub(crate) fn full_view(prec: &Tensor, prec_mean: &Tensor) -> anyhow::Result<NormalView> {
    let cov = matrix_inverse(&(prec * (-2.))?)?;
    let mean = cov.matmul(&prec_mean.unsqueeze(1)?)?.squeeze(1)?;
    Ok(NormalView { mean, cov })
}

/// Normal with a diagonal covariance
#[derive(Debug)]
pub struct NormalDiagonalCovariance {
    mean_prec: BayesianParameter,
    dim: usize,
}

impl NormalDiagonalCovariance {
    pub fn new(prior: ExpFamilyPrior, posterior: ExpFamilyPrior) -> anyhow::Result<Self> {
        let mean_prec = BayesianParameter::new(prior, posterior)?;
        let dim = match mean_prec.posterior().family() {
            Family::NormalGamma { dim } => dim,
            other => crate::invalid_arg!("expected a NormalGamma parameter, got {}", other),
        };
        Ok(Self { mean_prec, dim })
    }

    /// * `mean` - `(D)` prior mean
    /// * `diag_cov` - `(D)` prior variances
    /// * `pseudo_counts` - strength of the prior
    pub fn create(mean: &Tensor, diag_cov: &Tensor, pseudo_counts: f64) -> anyhow::Result<Self> {
        let prior = normal_gamma_prior(mean, &diag_cov.recip()?, pseudo_counts)?;
        Self::new(prior.clone(), prior)
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn parameter(&self) -> &BayesianParameter {
        &self.mean_prec
    }

    /// Expected mean and (diagonal) covariance
    pub fn view(&self) -> anyhow::Result<NormalView> {
        match self.mean_prec.expected_value_split()? {
            StatsBlocks::NormalGamma {
                prec, prec_mean, ..
            } => diagonal_view(&prec, &prec_mean),
            _ => crate::invalid_arg!("expected NormalGamma statistics"),
        }
    }

    /// `[m² + v, m, 1, 1]`, the expected statistics of `N(m, diag(v))`
    pub fn sufficient_statistics_from_mean_var(
        mean: &Tensor,
        var: &Tensor,
    ) -> anyhow::Result<Tensor> {
        Ok(diag_normal_expected_stats(mean, var)?)
    }
}

impl BayesianModel for NormalDiagonalCovariance {
    type State = BatchState;

    fn sufficient_statistics(&self, data: &Tensor) -> anyhow::Result<Tensor> {
        expect_data(data, self.dim)?;
        diagonal_stats(data)
    }

    fn mean_field_factorization(&self) -> Vec<Vec<ParamId>> {
        vec![vec![self.mean_prec.id()]]
    }

    fn forward(&self, stats: &Tensor) -> anyhow::Result<(Tensor, BatchState)> {
        let nn = check_stats(stats, 4 * self.dim)?;
        let llh = linear_llh(stats, self.mean_prec.expected_value(), self.dim)?;
        Ok((llh, BatchState::new(nn)))
    }

    fn accumulate(
        &self,
        stats: &Tensor,
        _state: BatchState,
        parent_msg: Option<&Tensor>,
    ) -> anyhow::Result<AccumulatedStats> {
        check_stats(stats, 4 * self.dim)?;
        let mut ret = AccumulatedStats::default();
        ret.insert(self.mean_prec.id(), weighted_stats(stats, parent_msg)?);
        Ok(ret)
    }

    fn local_kl_div_posterior_prior(&self, state: &BatchState) -> anyhow::Result<Tensor> {
        // no local latent variable
        state.zeros(self.mean_prec.posterior())
    }

    fn bayesian_parameters(&self) -> Vec<&BayesianParameter> {
        vec![&self.mean_prec]
    }

    fn bayesian_parameters_mut(&mut self) -> Vec<&mut BayesianParameter> {
        vec![&mut self.mean_prec]
    }

    fn to_dtype(&self, dtype: DType) -> anyhow::Result<Self> {
        let device = self.mean_prec.posterior().device().clone();
        Ok(Self {
            mean_prec: self.mean_prec.converted(dtype, &device)?,
            dim: self.dim,
        })
    }

    fn to_device(&self, device: &Device) -> anyhow::Result<Self> {
        Ok(Self {
            mean_prec: self.mean_prec.converted(self.mean_prec.posterior().dtype(), device)?,
            dim: self.dim,
        })
    }
}

impl LatentModel for NormalDiagonalCovariance {
    fn expected_natural_params(
        &self,
        means: &Tensor,
        variances: &Tensor,
        nsamples: usize,
    ) -> anyhow::Result<(Tensor, Tensor, BatchState)> {
        let nn = expect_data(means, self.dim)?;
        let stats = sampled_stats(self, means, variances, nsamples)?;
        let exp_np = self
            .mean_prec
            .expected_value()
            .unsqueeze(0)?
            .broadcast_as((nn, 4 * self.dim))?
            .contiguous()?;
        Ok((exp_np, stats, BatchState::new(nn)))
    }
}

/// Statistics of `nsamples` draws from `N(means, variances)`, averaged
/// over the draws: `(N, F)`
pub(crate) fn sampled_stats<M: BayesianModel>(
    model: &M,
    means: &Tensor,
    variances: &Tensor,
    nsamples: usize,
) -> anyhow::Result<Tensor> {
    let (nn, kk) = means.dims2()?;
    let nsamples = nsamples.max(1);
    let samples = crate::utils::sample_from_normals(means, variances, nsamples)?
        .reshape((nsamples * nn, kk))?;
    let stats = model.sufficient_statistics(&samples)?;
    let ff = stats.dim(1)?;
    Ok(stats.reshape((nsamples, nn, ff))?.mean(0)?)
}

/// Normal with a full covariance
#[derive(Debug)]
pub struct NormalFullCovariance {
    mean_prec: BayesianParameter,
    dim: usize,
}

impl NormalFullCovariance {
    pub fn new(prior: ExpFamilyPrior, posterior: ExpFamilyPrior) -> anyhow::Result<Self> {
        let mean_prec = BayesianParameter::new(prior, posterior)?;
        let dim = match mean_prec.posterior().family() {
            Family::NormalWishart { dim } => dim,
            other => crate::invalid_arg!("expected a NormalWishart parameter, got {}", other),
        };
        Ok(Self { mean_prec, dim })
    }

    /// * `mean` - `(D)` prior mean
    /// * `cov` - `(D, D)` prior covariance
    /// * `pseudo_counts` - strength of the prior
    pub fn create(mean: &Tensor, cov: &Tensor, pseudo_counts: f64) -> anyhow::Result<Self> {
        let prior = normal_wishart_prior(mean, cov, pseudo_counts)?;
        Self::new(prior.clone(), prior)
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn parameter(&self) -> &BayesianParameter {
        &self.mean_prec
    }

    pub fn view(&self) -> anyhow::Result<NormalView> {
        match self.mean_prec.expected_value_split()? {
            StatsBlocks::NormalWishart {
                prec, prec_mean, ..
            } => full_view(&prec, &prec_mean),
            _ => crate::invalid_arg!("expected NormalWishart statistics"),
        }
    }
}

impl BayesianModel for NormalFullCovariance {
    type State = BatchState;

    fn sufficient_statistics(&self, data: &Tensor) -> anyhow::Result<Tensor> {
        expect_data(data, self.dim)?;
        full_stats(data)
    }

    fn mean_field_factorization(&self) -> Vec<Vec<ParamId>> {
        vec![vec![self.mean_prec.id()]]
    }

    fn forward(&self, stats: &Tensor) -> anyhow::Result<(Tensor, BatchState)> {
        let nn = check_stats(stats, self.dim * self.dim + self.dim + 2)?;
        let llh = linear_llh(stats, self.mean_prec.expected_value(), self.dim)?;
        Ok((llh, BatchState::new(nn)))
    }

    fn accumulate(
        &self,
        stats: &Tensor,
        _state: BatchState,
        parent_msg: Option<&Tensor>,
    ) -> anyhow::Result<AccumulatedStats> {
        check_stats(stats, self.dim * self.dim + self.dim + 2)?;
        let mut ret = AccumulatedStats::default();
        ret.insert(self.mean_prec.id(), weighted_stats(stats, parent_msg)?);
        Ok(ret)
    }

    fn local_kl_div_posterior_prior(&self, state: &BatchState) -> anyhow::Result<Tensor> {
        state.zeros(self.mean_prec.posterior())
    }

    fn bayesian_parameters(&self) -> Vec<&BayesianParameter> {
        vec![&self.mean_prec]
    }

    fn bayesian_parameters_mut(&mut self) -> Vec<&mut BayesianParameter> {
        vec![&mut self.mean_prec]
    }

    fn to_dtype(&self, dtype: DType) -> anyhow::Result<Self> {
        let device = self.mean_prec.posterior().device().clone();
        Ok(Self {
            mean_prec: self.mean_prec.converted(dtype, &device)?,
            dim: self.dim,
        })
    }

    fn to_device(&self, device: &Device) -> anyhow::Result<Self> {
        Ok(Self {
            mean_prec: self.mean_prec.converted(self.mean_prec.posterior().dtype(), device)?,
            dim: self.dim,
        })
    }
}

/// Normal with a covariance `σ² I`
#[derive(Debug)]
pub struct NormalIsotropicCovariance {
    mean_prec: BayesianParameter,
    dim: usize,
}

impl NormalIsotropicCovariance {
    pub fn new(prior: ExpFamilyPrior, posterior: ExpFamilyPrior) -> anyhow::Result<Self> {
        let mean_prec = BayesianParameter::new(prior, posterior)?;
        let dim = match mean_prec.posterior().family() {
            Family::IsotropicNormalGamma { dim } => dim,
            other => {
                crate::invalid_arg!("expected an IsotropicNormalGamma parameter, got {}", other)
            }
        };
        Ok(Self { mean_prec, dim })
    }

    /// * `mean` - `(D)` prior mean
    /// * `variance` - prior variance (a single value)
    /// * `pseudo_counts` - strength of the prior
    pub fn create(mean: &Tensor, variance: &Tensor, pseudo_counts: f64) -> anyhow::Result<Self> {
        let prior = isotropic_normal_gamma_prior(mean, &variance.recip()?, pseudo_counts)?;
        Self::new(prior.clone(), prior)
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn parameter(&self) -> &BayesianParameter {
        &self.mean_prec
    }

    pub fn view(&self) -> anyhow::Result<NormalView> {
        match self.mean_prec.expected_value_split()? {
            StatsBlocks::IsotropicNormalGamma {
                prec, prec_mean, ..
            } => {
                let lambda = (prec * (-2.))?;
                let eye = Tensor::eye(self.dim, lambda.dtype(), lambda.device())?;
                Ok(NormalView {
                    mean: prec_mean.broadcast_div(&lambda)?,
                    cov: eye.broadcast_div(&lambda)?,
                })
            }
            _ => crate::invalid_arg!("expected IsotropicNormalGamma statistics"),
        }
    }
}

impl BayesianModel for NormalIsotropicCovariance {
    type State = BatchState;

    fn sufficient_statistics(&self, data: &Tensor) -> anyhow::Result<Tensor> {
        let nn = expect_data(data, self.dim)?;
        let ones = Tensor::ones((nn, 1), data.dtype(), data.device())?;
        Ok(Tensor::cat(
            &[
                data.sqr()?.sum_keepdim(D::Minus1)?,
                data.clone(),
                ones.clone(),
                (ones * self.dim as f64)?,
            ],
            1,
        )?)
    }

    fn mean_field_factorization(&self) -> Vec<Vec<ParamId>> {
        vec![vec![self.mean_prec.id()]]
    }

    fn forward(&self, stats: &Tensor) -> anyhow::Result<(Tensor, BatchState)> {
        let nn = check_stats(stats, self.dim + 3)?;
        let llh = linear_llh(stats, self.mean_prec.expected_value(), self.dim)?;
        Ok((llh, BatchState::new(nn)))
    }

    fn accumulate(
        &self,
        stats: &Tensor,
        _state: BatchState,
        parent_msg: Option<&Tensor>,
    ) -> anyhow::Result<AccumulatedStats> {
        check_stats(stats, self.dim + 3)?;
        let mut ret = AccumulatedStats::default();
        ret.insert(self.mean_prec.id(), weighted_stats(stats, parent_msg)?);
        Ok(ret)
    }

    fn local_kl_div_posterior_prior(&self, state: &BatchState) -> anyhow::Result<Tensor> {
        state.zeros(self.mean_prec.posterior())
    }

    fn bayesian_parameters(&self) -> Vec<&BayesianParameter> {
        vec![&self.mean_prec]
    }

    fn bayesian_parameters_mut(&mut self) -> Vec<&mut BayesianParameter> {
        vec![&mut self.mean_prec]
    }

    fn to_dtype(&self, dtype: DType) -> anyhow::Result<Self> {
        let device = self.mean_prec.posterior().device().clone();
        Ok(Self {
            mean_prec: self.mean_prec.converted(dtype, &device)?,
            dim: self.dim,
        })
    }

    fn to_device(&self, device: &Device) -> anyhow::Result<Self> {
        Ok(Self {
            mean_prec: self.mean_prec.converted(self.mean_prec.posterior().dtype(), device)?,
            dim: self.dim,
        })
    }
}
