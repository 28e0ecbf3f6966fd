//! Sets of normal densities evaluated side by side.
//!
//! The data statistics are those of the corresponding single model
//! (see [`crate::models::normal`]), so a set and its members share one
//! layout; the shared-covariance sets keep a single joint parameter.

use crate::expfamily::*;
use crate::models::normal::*;
use crate::models::traits::*;
use crate::parameters::*;
use candle_util::candle_core::{DType, Device, Tensor};
use candle_util::candle_numeric::{make_symposdef, DEFAULT_EVAL_THRESHOLD};
use rand::Rng;
use rand_distr::{Distribution, StandardNormal};

/// `size` rows `mean + noise_std * scale * eps`
fn perturbed_means<R: Rng>(
    mean: &Tensor,
    scale: &[f64],
    size: usize,
    noise_std: f64,
    rng: &mut R,
) -> anyhow::Result<Tensor> {
    let mu = mean.to_dtype(DType::F64)?.to_vec1::<f64>()?;
    if mu.len() != scale.len() {
        crate::invalid_arg!("mean of length {} for {} scales", mu.len(), scale.len());
    }
    let mut data = Vec::with_capacity(size * mu.len());
    for _ in 0..size {
        for (m, s) in mu.iter().zip(scale.iter()) {
            let eps: f64 = StandardNormal.sample(rng);
            data.push(m + noise_std * s * eps);
        }
    }
    Ok(Tensor::from_vec(data, (size, mu.len()), mean.device())?.to_dtype(mean.dtype())?)
}

fn sqrt_vec(x: &Tensor) -> anyhow::Result<Vec<f64>> {
    Ok(x.to_dtype(DType::F64)?
        .sqrt()?
        .to_vec1::<f64>()?)
}

fn sqrt_diag(cov: &Tensor) -> anyhow::Result<Vec<f64>> {
    let cov = cov.to_dtype(DType::F64)?.to_vec2::<f64>()?;
    Ok(cov.iter().enumerate().map(|(i, row)| row[i].sqrt()).collect())
}

/// `stats (N, F) @ matrix (K, F)ᵀ - D/2 ln 2π`
fn set_llh(stats: &Tensor, matrix: &Tensor, dim: usize) -> anyhow::Result<Tensor> {
    let llh = stats.matmul(&matrix.t()?)?;
    Ok((llh + gaussian_log_partition(dim))?)
}

/// `parent_msg (N, K)ᵀ @ stats (N, F) -> (K, F)`
fn weighted_set_stats(
    stats: &Tensor,
    parent_msg: Option<&Tensor>,
    len: usize,
    model: &'static str,
) -> anyhow::Result<Tensor> {
    let msg = require_parent_msg(parent_msg, model)?;
    let nn = stats.dim(0)?;
    if msg.dims() != [nn, len] {
        crate::invalid_arg!(
            "parent message should be ({}, {}), got {:?}",
            nn,
            len,
            msg.dims()
        );
    }
    Ok(msg.to_dtype(stats.dtype())?.t()?.matmul(stats)?)
}

fn stack_expected_values(params: &BayesianParameterSet) -> anyhow::Result<Tensor> {
    let rows = params.iter().map(|p| p.expected_value()).collect::<Vec<_>>();
    Ok(Tensor::stack(&rows, 0)?)
}

fn route_rows(params: &BayesianParameterSet, acc_kf: &Tensor) -> anyhow::Result<AccumulatedStats> {
    let mut ret = AccumulatedStats::default();
    for (k, param) in params.iter().enumerate() {
        ret.insert(param.id(), acc_kf.get(k)?);
    }
    Ok(ret)
}

fn expect_family_dim(
    params: &[BayesianParameter],
    family_dim: impl Fn(Family) -> Option<usize>,
    what: &str,
) -> anyhow::Result<usize> {
    let mut dims = params
        .iter()
        .map(|p| family_dim(p.posterior().family()))
        .collect::<Option<Vec<_>>>()
        .unwrap_or_default();
    dims.dedup();
    match dims.as_slice() {
        [dim] if !params.is_empty() => Ok(*dim),
        _ => crate::invalid_arg!("expected a non-empty set of {} parameters of one dimension", what),
    }
}

/// Independent normals with diagonal covariances
#[derive(Debug)]
pub struct NormalDiagonalCovarianceSet {
    means_precs: BayesianParameterSet,
    dim: usize,
}

impl NormalDiagonalCovarianceSet {
    /// One NormalGamma parameter per member
    pub fn new(params: Vec<BayesianParameter>) -> anyhow::Result<Self> {
        let dim = expect_family_dim(
            &params,
            |f| match f {
                Family::NormalGamma { dim } => Some(dim),
                _ => None,
            },
            "NormalGamma",
        )?;
        Ok(Self {
            means_precs: BayesianParameterSet::new(params),
            dim,
        })
    }

    /// Members share the prior; the posterior means are drawn around
    /// `mean` with standard deviation `noise_std * sqrt(diag_cov)`.
    ///
    /// * `mean` - `(D)`
    /// * `diag_cov` - `(D)`
    /// * `size` - number of members
    pub fn create<R: Rng>(
        mean: &Tensor,
        diag_cov: &Tensor,
        size: usize,
        pseudo_counts: f64,
        noise_std: f64,
        rng: &mut R,
    ) -> anyhow::Result<Self> {
        let prec = diag_cov.recip()?;
        let means = perturbed_means(mean, &sqrt_vec(diag_cov)?, size, noise_std, rng)?;
        let params = (0..size)
            .map(|k| {
                BayesianParameter::new(
                    normal_gamma_prior(mean, &prec, pseudo_counts)?,
                    normal_gamma_prior(&means.get(k)?, &prec, pseudo_counts)?,
                )
            })
            .collect::<anyhow::Result<Vec<_>>>()?;
        Self::new(params)
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn parameters(&self) -> &BayesianParameterSet {
        &self.means_precs
    }
}

impl BayesianModel for NormalDiagonalCovarianceSet {
    type State = BatchState;

    fn sufficient_statistics(&self, data: &Tensor) -> anyhow::Result<Tensor> {
        expect_data(data, self.dim)?;
        diagonal_stats(data)
    }

    fn mean_field_factorization(&self) -> Vec<Vec<ParamId>> {
        vec![self.means_precs.ids()]
    }

    fn forward(&self, stats: &Tensor) -> anyhow::Result<(Tensor, BatchState)> {
        let nn = check_stats(stats, 4 * self.dim)?;
        let llh = set_llh(stats, &self.expected_natural_params_as_matrix()?, self.dim)?;
        Ok((llh, BatchState::new(nn)))
    }

    fn accumulate(
        &self,
        stats: &Tensor,
        _state: BatchState,
        parent_msg: Option<&Tensor>,
    ) -> anyhow::Result<AccumulatedStats> {
        check_stats(stats, 4 * self.dim)?;
        let acc = weighted_set_stats(stats, parent_msg, self.len(), "NormalDiagonalCovarianceSet")?;
        route_rows(&self.means_precs, &acc)
    }

    fn local_kl_div_posterior_prior(&self, state: &BatchState) -> anyhow::Result<Tensor> {
        match self.means_precs.get(0) {
            Some(p) => state.zeros(p.posterior()),
            None => crate::invalid_arg!("empty set"),
        }
    }

    fn bayesian_parameters(&self) -> Vec<&BayesianParameter> {
        self.means_precs.iter().collect()
    }

    fn bayesian_parameters_mut(&mut self) -> Vec<&mut BayesianParameter> {
        self.means_precs.iter_mut().collect()
    }

    fn to_dtype(&self, dtype: DType) -> anyhow::Result<Self> {
        let device = match self.means_precs.get(0) {
            Some(p) => p.posterior().device().clone(),
            None => Device::Cpu,
        };
        Ok(Self {
            means_precs: self.means_precs.converted(dtype, &device)?,
            dim: self.dim,
        })
    }

    fn to_device(&self, device: &Device) -> anyhow::Result<Self> {
        let dtype = match self.means_precs.get(0) {
            Some(p) => p.posterior().dtype(),
            None => DType::F32,
        };
        Ok(Self {
            means_precs: self.means_precs.converted(dtype, device)?,
            dim: self.dim,
        })
    }
}

impl BayesianModelSet for NormalDiagonalCovarianceSet {
    type Component<'a> = NormalView;

    fn len(&self) -> usize {
        self.means_precs.len()
    }

    fn component(&self, i: usize) -> anyhow::Result<NormalView> {
        let param = match self.means_precs.get(i) {
            Some(p) => p,
            None => crate::invalid_arg!("component {} out of {}", i, self.len()),
        };
        match param.expected_value_split()? {
            StatsBlocks::NormalGamma {
                prec, prec_mean, ..
            } => diagonal_view(&prec, &prec_mean),
            _ => crate::invalid_arg!("expected NormalGamma statistics"),
        }
    }
}

impl NaturalParamsMatrix for NormalDiagonalCovarianceSet {
    fn stats_layout(&self) -> StatsLayout {
        StatsLayout::Diagonal
    }

    fn expected_natural_params_as_matrix(&self) -> anyhow::Result<Tensor> {
        stack_expected_values(&self.means_precs)
    }
}

/// Independent normals with full covariances
#[derive(Debug)]
pub struct NormalFullCovarianceSet {
    means_precs: BayesianParameterSet,
    dim: usize,
}

impl NormalFullCovarianceSet {
    /// One NormalWishart parameter per member
    pub fn new(params: Vec<BayesianParameter>) -> anyhow::Result<Self> {
        let dim = expect_family_dim(
            &params,
            |f| match f {
                Family::NormalWishart { dim } => Some(dim),
                _ => None,
            },
            "NormalWishart",
        )?;
        Ok(Self {
            means_precs: BayesianParameterSet::new(params),
            dim,
        })
    }

    /// * `mean` - `(D)`
    /// * `cov` - `(D, D)`, projected to the nearest positive definite
    ///   matrix first
    /// * `size` - number of members
    pub fn create<R: Rng>(
        mean: &Tensor,
        cov: &Tensor,
        size: usize,
        pseudo_counts: f64,
        noise_std: f64,
        rng: &mut R,
    ) -> anyhow::Result<Self> {
        let cov = &make_symposdef(cov, DEFAULT_EVAL_THRESHOLD)?;
        let means = perturbed_means(mean, &sqrt_diag(cov)?, size, noise_std, rng)?;
        let params = (0..size)
            .map(|k| {
                BayesianParameter::new(
                    normal_wishart_prior(mean, cov, pseudo_counts)?,
                    normal_wishart_prior(&means.get(k)?, cov, pseudo_counts)?,
                )
            })
            .collect::<anyhow::Result<Vec<_>>>()?;
        Self::new(params)
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn parameters(&self) -> &BayesianParameterSet {
        &self.means_precs
    }

    fn width(&self) -> usize {
        self.dim * self.dim + self.dim + 2
    }
}

impl BayesianModel for NormalFullCovarianceSet {
    type State = BatchState;

    fn sufficient_statistics(&self, data: &Tensor) -> anyhow::Result<Tensor> {
        expect_data(data, self.dim)?;
        full_stats(data)
    }

    fn mean_field_factorization(&self) -> Vec<Vec<ParamId>> {
        vec![self.means_precs.ids()]
    }

    fn forward(&self, stats: &Tensor) -> anyhow::Result<(Tensor, BatchState)> {
        let nn = check_stats(stats, self.width())?;
        let llh = set_llh(stats, &self.expected_natural_params_as_matrix()?, self.dim)?;
        Ok((llh, BatchState::new(nn)))
    }

    fn accumulate(
        &self,
        stats: &Tensor,
        _state: BatchState,
        parent_msg: Option<&Tensor>,
    ) -> anyhow::Result<AccumulatedStats> {
        check_stats(stats, self.width())?;
        let acc = weighted_set_stats(stats, parent_msg, self.len(), "NormalFullCovarianceSet")?;
        route_rows(&self.means_precs, &acc)
    }

    fn local_kl_div_posterior_prior(&self, state: &BatchState) -> anyhow::Result<Tensor> {
        match self.means_precs.get(0) {
            Some(p) => state.zeros(p.posterior()),
            None => crate::invalid_arg!("empty set"),
        }
    }

    fn bayesian_parameters(&self) -> Vec<&BayesianParameter> {
        self.means_precs.iter().collect()
    }

    fn bayesian_parameters_mut(&mut self) -> Vec<&mut BayesianParameter> {
        self.means_precs.iter_mut().collect()
    }

    fn to_dtype(&self, dtype: DType) -> anyhow::Result<Self> {
        let device = match self.means_precs.get(0) {
            Some(p) => p.posterior().device().clone(),
            None => Device::Cpu,
        };
        Ok(Self {
            means_precs: self.means_precs.converted(dtype, &device)?,
            dim: self.dim,
        })
    }

    fn to_device(&self, device: &Device) -> anyhow::Result<Self> {
        let dtype = match self.means_precs.get(0) {
            Some(p) => p.posterior().dtype(),
            None => DType::F32,
        };
        Ok(Self {
            means_precs: self.means_precs.converted(dtype, device)?,
            dim: self.dim,
        })
    }
}

impl BayesianModelSet for NormalFullCovarianceSet {
    type Component<'a> = NormalView;

    fn len(&self) -> usize {
        self.means_precs.len()
    }

    fn component(&self, i: usize) -> anyhow::Result<NormalView> {
        let param = match self.means_precs.get(i) {
            Some(p) => p,
            None => crate::invalid_arg!("component {} out of {}", i, self.len()),
        };
        match param.expected_value_split()? {
            StatsBlocks::NormalWishart {
                prec, prec_mean, ..
            } => full_view(&prec, &prec_mean),
            _ => crate::invalid_arg!("expected NormalWishart statistics"),
        }
    }
}

impl NaturalParamsMatrix for NormalFullCovarianceSet {
    fn stats_layout(&self) -> StatsLayout {
        StatsLayout::Full
    }

    fn expected_natural_params_as_matrix(&self) -> anyhow::Result<Tensor> {
        stack_expected_values(&self.means_precs)
    }
}

/// Normals with their own means and one shared diagonal covariance
#[derive(Debug)]
pub struct NormalSetSharedDiagonalCovariance {
    means_prec: BayesianParameter,
    dim: usize,
    ncomp: usize,
}

impl NormalSetSharedDiagonalCovariance {
    pub fn new(prior: ExpFamilyPrior, posterior: ExpFamilyPrior) -> anyhow::Result<Self> {
        let means_prec = BayesianParameter::new(prior, posterior)?;
        let (dim, ncomp) = match means_prec.posterior().family() {
            Family::JointNormalGamma { dim, ncomp } => (dim, ncomp),
            other => crate::invalid_arg!("expected a JointNormalGamma parameter, got {}", other),
        };
        Ok(Self {
            means_prec,
            dim,
            ncomp,
        })
    }

    /// * `mean` - `(D)`
    /// * `diag_cov` - `(D)`
    /// * `size` - number of members
    pub fn create<R: Rng>(
        mean: &Tensor,
        diag_cov: &Tensor,
        size: usize,
        pseudo_counts: f64,
        noise_std: f64,
        rng: &mut R,
    ) -> anyhow::Result<Self> {
        let prec = diag_cov.recip()?;
        let dim = mean.dim(0)?;
        let prior_means = mean.unsqueeze(0)?.broadcast_as((size, dim))?.contiguous()?;
        let means = perturbed_means(mean, &sqrt_vec(diag_cov)?, size, noise_std, rng)?;
        Self::new(
            joint_normal_gamma_prior(&prior_means, &prec, pseudo_counts)?,
            joint_normal_gamma_prior(&means, &prec, pseudo_counts)?,
        )
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn parameter(&self) -> &BayesianParameter {
        &self.means_prec
    }
}

impl BayesianModel for NormalSetSharedDiagonalCovariance {
    type State = BatchState;

    fn sufficient_statistics(&self, data: &Tensor) -> anyhow::Result<Tensor> {
        expect_data(data, self.dim)?;
        diagonal_stats(data)
    }

    fn mean_field_factorization(&self) -> Vec<Vec<ParamId>> {
        vec![vec![self.means_prec.id()]]
    }

    fn forward(&self, stats: &Tensor) -> anyhow::Result<(Tensor, BatchState)> {
        let nn = check_stats(stats, 4 * self.dim)?;
        let llh = set_llh(stats, &self.expected_natural_params_as_matrix()?, self.dim)?;
        Ok((llh, BatchState::new(nn)))
    }

    fn accumulate(
        &self,
        stats: &Tensor,
        _state: BatchState,
        parent_msg: Option<&Tensor>,
    ) -> anyhow::Result<AccumulatedStats> {
        check_stats(stats, 4 * self.dim)?;
        let dd = self.dim;
        let acc = weighted_set_stats(
            stats,
            parent_msg,
            self.ncomp,
            "NormalSetSharedDiagonalCovariance",
        )?;
        // every member sees the shared precision
        let joint = StatsBlocks::JointNormalGamma {
            prec: acc.narrow(1, 0, dd)?.sum(0)?,
            prec_means: acc.narrow(1, dd, dd)?,
            prec_means_sq: acc.narrow(1, 2 * dd, dd)?,
            ln_prec: acc.narrow(1, 3 * dd, dd)?.sum(0)?,
        };
        let mut ret = AccumulatedStats::default();
        ret.insert(self.means_prec.id(), joint.concat()?);
        Ok(ret)
    }

    fn local_kl_div_posterior_prior(&self, state: &BatchState) -> anyhow::Result<Tensor> {
        state.zeros(self.means_prec.posterior())
    }

    fn bayesian_parameters(&self) -> Vec<&BayesianParameter> {
        vec![&self.means_prec]
    }

    fn bayesian_parameters_mut(&mut self) -> Vec<&mut BayesianParameter> {
        vec![&mut self.means_prec]
    }

    fn to_dtype(&self, dtype: DType) -> anyhow::Result<Self> {
        let device = self.means_prec.posterior().device().clone();
        Ok(Self {
            means_prec: self.means_prec.converted(dtype, &device)?,
            dim: self.dim,
            ncomp: self.ncomp,
        })
    }

    fn to_device(&self, device: &Device) -> anyhow::Result<Self> {
        Ok(Self {
            means_prec: self
                .means_prec
                .converted(self.means_prec.posterior().dtype(), device)?,
            dim: self.dim,
            ncomp: self.ncomp,
        })
    }
}

impl BayesianModelSet for NormalSetSharedDiagonalCovariance {
    type Component<'a> = NormalView;

    fn len(&self) -> usize {
        self.ncomp
    }

    fn component(&self, i: usize) -> anyhow::Result<NormalView> {
        if i >= self.ncomp {
            crate::invalid_arg!("component {} out of {}", i, self.ncomp);
        }
        match self.means_prec.expected_value_split()? {
            StatsBlocks::JointNormalGamma {
                prec, prec_means, ..
            } => diagonal_view(&prec, &prec_means.get(i)?),
            _ => crate::invalid_arg!("expected JointNormalGamma statistics"),
        }
    }
}

impl NaturalParamsMatrix for NormalSetSharedDiagonalCovariance {
    fn stats_layout(&self) -> StatsLayout {
        StatsLayout::Diagonal
    }

    /// Rows in the layout `[E[-λ/2], E[λμ_k], E[-λμ_k²/2], E[½ ln λ]]`
    fn expected_natural_params_as_matrix(&self) -> anyhow::Result<Tensor> {
        let shape = (self.ncomp, self.dim);
        match self.means_prec.expected_value_split()? {
            StatsBlocks::JointNormalGamma {
                prec,
                prec_means,
                prec_means_sq,
                ln_prec,
            } => Ok(Tensor::cat(
                &[
                    prec.unsqueeze(0)?.broadcast_as(shape)?.contiguous()?,
                    prec_means,
                    prec_means_sq,
                    ln_prec.unsqueeze(0)?.broadcast_as(shape)?.contiguous()?,
                ],
                1,
            )?),
            _ => crate::invalid_arg!("expected JointNormalGamma statistics"),
        }
    }
}

/// Normals with their own means and one shared full covariance
#[derive(Debug)]
pub struct NormalSetSharedFullCovariance {
    means_prec: BayesianParameter,
    dim: usize,
    ncomp: usize,
}

impl NormalSetSharedFullCovariance {
    pub fn new(prior: ExpFamilyPrior, posterior: ExpFamilyPrior) -> anyhow::Result<Self> {
        let means_prec = BayesianParameter::new(prior, posterior)?;
        let (dim, ncomp) = match means_prec.posterior().family() {
            Family::JointNormalWishart { dim, ncomp } => (dim, ncomp),
            other => {
                crate::invalid_arg!("expected a JointNormalWishart parameter, got {}", other)
            }
        };
        Ok(Self {
            means_prec,
            dim,
            ncomp,
        })
    }

    /// * `mean` - `(D)`
    /// * `cov` - `(D, D)`, projected to the nearest positive definite
    ///   matrix first
    /// * `size` - number of members
    pub fn create<R: Rng>(
        mean: &Tensor,
        cov: &Tensor,
        size: usize,
        pseudo_counts: f64,
        noise_std: f64,
        rng: &mut R,
    ) -> anyhow::Result<Self> {
        let cov = &make_symposdef(cov, DEFAULT_EVAL_THRESHOLD)?;
        let dim = mean.dim(0)?;
        let prior_means = mean.unsqueeze(0)?.broadcast_as((size, dim))?.contiguous()?;
        let means = perturbed_means(mean, &sqrt_diag(cov)?, size, noise_std, rng)?;
        Self::new(
            joint_normal_wishart_prior(&prior_means, cov, pseudo_counts)?,
            joint_normal_wishart_prior(&means, cov, pseudo_counts)?,
        )
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn parameter(&self) -> &BayesianParameter {
        &self.means_prec
    }

    fn width(&self) -> usize {
        self.dim * self.dim + self.dim + 2
    }
}

impl BayesianModel for NormalSetSharedFullCovariance {
    type State = BatchState;

    fn sufficient_statistics(&self, data: &Tensor) -> anyhow::Result<Tensor> {
        expect_data(data, self.dim)?;
        full_stats(data)
    }

    fn mean_field_factorization(&self) -> Vec<Vec<ParamId>> {
        vec![vec![self.means_prec.id()]]
    }

    fn forward(&self, stats: &Tensor) -> anyhow::Result<(Tensor, BatchState)> {
        let nn = check_stats(stats, self.width())?;
        let llh = set_llh(stats, &self.expected_natural_params_as_matrix()?, self.dim)?;
        Ok((llh, BatchState::new(nn)))
    }

    fn accumulate(
        &self,
        stats: &Tensor,
        _state: BatchState,
        parent_msg: Option<&Tensor>,
    ) -> anyhow::Result<AccumulatedStats> {
        check_stats(stats, self.width())?;
        let dd = self.dim;
        let acc = weighted_set_stats(stats, parent_msg, self.ncomp, "NormalSetSharedFullCovariance")?;
        let joint = StatsBlocks::JointNormalWishart {
            prec: acc.narrow(1, 0, dd * dd)?.sum(0)?,
            prec_means: acc.narrow(1, dd * dd, dd)?,
            prec_means_sq: acc.narrow(1, dd * dd + dd, 1)?.squeeze(1)?,
            ln_det_prec: acc.narrow(1, dd * dd + dd + 1, 1)?.sum(0)?,
        };
        let mut ret = AccumulatedStats::default();
        ret.insert(self.means_prec.id(), joint.concat()?);
        Ok(ret)
    }

    fn local_kl_div_posterior_prior(&self, state: &BatchState) -> anyhow::Result<Tensor> {
        state.zeros(self.means_prec.posterior())
    }

    fn bayesian_parameters(&self) -> Vec<&BayesianParameter> {
        vec![&self.means_prec]
    }

    fn bayesian_parameters_mut(&mut self) -> Vec<&mut BayesianParameter> {
        vec![&mut self.means_prec]
    }

    fn to_dtype(&self, dtype: DType) -> anyhow::Result<Self> {
        let device = self.means_prec.posterior().device().clone();
        Ok(Self {
            means_prec: self.means_prec.converted(dtype, &device)?,
            dim: self.dim,
            ncomp: self.ncomp,
        })
    }

    fn to_device(&self, device: &Device) -> anyhow::Result<Self> {
        Ok(Self {
            means_prec: self
                .means_prec
                .converted(self.means_prec.posterior().dtype(), device)?,
            dim: self.dim,
            ncomp: self.ncomp,
        })
    }
}

impl BayesianModelSet for NormalSetSharedFullCovariance {
    type Component<'a> = NormalView;

    fn len(&self) -> usize {
        self.ncomp
    }

    fn component(&self, i: usize) -> anyhow::Result<NormalView> {
        if i >= self.ncomp {
            crate::invalid_arg!("component {} out of {}", i, self.ncomp);
        }
        match self.means_prec.expected_value_split()? {
            StatsBlocks::JointNormalWishart {
                prec, prec_means, ..
            } => full_view(&prec, &prec_means.get(i)?),
            _ => crate::invalid_arg!("expected JointNormalWishart statistics"),
        }
    }
}

impl NaturalParamsMatrix for NormalSetSharedFullCovariance {
    fn stats_layout(&self) -> StatsLayout {
        StatsLayout::Full
    }

    /// Rows `[E[-Λ/2], E[Λμ_k], E[-μ_kᵀΛμ_k/2], E[½ ln|Λ|]]`
    fn expected_natural_params_as_matrix(&self) -> anyhow::Result<Tensor> {
        let kk = self.ncomp;
        match self.means_prec.expected_value_split()? {
            StatsBlocks::JointNormalWishart {
                prec,
                prec_means,
                prec_means_sq,
                ln_det_prec,
            } => {
                let dd2 = self.dim * self.dim;
                let prec = prec.reshape((1, dd2))?.broadcast_as((kk, dd2))?.contiguous()?;
                let ln_det = ln_det_prec.reshape((1, 1))?.broadcast_as((kk, 1))?.contiguous()?;
                Ok(Tensor::cat(
                    &[prec, prec_means, prec_means_sq.unsqueeze(1)?, ln_det],
                    1,
                )?)
            }
            _ => crate::invalid_arg!("expected JointNormalWishart statistics"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn shared_diagonal_matches_separate_set() -> anyhow::Result<()> {
        // with equal priors both sets give the same expected llh
        let dev = Device::Cpu;
        let means = Tensor::new(&[[0_f64, 1.], [2., -1.], [1., 1.]], &dev)?;
        let prec = Tensor::new(&[2_f64, 0.5], &dev)?;

        let shared = joint_normal_gamma_prior(&means, &prec, 1.)?;
        let shared = NormalSetSharedDiagonalCovariance::new(shared.clone(), shared)?;

        let x = Tensor::new(&[[0.5_f64, 0.5], [-1., 2.]], &dev)?;
        let stats = shared.sufficient_statistics(&x)?;
        let (llh, _) = shared.forward(&stats)?;
        assert_eq!(llh.dims(), &[2, 3]);
        for v in llh.flatten_all()?.to_vec1::<f64>()? {
            assert!(v.is_finite());
        }

        let msg = Tensor::new(&[[1_f64, 0., 0.], [0., 0.5, 0.5]], &dev)?;
        let acc = shared.accumulate(&stats, BatchState::new(2), Some(&msg))?;
        let acc = shared
            .parameter()
            .posterior()
            .split_sufficient_statistics(&acc[&shared.parameter().id()])?;
        match acc {
            StatsBlocks::JointNormalGamma {
                prec_means_sq,
                ln_prec,
                ..
            } => {
                let counts = prec_means_sq.to_vec2::<f64>()?;
                approx::assert_abs_diff_eq!(counts[0][0], 1.0, epsilon = 1e-12);
                approx::assert_abs_diff_eq!(counts[1][1], 0.5, epsilon = 1e-12);
                approx::assert_abs_diff_eq!(ln_prec.to_vec1::<f64>()?[0], 2.0, epsilon = 1e-12);
            }
            _ => panic!("unexpected blocks"),
        }
        Ok(())
    }

    #[test]
    fn missing_parent_message() -> anyhow::Result<()> {
        let dev = Device::Cpu;
        let mut rng = StdRng::seed_from_u64(7);
        let set = NormalDiagonalCovarianceSet::create(
            &Tensor::zeros(2, DType::F64, &dev)?,
            &Tensor::ones(2, DType::F64, &dev)?,
            3,
            1.,
            1.,
            &mut rng,
        )?;
        assert_eq!(set.len(), 3);
        let x = Tensor::new(&[[0.5_f64, 0.5]], &dev)?;
        let stats = set.sufficient_statistics(&x)?;
        let (_, state) = set.forward(&stats)?;
        let err = set.accumulate(&stats, state, None).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<crate::error::ModelError>(),
            Some(crate::error::ModelError::MissingParentMessage(_))
        ));
        Ok(())
    }

    #[test]
    fn full_set_component_recovers_prior() -> anyhow::Result<()> {
        let dev = Device::Cpu;
        let mut rng = StdRng::seed_from_u64(1);
        let cov = Tensor::new(&[[2_f64, 0.5], [0.5, 1.]], &dev)?;
        let set = NormalSetSharedFullCovariance::create(
            &Tensor::zeros(2, DType::F64, &dev)?,
            &cov,
            2,
            1.,
            0.,
            &mut rng,
        )?;
        let view = set.component(1)?;
        let got = view.cov.to_vec2::<f64>()?;
        let want = cov.to_vec2::<f64>()?;
        for i in 0..2 {
            for j in 0..2 {
                approx::assert_abs_diff_eq!(got[i][j], want[i][j], epsilon = 1e-8);
            }
        }
        assert!(set.component(2).is_err());
        Ok(())
    }

    #[test]
    fn full_sets_accept_an_indefinite_covariance() -> anyhow::Result<()> {
        let dev = Device::Cpu;
        let mut rng = StdRng::seed_from_u64(2);
        let mean = Tensor::zeros(2, DType::F64, &dev)?;
        // eigenvalues 3 and -1
        let cov = Tensor::new(&[[1_f64, 2.], [2., 1.]], &dev)?;

        let set = NormalFullCovarianceSet::create(&mean, &cov, 2, 1., 0., &mut rng)?;
        let view = set.component(0)?.cov.to_vec2::<f64>()?;
        approx::assert_abs_diff_eq!(view[0][1], view[1][0], epsilon = 1e-10);
        // the negative eigenvalue is lifted to the floor
        let det = view[0][0] * view[1][1] - view[0][1] * view[1][0];
        approx::assert_abs_diff_eq!(det, 3. * DEFAULT_EVAL_THRESHOLD, epsilon = 1e-8);

        let shared = NormalSetSharedFullCovariance::create(&mean, &cov, 2, 1., 0., &mut rng)?;
        assert!(shared.component(1)?.cov.to_vec2::<f64>()?[0][0] > 0.);
        Ok(())
    }
}
