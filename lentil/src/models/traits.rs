use crate::expfamily::ExpFamilyPrior;
use crate::parameters::{AccumulatedStats, BayesianParameter, ParamId};
use candle_util::candle_core::{DType, Device, Tensor, Var};

/// A model whose parameters are [`BayesianParameter`]s.
///
/// `forward` hands back a `State` token holding whatever the model
/// computed for the batch (responsibilities, latent statistics, ...).
/// `accumulate` consumes that token, so the statistics of a batch can
/// only be accumulated once and only after its forward pass.
pub trait BayesianModel {
    type State;

    /// Map raw data `(N, D)` to the sufficient statistics of the model
    fn sufficient_statistics(&self, data: &Tensor) -> anyhow::Result<Tensor>;

    /// Groups of parameters updated together
    fn mean_field_factorization(&self) -> Vec<Vec<ParamId>>;

    /// Per-sample expected log-likelihood `(N)` (or `(N, len)` for a
    /// model set) and the token of this pass
    fn forward(&self, stats: &Tensor) -> anyhow::Result<(Tensor, Self::State)>;

    /// Sufficient statistics for every parameter, weighted by
    /// `parent_msg` when the model sits under a parent
    fn accumulate(
        &self,
        stats: &Tensor,
        state: Self::State,
        parent_msg: Option<&Tensor>,
    ) -> anyhow::Result<AccumulatedStats>;

    /// KL divergence between local posteriors and priors `(N)`
    fn local_kl_div_posterior_prior(&self, state: &Self::State) -> anyhow::Result<Tensor>;

    fn bayesian_parameters(&self) -> Vec<&BayesianParameter>;

    fn bayesian_parameters_mut(&mut self) -> Vec<&mut BayesianParameter>;

    /// Variables trained by a standard optimizer
    fn non_bayesian_variables(&self) -> anyhow::Result<Vec<Var>> {
        Ok(vec![])
    }

    fn to_dtype(&self, dtype: DType) -> anyhow::Result<Self>
    where
        Self: Sized;

    fn to_device(&self, device: &Device) -> anyhow::Result<Self>
    where
        Self: Sized;

    fn float(&self) -> anyhow::Result<Self>
    where
        Self: Sized,
    {
        self.to_dtype(DType::F32)
    }

    fn double(&self) -> anyhow::Result<Self>
    where
        Self: Sized,
    {
        self.to_dtype(DType::F64)
    }
}

/// A collection of models evaluated side by side: `forward` returns
/// `(N, len)` and `accumulate` requires a `(N, len)` parent message
pub trait BayesianModelSet: BayesianModel {
    type Component<'a>
    where
        Self: 'a;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Read-only view of the `i`-th member
    fn component(&self, i: usize) -> anyhow::Result<Self::Component<'_>>;
}

/// How the sufficient statistics of a normal model are laid out
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatsLayout {
    /// `[x², x, 1, 1]`, `4D` wide
    Diagonal,
    /// `[vec(xxᵀ), x, 1, 1]`, `D² + D + 2` wide
    Full,
}

/// Sets whose expected log-likelihood is linear in the sufficient
/// statistics
pub trait NaturalParamsMatrix {
    /// `(len, F)` expected natural parameters, row `k` for member `k`
    fn expected_natural_params_as_matrix(&self) -> anyhow::Result<Tensor>;

    fn stats_layout(&self) -> StatsLayout;
}

/// A prior over the latent space of a VAE
pub trait LatentModel: BayesianModel {
    /// * `means` - `(N, K)` posterior means of the latent variables
    /// * `variances` - `(N, K)` posterior variances
    /// * `nsamples` - number of Monte Carlo samples
    ///
    /// Returns the expected natural parameters `(N, 4K)` of the prior
    /// in the diagonal layout `[-λ/2, λμ, -λμ²/2, ½ ln λ]`, the latent
    /// statistics to accumulate and the token of this pass.
    fn expected_natural_params(
        &self,
        means: &Tensor,
        variances: &Tensor,
        nsamples: usize,
    ) -> anyhow::Result<(Tensor, Tensor, Self::State)>;
}

/// `-0.5 * D * ln(2π)`
pub(crate) fn gaussian_log_partition(dim: usize) -> f64 {
    -0.5 * dim as f64 * (2. * std::f64::consts::PI).ln()
}

/// Token of a model without local latent variables; it only keeps
/// the batch size
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchState {
    num_samples: usize,
}

impl BatchState {
    pub fn new(num_samples: usize) -> Self {
        Self { num_samples }
    }

    pub fn num_samples(&self) -> usize {
        self.num_samples
    }

    /// `(N)` zeros in the dtype and device of `like`
    pub(crate) fn zeros(&self, like: &ExpFamilyPrior) -> anyhow::Result<Tensor> {
        Ok(Tensor::zeros(self.num_samples, like.dtype(), like.device())?)
    }
}

pub(crate) fn require_parent_msg<'a>(
    parent_msg: Option<&'a Tensor>,
    model: &'static str,
) -> anyhow::Result<&'a Tensor> {
    parent_msg.ok_or_else(|| crate::error::ModelError::MissingParentMessage(model).into())
}

/// `(N, F)` statistics checked against the expected width
pub(crate) fn check_stats(stats: &Tensor, width: usize) -> anyhow::Result<usize> {
    match stats.dims() {
        [nn, ff] if *ff == width => Ok(*nn),
        dims => crate::invalid_arg!(
            "expected statistics of shape (N, {}), got {:?}",
            width,
            dims
        ),
    }
}
