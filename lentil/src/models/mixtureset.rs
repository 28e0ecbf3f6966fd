use crate::expfamily::*;
use crate::models::traits::*;
use crate::parameters::*;
use candle_util::candle_core::{DType, Device, Tensor};
use candle_util::candle_numeric::logsumexp;

/// `M` mixtures sharing one model set of `M * C` members; mixture `m`
/// owns the members `m * C .. (m + 1) * C`.
///
/// A `MixtureSet` is a model set itself (`len() == M`), so mixtures of
/// mixtures nest.
#[derive(Debug)]
pub struct MixtureSet<M> {
    num_mix: usize,
    num_comp: usize,
    weights: BayesianParameterSet,
    modelset: M,
}

/// Token of [`MixtureSet::forward`]
#[derive(Debug)]
pub struct MixtureSetState<S> {
    /// `(N, M, C)` responsibilities
    pub resps: Tensor,
    pub inner: S,
}

/// The `m`-th mixture of a [`MixtureSet`]: its normalized weights
/// `(C)` and views of its members
#[derive(Debug)]
pub struct MixtureSetElement<C> {
    pub weights: Tensor,
    pub modelset: Vec<C>,
}

/// Output of the responsibility computation, all `(N, M)` except
/// `resps (N, M, C)`
pub(crate) struct Responsibilities {
    pub exp_llh: Tensor,
    pub local_kl: Tensor,
    pub resps: Tensor,
}

/// * `llh_nmc` - per-component expected log-likelihood
/// * `log_weights_mc` - expected log weights
pub(crate) fn responsibilities(
    llh_nmc: &Tensor,
    log_weights_mc: &Tensor,
) -> anyhow::Result<Responsibilities> {
    let log_w = log_weights_mc.unsqueeze(0)?;
    let w_llh = llh_nmc.broadcast_add(&log_w)?;
    let log_norm = logsumexp(&w_llh, 2)?.detach();
    let log_resps = w_llh.broadcast_sub(&log_norm.unsqueeze(2)?)?;
    let resps = log_resps.exp()?;
    let local_kl = resps.mul(&log_resps.broadcast_sub(&log_w)?)?.sum(2)?;
    let exp_llh = llh_nmc.mul(&resps)?.sum(2)?;
    Ok(Responsibilities {
        exp_llh,
        local_kl,
        resps,
    })
}

impl<M: BayesianModelSet> MixtureSet<M> {
    /// * `prior_weights` - one Dirichlet per mixture
    /// * `posterior_weights` - same families as `prior_weights`
    /// * `modelset` - `M * C` members
    pub fn new(
        prior_weights: Vec<ExpFamilyPrior>,
        posterior_weights: Vec<ExpFamilyPrior>,
        modelset: M,
    ) -> anyhow::Result<Self> {
        let num_mix = prior_weights.len();
        if num_mix == 0 || posterior_weights.len() != num_mix {
            crate::invalid_arg!(
                "need as many (>0) prior as posterior weights: {} vs {}",
                num_mix,
                posterior_weights.len()
            );
        }
        if modelset.len() % num_mix != 0 {
            crate::invalid_arg!(
                "{} members cannot be split into {} mixtures",
                modelset.len(),
                num_mix
            );
        }
        let num_comp = modelset.len() / num_mix;

        let weights = prior_weights
            .into_iter()
            .zip(posterior_weights)
            .map(|(prior, posterior)| {
                if prior.family() != (Family::Dirichlet { dim: num_comp }) {
                    crate::invalid_arg!(
                        "mixture weights should be Dirichlet({}), got {}",
                        num_comp,
                        prior.family()
                    );
                }
                BayesianParameter::new(prior, posterior)
            })
            .collect::<anyhow::Result<Vec<_>>>()?;

        Ok(Self {
            num_mix,
            num_comp,
            weights: BayesianParameterSet::new(weights),
            modelset,
        })
    }

    /// Prior and posterior weights `Dirichlet(pseudo_counts * weights[m])`
    ///
    /// * `weights` - `(M, C)` initial weights
    pub fn create(modelset: M, weights: &Tensor, pseudo_counts: f64) -> anyhow::Result<Self> {
        let (num_mix, _) = weights.dims2()?;
        let priors = (0..num_mix)
            .map(|m| dirichlet_prior(&(weights.get(m)? * pseudo_counts)?))
            .collect::<anyhow::Result<Vec<_>>>()?;
        Self::new(priors.clone(), priors, modelset)
    }

    pub fn num_mix(&self) -> usize {
        self.num_mix
    }

    pub fn num_comp(&self) -> usize {
        self.num_comp
    }

    pub fn modelset(&self) -> &M {
        &self.modelset
    }

    pub fn weights(&self) -> &BayesianParameterSet {
        &self.weights
    }

    /// `(M, C)` expected log weights `E[ln π]`
    pub fn log_weights(&self) -> anyhow::Result<Tensor> {
        let rows = self.weights.iter().map(|w| w.expected_value()).collect::<Vec<_>>();
        Ok(Tensor::stack(&rows, 0)?)
    }

    /// Responsibilities of a batch and the token of the inner set
    pub(crate) fn responsibilities(
        &self,
        stats: &Tensor,
    ) -> anyhow::Result<(Responsibilities, M::State)> {
        let (llh, inner) = self.modelset.forward(stats)?;
        let nn = llh.dim(0)?;
        let llh = llh.reshape((nn, self.num_mix, self.num_comp))?;
        Ok((responsibilities(&llh, &self.log_weights()?)?, inner))
    }

    /// Weight statistics and inner statistics given `resps (N, M, C)`
    /// and the parent message `(N, M)`
    pub(crate) fn accumulate_joint(
        &self,
        stats: &Tensor,
        resps: &Tensor,
        inner: M::State,
        parent_msg: &Tensor,
    ) -> anyhow::Result<AccumulatedStats> {
        let nn = resps.dim(0)?;
        if parent_msg.dims() != [nn, self.num_mix] {
            crate::invalid_arg!(
                "parent message should be ({}, {}), got {:?}",
                nn,
                self.num_mix,
                parent_msg.dims()
            );
        }
        let parent_msg = parent_msg.to_dtype(resps.dtype())?;
        let joint_resps = resps.broadcast_mul(&parent_msg.unsqueeze(2)?)?;
        let counts = joint_resps.sum(0)?;

        let mut ret = AccumulatedStats::default();
        for (m, param) in self.weights.iter().enumerate() {
            ret.insert(param.id(), counts.get(m)?);
        }

        let joint_resps = joint_resps.reshape((nn, self.num_mix * self.num_comp))?;
        ret.extend(self.modelset.accumulate(stats, inner, Some(&joint_resps))?);
        Ok(ret)
    }

    pub(crate) fn convert(&self, dtype: DType, device: &Device, modelset: M) -> anyhow::Result<Self> {
        Ok(Self {
            num_mix: self.num_mix,
            num_comp: self.num_comp,
            weights: self.weights.converted(dtype, device)?,
            modelset,
        })
    }

    fn dtype_device(&self) -> (DType, Device) {
        match self.weights.get(0) {
            Some(p) => (p.posterior().dtype(), p.posterior().device().clone()),
            None => (DType::F32, Device::Cpu),
        }
    }
}

impl<M: BayesianModelSet> BayesianModel for MixtureSet<M> {
    type State = MixtureSetState<M::State>;

    fn sufficient_statistics(&self, data: &Tensor) -> anyhow::Result<Tensor> {
        self.modelset.sufficient_statistics(data)
    }

    fn mean_field_factorization(&self) -> Vec<Vec<ParamId>> {
        let mut groups = self.modelset.mean_field_factorization();
        if groups.is_empty() {
            groups.push(vec![]);
        }
        groups[0].extend(self.weights.ids());
        groups
    }

    /// `(N, M)` expected log-likelihood of every mixture minus the KL
    /// of its responsibilities
    fn forward(&self, stats: &Tensor) -> anyhow::Result<(Tensor, Self::State)> {
        let (r, inner) = self.responsibilities(stats)?;
        let llh = (r.exp_llh - r.local_kl)?;
        Ok((
            llh,
            MixtureSetState {
                resps: r.resps.detach(),
                inner,
            },
        ))
    }

    fn accumulate(
        &self,
        stats: &Tensor,
        state: Self::State,
        parent_msg: Option<&Tensor>,
    ) -> anyhow::Result<AccumulatedStats> {
        let parent_msg = require_parent_msg(parent_msg, "MixtureSet")?;
        self.accumulate_joint(stats, &state.resps, state.inner, parent_msg)
    }

    /// Already part of `forward`
    fn local_kl_div_posterior_prior(&self, state: &Self::State) -> anyhow::Result<Tensor> {
        let nn = state.resps.dim(0)?;
        Ok(Tensor::zeros(nn, state.resps.dtype(), state.resps.device())?)
    }

    fn bayesian_parameters(&self) -> Vec<&BayesianParameter> {
        let mut ret = self.weights.iter().collect::<Vec<_>>();
        ret.extend(self.modelset.bayesian_parameters());
        ret
    }

    fn bayesian_parameters_mut(&mut self) -> Vec<&mut BayesianParameter> {
        let mut ret = self.weights.iter_mut().collect::<Vec<_>>();
        ret.extend(self.modelset.bayesian_parameters_mut());
        ret
    }

    fn to_dtype(&self, dtype: DType) -> anyhow::Result<Self> {
        let (_, device) = self.dtype_device();
        self.convert(dtype, &device, self.modelset.to_dtype(dtype)?)
    }

    fn to_device(&self, device: &Device) -> anyhow::Result<Self> {
        let (dtype, _) = self.dtype_device();
        self.convert(dtype, device, self.modelset.to_device(device)?)
    }
}

impl<M: BayesianModelSet> BayesianModelSet for MixtureSet<M> {
    type Component<'a>
        = MixtureSetElement<M::Component<'a>>
    where
        Self: 'a;

    fn len(&self) -> usize {
        self.num_mix
    }

    fn component(&self, i: usize) -> anyhow::Result<Self::Component<'_>> {
        if i >= self.num_mix {
            crate::invalid_arg!("mixture {} out of {}", i, self.num_mix);
        }
        let weights = self.log_weights()?.get(i)?.exp()?;
        let weights = weights.broadcast_div(&weights.sum_keepdim(0)?)?;
        let modelset = (i * self.num_comp..(i + 1) * self.num_comp)
            .map(|k| self.modelset.component(k))
            .collect::<anyhow::Result<Vec<_>>>()?;
        Ok(MixtureSetElement { weights, modelset })
    }
}
