use crate::expfamily::ExpFamilyPrior;
use crate::models::mixtureset::MixtureSet;
use crate::models::normal::sampled_stats;
use crate::models::traits::*;
use crate::parameters::*;
use candle_util::candle_core::{DType, Device, Tensor};
use candle_util::candle_numeric::onehot;

/// A single mixture over the members of a model set. Unlike
/// [`MixtureSet`] it can sit at the top of a model: without a parent
/// message every sample has weight one.
#[derive(Debug)]
pub struct Mixture<M> {
    inner: MixtureSet<M>,
}

/// Token of [`Mixture::forward`]
#[derive(Debug)]
pub struct MixtureState<S> {
    /// `(N, C)` responsibilities
    pub resps: Tensor,
    /// `(N)` KL divergence of the responsibilities from the weights
    pub local_kl: Tensor,
    pub inner: S,
}

impl<M: BayesianModelSet> Mixture<M> {
    pub fn new(
        prior_weights: ExpFamilyPrior,
        posterior_weights: ExpFamilyPrior,
        modelset: M,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            inner: MixtureSet::new(vec![prior_weights], vec![posterior_weights], modelset)?,
        })
    }

    /// * `weights` - `(C)` initial weights
    /// * `pseudo_counts` - strength of the Dirichlet prior
    pub fn create(modelset: M, weights: &Tensor, pseudo_counts: f64) -> anyhow::Result<Self> {
        Ok(Self {
            inner: MixtureSet::create(modelset, &weights.unsqueeze(0)?, pseudo_counts)?,
        })
    }

    pub fn num_comp(&self) -> usize {
        self.inner.num_comp()
    }

    pub fn modelset(&self) -> &M {
        self.inner.modelset()
    }

    pub fn weights(&self) -> anyhow::Result<&BayesianParameter> {
        match self.inner.weights().get(0) {
            Some(w) => Ok(w),
            None => crate::invalid_arg!("mixture without weights"),
        }
    }

    /// `(C)` posterior mean of the weights
    pub fn expected_weights(&self) -> anyhow::Result<Tensor> {
        let alpha = (self.weights()?.posterior().natural_hparams() + 1.)?;
        Ok(alpha.broadcast_div(&alpha.sum_keepdim(0)?)?)
    }

    pub fn component(&self, k: usize) -> anyhow::Result<M::Component<'_>> {
        if k >= self.num_comp() {
            crate::invalid_arg!("component {} out of {}", k, self.num_comp());
        }
        self.modelset().component(k)
    }

    /// Like [`BayesianModel::forward`], with the responsibilities fixed
    /// to the one-hot encoding of known component `labels`
    ///
    /// * `stats` - `(N, S)` sufficient statistics
    /// * `labels` - `N` component indices, each `< C`
    pub fn forward_labelled(
        &self,
        stats: &Tensor,
        labels: &[usize],
    ) -> anyhow::Result<(Tensor, MixtureState<M::State>)> {
        let (llh, inner) = self.modelset().forward(stats)?;
        let nn = llh.dim(0)?;
        if labels.len() != nn {
            crate::invalid_arg!("{} labels for {} samples", labels.len(), nn);
        }
        if let Some(k) = labels.iter().find(|&&k| k >= self.num_comp()) {
            crate::invalid_arg!("label {} out of {} components", k, self.num_comp());
        }
        let resps = onehot(labels, self.num_comp(), llh.dtype(), llh.device())?;
        let log_w = self.inner.log_weights()?;
        let exp_llh = (&llh * &resps)?.sum(1)?;
        // r ln r vanishes for one-hot r
        let local_kl = resps.broadcast_mul(&log_w)?.sum(1)?.neg()?;
        Ok((
            exp_llh,
            MixtureState {
                resps,
                local_kl,
                inner,
            },
        ))
    }

    fn squeeze_state(
        &self,
        stats: &Tensor,
    ) -> anyhow::Result<(Tensor, MixtureState<M::State>)> {
        let (r, inner) = self.inner.responsibilities(stats)?;
        Ok((
            r.exp_llh.squeeze(1)?,
            MixtureState {
                resps: r.resps.squeeze(1)?.detach(),
                local_kl: r.local_kl.squeeze(1)?,
                inner,
            },
        ))
    }
}

impl<M: BayesianModelSet> BayesianModel for Mixture<M> {
    type State = MixtureState<M::State>;

    fn sufficient_statistics(&self, data: &Tensor) -> anyhow::Result<Tensor> {
        self.inner.sufficient_statistics(data)
    }

    fn mean_field_factorization(&self) -> Vec<Vec<ParamId>> {
        self.inner.mean_field_factorization()
    }

    /// `(N)` responsibility-weighted expected log-likelihood; the KL
    /// of the responsibilities is left to `local_kl_div_posterior_prior`
    fn forward(&self, stats: &Tensor) -> anyhow::Result<(Tensor, Self::State)> {
        self.squeeze_state(stats)
    }

    fn accumulate(
        &self,
        stats: &Tensor,
        state: Self::State,
        parent_msg: Option<&Tensor>,
    ) -> anyhow::Result<AccumulatedStats> {
        let nn = state.resps.dim(0)?;
        let parent_msg = match parent_msg {
            Some(w) => w.reshape((nn, 1))?,
            None => Tensor::ones((nn, 1), state.resps.dtype(), state.resps.device())?,
        };
        self.inner
            .accumulate_joint(stats, &state.resps.unsqueeze(1)?, state.inner, &parent_msg)
    }

    fn local_kl_div_posterior_prior(&self, state: &Self::State) -> anyhow::Result<Tensor> {
        Ok(state.local_kl.clone())
    }

    fn bayesian_parameters(&self) -> Vec<&BayesianParameter> {
        self.inner.bayesian_parameters()
    }

    fn bayesian_parameters_mut(&mut self) -> Vec<&mut BayesianParameter> {
        self.inner.bayesian_parameters_mut()
    }

    fn to_dtype(&self, dtype: DType) -> anyhow::Result<Self> {
        Ok(Self {
            inner: self.inner.to_dtype(dtype)?,
        })
    }

    fn to_device(&self, device: &Device) -> anyhow::Result<Self> {
        Ok(Self {
            inner: self.inner.to_device(device)?,
        })
    }
}

impl<M> LatentModel for Mixture<M>
where
    M: BayesianModelSet + NaturalParamsMatrix,
{
    fn expected_natural_params(
        &self,
        means: &Tensor,
        variances: &Tensor,
        nsamples: usize,
    ) -> anyhow::Result<(Tensor, Tensor, Self::State)> {
        let (_, kk) = means.dims2()?;
        if self.modelset().stats_layout() != StatsLayout::Diagonal {
            crate::invalid_arg!(
                "a latent prior needs diagonal statistics, got {:?}",
                self.modelset().stats_layout()
            );
        }
        let matrix = self.modelset().expected_natural_params_as_matrix()?;
        if matrix.dim(1)? != 4 * kk {
            crate::invalid_arg!(
                "a latent prior needs diagonal statistics of width {}, got {}",
                4 * kk,
                matrix.dim(1)?
            );
        }
        let stats = sampled_stats(self, means, variances, nsamples)?;
        let (_, state) = self.squeeze_state(&stats)?;
        let exp_np = state.resps.matmul(&matrix)?;
        Ok((exp_np, stats, state))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::normalset::{
        NormalDiagonalCovarianceSet, NormalFullCovarianceSet, NormalSetSharedFullCovariance,
    };
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn diag_gmm(ncomp: usize) -> anyhow::Result<Mixture<NormalDiagonalCovarianceSet>> {
        let dev = Device::Cpu;
        let mut rng = StdRng::seed_from_u64(3);
        let set = NormalDiagonalCovarianceSet::create(
            &Tensor::zeros(2, DType::F64, &dev)?,
            &Tensor::ones(2, DType::F64, &dev)?,
            ncomp,
            1.,
            1.,
            &mut rng,
        )?;
        let w = (Tensor::ones(ncomp, DType::F64, &dev)? / ncomp as f64)?;
        Mixture::create(set, &w, 1.)
    }

    #[test]
    fn top_level_accumulation() -> anyhow::Result<()> {
        let gmm = diag_gmm(3)?;
        let x = Tensor::new(&[[0.1_f64, -0.3], [1.5, 0.2], [-2., 1.]], &Device::Cpu)?;
        let stats = gmm.sufficient_statistics(&x)?;
        let (llh, state) = gmm.forward(&stats)?;
        assert_eq!(llh.dims(), &[3]);

        let kl = gmm.local_kl_div_posterior_prior(&state)?.to_vec1::<f64>()?;
        assert!(kl.iter().all(|v| v.is_finite()));

        let acc = gmm.accumulate(&stats, state, None)?;
        let counts = acc[&gmm.weights()?.id()].sum_all()?.to_scalar::<f64>()?;
        approx::assert_abs_diff_eq!(counts, 3.0, epsilon = 1e-10);

        let w = gmm.expected_weights()?.sum_all()?.to_scalar::<f64>()?;
        approx::assert_abs_diff_eq!(w, 1.0, epsilon = 1e-10);
        Ok(())
    }

    #[test]
    fn labelled_forward_uses_the_given_components() -> anyhow::Result<()> {
        let gmm = diag_gmm(2)?;
        let x = Tensor::new(&[[0.1_f64, -0.3], [1.5, 0.2], [-2., 1.]], &Device::Cpu)?;
        let stats = gmm.sufficient_statistics(&x)?;
        let labels = [1, 0, 1];

        let (per_comp, _) = gmm.modelset().forward(&stats)?;
        let per_comp = per_comp.to_vec2::<f64>()?;
        let log_w = gmm.weights()?.expected_value().to_vec1::<f64>()?;

        let (llh, state) = gmm.forward_labelled(&stats, &labels)?;
        let llh = llh.to_vec1::<f64>()?;
        let kl = gmm.local_kl_div_posterior_prior(&state)?.to_vec1::<f64>()?;
        for (n, &k) in labels.iter().enumerate() {
            approx::assert_abs_diff_eq!(llh[n], per_comp[n][k], epsilon = 1e-10);
            approx::assert_abs_diff_eq!(kl[n], -log_w[k], epsilon = 1e-10);
        }

        let acc = gmm.accumulate(&stats, state, None)?;
        let counts = acc[&gmm.weights()?.id()].to_vec1::<f64>()?;
        assert_eq!(counts, vec![1., 2.]);

        assert!(gmm.forward_labelled(&stats, &[0, 1]).is_err());
        assert!(gmm.forward_labelled(&stats, &[0, 2, 1]).is_err());
        Ok(())
    }

    #[test]
    fn latent_prior_layout() -> anyhow::Result<()> {
        let dev = Device::Cpu;
        let gmm = diag_gmm(2)?;
        let means = Tensor::new(&[[0_f64, 1.], [2., -1.], [1., 1.]], &dev)?;
        let vars = (means.ones_like()? * 0.1)?;
        let (exp_np, stats, state) = gmm.expected_natural_params(&means, &vars, 3)?;
        assert_eq!(exp_np.dims(), &[3, 8]);
        assert_eq!(stats.dims(), &[3, 8]);
        assert_eq!(state.resps.dims(), &[3, 2]);

        let mut rng = StdRng::seed_from_u64(3);
        let full = NormalFullCovarianceSet::create(
            &Tensor::zeros(2, DType::F64, &dev)?,
            &Tensor::eye(2, DType::F64, &dev)?,
            2,
            1.,
            1.,
            &mut rng,
        )?;
        // D = 2 full statistics are as wide as 2-D diagonal ones
        assert_eq!(full.expected_natural_params_as_matrix()?.dim(1)?, 8);
        let half = (Tensor::ones(2, DType::F64, &dev)? * 0.5)?;
        let full = Mixture::create(full, &half, 1.)?;
        let err = full.expected_natural_params(&means, &vars, 1).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<crate::ModelError>(),
            Some(crate::ModelError::InvalidArgument(_))
        ));

        let shared = NormalSetSharedFullCovariance::create(
            &Tensor::zeros(2, DType::F64, &dev)?,
            &Tensor::eye(2, DType::F64, &dev)?,
            2,
            1.,
            1.,
            &mut rng,
        )?;
        let shared = Mixture::create(shared, &half, 1.)?;
        assert!(shared.expected_natural_params(&means, &vars, 1).is_err());
        Ok(())
    }
}
