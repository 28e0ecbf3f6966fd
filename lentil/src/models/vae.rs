//! Variational auto-encoder with a Bayesian prior over its latent
//! space.
//!
//! The encoder and the decoder are point-estimated networks
//! (`non_bayesian_variables`), the latent prior and the optional
//! global observation noise are conjugate models updated by natural
//! gradients.

use crate::error::ModelError;
use crate::models::normal::{NormalDiagonalCovariance, NormalIsotropicCovariance};
use crate::models::traits::*;
use crate::parameters::*;
use candle_util::candle_core::{DType, Device, Tensor, Var};
use candle_util::candle_loss_functions::*;
use candle_util::candle_model_decoder::GaussianDecoder;
use candle_util::candle_model_encoder::{GaussianEncoder, GaussianModuleConfig};
use candle_util::candle_model_traits::*;
use candle_util::candle_nn::{VarBuilder, VarMap};
use candle_util::candle_nnet_registry::ElementRegistry;
use log::debug;
use std::sync::Arc;

/// How the reconstruction error is modelled
#[derive(Debug)]
pub enum ObservationNoise {
    /// The decoder outputs a variance for every observation
    Decoder,
    /// Residuals follow a global normal with diagonal covariance
    GlobalDiagonal(NormalDiagonalCovariance),
    /// Residuals follow a global normal with covariance `σ² I`
    GlobalIsotropic(NormalIsotropicCovariance),
}

impl ObservationNoise {
    fn global_normal(&self) -> Option<&dyn BayesianModel<State = BatchState>> {
        match self {
            ObservationNoise::Decoder => None,
            ObservationNoise::GlobalDiagonal(n) => Some(n),
            ObservationNoise::GlobalIsotropic(n) => Some(n),
        }
    }

    fn dim(&self) -> Option<usize> {
        match self {
            ObservationNoise::Decoder => None,
            ObservationNoise::GlobalDiagonal(n) => Some(n.dim()),
            ObservationNoise::GlobalIsotropic(n) => Some(n.dim()),
        }
    }

    fn bayesian_parameters(&self) -> Vec<&BayesianParameter> {
        self.global_normal()
            .map(|n| n.bayesian_parameters())
            .unwrap_or_default()
    }

    fn bayesian_parameters_mut(&mut self) -> Vec<&mut BayesianParameter> {
        match self {
            ObservationNoise::Decoder => vec![],
            ObservationNoise::GlobalDiagonal(n) => n.bayesian_parameters_mut(),
            ObservationNoise::GlobalIsotropic(n) => n.bayesian_parameters_mut(),
        }
    }

    fn to_dtype(&self, dtype: DType) -> anyhow::Result<Self> {
        Ok(match self {
            ObservationNoise::Decoder => ObservationNoise::Decoder,
            ObservationNoise::GlobalDiagonal(n) => ObservationNoise::GlobalDiagonal(n.to_dtype(dtype)?),
            ObservationNoise::GlobalIsotropic(n) => {
                ObservationNoise::GlobalIsotropic(n.to_dtype(dtype)?)
            }
        })
    }

    fn to_device(&self, device: &Device) -> anyhow::Result<Self> {
        Ok(match self {
            ObservationNoise::Decoder => ObservationNoise::Decoder,
            ObservationNoise::GlobalDiagonal(n) => {
                ObservationNoise::GlobalDiagonal(n.to_device(device)?)
            }
            ObservationNoise::GlobalIsotropic(n) => {
                ObservationNoise::GlobalIsotropic(n.to_device(device)?)
            }
        })
    }
}

/// Token of [`Vae::forward`]
#[derive(Debug)]
pub struct VaeState<S> {
    /// statistics of the latent samples for the latent model
    pub latent_stats: Tensor,
    pub latent_state: S,
    /// `(N)` KL of the approximate posterior from the latent prior;
    /// keeps its graph so the encoder gets the KL gradient
    pub local_kl: Tensor,
    /// `(N, F)` residual statistics of the global observation noise
    pub centered_stats: Option<Tensor>,
}

pub struct Vae<L> {
    encoder: GaussianEncoder,
    decoder: GaussianDecoder,
    varmap: VarMap,
    encoder_config: GaussianModuleConfig,
    decoder_config: GaussianModuleConfig,
    registry: Arc<ElementRegistry>,
    noise: ObservationNoise,
    latent_model: L,
    nsamples: usize,
    dtype: DType,
    device: Device,
}

impl<L: LatentModel> Vae<L> {
    /// * `encoder_config` - data (`dim_in`) to latent (`dim_out`)
    /// * `decoder_config` - latent (`dim_in`) to data (`dim_out`)
    /// * `registry` - resolves the element names of both networks
    /// * `latent_model` - prior over the latent space, in `dtype`
    /// * `noise` - observation noise, in `dtype`
    pub fn new(
        encoder_config: GaussianModuleConfig,
        decoder_config: GaussianModuleConfig,
        registry: Arc<ElementRegistry>,
        latent_model: L,
        noise: ObservationNoise,
        dtype: DType,
        device: &Device,
    ) -> anyhow::Result<Self> {
        if encoder_config.dim_out != decoder_config.dim_in {
            crate::invalid_arg!(
                "encoder emits {} latent dimensions, decoder expects {}",
                encoder_config.dim_out,
                decoder_config.dim_in
            );
        }
        if encoder_config.dim_in != decoder_config.dim_out {
            crate::invalid_arg!(
                "encoder reads {} features, decoder emits {}",
                encoder_config.dim_in,
                decoder_config.dim_out
            );
        }
        if let Some(dim) = noise.dim() {
            if dim != encoder_config.dim_in {
                crate::invalid_arg!(
                    "observation noise of dimension {} for {} features",
                    dim,
                    encoder_config.dim_in
                );
            }
        }
        let params = latent_model
            .bayesian_parameters()
            .into_iter()
            .chain(noise.bayesian_parameters());
        for p in params {
            let post = p.posterior();
            if post.dtype() != dtype || !post.device().same_device(device) {
                crate::invalid_arg!(
                    "Bayesian parameters live in {:?} on {:?}, networks in {:?} on {:?}",
                    post.dtype(),
                    post.device(),
                    dtype,
                    device
                );
            }
        }

        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, dtype, device);
        let encoder = GaussianEncoder::new(&encoder_config, &registry, vb.clone())?;
        let with_variance = matches!(noise, ObservationNoise::Decoder);
        let decoder = GaussianDecoder::new(&decoder_config, with_variance, &registry, vb)?;

        Ok(Self {
            encoder,
            decoder,
            varmap,
            encoder_config,
            decoder_config,
            registry,
            noise,
            latent_model,
            nsamples: 1,
            dtype,
            device: device.clone(),
        })
    }

    /// Number of Monte Carlo samples per data point
    pub fn with_nsamples(mut self, nsamples: usize) -> Self {
        self.nsamples = nsamples.max(1);
        self
    }

    pub fn nsamples(&self) -> usize {
        self.nsamples
    }

    pub fn latent_model(&self) -> &L {
        &self.latent_model
    }

    pub fn noise(&self) -> &ObservationNoise {
        &self.noise
    }

    pub fn dim_obs(&self) -> usize {
        self.encoder.dim_obs()
    }

    pub fn dim_latent(&self) -> usize {
        self.encoder.dim_latent()
    }

    /// Posterior moments `(means, variances)` of the latent variables
    pub fn encode(&self, data: &Tensor) -> anyhow::Result<(Tensor, Tensor)> {
        let x = data.to_dtype(self.dtype)?.to_device(&self.device)?;
        Ok(self.encoder.forward_t(&x, false)?)
    }

    fn named_vars(&self) -> anyhow::Result<Vec<(String, Var)>> {
        let data = self
            .varmap
            .data()
            .lock()
            .map_err(|e| anyhow::anyhow!("poisoned variable map: {}", e))?;
        let mut ret = data
            .iter()
            .map(|(name, var)| (name.clone(), var.clone()))
            .collect::<Vec<_>>();
        ret.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(ret)
    }

    /// Copies of the network weights, ordered by variable name
    pub fn non_bayesian_parameters(&self) -> anyhow::Result<Vec<Tensor>> {
        self.named_vars()?
            .into_iter()
            .map(|(_, var)| Ok(var.as_tensor().copy()?))
            .collect()
    }

    /// Overwrite the network weights in place, in the order of
    /// [`Vae::non_bayesian_parameters`]
    pub fn set_non_bayesian_parameters(&mut self, values: &[Tensor]) -> anyhow::Result<()> {
        let vars = self.named_vars()?;
        if vars.len() != values.len() {
            return Err(ModelError::ParameterCountMismatch {
                expected: vars.len(),
                got: values.len(),
            }
            .into());
        }
        for ((name, var), value) in vars.iter().zip(values) {
            if var.dims() != value.dims() {
                crate::invalid_arg!(
                    "{} has shape {:?}, got {:?}",
                    name,
                    var.dims(),
                    value.dims()
                );
            }
            var.set(&value.to_dtype(self.dtype)?.to_device(&self.device)?)?;
        }
        Ok(())
    }

    /// `(N)` expected log-likelihood of the data given `nsamples`
    /// latent draws per row, with the residual statistics of a global
    /// noise model
    fn expected_llh(
        &self,
        x_nd: &Tensor,
        z_snk: &Tensor,
    ) -> anyhow::Result<(Tensor, Option<Tensor>)> {
        let (ss, nn, kk) = z_snk.dims3()?;
        let dd = x_nd.dim(1)?;
        let z = z_snk.reshape((ss * nn, kk))?;

        match self.noise.global_normal() {
            None => {
                let (mean, var) = self.decoder.forward_with_variance(&z)?;
                let mean = mean.reshape((ss, nn, dd))?;
                let var = var.reshape((ss, nn, dd))?;
                let llh = gaussian_log_likelihood(x_nd, &mean, &var)?.mean(0)?;
                Ok((llh, None))
            }
            Some(normal) => {
                let mean = self.decoder.forward(&z)?.reshape((ss, nn, dd))?;
                let centered = x_nd
                    .unsqueeze(0)?
                    .broadcast_sub(&mean)?
                    .reshape((ss * nn, dd))?;
                let stats = normal.sufficient_statistics(&centered)?;
                let ff = stats.dim(1)?;
                let stats = stats.reshape((ss, nn, ff))?.mean(0)?;
                let (llh, _) = normal.forward(&stats)?;
                Ok((llh, Some(stats.detach())))
            }
        }
    }
}

impl<L: LatentModel> BayesianModel for Vae<L> {
    type State = VaeState<L::State>;

    /// The data themselves
    fn sufficient_statistics(&self, data: &Tensor) -> anyhow::Result<Tensor> {
        crate::models::normal::expect_data(data, self.dim_obs())?;
        Ok(data.to_dtype(self.dtype)?.to_device(&self.device)?)
    }

    fn mean_field_factorization(&self) -> Vec<Vec<ParamId>> {
        let mut groups = self.latent_model.mean_field_factorization();
        if let Some(normal) = self.noise.global_normal() {
            groups.extend(normal.mean_field_factorization());
        }
        groups
    }

    /// `(N)` expected log-likelihood; the KL of the encoder posterior
    /// is left to `local_kl_div_posterior_prior`
    fn forward(&self, stats: &Tensor) -> anyhow::Result<(Tensor, Self::State)> {
        let (means, vars) = self.encoder.forward_t(stats, true)?;

        let (exp_np, latent_stats, latent_state) = self.latent_model.expected_natural_params(
            &means.detach(),
            &vars.detach(),
            self.nsamples,
        )?;

        let post_np = diag_normal_natural_params(&means, &vars)?;
        let post_stats = diag_normal_expected_stats(&means, &vars)?;
        let gauss_kl = post_np
            .sub(&exp_np.to_dtype(post_np.dtype())?)?
            .mul(&post_stats)?
            .sum(1)?;
        let latent_kl = self.latent_model.local_kl_div_posterior_prior(&latent_state)?;
        let local_kl = (gauss_kl + latent_kl.to_dtype(self.dtype)?)?;

        let z = crate::utils::sample_from_normals(&means, &vars, self.nsamples)?;
        let (llh, centered_stats) = self.expected_llh(stats, &z)?;
        debug!(
            "vae forward: {} samples x {} draws",
            stats.dim(0)?,
            self.nsamples
        );

        Ok((
            llh,
            VaeState {
                latent_stats,
                latent_state,
                local_kl,
                centered_stats,
            },
        ))
    }

    fn accumulate(
        &self,
        _stats: &Tensor,
        state: Self::State,
        parent_msg: Option<&Tensor>,
    ) -> anyhow::Result<AccumulatedStats> {
        let mut ret =
            self.latent_model
                .accumulate(&state.latent_stats, state.latent_state, parent_msg)?;
        if let (Some(normal), Some(centered)) = (self.noise.global_normal(), state.centered_stats)
        {
            let batch = BatchState::new(centered.dim(0)?);
            ret.extend(normal.accumulate(&centered, batch, parent_msg)?);
        }
        Ok(ret)
    }

    fn local_kl_div_posterior_prior(&self, state: &Self::State) -> anyhow::Result<Tensor> {
        Ok(state.local_kl.clone())
    }

    fn bayesian_parameters(&self) -> Vec<&BayesianParameter> {
        let mut ret = self.latent_model.bayesian_parameters();
        ret.extend(self.noise.bayesian_parameters());
        ret
    }

    fn bayesian_parameters_mut(&mut self) -> Vec<&mut BayesianParameter> {
        let mut ret = self.latent_model.bayesian_parameters_mut();
        ret.extend(self.noise.bayesian_parameters_mut());
        ret
    }

    fn non_bayesian_variables(&self) -> anyhow::Result<Vec<Var>> {
        Ok(self.named_vars()?.into_iter().map(|(_, v)| v).collect())
    }

    fn to_dtype(&self, dtype: DType) -> anyhow::Result<Self> {
        let mut ret = Vae::new(
            self.encoder_config.clone(),
            self.decoder_config.clone(),
            self.registry.clone(),
            self.latent_model.to_dtype(dtype)?,
            self.noise.to_dtype(dtype)?,
            dtype,
            &self.device,
        )?
        .with_nsamples(self.nsamples);
        ret.set_non_bayesian_parameters(&self.non_bayesian_parameters()?)?;
        Ok(ret)
    }

    fn to_device(&self, device: &Device) -> anyhow::Result<Self> {
        let mut ret = Vae::new(
            self.encoder_config.clone(),
            self.decoder_config.clone(),
            self.registry.clone(),
            self.latent_model.to_device(device)?,
            self.noise.to_device(device)?,
            self.dtype,
            device,
        )?
        .with_nsamples(self.nsamples);
        ret.set_non_bayesian_parameters(&self.non_bayesian_parameters()?)?;
        Ok(ret)
    }
}
