use crate::candle_aux_layers::NeuralNetwork;
use crate::candle_model_traits::*;
use crate::candle_nnet_registry::{BlockConfig, ElementRegistry};
use candle_core::{Result, Tensor};
use candle_nn::{Linear, Module, VarBuilder};
use serde::{Deserialize, Serialize};

/// Shape of a network emitting diagonal Gaussian moments: the
/// `blocks` map `dim_in` to `dim_hidden`, then two linear heads map
/// `dim_hidden` to the mean and log-variance in `dim_out`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct GaussianModuleConfig {
    pub dim_in: usize,
    pub dim_hidden: usize,
    pub dim_out: usize,
    pub blocks: Vec<BlockConfig>,
}

impl GaussianModuleConfig {
    /// Read a JSON configuration
    pub fn from_json_file(file: &str) -> anyhow::Result<Self> {
        let reader = matrix_util::common_io::open_buf_reader(file)?;
        Ok(serde_json::from_reader(reader)?)
    }
}

pub(crate) const MIN_LNVAR: f64 = -8.;
pub(crate) const MAX_LNVAR: f64 = 8.;

pub struct GaussianEncoder {
    n_features: usize,
    n_latent: usize,
    fc: NeuralNetwork,
    z_mean: Linear,
    z_lnvar: Linear,
}

impl EncoderModuleT for GaussianEncoder {
    fn forward_t(&self, x_nd: &Tensor, _train: bool) -> Result<(Tensor, Tensor)> {
        let h_nl = self.fc.forward(x_nd)?;
        let z_mean_nk = self.z_mean.forward(&h_nl)?;
        let z_lnvar_nk = self.z_lnvar.forward(&h_nl)?.clamp(MIN_LNVAR, MAX_LNVAR)?;
        Ok((z_mean_nk, z_lnvar_nk.exp()?))
    }

    fn dim_obs(&self) -> usize {
        self.n_features
    }

    fn dim_latent(&self) -> usize {
        self.n_latent
    }
}

impl GaussianEncoder {
    /// Will create a new encoder module with these variables:
    ///
    /// * `nn.enc.fc.block.{i}.{j}...` where {i} is the block index
    /// * `nn.enc.z.mean.weight`
    /// * `nn.enc.z.lnvar.weight`
    pub fn new(
        config: &GaussianModuleConfig,
        registry: &ElementRegistry,
        vs: VarBuilder,
    ) -> Result<Self> {
        let fc = registry.create_nnet(&config.blocks, vs.pp("nn.enc.fc"))?;
        let z_mean = candle_nn::linear(config.dim_hidden, config.dim_out, vs.pp("nn.enc.z.mean"))?;
        let z_lnvar =
            candle_nn::linear(config.dim_hidden, config.dim_out, vs.pp("nn.enc.z.lnvar"))?;

        Ok(Self {
            n_features: config.dim_in,
            n_latent: config.dim_out,
            fc,
            z_mean,
            z_lnvar,
        })
    }

    ///
    /// z = mu + sigma * eps
    /// where eps ~ N(0, 1)
    ///
    /// # Arguments
    /// * `z_mean` - mean of Gaussian distribution
    /// * `z_var` - variance of Gaussian distribution
    pub fn reparameterize(&self, z_mean: &Tensor, z_var: &Tensor, train: bool) -> Result<Tensor> {
        if train {
            let eps = Tensor::randn_like(z_mean, 0., 1.)?;
            z_mean + z_var.sqrt()?.mul(&eps)?
        } else {
            Ok(z_mean.clone())
        }
    }
}
