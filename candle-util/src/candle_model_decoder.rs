use crate::candle_aux_layers::NeuralNetwork;
use crate::candle_model_encoder::{GaussianModuleConfig, MAX_LNVAR, MIN_LNVAR};
use crate::candle_model_traits::*;
use crate::candle_nnet_registry::ElementRegistry;
use candle_core::{bail, Result, Tensor};
use candle_nn::{Linear, Module, VarBuilder};

/// Map latent states back to the observation space. The variance
/// head only exists if the decoder models the observation noise.
pub struct GaussianDecoder {
    n_features: usize,
    n_latent: usize,
    fc: NeuralNetwork,
    x_mean: Linear,
    x_lnvar: Option<Linear>,
}

impl DecoderModuleT for GaussianDecoder {
    fn forward(&self, z_nk: &Tensor) -> Result<Tensor> {
        let h_nl = self.fc.forward(z_nk)?;
        self.x_mean.forward(&h_nl)
    }

    fn forward_with_variance(&self, z_nk: &Tensor) -> Result<(Tensor, Tensor)> {
        let x_lnvar = match self.x_lnvar.as_ref() {
            Some(x) => x,
            None => bail!("this decoder was built without a variance head"),
        };
        let h_nl = self.fc.forward(z_nk)?;
        let mean_nd = self.x_mean.forward(&h_nl)?;
        let var_nd = x_lnvar.forward(&h_nl)?.clamp(MIN_LNVAR, MAX_LNVAR)?.exp()?;
        Ok((mean_nd, var_nd))
    }

    fn dim_obs(&self) -> usize {
        self.n_features
    }

    fn dim_latent(&self) -> usize {
        self.n_latent
    }
}

impl GaussianDecoder {
    /// Variables:
    ///
    /// * `nn.dec.fc.block.{i}.{j}...`
    /// * `nn.dec.x.mean.weight`
    /// * `nn.dec.x.lnvar.weight` (only `with_variance`)
    ///
    /// Here `config.dim_in` is the latent dimension and
    /// `config.dim_out` the data dimension.
    pub fn new(
        config: &GaussianModuleConfig,
        with_variance: bool,
        registry: &ElementRegistry,
        vs: VarBuilder,
    ) -> Result<Self> {
        let fc = registry.create_nnet(&config.blocks, vs.pp("nn.dec.fc"))?;
        let x_mean = candle_nn::linear(config.dim_hidden, config.dim_out, vs.pp("nn.dec.x.mean"))?;
        let x_lnvar = if with_variance {
            Some(candle_nn::linear(
                config.dim_hidden,
                config.dim_out,
                vs.pp("nn.dec.x.lnvar"),
            )?)
        } else {
            None
        };

        Ok(Self {
            n_features: config.dim_out,
            n_latent: config.dim_in,
            fc,
            x_mean,
            x_lnvar,
        })
    }

    pub fn has_variance(&self) -> bool {
        self.x_lnvar.is_some()
    }
}
