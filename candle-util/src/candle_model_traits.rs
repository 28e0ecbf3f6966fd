use candle_core::{Result, Tensor};

pub trait EncoderModuleT {
    /// An encoder that spits out the moments of a diagonal Gaussian
    ///
    /// # Arguments
    /// * `x_nd` - input data (n x d)
    /// * `train` - whether to use dropout/batchnorm or not
    ///
    /// # Returns `(mean_nk, var_nk)`
    /// * `mean_nk` - latent means (n x k)
    /// * `var_nk` - latent variances (n x k), strictly positive
    fn forward_t(&self, x_nd: &Tensor, train: bool) -> Result<(Tensor, Tensor)>;

    fn dim_obs(&self) -> usize;

    fn dim_latent(&self) -> usize;
}

pub trait DecoderModuleT {
    /// A decoder that spits out the reconstruction mean
    fn forward(&self, z_nk: &Tensor) -> Result<Tensor>;

    /// A decoder that spits out the reconstruction mean and variance
    /// * `z_nk` - latent states
    fn forward_with_variance(&self, z_nk: &Tensor) -> Result<(Tensor, Tensor)>;

    fn dim_obs(&self) -> usize;

    fn dim_latent(&self) -> usize;
}
