use candle_util::candle_core::{Result, Tensor};
use candle_util::candle_numeric::{dmatrix_to_tensor, tensor_to_dmatrix};
use matrix_util::traits::SymMatOps;

/// Reparameterized draws `means + sqrt(variances) * eps`
///
/// * `means` - `(N, K)`
/// * `variances` - `(N, K)`
/// * `nsamples` - number of draws per row
///
/// Returns `(nsamples, N, K)`
pub fn sample_from_normals(means: &Tensor, variances: &Tensor, nsamples: usize) -> Result<Tensor> {
    let (nn, kk) = means.dims2()?;
    let shape = (nsamples, nn, kk);
    let eps = Tensor::randn(0., 1., shape, means.device())?.to_dtype(means.dtype())?;
    eps.broadcast_mul(&variances.sqrt()?.unsqueeze(0)?)?
        .broadcast_add(&means.unsqueeze(0)?)
}

/// Row-wise outer products `(N, D) -> (N, D * D)`
pub(crate) fn outer_rows(x_nd: &Tensor) -> Result<Tensor> {
    let (nn, dd) = x_nd.dims2()?;
    x_nd.unsqueeze(2)?
        .matmul(&x_nd.unsqueeze(1)?)?
        .reshape((nn, dd * dd))
}

/// Inverse of a square matrix through `nalgebra`, not differentiable
pub(crate) fn matrix_inverse(x: &Tensor) -> anyhow::Result<Tensor> {
    let inv = tensor_to_dmatrix(x)?.inverse_checked()?;
    Ok(dmatrix_to_tensor(&inv, x.dtype(), x.device())?)
}
