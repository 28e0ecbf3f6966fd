use candle_core::{Result, Tensor, D};

const LN_2PI: f64 = 1.8378770664093453;

/// Gaussian log-density with a diagonal covariance, summed over the
/// last dimension
///
/// llik(i) = -0.5 * sum_w [ (x(i,w) - mu(i,w))^2 / var(i,w) + log var(i,w) ]
///           - 0.5 * D * log(2 pi)
///
/// * `x_nd` - observed data; broadcast against `mean_nd`
/// * `mean_nd` - mean (same shape as `var_nd`)
/// * `var_nd` - variance
///
pub fn gaussian_log_likelihood(x_nd: &Tensor, mean_nd: &Tensor, var_nd: &Tensor) -> Result<Tensor> {
    let dim = mean_nd.dim(D::Minus1)? as f64;
    let dist = x_nd.broadcast_sub(mean_nd)?.sqr()?.div(var_nd)?;
    let llik = ((dist + var_nd.log()?)?.sum(D::Minus1)? * (-0.5))?;
    llik - 0.5 * dim * LN_2PI
}

/// Natural parameters of a diagonal Gaussian paired with the
/// statistics `[z^2, z, 1, 1]`; the last block carries the
/// normalizer.
///
/// `[-1/(2 var), mean/var, -mean^2/(2 var), -0.5 log var]`
pub fn diag_normal_natural_params(mean: &Tensor, var: &Tensor) -> Result<Tensor> {
    let prec = var.recip()?;
    Tensor::cat(
        &[
            (&prec * (-0.5))?,
            mean.mul(&prec)?,
            (mean.sqr()?.mul(&prec)? * (-0.5))?,
            (var.log()? * (-0.5))?,
        ],
        D::Minus1,
    )
}

/// Expected statistics `E[z^2], E[z], 1, 1` of a diagonal Gaussian
pub fn diag_normal_expected_stats(mean: &Tensor, var: &Tensor) -> Result<Tensor> {
    let ones = mean.ones_like()?;
    Tensor::cat(&[(mean.sqr()? + var)?, mean.clone(), ones.clone(), ones], D::Minus1)
}
