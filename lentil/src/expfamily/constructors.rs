use super::{ExpFamilyPrior, Family};
use crate::invalid_arg;
use crate::utils::matrix_inverse;
use candle_util::candle_core::{DType, Device, Tensor};

fn expect_vector(x: &Tensor, what: &str) -> anyhow::Result<usize> {
    match x.dims() {
        [d] => Ok(*d),
        dims => invalid_arg!("{} should be a vector, got shape {:?}", what, dims),
    }
}

fn expect_square(x: &Tensor, dim: usize, what: &str) -> anyhow::Result<()> {
    match x.dims() {
        [a, b] if *a == dim && *b == dim => Ok(()),
        dims => invalid_arg!(
            "{} should be a square {} x {} matrix, got shape {:?}",
            what,
            dim,
            dim,
            dims
        ),
    }
}

fn expect_positive(value: f64, what: &str) -> anyhow::Result<()> {
    if !(value > 0.) {
        invalid_arg!("{} should be positive, got {}", what, value);
    }
    Ok(())
}

/// A length-1 vector from a scalar or a length-1 tensor
fn as_singleton(x: &Tensor, what: &str) -> anyhow::Result<Tensor> {
    if x.elem_count() != 1 {
        invalid_arg!("{} should be a scalar, got shape {:?}", what, x.dims());
    }
    Ok(x.flatten_all()?)
}

fn flat_cat(blocks: &[Tensor]) -> anyhow::Result<Tensor> {
    let flat = blocks
        .iter()
        .map(|x| x.flatten_all())
        .collect::<candle_util::candle_core::Result<Vec<_>>>()?;
    Ok(Tensor::cat(&flat, 0)?)
}

/// Dirichlet with `η = concentrations - 1`
/// * `concentrations` - `(D)` positive pseudo-counts
pub fn dirichlet_prior(concentrations: &Tensor) -> anyhow::Result<ExpFamilyPrior> {
    let dim = expect_vector(concentrations, "concentrations")?;
    ExpFamilyPrior::new(Family::Dirichlet { dim }, (concentrations - 1.)?)
}

/// Gamma with `η = [shape - 1, -rate]`
pub fn gamma_prior(
    shape: f64,
    rate: f64,
    dtype: DType,
    device: &Device,
) -> anyhow::Result<ExpFamilyPrior> {
    expect_positive(shape, "shape")?;
    expect_positive(rate, "rate")?;
    let np = Tensor::new(&[shape - 1., -rate], device)?.to_dtype(dtype)?;
    ExpFamilyPrior::new(Family::Gamma, np)
}

/// Normal-Gamma with independent precisions per dimension
///
/// * `mean` - `(D)` prior mean
/// * `precision` - `(D)` expected precision
/// * `prior_counts` - strength of the prior
pub fn normal_gamma_prior(
    mean: &Tensor,
    precision: &Tensor,
    prior_counts: f64,
) -> anyhow::Result<ExpFamilyPrior> {
    expect_positive(prior_counts, "prior_counts")?;
    let dim = expect_vector(mean, "mean")?;
    if expect_vector(precision, "precision")? != dim {
        invalid_arg!("mean and precision disagree: {:?} vs {:?}", mean.dims(), precision.dims());
    }
    let kappa = prior_counts;
    let np = flat_cat(&[
        ((mean.sqr()? * kappa)? + 2. * kappa)?,
        (mean * kappa)?,
        (mean.ones_like()? * kappa)?,
        ((precision * (2. * kappa))? - 1.)?,
    ])?;
    ExpFamilyPrior::new(Family::NormalGamma { dim }, np)
}

/// Normal-Gamma over `K` means sharing one diagonal precision
///
/// * `means` - `(K, D)` prior means
/// * `precision` - `(D)` expected precision
/// * `prior_counts` - strength of the prior
pub fn joint_normal_gamma_prior(
    means: &Tensor,
    precision: &Tensor,
    prior_counts: f64,
) -> anyhow::Result<ExpFamilyPrior> {
    expect_positive(prior_counts, "prior_counts")?;
    let (ncomp, dim) = match means.dims() {
        [k, d] => (*k, *d),
        dims => invalid_arg!("means should be a K x D matrix, got shape {:?}", dims),
    };
    if expect_vector(precision, "precision")? != dim {
        invalid_arg!("means and precision disagree: {:?} vs {:?}", means.dims(), precision.dims());
    }
    let kappa = prior_counts;
    let np = flat_cat(&[
        ((means.sqr()?.sum(0)? * kappa)? + 2. * kappa)?,
        (means * kappa)?,
        (means.ones_like()? * kappa)?,
        ((precision * (2. * kappa))? - (2. - ncomp as f64))?,
    ])?;
    ExpFamilyPrior::new(Family::JointNormalGamma { dim, ncomp }, np)
}

/// Normal-Gamma with a single (isotropic) precision
///
/// * `mean` - `(D)` prior mean
/// * `precision` - scalar expected precision
/// * `prior_counts` - strength of the prior
pub fn isotropic_normal_gamma_prior(
    mean: &Tensor,
    precision: &Tensor,
    prior_counts: f64,
) -> anyhow::Result<ExpFamilyPrior> {
    expect_positive(prior_counts, "prior_counts")?;
    let dim = expect_vector(mean, "mean")?;
    let precision = as_singleton(precision, "precision")?;
    let kappa = prior_counts;
    let np = flat_cat(&[
        ((mean.sqr()?.sum_keepdim(0)? * kappa)? + 2. * kappa)?,
        (mean * kappa)?,
        (precision.ones_like()? * kappa)?,
        ((precision * (2. * kappa))? - (2. - dim as f64))?,
    ])?;
    ExpFamilyPrior::new(Family::IsotropicNormalGamma { dim }, np)
}

/// Normal-Wishart with a full precision matrix
///
/// * `mean` - `(D)` prior mean
/// * `cov` - `(D, D)` expected covariance
/// * `prior_counts` - strength of the prior
pub fn normal_wishart_prior(
    mean: &Tensor,
    cov: &Tensor,
    prior_counts: f64,
) -> anyhow::Result<ExpFamilyPrior> {
    expect_positive(prior_counts, "prior_counts")?;
    let dim = expect_vector(mean, "mean")?;
    expect_square(cov, dim, "cov")?;
    let kappa = prior_counts;
    let dof = kappa + dim as f64;
    let outer = mean.unsqueeze(1)?.matmul(&mean.unsqueeze(0)?)?;
    let scalar = Tensor::ones(1, mean.dtype(), mean.device())?;
    let np = flat_cat(&[
        ((outer * kappa)? + (cov * dof)?)?,
        (mean * kappa)?,
        (&scalar * kappa)?,
        (&scalar * (dof - dim as f64))?,
    ])?;
    ExpFamilyPrior::new(Family::NormalWishart { dim }, np)
}

/// Normal-Wishart over `K` means sharing one full precision matrix
///
/// * `means` - `(K, D)` prior means
/// * `cov` - `(D, D)` expected covariance
/// * `prior_counts` - strength of the prior
pub fn joint_normal_wishart_prior(
    means: &Tensor,
    cov: &Tensor,
    prior_counts: f64,
) -> anyhow::Result<ExpFamilyPrior> {
    expect_positive(prior_counts, "prior_counts")?;
    let (ncomp, dim) = match means.dims() {
        [k, d] => (*k, *d),
        dims => invalid_arg!("means should be a K x D matrix, got shape {:?}", dims),
    };
    expect_square(cov, dim, "cov")?;
    let kappa = prior_counts;
    let dof = kappa + dim as f64;
    let outer = means.t()?.matmul(means)?;
    let scalar = Tensor::ones(1, means.dtype(), means.device())?;
    let np = flat_cat(&[
        ((outer * kappa)? + (cov * dof)?)?,
        (means * kappa)?,
        (Tensor::ones(ncomp, means.dtype(), means.device())? * kappa)?,
        (&scalar * (dof - dim as f64 - 1. + ncomp as f64))?,
    ])?;
    ExpFamilyPrior::new(Family::JointNormalWishart { dim, ncomp }, np)
}

/// Normal over a mean vector with a known full covariance
///
/// * `mean` - `(D)`
/// * `cov` - `(D, D)`
pub fn normal_full_covariance_prior(mean: &Tensor, cov: &Tensor) -> anyhow::Result<ExpFamilyPrior> {
    let dim = expect_vector(mean, "mean")?;
    expect_square(cov, dim, "cov")?;
    let prec = matrix_inverse(cov)?;
    let np = flat_cat(&[
        (&prec * (-0.5))?,
        prec.matmul(&mean.unsqueeze(1)?)?.squeeze(1)?,
    ])?;
    ExpFamilyPrior::new(Family::NormalFullCovariance { dim }, np)
}

/// Normal over a mean vector with a known isotropic variance
///
/// * `mean` - `(D)`
/// * `variance` - scalar
pub fn normal_isotropic_covariance_prior(
    mean: &Tensor,
    variance: &Tensor,
) -> anyhow::Result<ExpFamilyPrior> {
    let dim = expect_vector(mean, "mean")?;
    let variance = as_singleton(variance, "variance")?;
    let prec = variance.recip()?;
    let np = flat_cat(&[(&prec * (-0.5))?, mean.broadcast_mul(&prec)?])?;
    ExpFamilyPrior::new(Family::NormalIsotropicCovariance { dim }, np)
}

/// Matrix normal over a `(D1, D2)` matrix whose columns share the
/// row covariance `cov`
///
/// * `mean` - `(D1, D2)`
/// * `cov` - `(D1, D1)`
pub fn matrix_normal_prior(mean: &Tensor, cov: &Tensor) -> anyhow::Result<ExpFamilyPrior> {
    let (dim1, dim2) = match mean.dims() {
        [a, b] => (*a, *b),
        dims => invalid_arg!("mean should be a matrix, got shape {:?}", dims),
    };
    expect_square(cov, dim1, "cov")?;
    let prec = matrix_inverse(cov)?;
    let np = flat_cat(&[(&prec * (-0.5))?, prec.matmul(mean)?])?;
    ExpFamilyPrior::new(Family::MatrixNormal { dim1, dim2 }, np)
}
