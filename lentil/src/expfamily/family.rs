use crate::expfamily::stats::StatsBlocks;
use candle_util::candle_core::{Result, Tensor};
use candle_util::candle_special_ops::{inverse, lgamma, logdet_spd};

const LN_2: f64 = std::f64::consts::LN_2;

/// Conjugate prior/posterior families with their dimensions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    Dirichlet { dim: usize },
    Gamma,
    NormalGamma { dim: usize },
    JointNormalGamma { dim: usize, ncomp: usize },
    IsotropicNormalGamma { dim: usize },
    NormalWishart { dim: usize },
    JointNormalWishart { dim: usize, ncomp: usize },
    NormalFullCovariance { dim: usize },
    NormalIsotropicCovariance { dim: usize },
    MatrixNormal { dim1: usize, dim2: usize },
}

impl std::fmt::Display for Family {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl Family {
    /// Length of the flat natural-parameter vector
    pub fn num_params(&self) -> usize {
        match *self {
            Family::Dirichlet { dim } => dim,
            Family::Gamma => 2,
            Family::NormalGamma { dim } => 4 * dim,
            Family::JointNormalGamma { dim, ncomp } => 2 * dim * (ncomp + 1),
            Family::IsotropicNormalGamma { dim } => dim + 3,
            Family::NormalWishart { dim } => dim * dim + dim + 2,
            Family::JointNormalWishart { dim, ncomp } => dim * dim + ncomp * dim + ncomp + 1,
            Family::NormalFullCovariance { dim } => dim * dim + dim,
            Family::NormalIsotropicCovariance { dim } => dim + 1,
            Family::MatrixNormal { dim1, dim2 } => dim1 * dim1 + dim1 * dim2,
        }
    }

    pub fn split(&self, vector: &Tensor) -> Result<StatsBlocks> {
        StatsBlocks::split(self, vector)
    }

    /// Log-normalizer `A(η)` as a scalar tensor, up to an additive
    /// constant. Differentiable in `natural_params`; the special
    /// functions need a CPU tensor.
    pub fn log_norm(&self, natural_params: &Tensor) -> Result<Tensor> {
        match self.split(natural_params)? {
            StatsBlocks::Dirichlet { ln_pi } => {
                let alpha = (ln_pi + 1.)?;
                lgamma(&alpha)?.sum_all()? - lgamma(&alpha.sum_all()?)?
            }

            StatsBlocks::Gamma { ln_lambda, lambda } => {
                let shape = (ln_lambda + 1.)?;
                let rate = lambda.neg()?;
                (lgamma(&shape)? - shape.mul(&rate.log()?)?)?.sum_all()
            }

            StatsBlocks::NormalGamma {
                prec,
                prec_mean,
                prec_mean_sq,
                ln_prec,
            } => {
                let a = ((ln_prec + 1.)? * 0.5)?;
                let b = ((prec - prec_mean.sqr()?.div(&prec_mean_sq)?)? * 0.5)?;
                let ret = ((lgamma(&a)? - (prec_mean_sq.log()? * 0.5)?)? - a.mul(&b.log()?)?)?;
                ret.sum_all()
            }

            StatsBlocks::JointNormalGamma {
                prec,
                prec_means,
                prec_means_sq,
                ln_prec,
            } => {
                let ncomp = prec_means.dim(0)? as f64;
                let a = ((ln_prec + (2. - ncomp))? * 0.5)?;
                let quad = prec_means.sqr()?.div(&prec_means_sq)?.sum(0)?;
                let b = ((prec - quad)? * 0.5)?;
                let gamma_part = (lgamma(&a)? - a.mul(&b.log()?)?)?.sum_all()?;
                gamma_part - (prec_means_sq.log()?.sum_all()? * 0.5)?
            }

            StatsBlocks::IsotropicNormalGamma {
                prec,
                prec_mean,
                prec_mean_sq,
                ln_prec,
            } => {
                let dim = prec_mean.dim(0)? as f64;
                let a = ((ln_prec + (2. - dim))? * 0.5)?;
                let quad = prec_mean.sqr()?.sum_keepdim(0)?.div(&prec_mean_sq)?;
                let b = ((prec - quad)? * 0.5)?;
                let ret = ((lgamma(&a)? - a.mul(&b.log()?)?)?
                    - (prec_mean_sq.log()? * (0.5 * dim))?)?;
                ret.sum_all()
            }

            StatsBlocks::NormalWishart {
                prec,
                prec_mean,
                prec_mean_sq,
                ln_det_prec,
            } => {
                let dim = prec_mean.dim(0)?;
                let outer = prec_mean
                    .unsqueeze(1)?
                    .matmul(&prec_mean.unsqueeze(0)?)?
                    .broadcast_div(&prec_mean_sq)?;
                let dof = (ln_det_prec + dim as f64)?;
                let ln_norm_dof = ((&dof * (0.5 * dim as f64 * LN_2))?
                    - (prec_mean_sq.log()? * (0.5 * dim as f64))?)?;
                wishart_log_norm(&(prec - outer)?, &dof, dim)? + ln_norm_dof.sum_all()?
            }

            StatsBlocks::JointNormalWishart {
                prec,
                prec_means,
                prec_means_sq,
                ln_det_prec,
            } => {
                let (ncomp, dim) = prec_means.dims2()?;
                let quad = prec_means
                    .broadcast_div(&prec_means_sq.unsqueeze(1)?)?
                    .t()?
                    .matmul(&prec_means)?;
                let dof = (ln_det_prec + (dim as f64 + 1. - ncomp as f64))?;
                let ln_2_part = (&dof * (0.5 * dim as f64 * LN_2))?.sum_all()?;
                let kappa_part = (prec_means_sq.log()?.sum_all()? * (0.5 * dim as f64))?;
                (wishart_log_norm(&(prec - quad)?, &dof, dim)? + ln_2_part)? - kappa_part
            }

            StatsBlocks::NormalFullCovariance { mean_outer, mean } => {
                let inv = inverse(&mean_outer)?;
                let quad = mean
                    .unsqueeze(0)?
                    .matmul(&inv)?
                    .matmul(&mean.unsqueeze(1)?)?
                    .sum_all()?;
                let logdet = logdet_spd(&(mean_outer * (-2.))?)?;
                (logdet * (-0.5))? - (quad * 0.25)?
            }

            StatsBlocks::NormalIsotropicCovariance { mean_sq, mean } => {
                let dim = mean.dim(0)? as f64;
                let quad = mean.sqr()?.sum_keepdim(0)?.div(&mean_sq)?;
                let ret = (((mean_sq * (-2.))?.log()? * (-0.5 * dim))? - (quad * 0.25)?)?;
                ret.sum_all()
            }

            StatsBlocks::MatrixNormal { mean_outer, mean } => {
                let dim2 = mean.dim(1)? as f64;
                let inv = inverse(&mean_outer)?;
                let quad = mean.mul(&inv.matmul(&mean)?)?.sum_all()?;
                let logdet = logdet_spd(&(mean_outer * (-2.))?)?;
                (logdet * (-0.5 * dim2))? - (quad * 0.25)?
            }
        }
    }
}

/// `-ν/2 log|W^{-1}| + Σ_i lgamma((ν + 1 - i)/2)` for `i = 1..D`
fn wishart_log_norm(inv_scale: &Tensor, dof: &Tensor, dim: usize) -> Result<Tensor> {
    let logdet = logdet_spd(inv_scale)?;
    let offsets = (0..dim).map(|i| -0.5 * i as f64).collect::<Vec<_>>();
    let offsets = Tensor::from_vec(offsets, dim, dof.device())?.to_dtype(dof.dtype())?;
    let half_dof = (dof * 0.5)?;
    let mvlgamma = lgamma(&offsets.broadcast_add(&half_dof)?)?.sum_all()?;
    let det_part = half_dof.sum_all()?.mul(&logdet)?.neg()?;
    det_part + mvlgamma
}
