use crate::expfamily::family::Family;
use candle_util::candle_core::{Result, Tensor};

/// A natural-parameter (or expected-statistics) vector cut into the
/// named blocks of its family.
///
/// Shapes use `D` for the dimension and `K` for the number of
/// components sharing one precision.
#[derive(Debug, Clone)]
pub enum StatsBlocks {
    /// `ln_pi (D)`
    Dirichlet { ln_pi: Tensor },
    /// `ln_lambda (1)`, `lambda (1)`
    Gamma { ln_lambda: Tensor, lambda: Tensor },
    /// four blocks of `(D)`
    NormalGamma {
        prec: Tensor,
        prec_mean: Tensor,
        prec_mean_sq: Tensor,
        ln_prec: Tensor,
    },
    /// `prec (D)`, `prec_means (K, D)`, `prec_means_sq (K, D)`, `ln_prec (D)`
    JointNormalGamma {
        prec: Tensor,
        prec_means: Tensor,
        prec_means_sq: Tensor,
        ln_prec: Tensor,
    },
    /// `prec (1)`, `prec_mean (D)`, `prec_mean_sq (1)`, `ln_prec (1)`
    IsotropicNormalGamma {
        prec: Tensor,
        prec_mean: Tensor,
        prec_mean_sq: Tensor,
        ln_prec: Tensor,
    },
    /// `prec (D, D)`, `prec_mean (D)`, `prec_mean_sq (1)`, `ln_det_prec (1)`
    NormalWishart {
        prec: Tensor,
        prec_mean: Tensor,
        prec_mean_sq: Tensor,
        ln_det_prec: Tensor,
    },
    /// `prec (D, D)`, `prec_means (K, D)`, `prec_means_sq (K)`, `ln_det_prec (1)`
    JointNormalWishart {
        prec: Tensor,
        prec_means: Tensor,
        prec_means_sq: Tensor,
        ln_det_prec: Tensor,
    },
    /// `mean_outer (D, D)`, `mean (D)`
    NormalFullCovariance { mean_outer: Tensor, mean: Tensor },
    /// `mean_sq (1)`, `mean (D)`
    NormalIsotropicCovariance { mean_sq: Tensor, mean: Tensor },
    /// `mean_outer (D1, D1)`, `mean (D1, D2)`
    MatrixNormal { mean_outer: Tensor, mean: Tensor },
}

impl StatsBlocks {
    /// The blocks in their canonical order
    pub fn blocks(&self) -> Vec<&Tensor> {
        match self {
            StatsBlocks::Dirichlet { ln_pi } => vec![ln_pi],
            StatsBlocks::Gamma { ln_lambda, lambda } => vec![ln_lambda, lambda],
            StatsBlocks::NormalGamma {
                prec,
                prec_mean,
                prec_mean_sq,
                ln_prec,
            }
            | StatsBlocks::JointNormalGamma {
                prec,
                prec_means: prec_mean,
                prec_means_sq: prec_mean_sq,
                ln_prec,
            }
            | StatsBlocks::IsotropicNormalGamma {
                prec,
                prec_mean,
                prec_mean_sq,
                ln_prec,
            } => vec![prec, prec_mean, prec_mean_sq, ln_prec],
            StatsBlocks::NormalWishart {
                prec,
                prec_mean,
                prec_mean_sq,
                ln_det_prec,
            }
            | StatsBlocks::JointNormalWishart {
                prec,
                prec_means: prec_mean,
                prec_means_sq: prec_mean_sq,
                ln_det_prec,
            } => vec![prec, prec_mean, prec_mean_sq, ln_det_prec],
            StatsBlocks::NormalFullCovariance { mean_outer, mean }
            | StatsBlocks::MatrixNormal { mean_outer, mean } => vec![mean_outer, mean],
            StatsBlocks::NormalIsotropicCovariance { mean_sq, mean } => vec![mean_sq, mean],
        }
    }

    /// Flatten and concatenate the blocks back into one vector
    pub fn concat(&self) -> Result<Tensor> {
        let flat = self
            .blocks()
            .into_iter()
            .map(|x| x.flatten_all())
            .collect::<Result<Vec<_>>>()?;
        Tensor::cat(&flat, 0)
    }

    /// Cut a flat vector according to `family`
    pub fn split(family: &Family, vector: &Tensor) -> Result<Self> {
        let mut cursor = BlockCursor::new(vector);
        let ret = match *family {
            Family::Dirichlet { dim } => StatsBlocks::Dirichlet {
                ln_pi: cursor.take(&[dim])?,
            },
            Family::Gamma => StatsBlocks::Gamma {
                ln_lambda: cursor.take(&[1])?,
                lambda: cursor.take(&[1])?,
            },
            Family::NormalGamma { dim } => StatsBlocks::NormalGamma {
                prec: cursor.take(&[dim])?,
                prec_mean: cursor.take(&[dim])?,
                prec_mean_sq: cursor.take(&[dim])?,
                ln_prec: cursor.take(&[dim])?,
            },
            Family::JointNormalGamma { dim, ncomp } => StatsBlocks::JointNormalGamma {
                prec: cursor.take(&[dim])?,
                prec_means: cursor.take(&[ncomp, dim])?,
                prec_means_sq: cursor.take(&[ncomp, dim])?,
                ln_prec: cursor.take(&[dim])?,
            },
            Family::IsotropicNormalGamma { dim } => StatsBlocks::IsotropicNormalGamma {
                prec: cursor.take(&[1])?,
                prec_mean: cursor.take(&[dim])?,
                prec_mean_sq: cursor.take(&[1])?,
                ln_prec: cursor.take(&[1])?,
            },
            Family::NormalWishart { dim } => StatsBlocks::NormalWishart {
                prec: cursor.take(&[dim, dim])?,
                prec_mean: cursor.take(&[dim])?,
                prec_mean_sq: cursor.take(&[1])?,
                ln_det_prec: cursor.take(&[1])?,
            },
            Family::JointNormalWishart { dim, ncomp } => StatsBlocks::JointNormalWishart {
                prec: cursor.take(&[dim, dim])?,
                prec_means: cursor.take(&[ncomp, dim])?,
                prec_means_sq: cursor.take(&[ncomp])?,
                ln_det_prec: cursor.take(&[1])?,
            },
            Family::NormalFullCovariance { dim } => StatsBlocks::NormalFullCovariance {
                mean_outer: cursor.take(&[dim, dim])?,
                mean: cursor.take(&[dim])?,
            },
            Family::NormalIsotropicCovariance { dim } => StatsBlocks::NormalIsotropicCovariance {
                mean_sq: cursor.take(&[1])?,
                mean: cursor.take(&[dim])?,
            },
            Family::MatrixNormal { dim1, dim2 } => StatsBlocks::MatrixNormal {
                mean_outer: cursor.take(&[dim1, dim1])?,
                mean: cursor.take(&[dim1, dim2])?,
            },
        };
        cursor.finish()?;
        Ok(ret)
    }
}

/// Walk along a flat vector, cutting consecutive blocks
struct BlockCursor<'a> {
    vector: &'a Tensor,
    offset: usize,
}

impl<'a> BlockCursor<'a> {
    fn new(vector: &'a Tensor) -> Self {
        Self { vector, offset: 0 }
    }

    fn take(&mut self, shape: &[usize]) -> Result<Tensor> {
        let len: usize = shape.iter().product();
        let ret = self.vector.narrow(0, self.offset, len)?.reshape(shape)?;
        self.offset += len;
        Ok(ret)
    }

    fn finish(self) -> Result<()> {
        let ntot = self.vector.dim(0)?;
        if self.offset != ntot {
            candle_util::candle_core::bail!(
                "vector of length {} does not match the layout ({})",
                ntot,
                self.offset
            );
        }
        Ok(())
    }
}
