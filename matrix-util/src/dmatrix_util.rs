use crate::traits::SymMatOps;
pub use nalgebra::{DMatrix, DVector};

impl SymMatOps for DMatrix<f64> {
    type Mat = Self;
    type Scalar = f64;

    fn symmetrize(&self) -> Self::Mat {
        (self + self.transpose()) * 0.5
    }

    fn make_symposdef(&self, eval_threshold: f64) -> anyhow::Result<Self::Mat> {
        if !self.is_square() {
            return Err(anyhow::anyhow!(
                "expected a square matrix, got {} x {}",
                self.nrows(),
                self.ncols()
            ));
        }

        let mut eig = self.symmetrize().symmetric_eigen();
        eig.eigenvalues
            .iter_mut()
            .for_each(|x| *x = x.max(eval_threshold));

        // recomposition is only symmetric up to round-off
        Ok(eig.recompose().symmetrize())
    }

    fn logdet_spd(&self) -> anyhow::Result<f64> {
        let chol = self
            .clone()
            .cholesky()
            .ok_or(anyhow::anyhow!("matrix is not positive definite"))?;
        let l = chol.l_dirty();
        Ok(2.0 * l.diagonal().iter().map(|x| x.ln()).sum::<f64>())
    }

    fn inverse_checked(&self) -> anyhow::Result<Self::Mat> {
        self.clone()
            .try_inverse()
            .ok_or(anyhow::anyhow!("matrix is singular"))
    }
}
