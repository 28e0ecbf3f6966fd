use candle_core::{bail, DType, Device, Result, Tensor};
use matrix_util::traits::SymMatOps;
use nalgebra::DMatrix;

/// Default eigenvalue floor for `make_symposdef`
pub const DEFAULT_EVAL_THRESHOLD: f64 = 1e-3;

/// Stable `log(sum(exp(x)))` along `dim`; the dimension is removed
///
/// * `x` - any tensor
/// * `dim` - dimension to sum over
pub fn logsumexp(x: &Tensor, dim: usize) -> Result<Tensor> {
    let xmax = x.max_keepdim(dim)?.detach();
    x.broadcast_sub(&xmax)?
        .exp()?
        .sum_keepdim(dim)?
        .log()?
        .broadcast_add(&xmax)?
        .squeeze(dim)
}

/// `(X + X') / 2` for a 2-D tensor
pub fn symmetrize(x: &Tensor) -> Result<Tensor> {
    (x + x.t()?)? * 0.5
}

/// Nearest symmetric positive definite matrix, with every eigenvalue
/// at least `eval_threshold`. Not differentiable.
pub fn make_symposdef(x: &Tensor, eval_threshold: f64) -> Result<Tensor> {
    let mat = tensor_to_dmatrix(x)?;
    let ret = mat
        .make_symposdef(eval_threshold)
        .map_err(|e| candle_core::Error::Msg(e.to_string()))?;
    dmatrix_to_tensor(&ret, x.dtype(), x.device())
}

/// One-hot encoding: `n x max_label` with a single one per row
///
/// * `labels` - indices, each `< max_label`
/// * `max_label` - number of columns
pub fn onehot(labels: &[usize], max_label: usize, dtype: DType, device: &Device) -> Result<Tensor> {
    let mut data = vec![0_f32; labels.len() * max_label];
    for (i, &k) in labels.iter().enumerate() {
        if k >= max_label {
            bail!("label {} out of range [0, {})", k, max_label);
        }
        data[i * max_label + k] = 1.;
    }
    Tensor::from_vec(data, (labels.len(), max_label), device)?.to_dtype(dtype)
}

/// Copy a 2-D tensor into a `DMatrix<f64>`
pub fn tensor_to_dmatrix(x: &Tensor) -> Result<DMatrix<f64>> {
    let (nrows, ncols) = x.dims2()?;
    let data = x
        .to_dtype(DType::F64)?
        .flatten_all()?
        .to_vec1::<f64>()?;
    Ok(DMatrix::from_row_slice(nrows, ncols, &data))
}

/// Copy a `DMatrix<f64>` into a 2-D tensor
pub fn dmatrix_to_tensor(mat: &DMatrix<f64>, dtype: DType, device: &Device) -> Result<Tensor> {
    let data = mat.transpose().as_slice().to_vec();
    Tensor::from_vec(data, (mat.nrows(), mat.ncols()), device)?.to_dtype(dtype)
}

/// A scalar tensor as `f64`, regardless of its dtype
pub fn to_f64_scalar(x: &Tensor) -> Result<f64> {
    x.to_dtype(DType::F64)?.to_scalar::<f64>()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn logsumexp_is_stable() -> Result<()> {
        let x = Tensor::new(&[[1000_f64, 1000.], [-1.0, 2.0]], &Device::Cpu)?;
        let lse = logsumexp(&x, 1)?.to_vec1::<f64>()?;
        approx::assert_abs_diff_eq!(lse[0], 1000. + 2_f64.ln(), epsilon = 1e-10);
        approx::assert_abs_diff_eq!(
            lse[1],
            ((-1_f64).exp() + 2_f64.exp()).ln(),
            epsilon = 1e-10
        );

        let lse0 = logsumexp(&x, 0)?;
        assert_eq!(lse0.dims(), &[2]);
        Ok(())
    }

    #[test]
    fn onehot_rows() -> Result<()> {
        let x = onehot(&[2, 0, 1], 3, DType::F32, &Device::Cpu)?;
        assert_eq!(
            x.to_vec2::<f32>()?,
            vec![vec![0., 0., 1.], vec![1., 0., 0.], vec![0., 1., 0.]]
        );
        assert!(onehot(&[3], 3, DType::F32, &Device::Cpu).is_err());
        Ok(())
    }

    #[test]
    fn make_symposdef_lifts_eigenvalues() -> Result<()> {
        let x = Tensor::new(&[[1_f32, 2.], [0., 1.]], &Device::Cpu)?;
        let y = make_symposdef(&x, DEFAULT_EVAL_THRESHOLD)?;
        assert_eq!(y.dtype(), DType::F32);
        let mat = tensor_to_dmatrix(&y)?;
        let eig = mat.clone().symmetric_eigen();
        for &lambda in eig.eigenvalues.iter() {
            assert!(lambda >= DEFAULT_EVAL_THRESHOLD - 1e-6);
        }
        // eigenvalues of the symmetric part are 2 and 0
        approx::assert_abs_diff_eq!(eig.eigenvalues.sum(), 2.0 + 1e-3, epsilon = 1e-5);

        // with eigenvectors (1, 1) and (1, -1), which must survive the lift
        let h = std::f64::consts::FRAC_1_SQRT_2;
        for (v, lambda) in [([h, h], 2.0), ([h, -h], DEFAULT_EVAL_THRESHOLD)] {
            let v = nalgebra::DVector::from_row_slice(&v);
            let mv = &mat * &v;
            for i in 0..2 {
                approx::assert_abs_diff_eq!(mv[i], lambda * v[i], epsilon = 1e-5);
            }
        }
        Ok(())
    }
}
