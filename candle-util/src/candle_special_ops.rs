//! Differentiable special functions that `candle` does not ship.
//!
//! Every op runs its forward pass on the CPU in `f64` and returns a
//! tensor of the input dtype. Apply them to CPU tensors; log-normalizers
//! are evaluated on the CPU anyway.

use candle_core::{bail, CpuStorage, CustomOp1, Layout, Result, Shape, Tensor};
use crate::candle_numeric::symmetrize;
use matrix_util::traits::SymMatOps;
use nalgebra::DMatrix;
use special::Gamma;

/// Copy the (contiguous) storage into `f64`
fn storage_to_f64(storage: &CpuStorage, layout: &Layout, name: &str) -> Result<Vec<f64>> {
    let (lb, ub) = match layout.contiguous_offsets() {
        Some(x) => x,
        None => bail!("{name}: input must be contiguous"),
    };
    let ret = match storage {
        CpuStorage::F32(v) => v[lb..ub].iter().map(|&x| x as f64).collect(),
        CpuStorage::F64(v) => v[lb..ub].to_vec(),
        _ => bail!("{name}: only f32 and f64 are supported"),
    };
    Ok(ret)
}

/// Put `f64` values back in the same dtype as `storage`
fn f64_to_storage(values: Vec<f64>, like: &CpuStorage) -> CpuStorage {
    match like {
        CpuStorage::F32(_) => CpuStorage::F32(values.into_iter().map(|x| x as f32).collect()),
        _ => CpuStorage::F64(values),
    }
}

fn square_matrix(storage: &CpuStorage, layout: &Layout, name: &str) -> Result<DMatrix<f64>> {
    let dims = layout.dims();
    if dims.len() != 2 || dims[0] != dims[1] {
        bail!("{name}: expected a square matrix, got {:?}", dims);
    }
    let values = storage_to_f64(storage, layout, name)?;
    Ok(DMatrix::from_row_slice(dims[0], dims[1], &values))
}

fn row_major(mat: &DMatrix<f64>) -> Vec<f64> {
    mat.transpose().as_slice().to_vec()
}

/// element-wise `ln Γ(x)`
pub struct LnGamma;

impl CustomOp1 for LnGamma {
    fn name(&self) -> &'static str {
        "lgamma"
    }

    fn cpu_fwd(&self, storage: &CpuStorage, layout: &Layout) -> Result<(CpuStorage, Shape)> {
        let values = storage_to_f64(storage, layout, self.name())?
            .into_iter()
            .map(|x| x.ln_gamma().0)
            .collect();
        Ok((f64_to_storage(values, storage), layout.shape().clone()))
    }

    fn bwd(&self, arg: &Tensor, _res: &Tensor, grad_res: &Tensor) -> Result<Option<Tensor>> {
        let psi = arg.contiguous()?.apply_op1_no_bwd(&Digamma)?;
        Ok(Some(grad_res.mul(&psi)?))
    }
}

/// element-wise `ψ(x) = d/dx ln Γ(x)`
pub struct Digamma;

impl CustomOp1 for Digamma {
    fn name(&self) -> &'static str {
        "digamma"
    }

    fn cpu_fwd(&self, storage: &CpuStorage, layout: &Layout) -> Result<(CpuStorage, Shape)> {
        let values = storage_to_f64(storage, layout, self.name())?
            .into_iter()
            .map(|x| x.digamma())
            .collect();
        Ok((f64_to_storage(values, storage), layout.shape().clone()))
    }
}

/// `log|X|` of a symmetric positive definite matrix
///
/// The gradient is symmetrized, `(X^{-1} + X^{-T}) / 2`, so that
/// updates along it stay in the space of symmetric matrices.
pub struct LogDetSpd;

impl CustomOp1 for LogDetSpd {
    fn name(&self) -> &'static str {
        "logdet-spd"
    }

    fn cpu_fwd(&self, storage: &CpuStorage, layout: &Layout) -> Result<(CpuStorage, Shape)> {
        let mat = square_matrix(storage, layout, self.name())?;
        let logdet = mat
            .logdet_spd()
            .map_err(|e| candle_core::Error::Msg(format!("{}: {}", self.name(), e)))?;
        Ok((f64_to_storage(vec![logdet], storage), Shape::from(())))
    }

    fn bwd(&self, arg: &Tensor, _res: &Tensor, grad_res: &Tensor) -> Result<Option<Tensor>> {
        let inv = arg.contiguous()?.apply_op1_no_bwd(&Inverse)?;
        let sym = symmetrize(&inv)?;
        Ok(Some(sym.broadcast_mul(grad_res)?))
    }
}

/// `X^{-1}` of a non-singular square matrix
pub struct Inverse;

impl CustomOp1 for Inverse {
    fn name(&self) -> &'static str {
        "inverse"
    }

    fn cpu_fwd(&self, storage: &CpuStorage, layout: &Layout) -> Result<(CpuStorage, Shape)> {
        let mat = square_matrix(storage, layout, self.name())?;
        let inv = mat
            .inverse_checked()
            .map_err(|e| candle_core::Error::Msg(format!("{}: {}", self.name(), e)))?;
        Ok((f64_to_storage(row_major(&inv), storage), layout.shape().clone()))
    }

    /// d/dX of `<G, X^{-1}>` is `-X^{-T} G X^{-T}`
    fn bwd(&self, _arg: &Tensor, res: &Tensor, grad_res: &Tensor) -> Result<Option<Tensor>> {
        let res_t = res.t()?;
        Ok(Some(res_t.matmul(grad_res)?.matmul(&res_t)?.neg()?))
    }
}

/// element-wise `ln Γ(x)`, differentiable
pub fn lgamma(x: &Tensor) -> Result<Tensor> {
    x.contiguous()?.apply_op1(LnGamma)
}

/// element-wise digamma (no gradient)
pub fn digamma(x: &Tensor) -> Result<Tensor> {
    x.contiguous()?.apply_op1_no_bwd(&Digamma)
}

/// `log|X|` for a symmetric positive definite `X`, differentiable
pub fn logdet_spd(x: &Tensor) -> Result<Tensor> {
    x.contiguous()?.apply_op1(LogDetSpd)
}

/// matrix inverse, differentiable
pub fn inverse(x: &Tensor) -> Result<Tensor> {
    x.contiguous()?.apply_op1(Inverse)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{Device, Var};

    #[test]
    fn lgamma_forward_backward() -> Result<()> {
        let x = Var::new(&[0.5_f64, 1.0, 2.0, 4.5], &Device::Cpu)?;
        let y = lgamma(x.as_tensor())?;
        let y_vec = y.to_vec1::<f64>()?;
        approx::assert_abs_diff_eq!(y_vec[0], std::f64::consts::PI.sqrt().ln(), epsilon = 1e-10);
        approx::assert_abs_diff_eq!(y_vec[1], 0.0, epsilon = 1e-10);
        approx::assert_abs_diff_eq!(y_vec[2], 0.0, epsilon = 1e-10);

        let grads = y.sum_all()?.backward()?;
        let dx = grads.get(x.as_tensor()).unwrap().to_vec1::<f64>()?;
        // ψ(1) = -γ
        approx::assert_abs_diff_eq!(dx[1], -0.5772156649015329, epsilon = 1e-8);
        approx::assert_abs_diff_eq!(dx[2], 1.0 - 0.5772156649015329, epsilon = 1e-8);
        Ok(())
    }

    #[test]
    fn logdet_gradient_is_symmetric_inverse() -> Result<()> {
        let data = [2.0_f64, 0.3, 0.1, 0.3, 1.5, 0.2, 0.1, 0.2, 1.0];
        let x = Var::from_tensor(&Tensor::from_slice(&data, (3, 3), &Device::Cpu)?)?;
        let ld = logdet_spd(x.as_tensor())?;

        let mat = DMatrix::from_row_slice(3, 3, &data);
        approx::assert_abs_diff_eq!(
            ld.to_scalar::<f64>()?,
            mat.determinant().ln(),
            epsilon = 1e-10
        );

        let grads = ld.backward()?;
        let dx = grads.get(x.as_tensor()).unwrap().to_vec2::<f64>()?;
        let inv = mat.try_inverse().unwrap();
        for i in 0..3 {
            for j in 0..3 {
                approx::assert_abs_diff_eq!(dx[i][j], inv[(i, j)], epsilon = 1e-10);
            }
        }
        Ok(())
    }

    #[test]
    fn inverse_gradient_matches_finite_difference() -> Result<()> {
        let data = [2.0_f64, 0.5, -0.3, 1.0];
        let x = Var::from_tensor(&Tensor::from_slice(&data, (2, 2), &Device::Cpu)?)?;
        let w = Tensor::from_slice(&[1.0_f64, -2.0, 0.5, 3.0], (2, 2), &Device::Cpu)?;

        let objective = |x: &Tensor| -> Result<Tensor> { inverse(x)?.mul(&w)?.sum_all() };

        let grads = objective(x.as_tensor())?.backward()?;
        let dx = grads.get(x.as_tensor()).unwrap().flatten_all()?.to_vec1::<f64>()?;

        let eps = 1e-6;
        for k in 0..4 {
            let mut plus = data;
            let mut minus = data;
            plus[k] += eps;
            minus[k] -= eps;
            let fp = objective(&Tensor::from_slice(&plus, (2, 2), &Device::Cpu)?)?
                .to_scalar::<f64>()?;
            let fm = objective(&Tensor::from_slice(&minus, (2, 2), &Device::Cpu)?)?
                .to_scalar::<f64>()?;
            approx::assert_abs_diff_eq!(dx[k], (fp - fm) / (2. * eps), epsilon = 1e-6);
        }
        Ok(())
    }

    #[test]
    fn f32_inputs_stay_f32() -> Result<()> {
        let x = Tensor::new(&[1.5_f32, 3.0], &Device::Cpu)?;
        let y = lgamma(&x)?;
        assert_eq!(y.dtype(), candle_core::DType::F32);
        let psi = digamma(&x)?.to_vec1::<f32>()?;
        approx::assert_abs_diff_eq!(psi[1], 0.9227843, epsilon = 1e-5);
        Ok(())
    }
}
