use candle_util::candle_core::{DType, Device, Tensor};
use clap::ValueEnum;
use matrix_util::common_io::{mkdir, write_types};
use matrix_util::traits::IoOps;
use nalgebra::DMatrix;

#[derive(ValueEnum, Clone, Debug, PartialEq)]
#[clap(rename_all = "lowercase")]
pub enum ComputeDevice {
    Cpu,
    Cuda,
    Metal,
}

impl ComputeDevice {
    pub fn to_device(&self, device_no: usize) -> anyhow::Result<Device> {
        Ok(match self {
            ComputeDevice::Metal => Device::new_metal(device_no)?,
            ComputeDevice::Cuda => Device::new_cuda(device_no)?,
            ComputeDevice::Cpu => Device::Cpu,
        })
    }
}

/// `(D)` column means and variances of `x`
pub fn column_moments(
    x: &DMatrix<f64>,
    dtype: DType,
    device: &Device,
) -> anyhow::Result<(Tensor, Tensor)> {
    let mean = x.row_mean().iter().cloned().collect::<Vec<_>>();
    let var = x
        .row_variance()
        .iter()
        .map(|v| v.max(1e-4))
        .collect::<Vec<_>>();
    let dd = mean.len();
    Ok((
        Tensor::from_vec(mean, dd, device)?.to_dtype(dtype)?,
        Tensor::from_vec(var, dd, device)?.to_dtype(dtype)?,
    ))
}

pub fn read_data(file: &str) -> anyhow::Result<DMatrix<f64>> {
    DMatrix::<f64>::from_tsv(file, None)
}

/// Write a 2-D tensor as `{out}.{name}.tsv`
pub fn write_tensor(x: &Tensor, out: &str, name: &str) -> anyhow::Result<()> {
    let file = format!("{}.{}.tsv", out, name);
    mkdir(&file)?;
    candle_util::candle_numeric::tensor_to_dmatrix(x)?.to_tsv(&file)
}

pub fn write_trace(trace: &[f32], out: &str) -> anyhow::Result<()> {
    let file = format!("{}.elbo.tsv", out);
    mkdir(&file)?;
    write_types(trace, &file)
}
