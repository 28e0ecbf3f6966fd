use crate::candle_numeric::dmatrix_to_tensor;
use candle_core::{DType, Device, Tensor};
use matrix_util::utils::{generate_minibatch_intervals, shuffled_indices};
use nalgebra::DMatrix;

/// `DataLoader` for minibatch learning
pub trait DataLoader {
    fn minibatch_data(&self, batch_idx: usize, target_device: &Device) -> anyhow::Result<Tensor>;

    fn num_minibatch(&self) -> usize;

    /// number of rows in total
    fn num_data(&self) -> usize;

    fn shuffle_minibatch(&mut self, batch_size: usize) -> anyhow::Result<()>;
}

///
/// A simple data loader for an in-memory 2d matrix.  Each row will
/// be considered as a feature vector. The number of samples is the
/// number of rows.
///
pub struct InMemoryData {
    input_data: Tensor,
    num_rows: usize,
    shuffled_input_data: Option<Vec<Tensor>>,
    seed: Option<u64>,
    num_shuffles: u64,
}

impl InMemoryData {
    /// * `data` - `n x d` tensor
    pub fn new(data: &Tensor) -> anyhow::Result<Self> {
        let (nrows, _) = data.dims2()?;
        Ok(InMemoryData {
            input_data: data.clone(),
            num_rows: nrows,
            shuffled_input_data: None,
            seed: None,
            num_shuffles: 0,
        })
    }

    /// * `data` - `n x d` matrix
    pub fn from_dmatrix(data: &DMatrix<f64>, dtype: DType, device: &Device) -> anyhow::Result<Self> {
        Self::new(&dmatrix_to_tensor(data, dtype, device)?)
    }

    /// Make shuffling reproducible
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }
}

impl DataLoader for InMemoryData {
    fn minibatch_data(&self, batch_idx: usize, target_device: &Device) -> anyhow::Result<Tensor> {
        let shuffled = self
            .shuffled_input_data
            .as_ref()
            .ok_or(anyhow::anyhow!("need to shuffle data"))?;

        let x = shuffled.get(batch_idx).ok_or(anyhow::anyhow!(
            "invalid index = {} vs. total # = {}",
            batch_idx,
            shuffled.len()
        ))?;

        Ok(x.to_device(target_device)?)
    }

    fn num_minibatch(&self) -> usize {
        self.shuffled_input_data
            .as_ref()
            .map(|x| x.len())
            .unwrap_or(0)
    }

    fn num_data(&self) -> usize {
        self.num_rows
    }

    /// Partition a random permutation of the rows into chunks of
    /// `batch_size`; the last chunk may be smaller.
    fn shuffle_minibatch(&mut self, batch_size: usize) -> anyhow::Result<()> {
        let ntot = self.num_data();
        let seed = self.seed.map(|s| s.wrapping_add(self.num_shuffles));
        self.num_shuffles += 1;

        let indices = shuffled_indices(ntot, seed)
            .into_iter()
            .map(|i| i as u32)
            .collect::<Vec<_>>();

        let device = self.input_data.device();
        let mut chunks = vec![];
        for (lb, ub) in generate_minibatch_intervals(ntot, batch_size) {
            let idx = Tensor::from_slice(&indices[lb..ub], ub - lb, device)?;
            chunks.push(self.input_data.index_select(&idx, 0)?);
        }
        self.shuffled_input_data = Some(chunks);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minibatches_cover_every_row() -> anyhow::Result<()> {
        let x = Tensor::arange(0_f32, 25., &Device::Cpu)?.reshape((25, 1))?;
        let mut data = InMemoryData::new(&x)?.with_seed(3);
        assert!(data.minibatch_data(0, &Device::Cpu).is_err());

        data.shuffle_minibatch(10)?;
        assert_eq!(data.num_minibatch(), 3);

        let mut rows = vec![];
        for b in 0..data.num_minibatch() {
            rows.extend(data.minibatch_data(b, &Device::Cpu)?.flatten_all()?.to_vec1::<f32>()?);
        }
        assert_eq!(rows.len(), 25);
        rows.sort_by(|a, b| a.partial_cmp(b).unwrap());
        assert_eq!(rows, (0..25).map(|x| x as f32).collect::<Vec<_>>());
        Ok(())
    }

    #[test]
    fn rows_are_counted_on_construction() -> anyhow::Result<()> {
        let x = Tensor::zeros((7, 3), DType::F32, &Device::Cpu)?;
        let mut data = InMemoryData::new(&x)?;
        assert_eq!(data.num_data(), 7);

        data.shuffle_minibatch(7)?;
        assert_eq!(data.num_minibatch(), 1);
        assert_eq!(data.minibatch_data(0, &Device::Cpu)?.dims(), &[7, 3]);

        let flat = Tensor::zeros(7, DType::F32, &Device::Cpu)?;
        assert!(InMemoryData::new(&flat).is_err());
        Ok(())
    }
}
