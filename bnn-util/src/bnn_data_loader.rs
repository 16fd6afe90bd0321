use candle_core::{Device, Tensor};
use nalgebra::DMatrix;
use ndarray::Array2;
use rand::prelude::SliceRandom;
use rayon::prelude::*;

pub struct MinibatchData {
    pub input: Tensor,
    pub output: Option<Tensor>,
}

/// `DataLoader` for minibatch learning
pub trait DataLoader {
    fn minibatch_shuffled(
        &self,
        batch_idx: usize,
        target_device: &Device,
    ) -> anyhow::Result<MinibatchData>;

    fn num_minibatch(&self) -> usize;

    fn shuffle_minibatch(&mut self, batch_size: usize) -> anyhow::Result<()>;
}

/// Anything whose rows convert to a vector of (1, d) tensors.
pub trait RowsToTensorVec {
    fn rows_to_tensor_vec(&self) -> anyhow::Result<Vec<Tensor>>;
}

impl RowsToTensorVec for Tensor {
    fn rows_to_tensor_vec(&self) -> anyhow::Result<Vec<Tensor>> {
        let nrows = self.dim(0)?;
        Ok((0..nrows)
            .map(|i| self.narrow(0, i, 1))
            .collect::<candle_core::Result<_>>()?)
    }
}

impl RowsToTensorVec for DMatrix<f32> {
    fn rows_to_tensor_vec(&self) -> anyhow::Result<Vec<Tensor>> {
        let ncols = self.ncols();
        (0..self.nrows())
            .map(|i| {
                let row: Vec<f32> = self.row(i).iter().copied().collect();
                Ok(Tensor::from_vec(row, (1, ncols), &Device::Cpu)?)
            })
            .collect()
    }
}

impl RowsToTensorVec for Array2<f32> {
    fn rows_to_tensor_vec(&self) -> anyhow::Result<Vec<Tensor>> {
        let ncols = self.ncols();
        self.rows()
            .into_iter()
            .map(|row| {
                let row: Vec<f32> = row.iter().copied().collect();
                Ok(Tensor::from_vec(row, (1, ncols), &Device::Cpu)?)
            })
            .collect()
    }
}

///
/// A simple data loader for in-memory 2d matrices. Each row is one
/// sample; minibatches are shuffled once and preloaded, then fetched by
/// index on the target device.
///
pub struct InMemoryData {
    input_data: Vec<Tensor>,
    output_data: Option<Vec<Tensor>>,

    shuffled_input_data: Option<Vec<Tensor>>,
    shuffled_output_data: Option<Vec<Tensor>>,

    minibatches: Minibatches,
}

impl InMemoryData {
    ///
    /// Create a data loader with the main data tensor `data`
    ///
    pub fn new<D>(data: &D) -> anyhow::Result<Self>
    where
        D: RowsToTensorVec,
    {
        let data = data.rows_to_tensor_vec()?;
        let rows = (0..data.len()).collect();

        Ok(InMemoryData {
            input_data: data,
            output_data: None,
            shuffled_input_data: None,
            shuffled_output_data: None,
            minibatches: Minibatches {
                samples: rows,
                chunks: vec![],
            },
        })
    }

    ///
    /// Create a data loader with the main `data` and output `out`
    ///
    pub fn new_with_output<D>(data: &D, out: &D) -> anyhow::Result<Self>
    where
        D: RowsToTensorVec,
    {
        let data = data.rows_to_tensor_vec()?;
        let out_data = out.rows_to_tensor_vec()?;
        let rows = (0..data.len()).collect();

        debug_assert!(data.len() == out_data.len());

        Ok(InMemoryData {
            input_data: data,
            output_data: Some(out_data),
            shuffled_input_data: None,
            shuffled_output_data: None,
            minibatches: Minibatches {
                samples: rows,
                chunks: vec![],
            },
        })
    }

    pub fn num_samples(&self) -> usize {
        self.input_data.len()
    }
}

impl DataLoader for InMemoryData {
    fn minibatch_shuffled(
        &self,
        batch_idx: usize,
        target_device: &Device,
    ) -> anyhow::Result<MinibatchData> {
        if let Some(input) =
            take_shuffled(batch_idx, target_device, self.shuffled_input_data.as_ref())?
        {
            let output =
                take_shuffled(batch_idx, target_device, self.shuffled_output_data.as_ref())?;

            Ok(MinibatchData { input, output })
        } else {
            Err(anyhow::anyhow!("need to shuffle data"))
        }
    }

    fn num_minibatch(&self) -> usize {
        self.minibatches.chunks.len()
    }

    fn shuffle_minibatch(&mut self, batch_size: usize) -> anyhow::Result<()> {
        /////////////////////
        // shuffle indexes //
        /////////////////////

        self.minibatches.shuffle_minibatch(batch_size);

        self.shuffled_input_data = Some(vec![]);

        if self.output_data.is_some() {
            self.shuffled_output_data = Some(vec![]);
        }

        ///////////////////////////////////
        // preload all the shuffled data //
        ///////////////////////////////////

        for batch_idx in 0..self.num_minibatch() {
            if let Some(samples) = self.minibatches.chunks.get(batch_idx) {
                {
                    let chunk: Vec<Tensor> = samples
                        .iter()
                        .map(|&i| self.input_data[i].clone())
                        .collect();

                    if let Some(shuffled_data) = &mut self.shuffled_input_data {
                        let x = Tensor::cat(&chunk, 0)?;
                        shuffled_data.push(x);
                    }
                }
                if let Some(out_data) = self.output_data.as_ref() {
                    let chunk: Vec<Tensor> =
                        samples.iter().map(|&i| out_data[i].clone()).collect();

                    if let Some(shuffled_data) = &mut self.shuffled_output_data {
                        let x = Tensor::cat(&chunk, 0)?;
                        shuffled_data.push(x);
                    }
                }
            } else {
                return Err(anyhow::anyhow!(
                    "invalid index = {} vs. total # = {}",
                    batch_idx,
                    self.num_minibatch()
                ));
            }
        }

        Ok(())
    }
}

fn take_shuffled(
    batch_idx: usize,
    target_device: &Device,
    data_vec: Option<&Vec<Tensor>>,
) -> anyhow::Result<Option<Tensor>> {
    if let Some(data_vec) = data_vec {
        if data_vec.len() <= batch_idx {
            Err(anyhow::anyhow!(
                "invalid index = {} vs. total # = {}",
                batch_idx,
                data_vec.len()
            ))
        } else {
            Ok(Some(data_vec[batch_idx].to_device(target_device)?))
        }
    } else {
        // if the data vector doesn't exist
        Ok(None)
    }
}

///
/// A helper `struct` for shuffling and creating minibatch indexes;
/// after `shuffle_minibatch` is called, `chunks` partition indexes.
///
pub struct Minibatches {
    samples: Vec<usize>,
    pub chunks: Vec<Vec<usize>>,
}

impl Minibatches {
    pub fn shuffle_minibatch(&mut self, batch_size: usize) {
        use rand_distr::{Distribution, Uniform};

        let mut rng = rand::rng();
        self.samples.shuffle(&mut rng);

        let nbatch = (self.size() + batch_size) / batch_size;
        let ntot = nbatch * batch_size;

        let unif = Uniform::new(0, self.size()).expect("unif [0 .. size)");

        let indexes = (0..ntot)
            .into_par_iter()
            .map_init(rand::rng, |rng, _| unif.sample(rng))
            .collect::<Vec<usize>>();

        self.chunks = (0..nbatch)
            .par_bridge()
            .map(|b| {
                let lb = b * batch_size;
                let ub = (b + 1) * batch_size;
                (lb..ub).map(|i| indexes[i]).collect()
            })
            .collect::<Vec<Vec<usize>>>();
    }

    pub fn size(&self) -> usize {
        self.samples.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shuffle_and_fetch() -> anyhow::Result<()> {
        let x = DMatrix::<f32>::from_fn(10, 3, |i, j| (i * 3 + j) as f32);
        let y = DMatrix::<f32>::from_fn(10, 1, |i, _| i as f32);

        let mut data = InMemoryData::new_with_output(&x, &y)?;
        assert_eq!(data.num_samples(), 10);

        data.shuffle_minibatch(4)?;
        assert!(data.num_minibatch() >= 2);

        let device = Device::Cpu;
        for b in 0..data.num_minibatch() {
            let mb = data.minibatch_shuffled(b, &device)?;
            assert_eq!(mb.input.dims(), &[4, 3]);
            assert_eq!(mb.output.as_ref().map(|t| t.dims().to_vec()), Some(vec![4, 1]));
        }
        Ok(())
    }

    #[test]
    fn test_fetch_before_shuffle_fails() -> anyhow::Result<()> {
        let x = Array2::<f32>::zeros((5, 2));
        let data = InMemoryData::new(&x)?;
        assert!(data.minibatch_shuffled(0, &Device::Cpu).is_err());
        Ok(())
    }

    #[test]
    fn test_tensor_rows_as_source() -> anyhow::Result<()> {
        let x = Tensor::randn(0f32, 1f32, (6, 2), &Device::Cpu)?;
        let rows = x.rows_to_tensor_vec()?;
        assert_eq!(rows.len(), 6);
        assert_eq!(rows[0].dims(), &[1, 2]);

        let mut data = InMemoryData::new(&x)?;
        data.shuffle_minibatch(3)?;
        let mb = data.minibatch_shuffled(0, &Device::Cpu)?;
        assert_eq!(mb.input.dims(), &[3, 2]);
        assert!(mb.output.is_none());
        Ok(())
    }
}
