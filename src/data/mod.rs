pub mod loader;

use crate::error::{Result, TrainerError};
use crate::model::state::HostTensor;
use burn::prelude::*;
use burn::tensor::TensorData;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Field holding model inputs
pub const INPUTS_FIELD: &str = "inputs";

/// Field holding integer class labels
pub const LABELS_FIELD: &str = "labels";

/// Collated batch: field name to host tensor
///
/// Every field shares the same leading (batch) dimension.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    fields: BTreeMap<String, HostTensor>,
}

impl Batch {
    /// Build a batch, rejecting fields whose leading dimensions disagree
    pub fn new(fields: BTreeMap<String, HostTensor>) -> Result<Self> {
        let mut batch_size = None;
        for (name, tensor) in &fields {
            let rows = tensor.leading_dim();
            match batch_size {
                None => batch_size = Some(rows),
                Some(expected) if expected != rows => {
                    return Err(TrainerError::Shape {
                        name: name.clone(),
                        expected: vec![expected],
                        got: vec![rows],
                    });
                }
                Some(_) => {}
            }
        }
        Ok(Self { fields })
    }

    /// Number of examples in the batch
    pub fn len(&self) -> usize {
        self.fields
            .values()
            .next()
            .map(HostTensor::leading_dim)
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, name: &str) -> Option<&HostTensor> {
        self.fields.get(name)
    }

    fn require(&self, name: &str) -> Result<&HostTensor> {
        self.get(name)
            .ok_or_else(|| TrainerError::data(format!("batch is missing the '{name}' field")))
    }

    /// Labels as class indices
    pub fn labels(&self) -> Result<Vec<i64>> {
        Ok(self
            .require(LABELS_FIELD)?
            .values()
            .iter()
            .map(|&v| v as i64)
            .collect())
    }

    /// Move the batch onto a compute device
    pub fn to_device<B: Backend>(&self, device: &B::Device) -> Result<DeviceBatch<B>> {
        let inputs = self.require(INPUTS_FIELD)?.to_tensor::<B, 2>(device)?;
        let labels = self.labels()?;
        let num_labels = labels.len();
        let labels = Tensor::<B, 1, Int>::from_data(TensorData::new(labels, [num_labels]), device);
        Ok(DeviceBatch { inputs, labels })
    }
}

/// Batch resident on a compute device
#[derive(Debug, Clone)]
pub struct DeviceBatch<B: Backend> {
    /// Inputs `[batch_size, features]`
    pub inputs: Tensor<B, 2>,
    /// Class indices `[batch_size]`
    pub labels: Tensor<B, 1, Int>,
}

/// Random-access source of raw examples
pub trait Dataset: Send + Sync {
    type Item: Clone + Send;

    fn len(&self) -> usize;

    fn get(&self, index: usize) -> Option<Self::Item>;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: Clone + Send + Sync> Dataset for Vec<T> {
    type Item = T;

    fn len(&self) -> usize {
        self.as_slice().len()
    }

    fn get(&self, index: usize) -> Option<T> {
        self.as_slice().get(index).cloned()
    }
}

/// Maps a sequence of raw examples to a [`Batch`]
pub trait Collator<I>: Send + Sync {
    fn collate(&self, items: Vec<I>) -> Result<Batch>;
}

impl<I, F> Collator<I> for F
where
    F: Fn(Vec<I>) -> Result<Batch> + Send + Sync,
{
    fn collate(&self, items: Vec<I>) -> Result<Batch> {
        self(items)
    }
}

/// Fixed-width feature vector with a class label
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TabularExample {
    pub features: Vec<f32>,
    pub label: i64,
}

impl TabularExample {
    pub fn new(features: Vec<f32>, label: i64) -> Self {
        Self { features, label }
    }
}

/// Collator for [`TabularExample`]s
#[derive(Debug, Clone, Copy, Default)]
pub struct TabularCollator;

impl Collator<TabularExample> for TabularCollator {
    fn collate(&self, items: Vec<TabularExample>) -> Result<Batch> {
        let width = items.first().map(|e| e.features.len()).unwrap_or(0);
        let mut inputs = Vec::with_capacity(items.len() * width);
        let mut labels = Vec::with_capacity(items.len());

        for item in &items {
            if item.features.len() != width {
                return Err(TrainerError::Shape {
                    name: INPUTS_FIELD.to_string(),
                    expected: vec![width],
                    got: vec![item.features.len()],
                });
            }
            inputs.extend_from_slice(&item.features);
            labels.push(item.label as f32);
        }

        let mut fields = BTreeMap::new();
        fields.insert(
            INPUTS_FIELD.to_string(),
            HostTensor::new(vec![items.len(), width], inputs)?,
        );
        fields.insert(
            LABELS_FIELD.to_string(),
            HostTensor::new(vec![items.len()], labels)?,
        );
        Batch::new(fields)
    }
}

/// Rank-strided view of a dataset for data-parallel training
///
/// Every shard has `ceil(len / world_size)` examples; short shards wrap
/// around to the start so all ranks run the same number of steps.
pub struct ShardedDataset<'a, D: Dataset> {
    inner: &'a D,
    rank: usize,
    world_size: usize,
}

impl<'a, D: Dataset> ShardedDataset<'a, D> {
    pub fn new(inner: &'a D, rank: usize, world_size: usize) -> Self {
        Self {
            inner,
            rank,
            world_size: world_size.max(1),
        }
    }
}

impl<D: Dataset> Dataset for ShardedDataset<'_, D> {
    type Item = D::Item;

    fn len(&self) -> usize {
        self.inner.len().div_ceil(self.world_size)
    }

    fn get(&self, index: usize) -> Option<D::Item> {
        let total = self.inner.len();
        if total == 0 || index >= self.len() {
            return None;
        }
        self.inner.get((index * self.world_size + self.rank) % total)
    }
}

/// Dataset split configuration
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SplitConfig {
    /// Training set ratio
    pub train_ratio: f32,
    /// Evaluation set ratio
    pub eval_ratio: f32,
    /// Test set ratio
    pub test_ratio: f32,
    /// Random seed
    pub seed: u64,
}

impl Default for SplitConfig {
    fn default() -> Self {
        Self {
            train_ratio: 0.7,
            eval_ratio: 0.1,
            test_ratio: 0.2,
            seed: 2026,
        }
    }
}

/// Train/eval/test splits
#[derive(Debug, Clone)]
pub struct DatasetSplits<T> {
    pub train: Vec<T>,
    pub eval: Vec<T>,
    pub test: Vec<T>,
}

impl<T> DatasetSplits<T> {
    /// Shuffle with the configured seed and cut into three splits
    pub fn split(mut examples: Vec<T>, config: &SplitConfig) -> Self {
        let mut rng = ChaCha8Rng::seed_from_u64(config.seed);
        examples.shuffle(&mut rng);

        let total = config.train_ratio + config.eval_ratio + config.test_ratio;
        let n = examples.len();
        let n_train = ((config.train_ratio / total) * n as f32).round() as usize;
        let n_eval = ((config.eval_ratio / total) * n as f32).round() as usize;
        let n_train = n_train.min(n);
        let n_eval = n_eval.min(n - n_train);

        let test = examples.split_off(n_train + n_eval);
        let eval = examples.split_off(n_train);

        Self {
            train: examples,
            eval,
            test,
        }
    }

    pub fn total_samples(&self) -> usize {
        self.train.len() + self.eval.len() + self.test.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray<f32>;

    fn examples(n: usize) -> Vec<TabularExample> {
        (0..n)
            .map(|i| TabularExample::new(vec![i as f32, 1.0], (i % 2) as i64))
            .collect()
    }

    #[test]
    fn test_batch_rejects_ragged_fields() {
        let mut fields = BTreeMap::new();
        fields.insert(INPUTS_FIELD.to_string(), HostTensor::zeros(vec![2, 3]));
        fields.insert(LABELS_FIELD.to_string(), HostTensor::zeros(vec![3]));
        assert!(Batch::new(fields).is_err());
    }

    #[test]
    fn test_tabular_collator() {
        let batch = TabularCollator.collate(examples(3)).unwrap();
        assert_eq!(batch.len(), 3);
        assert_eq!(batch.get(INPUTS_FIELD).unwrap().shape(), &[3, 2]);
        assert_eq!(batch.labels().unwrap(), vec![0, 1, 0]);
    }

    #[test]
    fn test_collator_rejects_mixed_widths() {
        let items = vec![
            TabularExample::new(vec![1.0, 2.0], 0),
            TabularExample::new(vec![1.0], 1),
        ];
        assert!(TabularCollator.collate(items).is_err());
    }

    #[test]
    fn test_to_device() {
        let device = Default::default();
        let batch = TabularCollator.collate(examples(4)).unwrap();
        let on_device = batch.to_device::<TestBackend>(&device).unwrap();
        assert_eq!(on_device.inputs.dims(), [4, 2]);
        assert_eq!(on_device.labels.dims(), [4]);
    }

    #[test]
    fn test_sharded_dataset_is_disjoint_and_padded() {
        let data = examples(5);
        let shard0 = ShardedDataset::new(&data, 0, 2);
        let shard1 = ShardedDataset::new(&data, 1, 2);
        assert_eq!(shard0.len(), 3);
        assert_eq!(shard1.len(), 3);

        let firsts: Vec<f32> = (0..3).map(|i| shard0.get(i).unwrap().features[0]).collect();
        let seconds: Vec<f32> = (0..3).map(|i| shard1.get(i).unwrap().features[0]).collect();
        assert_eq!(firsts, vec![0.0, 2.0, 4.0]);
        assert_eq!(seconds, vec![1.0, 3.0, 0.0]);
    }

    #[test]
    fn test_split_sizes() {
        let splits = DatasetSplits::split(examples(10), &SplitConfig::default());
        assert_eq!(splits.train.len(), 7);
        assert_eq!(splits.eval.len(), 1);
        assert_eq!(splits.test.len(), 2);
        assert_eq!(splits.total_samples(), 10);
    }
}
