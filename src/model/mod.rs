pub mod architecture;
pub mod checkpoint;
pub mod loss;
pub mod state;
pub mod supernet;

use crate::data::DeviceBatch;
use crate::training::bridge::WeightDelta;
use burn::module::AutodiffModule;
use burn::nn::loss::CrossEntropyLossConfig;
use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;
use state::StateDict;
use std::collections::hash_map::DefaultHasher;
use std::collections::BTreeSet;
use std::hash::{Hash, Hasher};
use std::path::Path;

/// Output of a forward pass over a batch
#[derive(Debug, Clone)]
pub struct ElasticOutput<B: Backend> {
    /// Class logits `[batch_size, num_classes]`
    pub logits: Tensor<B, 2>,
    /// Supervised loss `[1]`
    pub loss: Tensor<B, 1>,
}

/// Forward pass and host snapshot of a materialized subnet
pub trait ElasticModule<B: Backend> {
    /// Class logits for `inputs`
    fn forward_logits(&self, inputs: Tensor<B, 2>) -> Tensor<B, 2>;

    /// Host copy of every parameter, keyed by supernet parameter name
    fn state_dict(&self) -> crate::error::Result<StateDict>;

    /// Logits plus cross-entropy against the batch labels
    fn forward_batch(&self, batch: &DeviceBatch<B>) -> ElasticOutput<B> {
        let logits = self.forward_logits(batch.inputs.clone());
        let loss = CrossEntropyLossConfig::new()
            .init(&logits.device())
            .forward(logits.clone(), batch.labels.clone());
        ElasticOutput { logits, loss }
    }
}

/// Trainable subnet whose inference twin can run without autodiff
pub trait SubnetModel<B: AutodiffBackend>:
    AutodiffModule<B, InnerModule: ElasticModule<B::InnerBackend>> + ElasticModule<B>
{
}

impl<B, M> SubnetModel<B> for M
where
    B: AutodiffBackend,
    M: AutodiffModule<B, InnerModule: ElasticModule<B::InnerBackend>> + ElasticModule<B>,
{
}

/// A subnet extracted from the supernet, valid for one training step
#[derive(Debug, Clone)]
pub struct SubnetHandle<M> {
    /// Active model instance
    pub model: M,
    /// Declared parameter count
    pub param_count: usize,
    /// Architecture descriptor (empty object for the full supernet)
    pub arch: serde_json::Value,
}

impl<M> SubnetHandle<M> {
    pub fn new(model: M, param_count: usize, arch: serde_json::Value) -> Self {
        Self {
            model,
            param_count,
            arch,
        }
    }

    /// Stable digest of the architecture, used to check replicas agree
    pub fn fingerprint(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.param_count.hash(&mut hasher);
        self.arch.to_string().hash(&mut hasher);
        hasher.finish()
    }
}

/// The weight-sharing supernet the trainer orchestrates
///
/// Implementations own the shared weights. `apply_grad` is the only way the
/// trainer mutates them.
pub trait ElasticSupernet<B: AutodiffBackend> {
    type Model: SubnetModel<B>;

    /// Full-size model, used as the teacher pass
    fn model(&self) -> anyhow::Result<Self::Model>;

    /// Parameter count of the full-size model
    fn total_params(&self) -> usize;

    /// Names of every supernet parameter
    fn parameter_names(&self) -> BTreeSet<String>;

    /// Deterministic minimal-configuration subnet
    fn smallest_model(&self) -> anyhow::Result<SubnetHandle<Self::Model>>;

    /// Subnet sampled under the resource budget
    fn random_resource_aware_model(&mut self) -> anyhow::Result<SubnetHandle<Self::Model>>;

    /// Fold a subnet-sized `before - after` delta into the shared weights
    fn apply_grad(&mut self, delta: &WeightDelta) -> anyhow::Result<()>;

    /// Persist the full supernet weights under `path`
    fn save_ckpt(&self, path: &Path) -> anyhow::Result<()>;

    /// Full-size model wrapped as a subnet handle
    fn full_model(&self) -> anyhow::Result<SubnetHandle<Self::Model>> {
        Ok(SubnetHandle::new(
            self.model()?,
            self.total_params(),
            serde_json::json!({}),
        ))
    }
}

/// Reference supernet configuration
#[derive(Config, Debug)]
pub struct SupernetConfig {
    /// Number of input features
    pub input_size: usize,

    /// Number of output classes
    pub num_classes: usize,

    /// Hidden layer widths of the full supernet
    pub hidden_sizes: Vec<usize>,

    /// Granularity of sampled hidden widths
    #[config(default = "8")]
    pub width_step: usize,

    /// Smallest width as a fraction of the full width
    #[config(default = "0.25")]
    pub min_width_ratio: f64,

    /// Largest sampled subnet as a fraction of the full parameter count
    #[config(default = "1.0")]
    pub resource_budget: f64,

    /// Seed for subnet sampling, identical on every replica
    #[config(default = "2026")]
    pub seed: u64,
}

impl SupernetConfig {
    /// Small default for tabular classification
    pub fn tabular(input_size: usize, num_classes: usize) -> Self {
        Self::new(input_size, num_classes, vec![128, 64])
    }

    /// Hidden widths of the smallest subnet
    pub fn min_hidden_sizes(&self) -> Vec<usize> {
        self.hidden_sizes
            .iter()
            .map(|&h| ((h as f64 * self.min_width_ratio).round() as usize).clamp(1, h))
            .collect()
    }

    /// Layer dimensions `[input, hidden..., classes]` for the given widths
    pub fn layer_dims(&self, hidden: &[usize]) -> Vec<usize> {
        let mut dims = Vec::with_capacity(hidden.len() + 2);
        dims.push(self.input_size);
        dims.extend_from_slice(hidden);
        dims.push(self.num_classes);
        dims
    }

    /// Parameter count of an MLP with the given hidden widths
    pub fn param_count(&self, hidden: &[usize]) -> usize {
        self.layer_dims(hidden)
            .windows(2)
            .map(|w| w[0] * w[1] + w[1])
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_param_count() {
        let config = SupernetConfig::new(4, 3, vec![8, 6]);
        // 4*8+8 + 8*6+6 + 6*3+3
        assert_eq!(config.param_count(&[8, 6]), 40 + 54 + 21);
    }

    #[test]
    fn test_min_hidden_sizes() {
        let config = SupernetConfig::new(4, 3, vec![64, 2]).with_min_width_ratio(0.25);
        assert_eq!(config.min_hidden_sizes(), vec![16, 1]);
    }

    #[test]
    fn test_fingerprint_depends_on_arch() {
        let a = SubnetHandle::new((), 10, serde_json::json!({"hidden_sizes": [4]}));
        let b = SubnetHandle::new((), 10, serde_json::json!({"hidden_sizes": [8]}));
        assert_eq!(a.fingerprint(), a.clone().fingerprint());
        assert_ne!(a.fingerprint(), b.fingerprint());
    }
}
