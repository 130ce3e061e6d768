use crate::model::architecture::{bias_key, init_model, weight_key, ElasticMlp};
use crate::model::state::StateDict;
use crate::model::{ElasticModule, ElasticSupernet, SubnetHandle, SupernetConfig};
use crate::training::bridge::WeightDelta;
use anyhow::{bail, Context, Result};
use burn::prelude::*;
use burn::record::{FullPrecisionSettings, NamedMpkFileRecorder, Recorder};
use burn::tensor::backend::AutodiffBackend;
use rand::Rng;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use std::collections::BTreeSet;
use std::fs;
use std::path::Path;
use tracing::{debug, info};

/// Attempts at drawing a subnet within budget before falling back to the smallest
const MAX_SAMPLING_ATTEMPTS: usize = 32;

const MODEL_FILE: &str = "model";
const CONFIG_FILE: &str = "supernet.json";

/// Checkpoints keep full `f32` precision
type WeightRecorder = NamedMpkFileRecorder<FullPrecisionSettings>;

/// Width-elastic MLP supernet
///
/// Shared weights are kept on the host. Subnets are materialized on the
/// device from the leading blocks of every layer.
pub struct MlpSupernet<B: AutodiffBackend> {
    config: SupernetConfig,
    weights: StateDict,
    device: B::Device,
    rng: ChaCha8Rng,
}

impl<B: AutodiffBackend> MlpSupernet<B> {
    /// Freshly initialized supernet
    pub fn new(config: SupernetConfig, device: B::Device) -> Result<Self> {
        if config.hidden_sizes.iter().any(|&h| h == 0) {
            bail!("hidden sizes must be positive: {:?}", config.hidden_sizes);
        }
        let weights = init_model::<B>(&config, &device).state_dict()?;
        Ok(Self::from_weights(config, weights, device))
    }

    /// Supernet over existing shared weights, e.g. another replica's initialization
    pub fn from_weights(config: SupernetConfig, weights: StateDict, device: B::Device) -> Self {
        let rng = ChaCha8Rng::seed_from_u64(config.seed);
        Self {
            config,
            weights,
            device,
            rng,
        }
    }

    /// Load a checkpoint written by [`ElasticSupernet::save_ckpt`]
    pub fn load_ckpt(path: &Path, device: B::Device) -> Result<Self> {
        info!("Loading supernet checkpoint from {:?}", path);
        let config = SupernetConfig::load(path.join(CONFIG_FILE))
            .with_context(|| format!("Failed to read supernet config in {:?}", path))?;

        let record = WeightRecorder::new()
            .load(path.join(MODEL_FILE), &device)
            .context("Failed to load supernet weights")?;
        let model = init_model::<B>(&config, &device).load_record(record);

        let weights = model.state_dict()?;
        Ok(Self::from_weights(config, weights, device))
    }

    pub fn config(&self) -> &SupernetConfig {
        &self.config
    }

    /// Host copy of the shared weights
    pub fn weights(&self) -> &StateDict {
        &self.weights
    }

    /// Materialize the subnet with the given hidden widths
    pub fn materialize(&self, hidden: &[usize]) -> Result<SubnetHandle<ElasticMlp<B>>> {
        if hidden.len() != self.config.hidden_sizes.len() {
            bail!(
                "expected {} hidden widths, got {:?}",
                self.config.hidden_sizes.len(),
                hidden
            );
        }
        if let Some((w, max)) = hidden
            .iter()
            .zip(&self.config.hidden_sizes)
            .find(|(w, max)| **w == 0 || w > max)
        {
            bail!("hidden width {} outside 1..={}", w, max);
        }

        let dims = self.config.layer_dims(hidden);
        let mut sliced = StateDict::new();
        for (i, pair) in dims.windows(2).enumerate() {
            let (d_in, d_out) = (pair[0], pair[1]);
            let weight = self.shared(&weight_key(i))?.slice_prefix(&[d_in, d_out])?;
            let bias = self.shared(&bias_key(i))?.slice_prefix(&[d_out])?;
            sliced.insert(weight_key(i), weight);
            sliced.insert(bias_key(i), bias);
        }

        let model = ElasticMlp::from_state(&sliced, &self.device)?;
        let arch = serde_json::json!({ "hidden_sizes": hidden });
        Ok(SubnetHandle::new(model, self.config.param_count(hidden), arch))
    }

    fn shared(&self, name: &str) -> Result<&crate::model::state::HostTensor> {
        self.weights
            .get(name)
            .with_context(|| format!("supernet has no parameter {name}"))
    }

    /// Width candidates for one layer: multiples of the step between min and max
    fn width_choices(&self, min: usize, max: usize) -> Vec<usize> {
        let step = self.config.width_step.max(1);
        let mut choices: Vec<usize> = (min..=max).filter(|w| w % step == 0).collect();
        for bound in [min, max] {
            if !choices.contains(&bound) {
                choices.push(bound);
            }
        }
        choices.sort_unstable();
        choices
    }
}

impl<B: AutodiffBackend> ElasticSupernet<B> for MlpSupernet<B> {
    type Model = ElasticMlp<B>;

    fn model(&self) -> Result<ElasticMlp<B>> {
        Ok(ElasticMlp::from_state(&self.weights, &self.device)?)
    }

    fn total_params(&self) -> usize {
        self.config.param_count(&self.config.hidden_sizes)
    }

    fn parameter_names(&self) -> BTreeSet<String> {
        self.weights.keys().cloned().collect()
    }

    fn smallest_model(&self) -> Result<SubnetHandle<ElasticMlp<B>>> {
        self.materialize(&self.config.min_hidden_sizes())
    }

    fn random_resource_aware_model(&mut self) -> Result<SubnetHandle<ElasticMlp<B>>> {
        let budget = (self.total_params() as f64 * self.config.resource_budget) as usize;
        let minimums = self.config.min_hidden_sizes();
        let choices: Vec<Vec<usize>> = minimums
            .iter()
            .zip(&self.config.hidden_sizes)
            .map(|(&min, &max)| self.width_choices(min, max))
            .collect();

        for attempt in 0..MAX_SAMPLING_ATTEMPTS {
            let hidden: Vec<usize> = choices
                .iter()
                .map(|c| c[self.rng.gen_range(0..c.len())])
                .collect();
            if self.config.param_count(&hidden) <= budget {
                debug!("Sampled subnet {:?} after {} attempts", hidden, attempt + 1);
                return self.materialize(&hidden);
            }
        }

        debug!("No subnet within {} parameters, using the smallest", budget);
        self.smallest_model()
    }

    fn apply_grad(&mut self, delta: &WeightDelta) -> Result<()> {
        for (name, update) in delta.iter() {
            let shared = self
                .weights
                .get_mut(name)
                .with_context(|| format!("supernet has no parameter {name}"))?;
            shared.sub_assign_prefix(update)?;
        }
        Ok(())
    }

    fn save_ckpt(&self, path: &Path) -> Result<()> {
        fs::create_dir_all(path)
            .with_context(|| format!("Failed to create checkpoint directory {:?}", path))?;

        let model = ElasticMlp::<B>::from_state(&self.weights, &self.device)?;
        WeightRecorder::new()
            .record(model.into_record(), path.join(MODEL_FILE))
            .context("Failed to save supernet weights")?;
        self.config
            .save(path.join(CONFIG_FILE))
            .context("Failed to save supernet config")?;

        debug!("Saved supernet checkpoint: {:?}", path);
        Ok(())
    }
}
