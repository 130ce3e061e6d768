pub mod bridge;
pub mod distributed;
pub mod evaluator;
pub mod logger;
pub mod metrics;
pub mod optimizer;
pub mod scheduler;
pub mod step;
pub mod trainer;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Metric key holding the active subnet's parameter count
pub const PARAMS_KEY: &str = "params";

/// Training configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    /// Run output directory (checkpoints, logs)
    pub output_dir: PathBuf,
    /// Batch size per device for training
    pub per_device_train_batch_size: usize,
    /// Batch size per device for evaluation
    pub per_device_eval_batch_size: usize,
    /// Number of training epochs
    pub num_train_epochs: usize,
    /// Initial learning rate
    pub learning_rate: f64,
    /// AdamW weight decay
    pub weight_decay: f64,
    /// Number of workers for data loading
    pub dataloader_num_workers: usize,
    /// Evaluate every this many batches (0 = never)
    pub eval_steps: usize,
    /// Write `last_model` every this many batches (0 = end of epoch only)
    pub save_steps: usize,
    /// Stop after this many batches (0 = no limit)
    pub max_steps: usize,
    /// Random seed
    pub seed: u64,
    /// Show a progress bar over training steps
    pub show_progress: bool,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("output"),
            per_device_train_batch_size: 32,
            per_device_eval_batch_size: 64,
            num_train_epochs: 3,
            learning_rate: 2e-5,
            weight_decay: 0.01,
            dataloader_num_workers: 8,
            eval_steps: 100,
            save_steps: 1,
            max_steps: 0,
            seed: 2026,
            show_progress: true,
        }
    }
}

impl TrainingConfig {
    /// Create configuration for quick testing
    pub fn quick_test() -> Self {
        Self {
            per_device_train_batch_size: 8,
            per_device_eval_batch_size: 8,
            num_train_epochs: 1,
            learning_rate: 1e-3,
            dataloader_num_workers: 0,
            eval_steps: 0,
            show_progress: false,
            ..Default::default()
        }
    }

    /// Load from a JSON file; missing fields take their defaults
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read training config {:?}", path))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse training config {:?}", path))
    }

    /// Reject values the training loop cannot run with
    pub fn validate(&self) -> crate::error::Result<()> {
        use crate::error::TrainerError;

        if self.per_device_train_batch_size == 0 || self.per_device_eval_batch_size == 0 {
            return Err(TrainerError::config("batch sizes must be positive"));
        }
        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) {
            return Err(TrainerError::config(format!(
                "learning rate must be positive, got {}",
                self.learning_rate
            )));
        }
        if !(self.weight_decay.is_finite() && self.weight_decay >= 0.0) {
            return Err(TrainerError::config(format!(
                "weight decay must be non-negative, got {}",
                self.weight_decay
            )));
        }
        Ok(())
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.output_dir.join("logs")
    }
}

/// Named scalar metrics of one step or evaluation round
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MetricsRecord(BTreeMap<String, f64>);

impl MetricsRecord {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record carrying only the `params` field
    pub fn with_params(params: usize) -> Self {
        let mut record = Self::new();
        record.set_params(params);
        record
    }

    pub fn set_params(&mut self, params: usize) {
        self.0.insert(PARAMS_KEY.to_string(), params as f64);
    }

    pub fn params(&self) -> Option<usize> {
        self.get(PARAMS_KEY).map(|p| p as usize)
    }

    pub fn insert(&mut self, name: impl Into<String>, value: f64) {
        self.0.insert(name.into(), value);
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        self.0.get(name).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &f64)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<BTreeMap<String, f64>> for MetricsRecord {
    fn from(values: BTreeMap<String, f64>) -> Self {
        Self(values)
    }
}

impl FromIterator<(String, f64)> for MetricsRecord {
    fn from_iter<I: IntoIterator<Item = (String, f64)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Training state, persisted as `trainer_state.json`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrainingState {
    /// Current epoch
    pub epoch: usize,
    /// Batches processed so far
    pub global_step: usize,
    /// Best value per metric
    pub best_metrics: BTreeMap<String, f64>,
}

impl TrainingState {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Training result
#[derive(Debug, Clone)]
pub struct TrainingSummary {
    /// Final training state
    pub state: TrainingState,
    /// Metrics of the last supernet step
    pub last_metrics: Option<MetricsRecord>,
    /// Path of the `last_model` checkpoint, if written
    pub last_checkpoint: Option<PathBuf>,
    /// Training duration in seconds
    pub duration_secs: f64,
}
