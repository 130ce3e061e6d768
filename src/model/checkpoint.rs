use anyhow::Context;
use burn::tensor::backend::AutodiffBackend;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::error::{Result, TrainerError};
use crate::model::ElasticSupernet;
use crate::training::{MetricsRecord, TrainingState, PARAMS_KEY};

/// Name of the checkpoint written on the save cadence
pub const LAST_MODEL: &str = "last_model";

const STATE_FILE: &str = "trainer_state.json";

/// Best observed value per metric, higher is better
///
/// An unseen key behaves as negative infinity, so the first finite value
/// is an improvement. `params` never takes part in the comparison.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BestMetricTable {
    best: BTreeMap<String, f64>,
}

impl BestMetricTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one evaluation round in, returning the keys that strictly improved
    pub fn update(&mut self, metrics: &MetricsRecord) -> Vec<String> {
        let mut improved = Vec::new();
        for (name, &value) in metrics.iter() {
            if name == PARAMS_KEY || !value.is_finite() {
                continue;
            }
            let is_better = match self.best.get(name) {
                None => true,
                Some(&best) => value > best,
            };
            if is_better {
                self.best.insert(name.clone(), value);
                improved.push(name.clone());
            }
        }
        improved
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        self.best.get(name).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &f64)> {
        self.best.iter()
    }

    pub fn len(&self) -> usize {
        self.best.len()
    }

    pub fn is_empty(&self) -> bool {
        self.best.is_empty()
    }
}

/// Checkpoint manager for the supernet snapshots of one run
///
/// Layout under the output directory:
/// - `last_model/`
/// - `<metric>_best_model/`
/// - `trainer_state.json`
pub struct CheckpointManager {
    /// Run output directory
    output_dir: PathBuf,
    /// Best value per metric seen so far
    best: BestMetricTable,
}

impl CheckpointManager {
    /// Create new checkpoint manager
    pub fn new<P: AsRef<Path>>(output_dir: P) -> anyhow::Result<Self> {
        let output_dir = output_dir.as_ref().to_path_buf();
        fs::create_dir_all(&output_dir).context("Failed to create output directory")?;

        Ok(Self {
            output_dir,
            best: BestMetricTable::new(),
        })
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn last_path(&self) -> PathBuf {
        self.output_dir.join(LAST_MODEL)
    }

    pub fn best_path(&self, metric: &str) -> PathBuf {
        self.output_dir.join(format!("{metric}_best_model"))
    }

    pub fn best_metrics(&self) -> &BestMetricTable {
        &self.best
    }

    /// Snapshot the full supernet as `last_model`
    pub fn save_last<B, S>(&self, supernet: &S) -> Result<PathBuf>
    where
        B: AutodiffBackend,
        S: ElasticSupernet<B>,
    {
        let path = self.last_path();
        save_snapshot(supernet, &path)?;
        debug!("Saved last model: {:?}", path);
        Ok(path)
    }

    /// Update the best table and snapshot the supernet once per improved metric
    ///
    /// Returns the improved metric names. Failed writes are logged and do not
    /// roll back the table.
    pub fn update_best<B, S>(&mut self, metrics: &MetricsRecord, supernet: &S) -> Vec<String>
    where
        B: AutodiffBackend,
        S: ElasticSupernet<B>,
    {
        let improved = self.best.update(metrics);
        for name in &improved {
            let path = self.best_path(name);
            match save_snapshot(supernet, &path) {
                Ok(()) => info!(
                    "New best {}: {:.4}, saved {:?}",
                    name,
                    self.best.get(name).unwrap_or(f64::NAN),
                    path
                ),
                Err(err) => warn!("{}", err),
            }
        }
        improved
    }

    /// Persist loop progress next to the checkpoints
    pub fn write_state(&self, state: &TrainingState) -> Result<()> {
        let path = self.output_dir.join(STATE_FILE);
        let json = serde_json::to_string_pretty(state).map_err(|e| TrainerError::Checkpoint {
            path: path.clone(),
            source: e.into(),
        })?;
        fs::write(&path, json).map_err(|e| TrainerError::Checkpoint {
            path,
            source: e.into(),
        })
    }

    /// Read back `trainer_state.json` from a run directory
    pub fn read_state<P: AsRef<Path>>(output_dir: P) -> anyhow::Result<TrainingState> {
        let path = output_dir.as_ref().join(STATE_FILE);
        let json = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {:?}", path))?;
        serde_json::from_str(&json).context("Failed to parse trainer state")
    }
}

fn save_snapshot<B, S>(supernet: &S, path: &Path) -> Result<()>
where
    B: AutodiffBackend,
    S: ElasticSupernet<B>,
{
    supernet
        .save_ckpt(path)
        .map_err(|source| TrainerError::Checkpoint {
            path: path.to_path_buf(),
            source,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::supernet::MlpSupernet;
    use crate::model::SupernetConfig;
    use burn::backend::{Autodiff, NdArray};
    use tempfile::TempDir;

    type TestBackend = Autodiff<NdArray<f32>>;

    fn record(values: &[(&str, f64)]) -> MetricsRecord {
        let mut record = MetricsRecord::with_params(100);
        for (name, value) in values {
            record.insert(*name, *value);
        }
        record
    }

    #[test]
    fn test_best_table_is_monotonic() {
        let mut table = BestMetricTable::new();
        let rounds = [0.3, 0.5, 0.4, 0.5, 0.9, 0.1];
        let mut history = Vec::new();
        let mut writes = Vec::new();

        for value in rounds {
            let improved = table.update(&record(&[("accuracy", value)]));
            writes.push(!improved.is_empty());
            history.push(table.get("accuracy").unwrap());
        }

        assert!(history.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(writes, vec![true, true, false, false, true, false]);
        assert_eq!(table.get("accuracy"), Some(0.9));
    }

    #[test]
    fn test_best_table_skips_params_and_non_finite() {
        let mut table = BestMetricTable::new();
        let improved = table.update(&record(&[("loss", f64::NAN), ("f1", 0.2)]));

        assert_eq!(improved, vec!["f1".to_string()]);
        assert_eq!(table.get(PARAMS_KEY), None);
        assert_eq!(table.get("loss"), None);
    }

    #[test]
    fn test_update_best_writes_one_checkpoint_per_improvement() {
        let temp_dir = TempDir::new().unwrap();
        let mut manager = CheckpointManager::new(temp_dir.path()).unwrap();
        let config = SupernetConfig::new(3, 2, vec![4]);
        let supernet = MlpSupernet::<TestBackend>::new(config, Default::default()).unwrap();

        let first = manager.update_best(&record(&[("accuracy", 1.0)]), &supernet);
        let second = manager.update_best(&record(&[("accuracy", 0.5)]), &supernet);

        assert_eq!(first, vec!["accuracy".to_string()]);
        assert!(second.is_empty());
        assert_eq!(manager.best_metrics().get("accuracy"), Some(1.0));
        assert!(manager.best_path("accuracy").exists());
        assert!(!manager.best_path(PARAMS_KEY).exists());
    }

    #[test]
    fn test_last_model_and_state() {
        let temp_dir = TempDir::new().unwrap();
        let manager = CheckpointManager::new(temp_dir.path()).unwrap();
        let config = SupernetConfig::new(3, 2, vec![4]);
        let supernet = MlpSupernet::<TestBackend>::new(config, Default::default()).unwrap();

        let path = manager.save_last(&supernet).unwrap();
        assert_eq!(path, temp_dir.path().join("last_model"));
        assert!(path.is_dir());

        let state = TrainingState {
            global_step: 12,
            epoch: 2,
            ..Default::default()
        };
        manager.write_state(&state).unwrap();
        let loaded = CheckpointManager::read_state(temp_dir.path()).unwrap();
        assert_eq!(loaded.global_step, 12);
        assert_eq!(loaded.epoch, 2);
    }

    #[test]
    fn test_failed_write_is_recoverable() {
        let temp_dir = TempDir::new().unwrap();
        let manager = CheckpointManager::new(temp_dir.path()).unwrap();
        // a plain file where the checkpoint directory should go
        fs::write(manager.last_path(), b"occupied").unwrap();

        let config = SupernetConfig::new(3, 2, vec![4]);
        let supernet = MlpSupernet::<TestBackend>::new(config, Default::default()).unwrap();
        let err = manager.save_last(&supernet).unwrap_err();
        assert!(err.is_recoverable());
    }
}
