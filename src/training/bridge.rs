use crate::error::{Result, TrainerError};
use crate::model::state::{HostTensor, StateDict};
use crate::model::ElasticSupernet;
use burn::tensor::backend::AutodiffBackend;
use tracing::debug;

/// Per-parameter `before - after` difference from one local step
///
/// A positive entry means the parameter shrank, so it is folded back into
/// the supernet by subtraction.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WeightDelta {
    entries: StateDict,
}

impl WeightDelta {
    /// Difference of two host snapshots with identical key sets
    pub fn between(before: &StateDict, after: &StateDict) -> Result<Self> {
        if before.len() != after.len() {
            return Err(TrainerError::config(format!(
                "parameter snapshot changed size during the step ({} -> {})",
                before.len(),
                after.len()
            )));
        }

        let mut entries = StateDict::new();
        for (name, old) in before {
            let new = after
                .get(name)
                .ok_or_else(|| TrainerError::UnknownParameter(name.clone()))?;
            entries.insert(name.clone(), old.sub(new)?);
        }
        Ok(Self { entries })
    }

    pub fn from_entries(entries: StateDict) -> Self {
        Self { entries }
    }

    pub fn get(&self, name: &str) -> Option<&HostTensor> {
        self.entries.get(name)
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.entries.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &HostTensor)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Largest absolute entry, for logging
    pub fn max_abs(&self) -> f32 {
        self.entries
            .values()
            .flat_map(|t| t.values().iter())
            .fold(0.0f32, |acc, v| acc.max(v.abs()))
    }
}

/// The one place where a subnet's local update reaches the shared weights
pub struct GradientBridge;

impl GradientBridge {
    /// Hand `delta` to the supernet after checking it only names supernet parameters
    pub fn apply<B, S>(supernet: &mut S, delta: &WeightDelta) -> Result<()>
    where
        B: AutodiffBackend,
        S: ElasticSupernet<B>,
    {
        let known = supernet.parameter_names();
        if let Some(unknown) = delta.keys().find(|k| !known.contains(k.as_str())) {
            return Err(TrainerError::UnknownParameter(unknown.clone()));
        }

        debug!(
            "Applying weight delta over {} parameters (max |delta| = {:.3e})",
            delta.len(),
            delta.max_abs()
        );
        supernet.apply_grad(delta).map_err(TrainerError::Collaborator)
    }
}
