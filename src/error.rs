use std::path::PathBuf;
use thiserror::Error;

/// Errors raised by the collective process group
#[derive(Debug, Error)]
pub enum DistributedError {
    #[error("rank {rank} is out of range for world size {world_size}")]
    InvalidRank { rank: usize, world_size: usize },

    #[error("rank {0} already joined the process group")]
    DuplicateRank(usize),

    #[error("process group was torn down while rank {rank} was waiting in a collective")]
    GroupClosed { rank: usize },

    #[error("collective length mismatch: rank {rank} sent {got} values, expected {expected}")]
    LengthMismatch {
        rank: usize,
        expected: usize,
        got: usize,
    },

    #[error("replicas sampled divergent subnets for {namespace} at step {step}")]
    DivergentSubnets { namespace: String, step: usize },

    #[error("rank {rank} panicked")]
    RankPanicked { rank: usize },
}

/// Errors raised by the elastic training core
#[derive(Debug, Error)]
pub enum TrainerError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("{split} split is required but no dataset was supplied")]
    MissingSplit { split: &'static str },

    #[error("non-finite loss {value} in {namespace} at step {step}")]
    NonFiniteLoss {
        namespace: String,
        step: usize,
        value: f64,
    },

    #[error("trainable parameter {param} received no gradient, the subnet wiring is broken")]
    MissingGradient { param: String },

    #[error("weight delta key {0} is not a supernet parameter")]
    UnknownParameter(String),

    #[error("shape mismatch for {name}: expected {expected:?}, got {got:?}")]
    Shape {
        name: String,
        expected: Vec<usize>,
        got: Vec<usize>,
    },

    #[error("data error: {0}")]
    Data(String),

    #[error(transparent)]
    Distributed(#[from] DistributedError),

    #[error("failed to write checkpoint {path:?}: {source}")]
    Checkpoint {
        path: PathBuf,
        #[source]
        source: anyhow::Error,
    },

    #[error("failed to prepare output directory {path:?}: {source}")]
    OutputDir {
        path: PathBuf,
        #[source]
        source: anyhow::Error,
    },

    #[error("supernet collaborator failed: {0}")]
    Collaborator(#[source] anyhow::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl TrainerError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn data(msg: impl Into<String>) -> Self {
        Self::Data(msg.into())
    }

    /// Whether the training loop may continue after this error
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Checkpoint { .. })
    }
}

pub type Result<T> = std::result::Result<T, TrainerError>;
