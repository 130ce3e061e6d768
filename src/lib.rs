//! # supertrain: Elastic Supernet Training
//!
//! Trains a weight-sharing supernet so that every subnet carved out of it
//! stays usable. Each batch updates the full supernet, the smallest subnet
//! and a randomly sampled subnet; the two subnets learn from the full
//! model's logits (in-place distillation).
//!
//! ## Features
//!
//! - Per-subnet optimizers with a shared exponential LR schedule
//! - Weight-delta aggregation back into the shared weights
//! - Best-metric checkpointing and a JSONL metrics stream
//! - In-process data-parallel training with gradient all-reduce
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use supertrain::data::loader::{DataLoader, LoaderConfig};
//! use supertrain::data::{TabularCollator, TabularExample};
//! use supertrain::model::supernet::MlpSupernet;
//! use supertrain::model::SupernetConfig;
//! use supertrain::training::{trainer::Trainer, TrainingConfig};
//! use supertrain::DefaultBackend;
//!
//! let examples: Vec<TabularExample> = (0..64)
//!     .map(|i| TabularExample::new(vec![i as f32, 1.0], i % 2))
//!     .collect();
//! let loader = DataLoader::new(examples, TabularCollator, LoaderConfig::train(8, 0, 42)).unwrap();
//!
//! let device = Default::default();
//! let supernet =
//!     MlpSupernet::<DefaultBackend>::new(SupernetConfig::tabular(2, 2), device).unwrap();
//! let config = TrainingConfig { eval_steps: 0, ..TrainingConfig::default() };
//! let mut trainer = Trainer::new(supernet, config, device).unwrap();
//! let summary = trainer.train(&loader, None).unwrap();
//! ```

pub mod cli;
pub mod data;
pub mod error;
pub mod model;
pub mod training;
pub mod utils;

use burn::backend::Autodiff;
use burn_ndarray::NdArray;

/// Default backend type
pub type DefaultBackend = Autodiff<NdArray<f32>>;

/// Re-export commonly used types
pub use data::loader::{BatchSource, DataLoader};
pub use data::{Batch, Collator, Dataset};
pub use error::{DistributedError, TrainerError};
pub use model::supernet::MlpSupernet;
pub use model::{ElasticSupernet, SubnetHandle, SupernetConfig};
pub use training::bridge::WeightDelta;
pub use training::trainer::Trainer;
pub use training::{MetricsRecord, TrainingConfig, TrainingSummary};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");

/// Get library information
pub fn info() -> String {
    format!("{} v{} - elastic supernet training", NAME, VERSION)
}
