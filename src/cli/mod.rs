use crate::data::SplitConfig;
use crate::training::TrainingConfig;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// supertrain: elastic supernet training
#[derive(Parser, Debug)]
#[command(name = "supertrain")]
#[command(about = "Train a weight-sharing supernet so every subnet stays usable")]
#[command(version)]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand
    #[command(subcommand)]
    pub command: Commands,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Train the reference MLP supernet on a tabular dataset
    Train(TrainArgs),

    /// Evaluate a saved supernet checkpoint
    Evaluate(EvaluateArgs),
}

/// Training arguments
#[derive(Parser, Debug)]
pub struct TrainArgs {
    /// Input data file (CSV or TSV, optionally gzipped)
    #[arg(short, long, required = true)]
    pub input: PathBuf,

    /// Output directory for checkpoints and logs
    #[arg(short, long, default_value = "./output")]
    pub output: PathBuf,

    /// Column holding the integer class label
    #[arg(long, default_value = "label")]
    pub label_column: String,

    /// Training configuration file (JSON)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Hidden widths of the full supernet
    #[arg(long, value_delimiter = ',', default_value = "128,64")]
    pub hidden_sizes: Vec<usize>,

    /// Number of training epochs
    #[arg(short, long)]
    pub epochs: Option<usize>,

    /// Per-device batch size
    #[arg(short, long)]
    pub batch_size: Option<usize>,

    /// Learning rate
    #[arg(long)]
    pub learning_rate: Option<f64>,

    /// Evaluate every this many steps (0 = never)
    #[arg(long)]
    pub eval_steps: Option<usize>,

    /// Write `last_model` every this many steps
    #[arg(long)]
    pub save_steps: Option<usize>,

    /// Stop after this many steps
    #[arg(long)]
    pub max_steps: Option<usize>,

    /// Random seed
    #[arg(long)]
    pub seed: Option<u64>,

    /// Evaluation split ratio
    #[arg(long, default_value = "0.1")]
    pub eval_ratio: f32,

    /// Test split ratio
    #[arg(long, default_value = "0.2")]
    pub test_ratio: f32,

    /// Number of in-process data-parallel ranks
    #[arg(long, default_value = "1")]
    pub world_size: usize,

    /// Quick test mode (one epoch, small batches)
    #[arg(long)]
    pub quick: bool,
}

impl TrainArgs {
    /// Training configuration: defaults or `--config`, then CLI overrides
    pub fn training_config(&self) -> anyhow::Result<TrainingConfig> {
        let mut config = match (&self.config, self.quick) {
            (Some(path), _) => TrainingConfig::from_json_file(path)?,
            (None, true) => TrainingConfig::quick_test(),
            (None, false) => TrainingConfig::default(),
        };

        config.output_dir = self.output.clone();
        if let Some(epochs) = self.epochs {
            config.num_train_epochs = epochs;
        }
        if let Some(batch_size) = self.batch_size {
            config.per_device_train_batch_size = batch_size;
            config.per_device_eval_batch_size = batch_size;
        }
        if let Some(lr) = self.learning_rate {
            config.learning_rate = lr;
        }
        if let Some(eval_steps) = self.eval_steps {
            config.eval_steps = eval_steps;
        }
        if let Some(save_steps) = self.save_steps {
            config.save_steps = save_steps;
        }
        if let Some(max_steps) = self.max_steps {
            config.max_steps = max_steps;
        }
        if let Some(seed) = self.seed {
            config.seed = seed;
        }
        Ok(config)
    }

    pub fn split_config(&self, seed: u64) -> SplitConfig {
        SplitConfig {
            train_ratio: 1.0 - self.eval_ratio - self.test_ratio,
            eval_ratio: self.eval_ratio,
            test_ratio: self.test_ratio,
            seed,
        }
    }
}

/// Evaluation arguments
#[derive(Parser, Debug)]
pub struct EvaluateArgs {
    /// Input data file with ground truth labels
    #[arg(short, long, required = true)]
    pub input: PathBuf,

    /// Supernet checkpoint directory, e.g. `output/accuracy_best_model`
    #[arg(short, long, required = true)]
    pub model: PathBuf,

    /// Column holding the integer class label
    #[arg(long, default_value = "label")]
    pub label_column: String,

    /// Evaluate the smallest subnet instead of the full supernet
    #[arg(long)]
    pub smallest: bool,

    /// Output file for the metrics report (JSON)
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Batch size for evaluation
    #[arg(short, long, default_value = "64")]
    pub batch_size: usize,
}

/// Parse CLI arguments
pub fn parse_args() -> Cli {
    Cli::parse()
}

/// Setup logging based on verbosity; `RUST_LOG` takes precedence
pub fn setup_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_cli_parse() {
        let cli = Cli::parse_from(["supertrain", "train", "-i", "data.csv"]);

        match cli.command {
            Commands::Train(args) => {
                assert_eq!(args.input, PathBuf::from("data.csv"));
                assert_eq!(args.hidden_sizes, vec![128, 64]);
                assert_eq!(args.world_size, 1);
            }
            _ => panic!("Expected Train command"),
        }
    }

    #[test]
    fn test_overrides_apply_on_top_of_config_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("train.json");
        std::fs::write(&path, r#"{"num_train_epochs": 7, "learning_rate": 0.01}"#).unwrap();

        let cli = Cli::parse_from([
            "supertrain",
            "train",
            "-i",
            "data.csv",
            "-c",
            path.to_str().unwrap(),
            "--learning-rate",
            "0.5",
            "--world-size",
            "2",
            "--hidden-sizes",
            "16,8",
        ]);

        match cli.command {
            Commands::Train(args) => {
                let config = args.training_config().unwrap();
                assert_eq!(config.num_train_epochs, 7);
                assert_eq!(config.learning_rate, 0.5);
                assert_eq!(config.output_dir, PathBuf::from("./output"));
                assert_eq!(args.world_size, 2);
                assert_eq!(args.hidden_sizes, vec![16, 8]);
            }
            _ => panic!("Expected Train command"),
        }
    }

    #[test]
    fn test_evaluate_args() {
        let cli = Cli::parse_from([
            "supertrain",
            "evaluate",
            "-i",
            "test.csv",
            "-m",
            "out/accuracy_best_model",
            "--smallest",
        ]);

        match cli.command {
            Commands::Evaluate(args) => {
                assert_eq!(args.model, PathBuf::from("out/accuracy_best_model"));
                assert!(args.smallest);
                assert_eq!(args.label_column, "label");
            }
            _ => panic!("Expected Evaluate command"),
        }
    }
}
