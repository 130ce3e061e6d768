use anyhow::{bail, Context, Result};
use std::sync::Arc;
use supertrain::cli::{parse_args, setup_logging, Commands, EvaluateArgs, TrainArgs};
use supertrain::data::loader::{load_tabular, BatchSource, DataLoader, LoaderConfig};
use supertrain::data::{DatasetSplits, ShardedDataset, TabularCollator, TabularExample};
use supertrain::model::supernet::MlpSupernet;
use supertrain::model::{ElasticSupernet, SupernetConfig};
use supertrain::training::distributed::{self, device_for_rank};
use supertrain::training::evaluator::{Evaluator, MetricFn};
use supertrain::training::logger::format_metrics;
use supertrain::training::metrics::classification_metrics;
use supertrain::training::trainer::Trainer;
use supertrain::training::{TrainingConfig, TrainingSummary};
use supertrain::DefaultBackend;
use tracing::{error, info, warn};

fn main() {
    let cli = parse_args();

    setup_logging(cli.verbose);

    info!("{}", supertrain::info());

    let result = match cli.command {
        Commands::Train(args) => run_train(args),
        Commands::Evaluate(args) => run_evaluate(args),
    };

    if let Err(e) = result {
        error!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn run_train(args: TrainArgs) -> Result<()> {
    let mut config = args.training_config()?;
    info!("Input file: {:?}", args.input);
    info!("Output directory: {:?}", config.output_dir);

    supertrain::utils::ensure_dir(&config.output_dir)?;

    let examples = load_tabular(&args.input, &args.label_column)
        .with_context(|| format!("Failed to load data from {:?}", args.input))?;
    let input_size = examples
        .first()
        .map(|e| e.features.len())
        .context("Input file has no usable rows")?;
    if let Some(bad) = examples.iter().find(|e| e.label < 0) {
        bail!("Class labels must be non-negative, found {}", bad.label);
    }
    let num_classes = examples.iter().map(|e| e.label).max().unwrap_or(0) as usize + 1;

    let splits = DatasetSplits::split(examples, &args.split_config(config.seed));
    info!(
        "Split {} examples: train={}, eval={}, test={}",
        splits.total_samples(),
        splits.train.len(),
        splits.eval.len(),
        splits.test.len()
    );
    if splits.eval.is_empty() && config.eval_steps > 0 {
        warn!("Evaluation split is empty, periodic evaluation disabled");
        config.eval_steps = 0;
    }

    let supernet_config = SupernetConfig::new(input_size, num_classes, args.hidden_sizes.clone())
        .with_seed(config.seed);
    let metric_fn: Arc<dyn MetricFn> = Arc::new(classification_metrics);

    let summary = if args.world_size <= 1 {
        train_single(&config, supernet_config, &splits, metric_fn)?
    } else {
        train_distributed(&config, supernet_config, &splits, metric_fn, args.world_size)?
    };

    info!("=== Training Results ===");
    info!("Epochs: {}", summary.state.epoch);
    info!("Global steps: {}", summary.state.global_step);
    info!(
        "Training time: {}",
        supertrain::utils::format_duration(summary.duration_secs)
    );
    for (metric, value) in &summary.state.best_metrics {
        info!("Best {}: {:.4}", metric, value);
    }
    if let Some(checkpoint) = &summary.last_checkpoint {
        info!("Last model saved to: {:?}", checkpoint);
    }

    Ok(())
}

fn build_eval_loader(
    examples: &[TabularExample],
    config: &TrainingConfig,
) -> Result<Option<DataLoader<Vec<TabularExample>, TabularCollator>>> {
    if examples.is_empty() {
        return Ok(None);
    }
    let loader = DataLoader::new(
        examples.to_vec(),
        TabularCollator,
        LoaderConfig::eval(config.per_device_eval_batch_size, config.dataloader_num_workers),
    )?;
    Ok(Some(loader))
}

fn train_single(
    config: &TrainingConfig,
    supernet_config: SupernetConfig,
    splits: &DatasetSplits<TabularExample>,
    metric_fn: Arc<dyn MetricFn>,
) -> Result<TrainingSummary> {
    let device = device_for_rank::<DefaultBackend>(0);
    let supernet = MlpSupernet::<DefaultBackend>::new(supernet_config, device.clone())?;
    info!("Supernet has {} parameters", supernet.total_params());

    let train_loader = DataLoader::new(
        splits.train.clone(),
        TabularCollator,
        LoaderConfig::train(
            config.per_device_train_batch_size,
            config.dataloader_num_workers,
            config.seed,
        ),
    )?;
    let eval_loader = build_eval_loader(&splits.eval, config)?;
    let test_loader = build_eval_loader(&splits.test, config)?;

    let mut trainer = Trainer::new(supernet, config.clone(), device)?.with_metric_fn(metric_fn);
    let summary = trainer.train(
        &train_loader,
        eval_loader.as_ref().map(|l| l as &dyn BatchSource),
    )?;

    if let Some(test_loader) = &test_loader {
        if let Some(metrics) = trainer.test(test_loader)? {
            info!("Test metrics: {}", format_metrics(&metrics));
        }
    }

    Ok(summary)
}

fn train_distributed(
    config: &TrainingConfig,
    supernet_config: SupernetConfig,
    splits: &DatasetSplits<TabularExample>,
    metric_fn: Arc<dyn MetricFn>,
    world_size: usize,
) -> Result<TrainingSummary> {
    // every replica starts from the same weights
    let initial = MlpSupernet::<DefaultBackend>::new(
        supernet_config.clone(),
        device_for_rank::<DefaultBackend>(0),
    )?;
    let weights = initial.weights().clone();
    info!(
        "Supernet has {} parameters, training on {} ranks",
        initial.total_params(),
        world_size
    );

    let eval_loader = build_eval_loader(&splits.eval, config)?;

    let mut summaries = distributed::launch(world_size, |rank, sync| {
        let device = device_for_rank::<DefaultBackend>(rank);
        let supernet = MlpSupernet::<DefaultBackend>::from_weights(
            supernet_config.clone(),
            weights.clone(),
            device.clone(),
        );

        let mut rank_config = config.clone();
        rank_config.show_progress &= rank == 0;

        let shard = ShardedDataset::new(&splits.train, rank, world_size);
        let train_loader = DataLoader::new(
            shard,
            TabularCollator,
            LoaderConfig::train(
                rank_config.per_device_train_batch_size,
                rank_config.dataloader_num_workers,
                rank_config.seed,
            ),
        )?;

        let mut trainer = Trainer::with_sync(supernet, rank_config, device, sync)?
            .with_metric_fn(metric_fn.clone());
        let eval = if rank == 0 {
            eval_loader.as_ref().map(|l| l as &dyn BatchSource)
        } else {
            None
        };
        trainer.train(&train_loader, eval)
    })?;

    Ok(summaries.swap_remove(0))
}

fn run_evaluate(args: EvaluateArgs) -> Result<()> {
    info!("Input file: {:?}", args.input);
    info!("Model: {:?}", args.model);

    let device = device_for_rank::<DefaultBackend>(0);
    let supernet = MlpSupernet::<DefaultBackend>::load_ckpt(&args.model, device.clone())
        .with_context(|| format!("Failed to load model from {:?}", args.model))?;

    let examples = load_tabular(&args.input, &args.label_column)
        .with_context(|| format!("Failed to load data from {:?}", args.input))?;
    let loader = DataLoader::new(examples, TabularCollator, LoaderConfig::eval(args.batch_size, 0))?;

    let subnet = if args.smallest {
        supernet.smallest_model()?
    } else {
        supernet.full_model()?
    };

    let metric_fn: &dyn MetricFn = &classification_metrics;
    let metrics = Evaluator::new(Some(metric_fn))
        .evaluate::<DefaultBackend, _>(&subnet, &loader, &device)?
        .context("Metric computation failed")?;

    info!("=== Evaluation Results ===");
    info!("{}", format_metrics(&metrics));

    if let Some(output) = args.output {
        let report = serde_json::to_string_pretty(&metrics)?;
        std::fs::write(&output, report)?;
        info!("Evaluation report saved to: {:?}", output);
    }

    Ok(())
}
