use crate::data::loader::BatchSource;
use crate::data::DeviceBatch;
use crate::error::{Result, TrainerError};
use crate::model::checkpoint::{BestMetricTable, CheckpointManager};
use crate::model::state::HostTensor;
use crate::model::{ElasticSupernet, SubnetHandle};
use crate::training::evaluator::{Evaluator, MetricFn};
use crate::training::logger::{progress_bar, MetricsLogger};
use crate::training::optimizer::OptimizerFactory;
use crate::training::scheduler::LrSchedule;
use crate::training::step::{teacher_logits, training_step, GradientSync, LocalSync};
use crate::training::{MetricsRecord, TrainingConfig, TrainingState, TrainingSummary};
use burn::tensor::backend::AutodiffBackend;
use std::marker::PhantomData;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Namespace of the full supernet pass
pub const SUPERNET_NS: &str = "steps/supernet";
/// Namespace of the smallest subnet pass
pub const SMALLEST_SUBNET_NS: &str = "steps/smallest-subnet";
/// Namespace of the sampled subnet pass
pub const SUBNET_NS: &str = "steps/subnet";

/// Which subnet a pass trains
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pass {
    Supernet,
    Smallest,
    Sampled,
}

impl Pass {
    fn namespace(self) -> &'static str {
        match self {
            Pass::Supernet => SUPERNET_NS,
            Pass::Smallest => SMALLEST_SUBNET_NS,
            Pass::Sampled => SUBNET_NS,
        }
    }

    fn eval_namespace(self) -> &'static str {
        match self {
            Pass::Supernet => "eval/supernet",
            Pass::Smallest => "eval/smallest-subnet",
            Pass::Sampled => "eval/subnet",
        }
    }
}

/// Elastic supernet trainer
///
/// Every batch trains three configurations in order: the full supernet, the
/// smallest subnet and a sampled subnet. The two subnets distill from the
/// full model's logits on the same batch, taken after its update.
pub struct Trainer<B: AutodiffBackend, S: ElasticSupernet<B>, G: GradientSync<B> = LocalSync> {
    /// Shared weights
    supernet: S,
    /// Training configuration
    config: TrainingConfig,
    /// Device
    device: B::Device,
    /// Builds an optimizer per activated subnet
    factory: OptimizerFactory,
    /// Cross-replica gradient averaging
    sync: G,
    /// Evaluation metric
    metric_fn: Option<Arc<dyn MetricFn>>,
    /// Metrics stream
    logger: MetricsLogger,
    /// Checkpoint manager, main replica only
    checkpoints: Option<CheckpointManager>,
    /// Loop progress
    state: TrainingState,
    _backend: PhantomData<B>,
}

impl<B, S> Trainer<B, S, LocalSync>
where
    B: AutodiffBackend,
    S: ElasticSupernet<B>,
{
    /// Create new single-process trainer
    pub fn new(supernet: S, config: TrainingConfig, device: B::Device) -> Result<Self> {
        Self::with_sync(supernet, config, device, LocalSync)
    }
}

impl<B, S, G> Trainer<B, S, G>
where
    B: AutodiffBackend,
    S: ElasticSupernet<B>,
    G: GradientSync<B>,
{
    /// Create new trainer synchronizing gradients through `sync`
    ///
    /// Only the main replica writes logs and checkpoints.
    pub fn with_sync(
        supernet: S,
        config: TrainingConfig,
        device: B::Device,
        sync: G,
    ) -> Result<Self> {
        config.validate()?;

        let (logger, checkpoints) = if sync.is_main_process() {
            let logger = MetricsLogger::new(config.logs_dir()).map_err(|source| {
                TrainerError::OutputDir {
                    path: config.logs_dir(),
                    source,
                }
            })?;
            let checkpoints = CheckpointManager::new(&config.output_dir).map_err(|source| {
                TrainerError::OutputDir {
                    path: config.output_dir.clone(),
                    source,
                }
            })?;
            (logger, Some(checkpoints))
        } else {
            (MetricsLogger::tracing_only(), None)
        };

        Ok(Self {
            supernet,
            factory: OptimizerFactory::from_config(&config),
            config,
            device,
            sync,
            metric_fn: None,
            logger,
            checkpoints,
            state: TrainingState::new(),
            _backend: PhantomData,
        })
    }

    /// Set the evaluation metric
    pub fn with_metric_fn(mut self, metric_fn: Arc<dyn MetricFn>) -> Self {
        self.metric_fn = Some(metric_fn);
        self
    }

    pub fn supernet(&self) -> &S {
        &self.supernet
    }

    pub fn into_supernet(self) -> S {
        self.supernet
    }

    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    pub fn logger(&self) -> &MetricsLogger {
        &self.logger
    }

    pub fn state(&self) -> &TrainingState {
        &self.state
    }

    /// Best metric table, empty on non-main replicas
    pub fn best_metrics(&self) -> BestMetricTable {
        self.checkpoints
            .as_ref()
            .map(|c| c.best_metrics().clone())
            .unwrap_or_default()
    }

    /// Run the elastic training loop
    ///
    /// `eval_loader` is required when `eval_steps > 0` on the main replica.
    pub fn train(
        &mut self,
        train_loader: &dyn BatchSource,
        eval_loader: Option<&dyn BatchSource>,
    ) -> Result<TrainingSummary> {
        let is_main = self.sync.is_main_process();
        let eval_loader = if is_main && self.config.eval_steps > 0 {
            Some(eval_loader.ok_or(TrainerError::MissingSplit { split: "eval" })?)
        } else {
            None
        };

        info!("Starting training with configuration: {:?}", self.config);
        let start_time = Instant::now();

        let batches_per_epoch = train_loader.num_batches();
        let mut total_steps = self.config.num_train_epochs * batches_per_epoch;
        if self.config.max_steps > 0 {
            total_steps = total_steps.min(self.config.max_steps);
        }
        let progress = progress_bar(total_steps as u64, self.config.show_progress && is_main);

        let mut schedule: Option<LrSchedule> = None;
        let mut last_metrics = None;
        let mut last_checkpoint = None;

        let mut reached_max_steps = false;
        for epoch in 0..self.config.num_train_epochs {
            self.state.epoch = epoch;
            info!("Epoch {}/{}", epoch + 1, self.config.num_train_epochs);

            for batch in train_loader.iter_epoch(epoch) {
                if self.config.max_steps > 0 && self.state.global_step >= self.config.max_steps {
                    info!("Reached max_steps = {}", self.config.max_steps);
                    reached_max_steps = true;
                    break;
                }

                let batch = batch?.to_device::<B>(&self.device)?;
                let step = self.state.global_step;
                let evaluate = self.config.eval_steps > 0 && (step + 1) % self.config.eval_steps == 0;

                // teacher pass
                let full = self.supernet.full_model().map_err(TrainerError::Collaborator)?;
                let (metrics, soft_labels, rest) = self.run_pass(
                    Pass::Supernet,
                    full,
                    &batch,
                    None,
                    schedule.take(),
                    eval_loader.filter(|_| evaluate),
                )?;
                schedule = Some(rest);
                last_metrics = Some(metrics);

                // student passes on the same batch
                let smallest = self.supernet.smallest_model().map_err(TrainerError::Collaborator)?;
                let (_, _, rest) = self.run_pass(
                    Pass::Smallest,
                    smallest,
                    &batch,
                    soft_labels.as_ref(),
                    schedule.take(),
                    eval_loader.filter(|_| evaluate),
                )?;
                schedule = Some(rest);

                let sampled = self
                    .supernet
                    .random_resource_aware_model()
                    .map_err(TrainerError::Collaborator)?;
                let (_, _, rest) = self.run_pass(
                    Pass::Sampled,
                    sampled,
                    &batch,
                    soft_labels.as_ref(),
                    schedule.take(),
                    eval_loader.filter(|_| evaluate),
                )?;
                schedule = Some(rest);

                self.state.global_step += 1;
                progress.inc(1);

                if self.config.save_steps > 0 && self.state.global_step % self.config.save_steps == 0 {
                    last_checkpoint = self.save_last()?.or(last_checkpoint);
                }
            }

            last_checkpoint = self.save_last()?.or(last_checkpoint);
            if reached_max_steps {
                break;
            }
        }

        progress.finish_and_clear();

        self.state.best_metrics = self
            .best_metrics()
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect();
        if let Some(checkpoints) = &self.checkpoints {
            report_checkpoint_error(checkpoints.write_state(&self.state))?;
        }

        let duration_secs = start_time.elapsed().as_secs_f64();
        info!(
            "Training completed in {:.2}s ({} steps)",
            duration_secs, self.state.global_step
        );

        Ok(TrainingSummary {
            state: self.state.clone(),
            last_metrics,
            last_checkpoint,
            duration_secs,
        })
    }

    /// Train one subnet on the batch, then evaluate it when due
    ///
    /// Returns the step metrics, the post-step logits of the subnet on this
    /// batch (teacher pass only) and the schedule to rebind.
    fn run_pass(
        &mut self,
        pass: Pass,
        subnet: SubnetHandle<S::Model>,
        batch: &DeviceBatch<B>,
        soft_labels: Option<&HostTensor>,
        schedule: Option<LrSchedule>,
        eval_loader: Option<&dyn BatchSource>,
    ) -> Result<(MetricsRecord, Option<HostTensor>, LrSchedule)> {
        let namespace = pass.namespace();
        let step = self.state.global_step;
        debug!("{} step {}: {} params", namespace, step, subnet.param_count);

        let mut active = self.factory.create(subnet, schedule);
        let output = training_step(
            &mut self.supernet,
            &mut active,
            batch,
            soft_labels,
            &self.sync,
            namespace,
            step,
        )?;
        let mut metrics = output.metrics;
        metrics.insert("lr", output.learning_rate);
        self.logger.log_metrics(&metrics, step, namespace);

        if let Some(loader) = eval_loader {
            if let Some(eval_metrics) = self.evaluate_subnet(active.handle(), loader)? {
                self.logger.log_metrics(&eval_metrics, step, pass.eval_namespace());
                if pass == Pass::Supernet {
                    if let Some(checkpoints) = &mut self.checkpoints {
                        checkpoints.update_best(&eval_metrics, &self.supernet);
                    }
                }
            }
        }

        let logits = match pass {
            Pass::Supernet => Some(teacher_logits(active.model(), batch)?),
            Pass::Smallest | Pass::Sampled => None,
        };

        let (_, schedule) = active.into_parts();
        Ok((metrics, logits, schedule))
    }

    /// Evaluate a subnet without touching the best-metric table
    pub fn evaluate_subnet(
        &self,
        subnet: &SubnetHandle<S::Model>,
        loader: &dyn BatchSource,
    ) -> Result<Option<MetricsRecord>> {
        Evaluator::new(self.metric_fn.as_deref()).evaluate::<B, _>(subnet, loader, &self.device)
    }

    /// Evaluate the full supernet
    pub fn evaluate(&self, loader: &dyn BatchSource) -> Result<Option<MetricsRecord>> {
        let full = self.supernet.full_model().map_err(TrainerError::Collaborator)?;
        self.evaluate_subnet(&full, loader)
    }

    /// Evaluate the full supernet on the test split and log under `test/supernet`
    pub fn test(&mut self, loader: &dyn BatchSource) -> Result<Option<MetricsRecord>> {
        let metrics = self.evaluate(loader)?;
        if let Some(metrics) = &metrics {
            self.logger
                .log_metrics(metrics, self.state.global_step, "test/supernet");
        }
        Ok(metrics)
    }

    fn save_last(&self) -> Result<Option<PathBuf>> {
        match &self.checkpoints {
            Some(checkpoints) => {
                let saved = checkpoints.save_last(&self.supernet);
                report_checkpoint_error(saved)
            }
            None => Ok(None),
        }
    }
}

/// Log recoverable checkpoint failures and keep training
fn report_checkpoint_error<T>(result: Result<T>) -> Result<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(err) if err.is_recoverable() => {
            warn!("{}", err);
            Ok(None)
        }
        Err(err) => Err(err),
    }
}
