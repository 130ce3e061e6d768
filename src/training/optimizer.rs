use crate::model::{SubnetHandle, SubnetModel};
use crate::training::scheduler::LrSchedule;
use crate::training::TrainingConfig;
use burn::optim::{AdamWConfig, GradientsParams, Optimizer};
use burn::tensor::backend::AutodiffBackend;
use std::marker::PhantomData;
use tracing::debug;

/// Builds the optimizer and schedule for each newly activated subnet
#[derive(Debug, Clone)]
pub struct OptimizerFactory {
    learning_rate: f64,
    weight_decay: f64,
}

impl OptimizerFactory {
    pub fn new(learning_rate: f64, weight_decay: f64) -> Self {
        Self {
            learning_rate,
            weight_decay,
        }
    }

    pub fn from_config(config: &TrainingConfig) -> Self {
        Self::new(config.learning_rate, config.weight_decay)
    }

    /// Activate `subnet` with a fresh AdamW optimizer
    ///
    /// `schedule` is rebound with its step count when given; otherwise a new
    /// schedule starts at step 0.
    pub fn create<B, M>(
        &self,
        subnet: SubnetHandle<M>,
        schedule: Option<LrSchedule>,
    ) -> ActiveSubnet<B, M, impl Optimizer<M, B>>
    where
        B: AutodiffBackend,
        M: SubnetModel<B>,
    {
        let optimizer = AdamWConfig::new()
            .with_weight_decay(self.weight_decay as f32)
            .init::<B, M>();

        let schedule = match schedule {
            Some(schedule) => {
                debug!("Rebinding schedule at step {}", schedule.current_step());
                schedule
            }
            None => LrSchedule::new(self.learning_rate),
        };

        ActiveSubnet {
            handle: subnet,
            optimizer,
            schedule,
            _backend: PhantomData,
        }
    }
}

/// A subnet together with the optimizer built for its parameters
///
/// The pair is created and dropped together; there is no way to swap the
/// model under an existing optimizer.
pub struct ActiveSubnet<B, M, O> {
    handle: SubnetHandle<M>,
    optimizer: O,
    schedule: LrSchedule,
    _backend: PhantomData<B>,
}

impl<B, M, O> ActiveSubnet<B, M, O>
where
    B: AutodiffBackend,
    M: SubnetModel<B>,
    O: Optimizer<M, B>,
{
    pub fn model(&self) -> &M {
        &self.handle.model
    }

    pub fn handle(&self) -> &SubnetHandle<M> {
        &self.handle
    }

    /// Declared parameter count of the active subnet
    pub fn params(&self) -> usize {
        self.handle.param_count
    }

    /// Learning rate the next optimizer step will use
    pub fn learning_rate(&self) -> f64 {
        self.schedule.get_lr()
    }

    pub fn schedule(&self) -> &LrSchedule {
        &self.schedule
    }

    /// One optimizer step followed by one schedule step
    pub fn apply_gradients(&mut self, grads: GradientsParams) -> f64 {
        let lr = self.schedule.get_lr();
        let model = self.handle.model.clone();
        self.handle.model = self.optimizer.step(lr, model, grads);
        self.schedule.step();
        lr
    }

    /// Release the subnet, keeping the schedule for the next one
    pub fn into_parts(self) -> (SubnetHandle<M>, LrSchedule) {
        (self.handle, self.schedule)
    }
}
