use crate::data::DeviceBatch;
use crate::error::{Result, TrainerError};
use crate::model::loss::compose_loss;
use crate::model::state::HostTensor;
use crate::model::{ElasticModule, ElasticSupernet, SubnetModel};
use crate::training::bridge::{GradientBridge, WeightDelta};
use crate::training::optimizer::ActiveSubnet;
use crate::training::MetricsRecord;
use burn::module::{AutodiffModule, ModuleVisitor, ParamId};
use burn::optim::{GradientsParams, Optimizer};
use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;
use burn::tensor::ElementConversion;
use std::marker::PhantomData;
use tracing::trace;

/// How gradients and step results are shared between replicas
pub trait GradientSync<B: AutodiffBackend> {
    /// Replace every trainable gradient with its cross-replica mean
    fn synchronize<M: AutodiffModule<B>>(
        &self,
        model: &M,
        grads: GradientsParams,
    ) -> Result<GradientsParams>;

    /// Sum a scalar loss over replicas
    fn reduce_loss(&self, loss: f64) -> Result<f64> {
        Ok(loss)
    }

    /// Fail if replicas are about to train different subnets
    fn verify_subnet(&self, _fingerprint: u64, _namespace: &str, _step: usize) -> Result<()> {
        Ok(())
    }

    /// Whether this replica evaluates, checkpoints and writes logs
    fn is_main_process(&self) -> bool {
        true
    }
}

/// Single-process training, gradients pass through untouched
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalSync;

impl<B: AutodiffBackend> GradientSync<B> for LocalSync {
    fn synchronize<M: AutodiffModule<B>>(
        &self,
        _model: &M,
        grads: GradientsParams,
    ) -> Result<GradientsParams> {
        Ok(grads)
    }
}

/// Result of one elastic training step
#[derive(Debug, Clone)]
pub struct StepOutput {
    /// `train_loss` and `params`
    pub metrics: MetricsRecord,
    /// Learning rate the optimizer step used
    pub learning_rate: f64,
}

/// Train the active subnet on one batch and fold its update into the supernet
///
/// The loss is the supervised loss, plus the distillation term when
/// `soft_labels` (teacher logits on this batch) are given. The weight delta is
/// computed on the host as before minus after and handed to the bridge
/// before returning.
pub fn training_step<B, S, O, G>(
    supernet: &mut S,
    active: &mut ActiveSubnet<B, S::Model, O>,
    batch: &DeviceBatch<B>,
    soft_labels: Option<&HostTensor>,
    sync: &G,
    namespace: &str,
    step: usize,
) -> Result<StepOutput>
where
    B: AutodiffBackend,
    S: ElasticSupernet<B>,
    O: Optimizer<S::Model, B>,
    G: GradientSync<B>,
{
    sync.verify_subnet(active.handle().fingerprint(), namespace, step)?;

    let before = active.model().state_dict()?;

    let output = active.model().forward_batch(batch);
    let teacher = soft_labels
        .map(|logits| logits.to_tensor::<B, 2>(&batch.inputs.device()))
        .transpose()?;
    let loss = compose_loss(output.loss, output.logits, teacher);

    let local_loss: f64 = loss.clone().into_scalar().elem();
    let total_loss = sync.reduce_loss(local_loss)?;
    if !total_loss.is_finite() {
        return Err(TrainerError::NonFiniteLoss {
            namespace: namespace.to_string(),
            step,
            value: total_loss,
        });
    }

    let grads = GradientsParams::from_grads(loss.backward(), active.model());
    check_gradients(active.model(), &grads)?;
    let grads = sync.synchronize(active.model(), grads)?;
    let learning_rate = active.apply_gradients(grads);

    let after = active.model().state_dict()?;
    let delta = WeightDelta::between(&before, &after)?;
    GradientBridge::apply(supernet, &delta)?;

    trace!(
        "{} step {}: loss {:.6}, lr {:.3e}",
        namespace,
        step,
        total_loss,
        learning_rate
    );

    let mut metrics = MetricsRecord::with_params(active.params());
    metrics.insert("train_loss", total_loss);
    Ok(StepOutput {
        metrics,
        learning_rate,
    })
}

/// Logits of `model` on `batch`, computed without a graph and copied to the host
pub fn teacher_logits<B, M>(model: &M, batch: &DeviceBatch<B>) -> Result<HostTensor>
where
    B: AutodiffBackend,
    M: SubnetModel<B>,
{
    let logits = model.valid().forward_logits(batch.inputs.clone().inner());
    HostTensor::from_tensor(logits)
}

/// Every parameter that requires a gradient must have received one
fn check_gradients<B, M>(model: &M, grads: &GradientsParams) -> Result<()>
where
    B: AutodiffBackend,
    M: AutodiffModule<B>,
{
    let mut visitor = GradientPresence::<B> {
        grads,
        index: 0,
        missing: None,
        _backend: PhantomData,
    };
    model.visit(&mut visitor);

    match visitor.missing {
        Some(param) => Err(TrainerError::MissingGradient { param }),
        None => Ok(()),
    }
}

struct GradientPresence<'a, B> {
    grads: &'a GradientsParams,
    index: usize,
    missing: Option<String>,
    _backend: PhantomData<B>,
}

impl<B: AutodiffBackend> ModuleVisitor<B> for GradientPresence<'_, B> {
    fn visit_float<const D: usize>(&mut self, id: ParamId, tensor: &Tensor<B, D>) {
        let index = self.index;
        self.index += 1;
        if self.missing.is_some() || !tensor.is_require_grad() {
            return;
        }
        if self.grads.get::<B::InnerBackend, D>(id).is_none() {
            self.missing = Some(format!("#{index} ({id})"));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{Batch, Collator, TabularCollator, TabularExample};
    use crate::model::supernet::MlpSupernet;
    use crate::model::SupernetConfig;
    use crate::training::optimizer::OptimizerFactory;
    use burn::backend::{Autodiff, NdArray};

    type TestBackend = Autodiff<NdArray<f32>>;

    fn batch() -> Batch {
        TabularCollator
            .collate(vec![
                TabularExample::new(vec![1.0, 0.0, -1.0], 0),
                TabularExample::new(vec![0.5, 2.0, 0.0], 1),
            ])
            .unwrap()
    }

    fn supernet() -> MlpSupernet<TestBackend> {
        let config = SupernetConfig::new(3, 2, vec![8]).with_width_step(2);
        MlpSupernet::new(config, Default::default()).unwrap()
    }

    #[test]
    fn test_step_folds_delta_into_supernet() {
        let mut supernet = supernet();
        let device = Default::default();
        let batch = batch().to_device::<TestBackend>(&device).unwrap();
        let factory = OptimizerFactory::new(0.05, 0.0);

        let shared_before = supernet.weights().clone();
        let subnet = supernet.smallest_model().unwrap();
        let subnet_before = subnet.model.state_dict().unwrap();
        let mut active = factory.create(subnet, None);

        let output = training_step(
            &mut supernet,
            &mut active,
            &batch,
            None,
            &LocalSync,
            "steps/smallest-subnet",
            0,
        )
        .unwrap();

        assert_eq!(output.metrics.params(), Some(active.params()));
        assert!(output.metrics.get("train_loss").unwrap() > 0.0);
        assert_eq!(output.learning_rate, 0.05);

        // shared block moved exactly as far as the subnet did
        let subnet_after = active.model().state_dict().unwrap();
        for (name, before) in &subnet_before {
            let after = &subnet_after[name];
            let shared = supernet.weights()[name].slice_prefix(after.shape()).unwrap();
            let old = shared_before[name].slice_prefix(after.shape()).unwrap();
            let moved = old.sub(&shared).unwrap();
            let expected = before.sub(after).unwrap();
            for (a, b) in moved.values().iter().zip(expected.values()) {
                assert!((a - b).abs() < 1e-6);
            }
        }
    }

    #[test]
    fn test_step_with_soft_labels() {
        let mut supernet = supernet();
        let device = Default::default();
        let batch = batch().to_device::<TestBackend>(&device).unwrap();
        let factory = OptimizerFactory::new(0.01, 0.0);

        let full = supernet.full_model().unwrap();
        let soft_labels = teacher_logits(&full.model, &batch).unwrap();
        assert_eq!(soft_labels.shape(), &[2, 2]);

        let mut active = factory.create(supernet.smallest_model().unwrap(), None);
        let output = training_step(
            &mut supernet,
            &mut active,
            &batch,
            Some(&soft_labels),
            &LocalSync,
            "steps/smallest-subnet",
            0,
        )
        .unwrap();
        assert!(output.metrics.get("train_loss").unwrap().is_finite());
    }

    #[test]
    fn test_non_finite_loss_is_rejected() {
        let mut supernet = supernet();
        let device = Default::default();
        let batch = Batch::new(
            [
                (
                    crate::data::INPUTS_FIELD.to_string(),
                    HostTensor::new(vec![1, 3], vec![f32::NAN, 0.0, 0.0]).unwrap(),
                ),
                (
                    crate::data::LABELS_FIELD.to_string(),
                    HostTensor::new(vec![1], vec![0.0]).unwrap(),
                ),
            ]
            .into_iter()
            .collect(),
        )
        .unwrap();
        let batch = batch.to_device::<TestBackend>(&device).unwrap();

        let shared_before = supernet.weights().clone();
        let factory = OptimizerFactory::new(0.01, 0.0);
        let mut active = factory.create(supernet.full_model().unwrap(), None);
        let result = training_step(
            &mut supernet,
            &mut active,
            &batch,
            None,
            &LocalSync,
            "steps/supernet",
            4,
        );

        assert!(matches!(
            result,
            Err(TrainerError::NonFiniteLoss { step: 4, .. })
        ));
        assert_eq!(supernet.weights(), &shared_before);
    }

    /// Ids of the trainable matrices, in visit order
    struct MatrixIds(Vec<ParamId>);

    impl<B: Backend> ModuleVisitor<B> for MatrixIds {
        fn visit_float<const D: usize>(&mut self, id: ParamId, _tensor: &Tensor<B, D>) {
            if D == 2 {
                self.0.push(id);
            }
        }
    }

    #[test]
    fn test_missing_gradients_are_reported() {
        let supernet = supernet();
        let device = Default::default();
        let batch = batch().to_device::<TestBackend>(&device).unwrap();
        let model = supernet.full_model().unwrap().model;

        assert!(matches!(
            check_gradients(&model, &GradientsParams::new()),
            Err(TrainerError::MissingGradient { .. })
        ));

        let output = model.forward_batch(&batch);
        let mut grads = GradientsParams::from_grads(output.loss.backward(), &model);
        assert!(check_gradients(&model, &grads).is_ok());

        let mut ids = MatrixIds(Vec::new());
        model.visit(&mut ids);
        let dropped = ids.0.swap_remove(0);
        let dropped_name = dropped.to_string();
        assert!(grads.remove::<NdArray<f32>, 2>(dropped).is_some());

        match check_gradients(&model, &grads) {
            Err(TrainerError::MissingGradient { param }) => {
                assert!(param.contains(&dropped_name), "{param}")
            }
            other => panic!("expected a missing gradient, got {other:?}"),
        }
    }
}
