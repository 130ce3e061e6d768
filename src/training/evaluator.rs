use crate::data::loader::BatchSource;
use crate::error::Result;
use crate::model::state::HostTensor;
use crate::model::{ElasticModule, SubnetHandle, SubnetModel};
use crate::training::MetricsRecord;
use burn::tensor::backend::AutodiffBackend;
use tracing::{debug, warn};

/// Everything an evaluation round produced, on the host
#[derive(Debug, Clone, PartialEq)]
pub struct EvalPrediction {
    /// Logits `[num_examples, num_classes]`
    pub predictions: HostTensor,
    /// Ground-truth class per example
    pub label_ids: Vec<i64>,
}

impl EvalPrediction {
    /// Predicted class per example
    pub fn argmax(&self) -> Result<Vec<i64>> {
        self.predictions.argmax_rows()
    }

    pub fn len(&self) -> usize {
        self.label_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.label_ids.is_empty()
    }
}

/// Metric function over a complete evaluation split
pub trait MetricFn: Send + Sync {
    fn compute(&self, eval: &EvalPrediction) -> anyhow::Result<MetricsRecord>;
}

impl<F> MetricFn for F
where
    F: Fn(&EvalPrediction) -> anyhow::Result<MetricsRecord> + Send + Sync,
{
    fn compute(&self, eval: &EvalPrediction) -> anyhow::Result<MetricsRecord> {
        self(eval)
    }
}

/// Runs a subnet over an evaluation split without gradient tracking
#[derive(Clone, Copy)]
pub struct Evaluator<'a> {
    metric_fn: Option<&'a dyn MetricFn>,
}

impl<'a> Evaluator<'a> {
    pub fn new(metric_fn: Option<&'a dyn MetricFn>) -> Self {
        Self { metric_fn }
    }

    /// Evaluate `subnet` over every batch of `loader`
    ///
    /// Predictions and labels of all batches are gathered before the metric
    /// function runs once. Returns `Ok(None)` when the metric function fails;
    /// data and device errors propagate.
    pub fn evaluate<B, M>(
        &self,
        subnet: &SubnetHandle<M>,
        loader: &dyn BatchSource,
        device: &B::Device,
    ) -> Result<Option<MetricsRecord>>
    where
        B: AutodiffBackend,
        M: SubnetModel<B>,
    {
        let model = subnet.model.valid();
        let mut logits = Vec::with_capacity(loader.num_batches());
        let mut label_ids = Vec::new();

        for batch in loader.iter_epoch(0) {
            let batch = batch?;
            label_ids.extend(batch.labels()?);
            let batch = batch.to_device::<B::InnerBackend>(device)?;
            logits.push(HostTensor::from_tensor(model.forward_logits(batch.inputs))?);
        }

        let eval = EvalPrediction {
            predictions: HostTensor::concat_rows(&logits)?,
            label_ids,
        };
        debug!("Evaluating on {} examples", eval.len());

        let mut metrics = match self.metric_fn {
            None => MetricsRecord::new(),
            Some(metric_fn) => match metric_fn.compute(&eval) {
                Ok(metrics) => metrics,
                Err(err) => {
                    warn!("Metric computation failed, skipping this round: {:#}", err);
                    return Ok(None);
                }
            },
        };
        metrics.set_params(subnet.param_count);
        Ok(Some(metrics))
    }
}
