//! Synchronous data-parallel training across ranks
//!
//! Each rank runs the full elastic loop on its own replica of the supernet.
//! After every backward pass the trainable gradients are summed across ranks
//! and divided by the world size before the optimizer step.

use crate::error::{DistributedError, Result, TrainerError};
use crate::training::step::GradientSync;
use burn::module::{AutodiffModule, ModuleVisitor, ParamId};
use burn::optim::GradientsParams;
use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;
use burn::tensor::TensorData;
use parking_lot::{Condvar, Mutex};
use std::marker::PhantomData;
use std::sync::Arc;
use std::thread;
use tracing::{debug, error, info};

/// Reduction applied by a collective
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReduceOp {
    Sum,
    Max,
    Min,
}

impl ReduceOp {
    fn combine(self, acc: &mut [f64], values: &[f64]) {
        for (a, &v) in acc.iter_mut().zip(values) {
            *a = match self {
                ReduceOp::Sum => *a + v,
                ReduceOp::Max => a.max(v),
                ReduceOp::Min => a.min(v),
            };
        }
    }
}

/// Membership of one rank in a group of processes
///
/// Collectives block until every rank has entered them. There is no
/// timeout: a rank that never arrives stalls the group until it leaves.
pub trait ProcessGroup: Send + Sync {
    fn rank(&self) -> usize;

    fn world_size(&self) -> usize;

    /// Reduce `values` element-wise over all ranks; every rank receives the result
    fn all_reduce(&self, values: &mut [f64], op: ReduceOp) -> std::result::Result<(), DistributedError>;

    /// Wait until every rank reaches this point
    fn barrier(&self) -> std::result::Result<(), DistributedError> {
        self.all_reduce(&mut [], ReduceOp::Sum)
    }
}

struct CollectiveState {
    joined: Vec<bool>,
    closed: bool,
    generation: u64,
    arrived: usize,
    accumulator: Vec<f64>,
    result: Vec<f64>,
}

struct GroupShared {
    world_size: usize,
    state: Mutex<CollectiveState>,
    cond: Condvar,
}

/// Rendezvous for threads of one process acting as ranks
#[derive(Clone)]
pub struct LocalGroup {
    shared: Arc<GroupShared>,
}

impl LocalGroup {
    pub fn new(world_size: usize) -> Self {
        Self {
            shared: Arc::new(GroupShared {
                world_size,
                state: Mutex::new(CollectiveState {
                    joined: vec![false; world_size],
                    closed: false,
                    generation: 0,
                    arrived: 0,
                    accumulator: Vec::new(),
                    result: Vec::new(),
                }),
                cond: Condvar::new(),
            }),
        }
    }

    pub fn world_size(&self) -> usize {
        self.shared.world_size
    }

    /// Join the group as `rank`
    pub fn init_process_group(
        &self,
        rank: usize,
    ) -> std::result::Result<LocalProcessGroup, DistributedError> {
        let world_size = self.shared.world_size;
        if rank >= world_size {
            return Err(DistributedError::InvalidRank { rank, world_size });
        }

        let mut state = self.shared.state.lock();
        if state.closed {
            return Err(DistributedError::GroupClosed { rank });
        }
        if state.joined[rank] {
            return Err(DistributedError::DuplicateRank(rank));
        }
        state.joined[rank] = true;
        debug!("Rank {}/{} joined the process group", rank, world_size);

        Ok(LocalProcessGroup {
            rank,
            shared: Arc::clone(&self.shared),
        })
    }
}

/// One rank's handle on a [`LocalGroup`]
///
/// Dropping the handle tears the group down; peers blocked in a collective
/// get [`DistributedError::GroupClosed`].
pub struct LocalProcessGroup {
    rank: usize,
    shared: Arc<GroupShared>,
}

impl LocalProcessGroup {
    /// Leave the group
    pub fn destroy(self) {
        drop(self);
    }

    fn close(&self) {
        let mut state = self.shared.state.lock();
        if !state.closed {
            debug!("Rank {} tore down the process group", self.rank);
            state.closed = true;
        }
        self.shared.cond.notify_all();
    }
}

impl Drop for LocalProcessGroup {
    fn drop(&mut self) {
        self.close();
    }
}

impl ProcessGroup for LocalProcessGroup {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.shared.world_size
    }

    fn all_reduce(&self, values: &mut [f64], op: ReduceOp) -> std::result::Result<(), DistributedError> {
        let shared = &*self.shared;
        let mut state = shared.state.lock();
        if state.closed {
            return Err(DistributedError::GroupClosed { rank: self.rank });
        }

        if state.arrived == 0 {
            state.accumulator = values.to_vec();
        } else if state.accumulator.len() != values.len() {
            let expected = state.accumulator.len();
            state.closed = true;
            shared.cond.notify_all();
            return Err(DistributedError::LengthMismatch {
                rank: self.rank,
                expected,
                got: values.len(),
            });
        } else {
            op.combine(&mut state.accumulator, values);
        }
        state.arrived += 1;

        let generation = state.generation;
        if state.arrived == shared.world_size {
            state.result = std::mem::take(&mut state.accumulator);
            state.arrived = 0;
            state.generation += 1;
            shared.cond.notify_all();
        } else {
            // the result of this generation stays put until we have read it
            while state.generation == generation {
                if state.closed {
                    return Err(DistributedError::GroupClosed { rank: self.rank });
                }
                shared.cond.wait(&mut state);
            }
        }

        values.copy_from_slice(&state.result);
        Ok(())
    }
}

/// Sum over ranks, then divide by the world size
pub fn all_reduce_mean<P: ProcessGroup + ?Sized>(
    group: &P,
    values: &mut [f64],
) -> std::result::Result<(), DistributedError> {
    group.all_reduce(values, ReduceOp::Sum)?;
    let world_size = group.world_size() as f64;
    for v in values.iter_mut() {
        *v /= world_size;
    }
    Ok(())
}

/// Gradient averaging over a process group
pub struct AllReduceSync<P> {
    group: P,
}

impl<P: ProcessGroup> AllReduceSync<P> {
    pub fn new(group: P) -> Self {
        Self { group }
    }

    pub fn group(&self) -> &P {
        &self.group
    }

    pub fn into_group(self) -> P {
        self.group
    }
}

impl<B: AutodiffBackend, P: ProcessGroup> GradientSync<B> for AllReduceSync<P> {
    fn synchronize<M: AutodiffModule<B>>(
        &self,
        model: &M,
        grads: GradientsParams,
    ) -> Result<GradientsParams> {
        let mut visitor = GradientAverager::<B, P> {
            group: &self.group,
            grads,
            error: None,
            _backend: PhantomData,
        };
        model.visit(&mut visitor);

        match visitor.error {
            Some(err) => Err(err),
            None => Ok(visitor.grads),
        }
    }

    fn reduce_loss(&self, loss: f64) -> Result<f64> {
        let mut values = [loss];
        self.group.all_reduce(&mut values, ReduceOp::Sum)?;
        Ok(values[0])
    }

    fn verify_subnet(&self, fingerprint: u64, namespace: &str, step: usize) -> Result<()> {
        // halves fit exactly in an f64
        let halves = [(fingerprint & 0xffff_ffff) as f64, (fingerprint >> 32) as f64];
        let mut max = halves;
        let mut min = halves;
        self.group.all_reduce(&mut max, ReduceOp::Max)?;
        self.group.all_reduce(&mut min, ReduceOp::Min)?;

        if max != min {
            return Err(DistributedError::DivergentSubnets {
                namespace: namespace.to_string(),
                step,
            }
            .into());
        }
        Ok(())
    }

    fn is_main_process(&self) -> bool {
        self.group.rank() == 0
    }
}

/// Replaces each trainable gradient with its mean over ranks
///
/// Parameters are visited in module order, which matches across replicas
/// training the same subnet.
struct GradientAverager<'a, B, P> {
    group: &'a P,
    grads: GradientsParams,
    error: Option<TrainerError>,
    _backend: PhantomData<B>,
}

impl<B: AutodiffBackend, P: ProcessGroup> GradientAverager<'_, B, P> {
    fn average<const D: usize>(&mut self, id: ParamId) -> Result<()> {
        let grad = self
            .grads
            .remove::<B::InnerBackend, D>(id)
            .ok_or_else(|| TrainerError::MissingGradient {
                param: id.to_string(),
            })?;

        let dims = grad.dims();
        let device = grad.device();
        let mut values = grad
            .into_data()
            .convert::<f64>()
            .to_vec::<f64>()
            .map_err(|e| TrainerError::data(format!("gradient readback failed: {e:?}")))?;

        all_reduce_mean(self.group, &mut values)?;

        let data = TensorData::new(values, dims)
            .convert::<<B::InnerBackend as Backend>::FloatElem>();
        let averaged = Tensor::<B::InnerBackend, D>::from_data(data, &device);
        self.grads.register::<B::InnerBackend, D>(id, averaged);
        Ok(())
    }
}

impl<B: AutodiffBackend, P: ProcessGroup> ModuleVisitor<B> for GradientAverager<'_, B, P> {
    fn visit_float<const D: usize>(&mut self, id: ParamId, tensor: &Tensor<B, D>) {
        if self.error.is_some() || !tensor.is_require_grad() {
            return;
        }
        if let Err(err) = self.average::<D>(id) {
            self.error = Some(err);
        }
    }
}

/// Device a rank's replica is bound to
///
/// Every rank gets the backend's default device. The ndarray backend exposes
/// a single CPU device, so replicas are threads sharing it and only the
/// process group separates their state.
pub fn device_for_rank<B: Backend>(rank: usize) -> B::Device {
    let device = B::Device::default();
    debug!("Rank {} bound to shared device {:?}", rank, device);
    device
}

/// Run `train_rank` once per rank, each on its own thread
///
/// Every rank joins the group before `train_rank` is called and leaves it
/// when its sync handle is dropped, on success or failure. Returns the
/// per-rank results in rank order, or the first root-cause error.
pub fn launch<R, F>(world_size: usize, train_rank: F) -> Result<Vec<R>>
where
    R: Send,
    F: Fn(usize, AllReduceSync<LocalProcessGroup>) -> Result<R> + Sync,
{
    if world_size == 0 {
        return Err(TrainerError::config("world size must be at least 1"));
    }

    info!("Launching {} ranks", world_size);
    let group = LocalGroup::new(world_size);

    let outcomes: Vec<Result<R>> = thread::scope(|scope| {
        let handles: Vec<_> = (0..world_size)
            .map(|rank| {
                let group = group.clone();
                let train_rank = &train_rank;
                scope.spawn(move || {
                    let process_group = group.init_process_group(rank)?;
                    process_group.barrier()?;
                    train_rank(rank, AllReduceSync::new(process_group))
                })
            })
            .collect();

        handles
            .into_iter()
            .enumerate()
            .map(|(rank, handle)| {
                handle
                    .join()
                    .unwrap_or_else(|_| Err(DistributedError::RankPanicked { rank }.into()))
            })
            .collect()
    });

    let mut results = Vec::with_capacity(world_size);
    let mut first_error: Option<TrainerError> = None;
    for (rank, outcome) in outcomes.into_iter().enumerate() {
        match outcome {
            Ok(result) => results.push(result),
            Err(err) => {
                error!("Rank {} failed: {}", rank, err);
                let is_secondary = matches!(
                    err,
                    TrainerError::Distributed(DistributedError::GroupClosed { .. })
                );
                match &first_error {
                    None => first_error = Some(err),
                    Some(TrainerError::Distributed(DistributedError::GroupClosed { .. }))
                        if !is_secondary =>
                    {
                        first_error = Some(err)
                    }
                    Some(_) => {}
                }
            }
        }
    }

    match first_error {
        Some(err) => Err(err),
        None => Ok(results),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::architecture::{init_model, ElasticMlp};
    use crate::model::{ElasticModule, SupernetConfig};
    use crate::training::step::GradientSync;
    use burn::backend::{Autodiff, NdArray};

    type TestBackend = Autodiff<NdArray<f32>>;

    #[test]
    fn test_cpu_ranks_share_one_device() {
        let default = <TestBackend as Backend>::Device::default();
        for rank in 0..4 {
            assert_eq!(device_for_rank::<TestBackend>(rank), default);
        }
    }

    #[test]
    fn test_all_reduce_mean_of_two_ranks() {
        let results = launch(2, |rank, sync| {
            let mut grad = [if rank == 0 { 2.0 } else { 4.0 }];
            all_reduce_mean(sync.group(), &mut grad)?;
            Ok(grad[0])
        })
        .unwrap();

        assert_eq!(results, vec![3.0, 3.0]);
    }

    #[test]
    fn test_reduce_ops() {
        let results = launch(3, |rank, sync| {
            let r = rank as f64;
            let mut sum = [r, 1.0];
            let mut max = [r];
            let mut min = [r];
            sync.group().all_reduce(&mut sum, ReduceOp::Sum)?;
            sync.group().all_reduce(&mut max, ReduceOp::Max)?;
            sync.group().all_reduce(&mut min, ReduceOp::Min)?;
            sync.group().barrier()?;
            Ok((sum, max[0], min[0]))
        })
        .unwrap();

        for (sum, max, min) in results {
            assert_eq!(sum, [3.0, 3.0]);
            assert_eq!(max, 2.0);
            assert_eq!(min, 0.0);
        }
    }

    #[test]
    fn test_init_rejects_bad_ranks() {
        let group = LocalGroup::new(2);
        assert!(matches!(
            group.init_process_group(2),
            Err(DistributedError::InvalidRank { rank: 2, world_size: 2 })
        ));

        let _rank0 = group.init_process_group(0).unwrap();
        assert!(matches!(
            group.init_process_group(0),
            Err(DistributedError::DuplicateRank(0))
        ));
    }

    #[test]
    fn test_teardown_releases_waiting_rank() {
        let result = launch(2, |rank, sync| {
            if rank == 1 {
                return Err(TrainerError::config("rank 1 failed before the collective"));
            }
            let mut values = [1.0];
            sync.group().all_reduce(&mut values, ReduceOp::Sum)?;
            Ok(())
        });

        // the root cause wins over the peer's GroupClosed
        assert!(matches!(result, Err(TrainerError::Config(_))));
    }

    #[test]
    fn test_divergent_subnets_are_detected() {
        let result = launch(2, |rank, sync| {
            GradientSync::<TestBackend>::verify_subnet(&sync, 10 + rank as u64, "steps/subnet", 5)
        });
        assert!(matches!(
            result,
            Err(TrainerError::Distributed(DistributedError::DivergentSubnets { step: 5, .. }))
        ));

        launch(2, |_, sync| {
            GradientSync::<TestBackend>::verify_subnet(&sync, u64::MAX - 3, "steps/subnet", 5)
        })
        .unwrap();
    }

    #[test]
    fn test_synchronize_averages_model_gradients() {
        let config = SupernetConfig::new(2, 2, vec![3]);
        let device = Default::default();
        let state = init_model::<TestBackend>(&config, &device).state_dict().unwrap();

        let local_and_synced = launch(2, |rank, sync| {
            let device = Default::default();
            let model = ElasticMlp::<TestBackend>::from_state(&state, &device)?;
            let x = if rank == 0 { [[1.0, 0.0]] } else { [[0.0, 3.0]] };
            let input = Tensor::<TestBackend, 2>::from_floats(x, &device);

            let grads_of = |model: &ElasticMlp<TestBackend>| {
                let loss = model.forward(input.clone()).sum();
                GradientsParams::from_grads(loss.backward(), model)
            };
            let local = flatten(&model, &grads_of(&model));
            let synced = sync.synchronize(&model, grads_of(&model))?;
            Ok((local, flatten(&model, &synced)))
        })
        .unwrap();

        let (local0, synced0) = &local_and_synced[0];
        let (local1, synced1) = &local_and_synced[1];
        assert_eq!(synced0, synced1);
        for ((a, b), s) in local0.iter().zip(local1).zip(synced0) {
            assert!((s - (a + b) / 2.0).abs() < 1e-6);
        }
    }

    /// All gradients of `model` in visit order
    fn flatten(model: &ElasticMlp<TestBackend>, grads: &GradientsParams) -> Vec<f32> {
        struct Collect<'a> {
            grads: &'a GradientsParams,
            out: Vec<f32>,
        }
        impl ModuleVisitor<TestBackend> for Collect<'_> {
            fn visit_float<const D: usize>(&mut self, id: ParamId, _: &Tensor<TestBackend, D>) {
                let grad = self.grads.get::<NdArray<f32>, D>(id).unwrap();
                self.out
                    .extend(grad.into_data().convert::<f32>().to_vec::<f32>().unwrap());
            }
        }
        let mut collect = Collect {
            grads,
            out: Vec::new(),
        };
        model.visit(&mut collect);
        collect.out
    }
}
