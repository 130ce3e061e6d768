use crate::error::{Result, TrainerError};
use burn::backend::NdArray;
use burn::prelude::*;
use burn::tensor::TensorData;
use std::collections::BTreeMap;
use std::ops::Range;

/// Parameter name to host-resident values
pub type StateDict = BTreeMap<String, HostTensor>;

/// CPU backend that host-side block arithmetic runs on
type Host = NdArray<f32>;

/// Dispatch a const-rank helper on a runtime rank
macro_rules! with_rank {
    ($rank:expr, $op:ident($($arg:expr),*)) => {
        match $rank {
            1 => $op::<1>($($arg),*),
            2 => $op::<2>($($arg),*),
            3 => $op::<3>($($arg),*),
            rank => Err(TrainerError::Shape {
                name: "host tensor rank".to_string(),
                expected: vec![3],
                got: vec![rank],
            }),
        }
    };
}

/// Dense `f32` tensor data kept in host memory
///
/// Parameter snapshots, weight deltas, batches and accumulated evaluation
/// outputs all live here so that device memory is only held while a
/// forward/backward pass is running. Block arithmetic goes through the
/// ndarray backend.
#[derive(Debug, Clone)]
pub struct HostTensor {
    data: TensorData,
}

impl HostTensor {
    /// Create a tensor, checking that `values` fills `shape`
    pub fn new(shape: Vec<usize>, values: Vec<f32>) -> Result<Self> {
        let numel: usize = shape.iter().product();
        if numel != values.len() {
            return Err(TrainerError::Shape {
                name: "host tensor".to_string(),
                expected: shape,
                got: vec![values.len()],
            });
        }
        Ok(Self {
            data: TensorData::new(values, shape),
        })
    }

    /// Tensor of zeros
    pub fn zeros(shape: Vec<usize>) -> Self {
        Self {
            data: TensorData::zeros::<f32, _>(shape),
        }
    }

    /// Copy a device tensor to the host
    pub fn from_tensor<B: Backend, const D: usize>(tensor: Tensor<B, D>) -> Result<Self> {
        Ok(Self {
            data: tensor.into_data().convert::<f32>(),
        })
    }

    /// Materialize on a device as a rank-`D` float tensor
    pub fn to_tensor<B: Backend, const D: usize>(&self, device: &B::Device) -> Result<Tensor<B, D>> {
        if self.shape().len() != D {
            return Err(TrainerError::Shape {
                name: format!("rank-{D} tensor"),
                expected: vec![D],
                got: vec![self.shape().len()],
            });
        }
        Ok(Tensor::from_data(self.data.clone(), device))
    }

    fn on_host<const D: usize>(&self) -> Result<Tensor<Host, D>> {
        self.to_tensor::<Host, D>(&Default::default())
    }

    pub fn shape(&self) -> &[usize] {
        &self.data.shape
    }

    /// Row-major values
    pub fn values(&self) -> &[f32] {
        // every constructor stores f32
        self.data.as_slice::<f32>().unwrap_or_default()
    }

    pub fn numel(&self) -> usize {
        self.data.num_elements()
    }

    /// Size of the leading dimension (0 for scalars)
    pub fn leading_dim(&self) -> usize {
        self.shape().first().copied().unwrap_or(0)
    }

    /// Elementwise `self - other`
    pub fn sub(&self, other: &HostTensor) -> Result<HostTensor> {
        if self.shape() != other.shape() {
            return Err(TrainerError::Shape {
                name: "elementwise difference".to_string(),
                expected: self.shape().to_vec(),
                got: other.shape().to_vec(),
            });
        }
        with_rank!(self.shape().len(), sub_rank(self, other))
    }

    /// Leading block `[0..shape[0], 0..shape[1], ...]` of this tensor
    pub fn slice_prefix(&self, shape: &[usize]) -> Result<HostTensor> {
        self.check_prefix(shape)?;
        with_rank!(shape.len(), slice_prefix_rank(self, shape))
    }

    /// Subtract `delta` from the leading block it covers
    pub fn sub_assign_prefix(&mut self, delta: &HostTensor) -> Result<()> {
        self.check_prefix(delta.shape())?;
        *self = with_rank!(delta.shape().len(), sub_assign_prefix_rank(self, delta))?;
        Ok(())
    }

    /// Stack tensors along the leading dimension
    pub fn concat_rows(parts: &[HostTensor]) -> Result<HostTensor> {
        let Some(first) = parts.first() else {
            return Ok(HostTensor::zeros(vec![0]));
        };
        let trailing = first.shape().get(1..).unwrap_or_default();
        for part in parts {
            if part.shape().is_empty() || &part.shape()[1..] != trailing {
                return Err(TrainerError::Shape {
                    name: "concatenated rows".to_string(),
                    expected: trailing.to_vec(),
                    got: part.shape().to_vec(),
                });
            }
        }
        with_rank!(first.shape().len(), concat_rows_rank(parts))
    }

    /// Index of the largest value in every row of a matrix
    pub fn argmax_rows(&self) -> Result<Vec<i64>> {
        if self.numel() == 0 {
            return Ok(Vec::new());
        }
        let indices = self.on_host::<2>()?.argmax(1).into_data();
        indices
            .convert::<i64>()
            .to_vec::<i64>()
            .map_err(|e| TrainerError::data(format!("failed to read argmax indices: {e:?}")))
    }

    /// Whether every value is finite
    pub fn is_finite(&self) -> bool {
        self.values().iter().all(|v| v.is_finite())
    }

    fn check_prefix(&self, shape: &[usize]) -> Result<()> {
        let fits = shape.len() == self.shape().len()
            && shape.iter().zip(self.shape()).all(|(inner, outer)| inner <= outer);
        if fits {
            Ok(())
        } else {
            Err(TrainerError::Shape {
                name: "prefix slice".to_string(),
                expected: self.shape().to_vec(),
                got: shape.to_vec(),
            })
        }
    }
}

impl PartialEq for HostTensor {
    fn eq(&self, other: &Self) -> bool {
        self.shape() == other.shape() && self.values() == other.values()
    }
}

fn leading_block<const D: usize>(shape: &[usize]) -> [Range<usize>; D] {
    std::array::from_fn(|axis| 0..shape[axis])
}

fn sub_rank<const D: usize>(lhs: &HostTensor, rhs: &HostTensor) -> Result<HostTensor> {
    HostTensor::from_tensor(lhs.on_host::<D>()?.sub(rhs.on_host::<D>()?))
}

fn slice_prefix_rank<const D: usize>(full: &HostTensor, shape: &[usize]) -> Result<HostTensor> {
    HostTensor::from_tensor(full.on_host::<D>()?.slice(leading_block::<D>(shape)))
}

fn sub_assign_prefix_rank<const D: usize>(
    full: &HostTensor,
    delta: &HostTensor,
) -> Result<HostTensor> {
    let ranges = leading_block::<D>(delta.shape());
    let full = full.on_host::<D>()?;
    let block = full.clone().slice(ranges.clone()).sub(delta.on_host::<D>()?);
    HostTensor::from_tensor(full.slice_assign(ranges, block))
}

fn concat_rows_rank<const D: usize>(parts: &[HostTensor]) -> Result<HostTensor> {
    let tensors = parts
        .iter()
        .map(HostTensor::on_host::<D>)
        .collect::<Result<Vec<_>>>()?;
    HostTensor::from_tensor(Tensor::cat(tensors, 0))
}

#[cfg(test)]
mod tests {
    use super::*;

    type TestBackend = NdArray<f32>;

    fn matrix() -> HostTensor {
        HostTensor::new(vec![3, 3], (0..9).map(|v| v as f32).collect()).unwrap()
    }

    #[test]
    fn test_new_rejects_wrong_length() {
        assert!(HostTensor::new(vec![2, 2], vec![1.0; 3]).is_err());
    }

    #[test]
    fn test_slice_prefix() {
        let block = matrix().slice_prefix(&[2, 2]).unwrap();
        assert_eq!(block.shape(), &[2, 2]);
        assert_eq!(block.values(), &[0.0, 1.0, 3.0, 4.0]);

        let bias = HostTensor::new(vec![4], vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        assert_eq!(bias.slice_prefix(&[2]).unwrap().values(), &[1.0, 2.0]);
    }

    #[test]
    fn test_sub_assign_prefix_only_touches_block() {
        let mut full = matrix();
        let delta = HostTensor::new(vec![2, 1], vec![10.0, 20.0]).unwrap();
        full.sub_assign_prefix(&delta).unwrap();
        assert_eq!(full.shape(), &[3, 3]);
        assert_eq!(
            full.values(),
            &[-10.0, 1.0, 2.0, -17.0, 4.0, 5.0, 6.0, 7.0, 8.0]
        );
    }

    #[test]
    fn test_sub_assign_full_block() {
        let mut full = matrix();
        full.sub_assign_prefix(&matrix()).unwrap();
        assert_eq!(full, HostTensor::zeros(vec![3, 3]));
    }

    #[test]
    fn test_prefix_larger_than_tensor_fails() {
        assert!(matrix().slice_prefix(&[4, 1]).is_err());
        assert!(matrix().slice_prefix(&[3]).is_err());
        let mut full = matrix();
        assert!(full.sub_assign_prefix(&HostTensor::zeros(vec![1, 4])).is_err());
        assert_eq!(full, matrix());
    }

    #[test]
    fn test_sub_checks_shapes() {
        let diff = matrix().sub(&HostTensor::zeros(vec![3, 3])).unwrap();
        assert_eq!(diff, matrix());
        assert!(matrix().sub(&HostTensor::zeros(vec![9])).is_err());
    }

    #[test]
    fn test_concat_rows() {
        let a = HostTensor::new(vec![1, 2], vec![1.0, 2.0]).unwrap();
        let b = HostTensor::new(vec![2, 2], vec![3.0, 4.0, 5.0, 6.0]).unwrap();
        let joined = HostTensor::concat_rows(&[a.clone(), b]).unwrap();
        assert_eq!(joined.shape(), &[3, 2]);
        assert_eq!(joined.values(), &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);

        let wide = HostTensor::zeros(vec![1, 3]);
        assert!(HostTensor::concat_rows(&[a, wide]).is_err());
        assert_eq!(HostTensor::concat_rows(&[]).unwrap().numel(), 0);
    }

    #[test]
    fn test_argmax_rows() {
        let logits = HostTensor::new(vec![2, 3], vec![0.1, 0.7, 0.2, 2.0, -1.0, 1.0]).unwrap();
        assert_eq!(logits.argmax_rows().unwrap(), vec![1, 0]);
        assert!(HostTensor::zeros(vec![3]).argmax_rows().is_err());
    }

    #[test]
    fn test_device_round_trip_keeps_shape() {
        let device = Default::default();
        let host = matrix();
        let tensor: Tensor<TestBackend, 2> = host.to_tensor(&device).unwrap();
        assert_eq!(tensor.dims(), [3, 3]);
        assert_eq!(HostTensor::from_tensor(tensor).unwrap(), host);
        assert!(host.to_tensor::<TestBackend, 1>(&device).is_err());
    }
}
