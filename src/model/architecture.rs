use crate::error::{Result, TrainerError};
use crate::model::state::{HostTensor, StateDict};
use crate::model::{ElasticModule, SupernetConfig};
use burn::module::Param;
use burn::nn::{Linear, LinearConfig};
use burn::prelude::*;
use burn::tensor::activation::relu;

/// Width-elastic multilayer perceptron
///
/// Subnets are the same type with narrower hidden layers; their parameters
/// are the leading blocks of the supernet's.
#[derive(Module, Debug)]
pub struct ElasticMlp<B: Backend> {
    /// Fully connected layers, last one produces logits
    layers: Vec<Linear<B>>,
}

impl<B: Backend> ElasticMlp<B> {
    /// Forward pass producing logits
    pub fn forward(&self, input: Tensor<B, 2>) -> Tensor<B, 2> {
        let last = self.layers.len().saturating_sub(1);
        let mut x = input;
        for (i, layer) in self.layers.iter().enumerate() {
            x = layer.forward(x);
            if i < last {
                x = relu(x);
            }
        }
        x
    }

    /// Hidden layer widths
    pub fn hidden_sizes(&self) -> Vec<usize> {
        let last = self.layers.len().saturating_sub(1);
        self.layers[..last]
            .iter()
            .map(|layer| layer.weight.val().dims()[1])
            .collect()
    }

    /// Rebuild from a state dict produced by [`ElasticModule::state_dict`]
    pub fn from_state(state: &StateDict, device: &B::Device) -> Result<Self> {
        let mut layers: Vec<Linear<B>> = Vec::new();
        while let Some(weight) = state.get(&weight_key(layers.len())) {
            let i = layers.len();
            let bias = state
                .get(&bias_key(i))
                .ok_or_else(|| TrainerError::data(format!("missing {}", bias_key(i))))?;
            layers.push(Linear {
                weight: Param::from_tensor(weight.to_tensor::<B, 2>(device)?),
                bias: Some(Param::from_tensor(bias.to_tensor::<B, 1>(device)?)),
            });
        }
        if layers.is_empty() {
            return Err(TrainerError::data("state dict holds no layers"));
        }
        Ok(Self { layers })
    }
}

impl<B: Backend> ElasticModule<B> for ElasticMlp<B> {
    fn forward_logits(&self, inputs: Tensor<B, 2>) -> Tensor<B, 2> {
        self.forward(inputs)
    }

    fn state_dict(&self) -> Result<StateDict> {
        let mut state = StateDict::new();
        for (i, layer) in self.layers.iter().enumerate() {
            state.insert(weight_key(i), HostTensor::from_tensor(layer.weight.val())?);
            if let Some(bias) = &layer.bias {
                state.insert(bias_key(i), HostTensor::from_tensor(bias.val())?);
            }
        }
        Ok(state)
    }
}

pub(crate) fn weight_key(layer: usize) -> String {
    format!("layers.{layer}.weight")
}

pub(crate) fn bias_key(layer: usize) -> String {
    format!("layers.{layer}.bias")
}

/// Initialize the full-size model from configuration
pub fn init_model<B: Backend>(config: &SupernetConfig, device: &B::Device) -> ElasticMlp<B> {
    let dims = config.layer_dims(&config.hidden_sizes);
    let layers = dims
        .windows(2)
        .map(|w| LinearConfig::new(w[0], w[1]).with_bias(true).init(device))
        .collect();

    ElasticMlp { layers }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_model_forward() {
        let device = Default::default();
        let config = SupernetConfig::new(5, 3, vec![16, 8]);
        let model = init_model::<TestBackend>(&config, &device);

        let input = Tensor::<TestBackend, 2>::zeros([2, 5], &device);
        let output = model.forward(input);

        assert_eq!(output.dims(), [2, 3]);
        assert_eq!(model.hidden_sizes(), vec![16, 8]);
    }

    #[test]
    fn test_state_dict_round_trip() {
        let device = Default::default();
        let config = SupernetConfig::new(4, 2, vec![6]);
        let model = init_model::<TestBackend>(&config, &device);

        let state = model.state_dict().unwrap();
        assert_eq!(
            state.keys().cloned().collect::<Vec<_>>(),
            vec![
                "layers.0.bias",
                "layers.0.weight",
                "layers.1.bias",
                "layers.1.weight"
            ]
        );
        assert_eq!(state["layers.0.weight"].shape(), &[4, 6]);

        let rebuilt = ElasticMlp::<TestBackend>::from_state(&state, &device).unwrap();
        assert_eq!(rebuilt.state_dict().unwrap(), state);

        let total: usize = state.values().map(HostTensor::numel).sum();
        assert_eq!(total, config.param_count(&[6]));
    }

    #[test]
    fn test_from_empty_state_fails() {
        let device = Default::default();
        assert!(ElasticMlp::<TestBackend>::from_state(&StateDict::new(), &device).is_err());
    }
}
