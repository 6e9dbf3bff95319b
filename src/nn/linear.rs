//! A basic linear layer.

use crate::nn::Module;
use crate::tensor::Tensor;
use rand::Rng;
use tracing::debug;

pub struct Linear {
    weights: Tensor,
    bias: Tensor,
}

impl Linear {
    /// Xavier-uniform weights, zero bias.
    pub fn new<R: Rng + ?Sized>(in_features: usize, out_features: usize, rng: &mut R) -> Self {
        debug!(in_features, out_features, "initializing Linear layer");
        let limit = (6.0 / (in_features + out_features) as f32).sqrt();
        Self {
            weights: Tensor::rand(vec![in_features, out_features], limit, rng),
            bias: Tensor::zeros(vec![out_features]),
        }
    }

    pub fn in_features(&self) -> usize {
        self.weights.shape()[0]
    }

    pub fn out_features(&self) -> usize {
        self.weights.shape()[1]
    }
}

impl Module for Linear {
    fn forward(&self, input: &Tensor) -> Tensor {
        let x = input.matmul(&self.weights);
        &x + &self.bias
    }

    fn parameters(&self) -> Vec<Tensor> {
        vec![self.weights.clone(), self.bias.clone()]
    }
}
