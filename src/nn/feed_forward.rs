//! A position-wise feed-forward network.

use crate::models::mae::MaeModelConfig;
use crate::nn::linear::Linear;
use crate::nn::Module;
use crate::tensor::Tensor;
use rand::Rng;

pub struct FeedForward {
    fc1: Linear,
    fc2: Linear,
}

impl FeedForward {
    pub fn new<R: Rng + ?Sized>(config: &MaeModelConfig, rng: &mut R) -> Self {
        let hidden_dim = config.embed_dim * config.mlp_ratio;
        Self {
            fc1: Linear::new(config.embed_dim, hidden_dim, rng),
            fc2: Linear::new(hidden_dim, config.embed_dim, rng),
        }
    }
}

impl Module for FeedForward {
    fn forward(&self, input: &Tensor) -> Tensor {
        let x = self.fc1.forward(input).gelu();
        self.fc2.forward(&x)
    }

    fn parameters(&self) -> Vec<Tensor> {
        let mut params = self.fc1.parameters();
        params.extend(self.fc2.parameters());
        params
    }
}
