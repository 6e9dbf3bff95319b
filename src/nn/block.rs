//! Pre-norm transformer encoder block.

use crate::models::mae::MaeModelConfig;
use crate::nn::attention::MultiHeadAttention;
use crate::nn::feed_forward::FeedForward;
use crate::nn::layer_norm::LayerNorm;
use crate::nn::Module;
use crate::tensor::Tensor;
use rand::Rng;

pub struct TransformerBlock {
    norm1: LayerNorm,
    attention: MultiHeadAttention,
    norm2: LayerNorm,
    feed_forward: FeedForward,
}

impl TransformerBlock {
    pub fn new<R: Rng + ?Sized>(config: &MaeModelConfig, rng: &mut R) -> Self {
        Self {
            norm1: LayerNorm::new(config.embed_dim),
            attention: MultiHeadAttention::new(config, rng),
            norm2: LayerNorm::new(config.embed_dim),
            feed_forward: FeedForward::new(config, rng),
        }
    }
}

impl Module for TransformerBlock {
    fn forward(&self, input: &Tensor) -> Tensor {
        let x = input + &self.attention.forward(&self.norm1.forward(input));
        &x + &self.feed_forward.forward(&self.norm2.forward(&x))
    }

    fn parameters(&self) -> Vec<Tensor> {
        let mut params = self.norm1.parameters();
        params.extend(self.attention.parameters());
        params.extend(self.norm2.parameters());
        params.extend(self.feed_forward.parameters());
        params
    }
}
