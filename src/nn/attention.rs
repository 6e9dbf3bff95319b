//! Multi-Head Self-Attention module.

use crate::models::mae::MaeModelConfig;
use crate::nn::linear::Linear;
use crate::nn::Module;
use crate::tensor::Tensor;
use rand::Rng;
use tracing::debug;

pub struct MultiHeadAttention {
    num_heads: usize,
    d_k: usize,
    w_q: Linear,
    w_k: Linear,
    w_v: Linear,
    w_o: Linear,
}

impl MultiHeadAttention {
    pub fn new<R: Rng + ?Sized>(config: &MaeModelConfig, rng: &mut R) -> Self {
        debug!(num_heads = config.num_heads, "initializing MultiHeadAttention");
        assert_eq!(
            config.embed_dim % config.num_heads,
            0,
            "embed_dim must be divisible by num_heads"
        );

        let embed_dim = config.embed_dim;
        Self {
            num_heads: config.num_heads,
            d_k: embed_dim / config.num_heads,
            w_q: Linear::new(embed_dim, embed_dim, rng),
            w_k: Linear::new(embed_dim, embed_dim, rng),
            w_v: Linear::new(embed_dim, embed_dim, rng),
            w_o: Linear::new(embed_dim, embed_dim, rng),
        }
    }

    /// `[batch, seq, embed]` -> `[batch * heads, seq, d_k]`
    fn split_heads(&self, x: &Tensor, batch_size: usize, seq_len: usize) -> Tensor {
        x.reshape(vec![batch_size, seq_len, self.num_heads, self.d_k])
            .transpose(1, 2)
            .reshape(vec![batch_size * self.num_heads, seq_len, self.d_k])
    }
}

impl Module for MultiHeadAttention {
    fn forward(&self, input: &Tensor) -> Tensor {
        let shape = input.shape();
        let (batch_size, seq_len, embed_dim) = (shape[0], shape[1], shape[2]);

        let q = self.split_heads(&self.w_q.forward(input), batch_size, seq_len);
        let k = self.split_heads(&self.w_k.forward(input), batch_size, seq_len);
        let v = self.split_heads(&self.w_v.forward(input), batch_size, seq_len);

        // [b*h, seq, d_k] @ [b*h, d_k, seq] -> [b*h, seq, seq]
        let scores = q.matmul(&k.transpose(1, 2)) / (self.d_k as f32).sqrt();
        let weights = scores.softmax(2);
        let context = weights.matmul(&v);

        let context = context
            .reshape(vec![batch_size, self.num_heads, seq_len, self.d_k])
            .transpose(1, 2)
            .reshape(vec![batch_size, seq_len, embed_dim]);

        self.w_o.forward(&context)
    }

    fn parameters(&self) -> Vec<Tensor> {
        [&self.w_q, &self.w_k, &self.w_v, &self.w_o]
            .iter()
            .flat_map(|l| l.parameters())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn preserves_sequence_shape() {
        let config = MaeModelConfig {
            num_patches: 4,
            patch_dim: 12,
            embed_dim: 8,
            num_heads: 2,
            num_layers: 1,
            mlp_ratio: 2,
        };
        let mut rng = StdRng::seed_from_u64(0);
        let attn = MultiHeadAttention::new(&config, &mut rng);
        let x = Tensor::rand(vec![3, 4, 8], 1.0, &mut rng);
        assert_eq!(attn.forward(&x).shape(), vec![3, 4, 8]);
        assert_eq!(attn.parameters().len(), 8);
    }
}
