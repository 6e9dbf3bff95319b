//! Patch embedding for a Vision Transformer encoder.
//!
//! Takes an already patchified sequence `[batch, num_patches, patch_dim]`
//! (see [`crate::patch`]), projects every patch vector to the embedding
//! dimension and adds a learned positional embedding per patch position.

use crate::nn::linear::Linear;
use crate::nn::Module;
use crate::tensor::Tensor;
use rand::Rng;
use tracing::debug;

pub struct PatchEmbedding {
    projection: Linear,
    position: Tensor,
}

impl PatchEmbedding {
    pub fn new<R: Rng + ?Sized>(
        num_patches: usize,
        patch_dim: usize,
        embed_dim: usize,
        rng: &mut R,
    ) -> Self {
        debug!(num_patches, patch_dim, embed_dim, "initializing PatchEmbedding");
        Self {
            projection: Linear::new(patch_dim, embed_dim, rng),
            position: Tensor::rand(vec![num_patches, embed_dim], 0.02, rng),
        }
    }
}

impl Module for PatchEmbedding {
    fn forward(&self, input: &Tensor) -> Tensor {
        // [B, N, E] + [N, E] broadcasts over the batch.
        &self.projection.forward(input) + &self.position
    }

    fn parameters(&self) -> Vec<Tensor> {
        let mut params = self.projection.parameters();
        params.push(self.position.clone());
        params
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn embeds_every_patch() {
        let mut rng = StdRng::seed_from_u64(5);
        let embed = PatchEmbedding::new(4, 48, 16, &mut rng);
        let out = embed.forward(&Tensor::zeros(vec![2, 4, 48]));
        assert_eq!(out.shape(), vec![2, 4, 16]);

        // Zero input: the output is exactly the positional embedding for each image.
        let out = out.data();
        let pos = embed.position.data();
        for b in 0..2 {
            assert_eq!(out.index_axis(ndarray::Axis(0), b), pos.view());
        }
    }
}
