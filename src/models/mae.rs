//! A small masked autoencoder: ViT-style encoder plus a linear patch decoder.

use crate::error::{MaeError, Result};
use crate::models::ReconstructionModel;
use crate::nn::block::TransformerBlock;
use crate::nn::layer_norm::LayerNorm;
use crate::nn::linear::Linear;
use crate::nn::patch_embedding::PatchEmbedding;
use crate::nn::Module;
use crate::tensor::Tensor;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaeModelConfig {
    pub num_patches: usize,
    pub patch_dim: usize,
    pub embed_dim: usize,
    pub num_heads: usize,
    pub num_layers: usize,
    pub mlp_ratio: usize,
}

impl MaeModelConfig {
    pub fn validate(&self) -> Result<()> {
        for (field, value) in [
            ("num_patches", self.num_patches),
            ("patch_dim", self.patch_dim),
            ("embed_dim", self.embed_dim),
            ("num_heads", self.num_heads),
            ("mlp_ratio", self.mlp_ratio),
        ] {
            if value == 0 {
                return Err(MaeError::config(field, "must be positive"));
            }
        }
        if self.embed_dim % self.num_heads != 0 {
            return Err(MaeError::config(
                "num_heads",
                format!(
                    "embed_dim {} is not divisible by {} heads",
                    self.embed_dim, self.num_heads
                ),
            ));
        }
        Ok(())
    }
}

pub struct MaskedAutoencoder {
    config: MaeModelConfig,
    embedding: PatchEmbedding,
    blocks: Vec<TransformerBlock>,
    norm: LayerNorm,
    decoder: Linear,
}

impl MaskedAutoencoder {
    pub fn new<R: Rng + ?Sized>(config: &MaeModelConfig, rng: &mut R) -> Result<Self> {
        config.validate()?;
        let embedding =
            PatchEmbedding::new(config.num_patches, config.patch_dim, config.embed_dim, rng);
        let blocks = (0..config.num_layers)
            .map(|_| TransformerBlock::new(config, rng))
            .collect();
        let model = Self {
            config: config.clone(),
            embedding,
            blocks,
            norm: LayerNorm::new(config.embed_dim),
            decoder: Linear::new(config.embed_dim, config.patch_dim, rng),
        };
        info!(
            num_patches = config.num_patches,
            embed_dim = config.embed_dim,
            num_layers = config.num_layers,
            parameters = model.num_parameters(),
            "masked autoencoder ready"
        );
        Ok(model)
    }

    pub fn config(&self) -> &MaeModelConfig {
        &self.config
    }

    /// Total scalar parameter count.
    pub fn num_parameters(&self) -> usize {
        Module::parameters(self)
            .iter()
            .map(|p| p.data().len())
            .sum()
    }
}

impl Module for MaskedAutoencoder {
    fn forward(&self, input: &Tensor) -> Tensor {
        let mut x = self.embedding.forward(input);
        for block in &self.blocks {
            x = block.forward(&x);
        }
        self.decoder.forward(&self.norm.forward(&x))
    }

    fn parameters(&self) -> Vec<Tensor> {
        let mut params = self.embedding.parameters();
        for block in &self.blocks {
            params.extend(block.parameters());
        }
        params.extend(self.norm.parameters());
        params.extend(self.decoder.parameters());
        params
    }
}

impl ReconstructionModel for MaskedAutoencoder {
    fn reconstruct(&self, masked: &Tensor) -> Tensor {
        self.forward(masked)
    }

    fn parameters(&self) -> Vec<Tensor> {
        Module::parameters(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    pub(crate) fn tiny_config() -> MaeModelConfig {
        MaeModelConfig {
            num_patches: 4,
            patch_dim: 12,
            embed_dim: 8,
            num_heads: 2,
            num_layers: 2,
            mlp_ratio: 2,
        }
    }

    #[test]
    fn reconstruction_preserves_shape() {
        let mut rng = StdRng::seed_from_u64(11);
        let model = MaskedAutoencoder::new(&tiny_config(), &mut rng).unwrap();
        let out = model.reconstruct(&Tensor::rand(vec![3, 4, 12], 1.0, &mut rng));
        assert_eq!(out.shape(), vec![3, 4, 12]);
    }

    #[test]
    fn every_parameter_receives_a_gradient() {
        let mut rng = StdRng::seed_from_u64(12);
        let model = MaskedAutoencoder::new(&tiny_config(), &mut rng).unwrap();
        let out = model.reconstruct(&Tensor::rand(vec![2, 4, 12], 1.0, &mut rng));
        out.square().mean().backward();
        for p in ReconstructionModel::parameters(&model) {
            assert!(p.grad().is_some());
        }
    }

    #[test]
    fn rejects_indivisible_heads() {
        let mut config = tiny_config();
        config.num_heads = 3;
        let mut rng = StdRng::seed_from_u64(0);
        assert!(matches!(
            MaskedAutoencoder::new(&config, &mut rng),
            Err(MaeError::Config { field: "num_heads", .. })
        ));
    }
}
