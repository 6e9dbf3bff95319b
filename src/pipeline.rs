//! One masked-reconstruction step: encode, mask, reconstruct, score.

use crate::data::ImageBatchLoader;
use crate::error::{MaeError, Result};
use crate::loss::masked_mse_loss;
use crate::masking::{MaskedBatch, MaskingPolicy};
use crate::models::ReconstructionModel;
use crate::optimizer::Optimizer;
use crate::patch::{PatchCodec, PatchGrid};
use crate::tensor::Tensor;
use ndarray::{Array3, Array4, ArrayView4, Ix3, Zip};
use rand::Rng;
use tracing::{debug, warn};

/// Everything produced by a forward pass over one image batch.
pub struct StepOutput {
    pub grid: PatchGrid,
    pub patches: Array3<f32>,
    pub masking: MaskedBatch,
    pub reconstruction: Tensor,
    pub loss: Tensor,
}

impl StepOutput {
    /// The reconstruction as a plain `[B, N, D]` array.
    pub fn reconstruction_array(&self) -> Result<Array3<f32>> {
        self.reconstruction
            .data()
            .clone()
            .into_dimensionality::<Ix3>()
            .map_err(|e| MaeError::shape("reconstruction rank", 3, e))
    }
}

/// Decoded images for inspecting a step.
#[derive(Debug, Clone)]
pub struct Visualization {
    pub original: Array4<f32>,
    pub masked: Array4<f32>,
    pub reconstructed: Array4<f32>,
    /// Reconstruction with the visible patches replaced by the originals.
    pub pasted: Array4<f32>,
}

#[derive(Debug, Clone, Copy)]
pub struct MaskedReconstruction {
    pub codec: PatchCodec,
    pub policy: MaskingPolicy,
}

impl MaskedReconstruction {
    pub fn new(codec: PatchCodec, policy: MaskingPolicy) -> Self {
        Self { codec, policy }
    }

    pub fn forward<M, R>(&self, model: &M, images: ArrayView4<'_, f32>, rng: &mut R) -> Result<StepOutput>
    where
        M: ReconstructionModel + ?Sized,
        R: Rng + ?Sized,
    {
        let (_, _, height, width) = images.dim();
        let grid = self.codec.grid_for(height, width)?;
        let patches = self.codec.encode(images)?;
        let masking = self.policy.apply(patches.view(), rng)?;

        let reconstruction = model.reconstruct(&Tensor::from_array(masking.masked.clone()));
        if reconstruction.shape() != patches.shape() {
            return Err(MaeError::shape(
                "reconstruction model output",
                patches.shape(),
                reconstruction.shape(),
            ));
        }

        let loss = masked_mse_loss(
            &Tensor::from_array(patches.clone()),
            &reconstruction,
            &Tensor::from_array(masking.mask.clone()),
        )?;

        Ok(StepOutput {
            grid,
            patches,
            masking,
            reconstruction,
            loss,
        })
    }

    /// Forward, backward and one optimizer update. Returns the loss value.
    pub fn train_step<M, O, R>(
        &self,
        model: &M,
        optimizer: &mut O,
        images: ArrayView4<'_, f32>,
        rng: &mut R,
    ) -> Result<f32>
    where
        M: ReconstructionModel + ?Sized,
        O: Optimizer + ?Sized,
        R: Rng + ?Sized,
    {
        let output = self.forward(model, images, rng)?;
        let value = output.loss.item();
        optimizer.zero_grad();
        output.loss.backward();
        optimizer.step();
        Ok(value)
    }

    /// Runs `train_step` over every batch of `loader` and returns the mean loss.
    ///
    /// Batches without hidden patches are skipped with a warning; any other
    /// error aborts the epoch.
    pub fn train_epoch<M, O, R>(
        &self,
        model: &M,
        optimizer: &mut O,
        loader: ImageBatchLoader<'_>,
        rng: &mut R,
    ) -> Result<Option<f32>>
    where
        M: ReconstructionModel + ?Sized,
        O: Optimizer + ?Sized,
        R: Rng + ?Sized,
    {
        let mut total = 0.0;
        let mut count = 0usize;
        for (i, batch) in loader.enumerate() {
            match self.train_step(model, optimizer, batch.view(), rng) {
                Ok(loss) => {
                    total += loss;
                    count += 1;
                    debug!(batch = i, loss, "train step");
                }
                Err(MaeError::EmptyMask) => warn!(batch = i, "skipping batch with no hidden patches"),
                Err(e) => return Err(e),
            }
        }
        Ok((count > 0).then(|| total / count as f32))
    }

    /// Mean masked loss over `loader` without updating the model.
    pub fn evaluate<M, R>(&self, model: &M, loader: ImageBatchLoader<'_>, rng: &mut R) -> Result<Option<f32>>
    where
        M: ReconstructionModel + ?Sized,
        R: Rng + ?Sized,
    {
        let mut total = 0.0;
        let mut count = 0usize;
        for batch in loader {
            match self.forward(model, batch.view(), rng) {
                Ok(output) => {
                    total += output.loss.item();
                    count += 1;
                }
                Err(MaeError::EmptyMask) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok((count > 0).then(|| total / count as f32))
    }

    /// Decodes the original, masked and reconstructed sequences of a step back to images.
    pub fn visualize(&self, output: &StepOutput) -> Result<Visualization> {
        let reconstructed = output.reconstruction_array()?;

        let mut pasted = reconstructed.clone();
        Zip::from(pasted.rows_mut())
            .and(output.patches.rows())
            .and(&output.masking.mask)
            .for_each(|mut rec, orig, &hidden| {
                if hidden == 0.0 {
                    rec.assign(&orig);
                }
            });

        let grid = Some(output.grid);
        Ok(Visualization {
            original: self.codec.decode(output.patches.view(), grid)?,
            masked: self.codec.decode(output.masking.masked.view(), grid)?,
            reconstructed: self.codec.decode(reconstructed.view(), grid)?,
            pasted: self.codec.decode(pasted.view(), grid)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::synthetic_dataset;
    use crate::models::mae::{MaeModelConfig, MaskedAutoencoder};
    use crate::optimizer::Adam;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn pipeline(mask_ratio: f64) -> MaskedReconstruction {
        MaskedReconstruction::new(
            PatchCodec::new(4, 3).unwrap(),
            MaskingPolicy::new(mask_ratio).unwrap(),
        )
    }

    #[test]
    fn identity_model_has_loss_equal_to_hidden_energy() {
        let mut rng = StdRng::seed_from_u64(2);
        let images = Array4::from_elem((2, 3, 8, 8), 1.0f32);
        let identity = |x: &Tensor| x.detach();
        let output = pipeline(0.5).forward(&identity, images.view(), &mut rng).unwrap();
        // Hidden patches come back as zeros against an all-ones target.
        assert!((output.loss.item() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn shape_changing_model_is_rejected() {
        let mut rng = StdRng::seed_from_u64(2);
        let images = Array4::<f32>::zeros((1, 3, 8, 8));
        let truncating = |x: &Tensor| x.reshape(vec![1, 2, 96]);
        let result = pipeline(0.5).forward(&truncating, images.view(), &mut rng);
        assert!(matches!(result, Err(MaeError::Shape { .. })));
    }

    #[test]
    fn visualization_restores_original_and_pastes_visible() {
        let mut rng = StdRng::seed_from_u64(4);
        let images = Array4::from_shape_fn((2, 3, 8, 8), |(b, c, y, x)| (b + c + y * x) as f32);
        let zeros = |x: &Tensor| Tensor::zeros(x.shape());
        let p = pipeline(0.5);
        let output = p.forward(&zeros, images.view(), &mut rng).unwrap();
        let vis = p.visualize(&output).unwrap();

        assert_eq!(vis.original, images);
        assert_eq!(vis.reconstructed, Array4::<f32>::zeros((2, 3, 8, 8)));
        // Pasted = masked input here, since the model predicts zeros for hidden patches.
        assert_eq!(vis.pasted, vis.masked);
    }

    #[test]
    fn training_reduces_loss_on_a_fixed_batch() {
        let mut rng = StdRng::seed_from_u64(8);
        let data = synthetic_dataset(4, 3, 8, &mut rng).unwrap();
        let images = data.batch(&[0, 1, 2, 3]);
        let config = MaeModelConfig {
            num_patches: 4,
            patch_dim: 48,
            embed_dim: 16,
            num_heads: 2,
            num_layers: 1,
            mlp_ratio: 2,
        };
        let model = MaskedAutoencoder::new(&config, &mut rng).unwrap();
        let mut optimizer = Adam::new(ReconstructionModel::parameters(&model), 1e-2);
        let p = pipeline(0.5);

        let eval = |model: &MaskedAutoencoder| {
            let mut eval_rng = StdRng::seed_from_u64(100);
            p.forward(model, images.view(), &mut eval_rng).unwrap().loss.item()
        };
        let before = eval(&model);
        for _ in 0..30 {
            p.train_step(&model, &mut optimizer, images.view(), &mut rng).unwrap();
        }
        assert!(eval(&model) < before);
    }
}
