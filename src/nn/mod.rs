//! Layers of the masked autoencoder.

pub mod attention;
pub mod block;
pub mod feed_forward;
pub mod layer_norm;
pub mod linear;
pub mod patch_embedding;

use crate::tensor::Tensor;

/// A layer over `[B, N, E]` token tensors.
pub trait Module {
    fn forward(&self, input: &Tensor) -> Tensor;

    /// Learnable tensors, in the order checkpoints store them.
    fn parameters(&self) -> Vec<Tensor>;

    fn zero_grad(&self) {
        for p in self.parameters() {
            p.zero_grad();
        }
    }
}
