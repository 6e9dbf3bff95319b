//! Reconstruction models.
//!
//! The masking and loss code only relies on [`ReconstructionModel`]: a
//! `[B, N, D] -> [B, N, D]` map where output position `n` corresponds to
//! input position `n`.

pub mod mae;

use crate::tensor::Tensor;

pub trait ReconstructionModel {
    /// Reconstructs a full patch sequence from a masked one.
    fn reconstruct(&self, masked: &Tensor) -> Tensor;

    /// Learnable parameters, in a stable order.
    fn parameters(&self) -> Vec<Tensor> {
        Vec::new()
    }
}

/// Any closure over tensors is a parameter-free reconstruction model.
impl<F> ReconstructionModel for F
where
    F: Fn(&Tensor) -> Tensor,
{
    fn reconstruct(&self, masked: &Tensor) -> Tensor {
        self(masked)
    }
}
