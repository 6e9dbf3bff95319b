//! Loss functions.

use crate::error::{MaeError, Result};
use crate::tensor::Tensor;
use ndarray::{Array2, ArrayView2, ArrayView3, Axis};

fn check_shapes(original: &[usize], reconstructed: &[usize], mask: &[usize]) -> Result<()> {
    if original.len() != 3 || original != reconstructed {
        return Err(MaeError::shape(
            "masked loss (reconstruction)",
            original,
            reconstructed,
        ));
    }
    if mask != &original[..2] {
        return Err(MaeError::shape("masked loss (mask)", &original[..2], mask));
    }
    Ok(())
}

/// Mean squared reconstruction error over the hidden patches only.
///
/// # Arguments
/// * `original` - Target patch sequence, shape `[B, N, D]`.
/// * `reconstructed` - Model output, same shape.
/// * `mask` - `[B, N]`, 1.0 for hidden patches and 0.0 for visible ones.
///
/// The squared error is averaged over `D`, weighted by the mask, summed and
/// divided by the number of hidden patches. A mask with no hidden patch has
/// no defined loss and returns [`MaeError::EmptyMask`] instead of NaN.
pub fn masked_mse_loss(original: &Tensor, reconstructed: &Tensor, mask: &Tensor) -> Result<Tensor> {
    check_shapes(&original.shape(), &reconstructed.shape(), &mask.shape())?;

    let hidden = mask.data().sum();
    if hidden <= 0.0 {
        return Err(MaeError::EmptyMask);
    }

    let per_patch = (reconstructed - original).square().mean_axis(2, false);
    let masked = &per_patch * mask;
    Ok(masked.sum() / hidden)
}

/// `[B, N]` squared error surface, mean-reduced over the patch dimension.
pub fn per_patch_error(original: ArrayView3<'_, f32>, reconstructed: ArrayView3<'_, f32>) -> Result<Array2<f32>> {
    if original.shape() != reconstructed.shape() {
        return Err(MaeError::shape("per-patch error", original.shape(), reconstructed.shape()));
    }
    let diff = &reconstructed - &original;
    let squared = diff.mapv(|v| v * v);
    squared
        .mean_axis(Axis(2))
        .ok_or_else(|| MaeError::shape("per-patch error", "non-empty patch dimension", original.shape()))
}

/// Plain-array variant of [`masked_mse_loss`] for evaluation code, outside the autograd graph.
pub fn masked_mse(
    original: ArrayView3<'_, f32>,
    reconstructed: ArrayView3<'_, f32>,
    mask: ArrayView2<'_, f32>,
) -> Result<f32> {
    check_shapes(original.shape(), reconstructed.shape(), mask.shape())?;
    let hidden = mask.sum();
    if hidden <= 0.0 {
        return Err(MaeError::EmptyMask);
    }
    let errors = per_patch_error(original, reconstructed)?;
    Ok((&errors * &mask).sum() / hidden)
}
