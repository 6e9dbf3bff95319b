//! Patch codec: images `[B, C, H, W]` to flattened patch sequences `[B, N, D]` and back.
//!
//! Patches are enumerated row-major over the patch grid (top-to-bottom, then
//! left-to-right within a row), so `N = (H / P) * (W / P)`. Inside a patch the
//! pixels are scanned row-major and the channels of each pixel are contiguous,
//! so element `d` of a patch vector is
//!
//! ```text
//! d = (py * P + px) * C + c
//! ```
//!
//! for pixel offset `(py, px)` inside the patch and channel `c`. `D = P * P * C`.

use crate::error::{MaeError, Result};
use ndarray::{Array3, Array4, ArrayView3, ArrayView4};
use serde::{Deserialize, Serialize};

/// Number of patch rows and columns covering one image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchGrid {
    pub rows: usize,
    pub cols: usize,
}

impl PatchGrid {
    pub fn new(rows: usize, cols: usize) -> Self {
        Self { rows, cols }
    }

    /// Square grid for `num_patches`, or a shape error when it is not a perfect square.
    pub fn square(num_patches: usize) -> Result<Self> {
        let side = (num_patches as f64).sqrt().round() as usize;
        if side * side != num_patches {
            return Err(MaeError::shape(
                "decode (square patch grid)",
                "a perfect-square patch count",
                num_patches,
            ));
        }
        Ok(Self::new(side, side))
    }

    pub fn num_patches(&self) -> usize {
        self.rows * self.cols
    }
}

/// Patch geometry for one dataset: patch side length and channel count.
///
/// `D = patch_size² × channels` is ambiguous between factorizations, so the
/// channel count travels with the codec instead of being inferred on decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchCodec {
    pub patch_size: usize,
    pub channels: usize,
}

impl PatchCodec {
    pub fn new(patch_size: usize, channels: usize) -> Result<Self> {
        if patch_size == 0 {
            return Err(MaeError::config("patch_size", "must be positive"));
        }
        if channels == 0 {
            return Err(MaeError::config("channels", "must be positive"));
        }
        Ok(Self {
            patch_size,
            channels,
        })
    }

    /// Flattened length of one patch vector.
    pub fn patch_dim(&self) -> usize {
        self.patch_size * self.patch_size * self.channels
    }

    /// Patch grid for an `height × width` image.
    pub fn grid_for(&self, height: usize, width: usize) -> Result<PatchGrid> {
        check_divisible(height, width, self.patch_size)?;
        Ok(PatchGrid::new(
            height / self.patch_size,
            width / self.patch_size,
        ))
    }

    pub fn encode(&self, images: ArrayView4<'_, f32>) -> Result<Array3<f32>> {
        if images.dim().1 != self.channels {
            return Err(MaeError::shape(
                "encode (channel count)",
                self.channels,
                images.dim().1,
            ));
        }
        encode(images, self.patch_size)
    }

    pub fn decode(
        &self,
        patches: ArrayView3<'_, f32>,
        grid: Option<PatchGrid>,
    ) -> Result<Array4<f32>> {
        decode(patches, self.patch_size, self.channels, grid)
    }
}

fn check_divisible(height: usize, width: usize, patch_size: usize) -> Result<()> {
    if patch_size == 0 || height % patch_size != 0 || width % patch_size != 0 {
        return Err(MaeError::shape(
            "encode (image divisible by patch size)",
            format!("H and W multiples of {patch_size}"),
            (height, width),
        ));
    }
    Ok(())
}

/// Splits a batch of images `[B, C, H, W]` into patch sequences `[B, N, P*P*C]`.
pub fn encode(images: ArrayView4<'_, f32>, patch_size: usize) -> Result<Array3<f32>> {
    let (batch, channels, height, width) = images.dim();
    check_divisible(height, width, patch_size)?;
    let p = patch_size;
    let (rows, cols) = (height / p, width / p);

    // [B, C, rows, py, cols, px] -> [B, rows, cols, py, px, C]
    let blocks = images
        .as_standard_layout()
        .into_shape((batch, channels, rows, p, cols, p))
        .map_err(|e| MaeError::shape("encode (split into blocks)", images.shape(), e))?;
    let patches = blocks
        .permuted_axes([0, 2, 4, 3, 5, 1])
        .as_standard_layout()
        .into_owned();

    patches
        .into_shape((batch, rows * cols, p * p * channels))
        .map_err(|e| MaeError::shape("encode (flatten patches)", images.shape(), e))
}

/// Reassembles patch sequences `[B, N, P*P*C]` into images `[B, C, H, W]`.
///
/// Without an explicit `grid` the patch count must be a perfect square.
pub fn decode(
    patches: ArrayView3<'_, f32>,
    patch_size: usize,
    channels: usize,
    grid: Option<PatchGrid>,
) -> Result<Array4<f32>> {
    let (batch, num_patches, dim) = patches.dim();
    let p = patch_size;
    if p == 0 || channels == 0 || dim != p * p * channels {
        return Err(MaeError::shape(
            "decode (patch dimension)",
            format!("{p}*{p}*{channels}"),
            dim,
        ));
    }
    let grid = match grid {
        Some(g) if g.num_patches() == num_patches => g,
        Some(g) => {
            return Err(MaeError::shape(
                "decode (declared patch grid)",
                (g.rows, g.cols),
                num_patches,
            ))
        }
        None => PatchGrid::square(num_patches)?,
    };

    // [B, rows, cols, py, px, C] -> [B, C, rows, py, cols, px]
    let blocks = patches
        .as_standard_layout()
        .into_shape((batch, grid.rows, grid.cols, p, p, channels))
        .map_err(|e| MaeError::shape("decode (split patches)", patches.shape(), e))?;
    let images = blocks
        .permuted_axes([0, 5, 1, 3, 2, 4])
        .as_standard_layout()
        .into_owned();

    images
        .into_shape((batch, channels, grid.rows * p, grid.cols * p))
        .map_err(|e| MaeError::shape("decode (assemble images)", patches.shape(), e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array;

    fn ramp(shape: (usize, usize, usize, usize)) -> Array4<f32> {
        let len = shape.0 * shape.1 * shape.2 * shape.3;
        Array::from_shape_vec(shape, (0..len).map(|v| v as f32).collect()).unwrap()
    }

    #[test]
    fn encode_shape_for_reference_batch() {
        let images = ramp((2, 3, 8, 8));
        let patches = encode(images.view(), 4).unwrap();
        assert_eq!(patches.dim(), (2, 4, 48));
    }

    #[test]
    fn encode_orders_patches_row_major_with_channel_minor_pixels() {
        let (p, c) = (4, 3);
        let images = ramp((2, c, 8, 8));
        let patches = encode(images.view(), p).unwrap();

        for b in 0..2 {
            for n in 0..4 {
                let (row, col) = (n / 2, n % 2);
                for py in 0..p {
                    for px in 0..p {
                        for ch in 0..c {
                            let d = (py * p + px) * c + ch;
                            assert_eq!(
                                patches[[b, n, d]],
                                images[[b, ch, row * p + py, col * p + px]]
                            );
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn encode_rejects_indivisible_images() {
        let images = ramp((1, 3, 8, 6));
        let err = encode(images.view(), 4).unwrap_err();
        assert!(matches!(err, MaeError::Shape { .. }));
    }

    #[test]
    fn encode_rejects_zero_patch_size() {
        let images = ramp((1, 1, 4, 4));
        assert!(encode(images.view(), 0).is_err());
    }

    #[test]
    fn decode_inverts_encode() {
        let images = ramp((3, 2, 12, 12));
        let patches = encode(images.view(), 3).unwrap();
        let restored = decode(patches.view(), 3, 2, None).unwrap();
        assert_eq!(restored, images);
    }

    #[test]
    fn decode_needs_grid_for_non_square_images() {
        let images = ramp((1, 3, 4, 8));
        let patches = encode(images.view(), 4).unwrap();
        assert_eq!(patches.dim(), (1, 2, 48));

        let err = decode(patches.view(), 4, 3, None).unwrap_err();
        assert!(matches!(err, MaeError::Shape { .. }));

        let restored = decode(patches.view(), 4, 3, Some(PatchGrid::new(1, 2))).unwrap();
        assert_eq!(restored, images);
    }

    #[test]
    fn decode_rejects_wrong_channel_count() {
        let patches = Array3::<f32>::zeros((1, 4, 48));
        assert!(decode(patches.view(), 4, 1, None).is_err());
        assert!(decode(patches.view(), 4, 3, None).is_ok());
    }

    #[test]
    fn decode_rejects_mismatched_grid() {
        let patches = Array3::<f32>::zeros((1, 6, 16));
        let err = decode(patches.view(), 4, 1, Some(PatchGrid::new(2, 2))).unwrap_err();
        assert!(matches!(err, MaeError::Shape { .. }));
    }

    #[test]
    fn codec_checks_channels_on_encode() {
        let codec = PatchCodec::new(4, 3).unwrap();
        assert_eq!(codec.patch_dim(), 48);
        assert_eq!(codec.grid_for(32, 32).unwrap(), PatchGrid::new(8, 8));
        assert!(codec.encode(ramp((1, 1, 8, 8)).view()).is_err());
    }

    #[test]
    fn square_grid_requires_perfect_square() {
        assert_eq!(PatchGrid::square(64).unwrap(), PatchGrid::new(8, 8));
        assert!(PatchGrid::square(12).is_err());
    }
}
