//! Random patch masking with shuffle/restore index bookkeeping.
//!
//! For each image a random key is drawn per patch and the patch indices are
//! sorted by key. The first `keep_count` indices of that shuffled order stay
//! visible; the rest are hidden. The mask is built in shuffled order and
//! gathered back through the inverse permutation so that `mask[[b, n]]`
//! always refers to `patches[[b, n, ..]]`.

use crate::error::{MaeError, Result};
use ndarray::{s, Array1, Array2, Array3, ArrayView3};
use rand::distributions::{Distribution, Uniform};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::debug;

const KEEP_TOLERANCE: f64 = 1e-9;

/// What to do when the ratio keeps every patch or none of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DegeneratePolicy {
    /// Fail with [`MaeError::DegenerateMask`].
    #[default]
    Reject,
    /// Produce the all-visible or all-hidden mask.
    Allow,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MaskingPolicy {
    mask_ratio: f64,
    degenerate: DegeneratePolicy,
}

/// Output of [`MaskingPolicy::apply`].
#[derive(Debug, Clone)]
pub struct MaskedBatch {
    /// `[B, N, D]`: visible patches copied, hidden patches zero.
    pub masked: Array3<f32>,
    /// `[B, N]`: 1.0 hidden, 0.0 visible, in original patch order.
    pub mask: Array2<f32>,
    /// `[B, N]`: shuffled rank -> original patch index.
    pub ids_shuffle: Array2<usize>,
    /// `[B, N]`: original patch index -> shuffled rank.
    pub ids_restore: Array2<usize>,
    pub keep_count: usize,
}

impl MaskedBatch {
    pub fn num_patches(&self) -> usize {
        self.mask.ncols()
    }

    /// Hidden patches per image.
    pub fn hidden_count(&self) -> usize {
        self.num_patches() - self.keep_count
    }

    /// Original indices of the visible patches of image `b`, in shuffled order.
    pub fn visible_indices(&self, b: usize) -> Vec<usize> {
        self.ids_shuffle
            .row(b)
            .iter()
            .take(self.keep_count)
            .copied()
            .collect()
    }

    /// Original indices of the hidden patches of image `b`, in shuffled order.
    pub fn hidden_indices(&self, b: usize) -> Vec<usize> {
        self.ids_shuffle
            .row(b)
            .iter()
            .skip(self.keep_count)
            .copied()
            .collect()
    }
}

impl MaskingPolicy {
    /// Creates a policy hiding `mask_ratio` of the patches of every image.
    /// The ratio must lie in `[0, 1)`.
    pub fn new(mask_ratio: f64) -> Result<Self> {
        if !(0.0..1.0).contains(&mask_ratio) {
            return Err(MaeError::config(
                "mask_ratio",
                format!("{mask_ratio} is outside [0, 1)"),
            ));
        }
        Ok(Self {
            mask_ratio,
            degenerate: DegeneratePolicy::default(),
        })
    }

    pub fn with_degenerate(mut self, degenerate: DegeneratePolicy) -> Self {
        self.degenerate = degenerate;
        self
    }

    pub fn mask_ratio(&self) -> f64 {
        self.mask_ratio
    }

    /// `floor(N × (1 − mask_ratio))`, with the ratio read as the decimal it was written as.
    pub fn keep_count(&self, num_patches: usize) -> usize {
        let exact = num_patches as f64 * (1.0 - self.mask_ratio);
        // 1 - 0.9 is 0.09999999999999998 in binary; snap products that sit on an integer.
        let nearest = exact.round();
        let keep = if (exact - nearest).abs() <= KEEP_TOLERANCE * exact.max(1.0) {
            nearest
        } else {
            exact.floor()
        };
        (keep as usize).min(num_patches)
    }

    fn checked_keep_count(&self, num_patches: usize) -> Result<usize> {
        let keep_count = self.keep_count(num_patches);
        let degenerate = keep_count == 0 || keep_count == num_patches;
        if degenerate && self.degenerate == DegeneratePolicy::Reject {
            return Err(MaeError::DegenerateMask {
                num_patches,
                keep_count,
            });
        }
        Ok(keep_count)
    }

    /// Masks a batch of patch sequences `[B, N, D]`.
    ///
    /// Each image gets an independent random subset; the caller owns `rng`, so
    /// a fixed seed reproduces the same masks.
    pub fn apply<R: Rng + ?Sized>(
        &self,
        patches: ArrayView3<'_, f32>,
        rng: &mut R,
    ) -> Result<MaskedBatch> {
        let (batch, num_patches, _) = patches.dim();
        let keep_count = self.checked_keep_count(num_patches)?;

        let mut ids_shuffle = Array2::<usize>::zeros((batch, num_patches));
        let mut ids_restore = Array2::<usize>::zeros((batch, num_patches));
        let mut mask = Array2::<f32>::zeros((batch, num_patches));
        let mut masked = Array3::<f32>::zeros(patches.raw_dim());

        let noise = Uniform::new(0.0f32, 1.0);
        for b in 0..batch {
            let keys: Vec<f32> = (0..num_patches).map(|_| noise.sample(rng)).collect();
            let shuffle = argsort(&keys);
            let restore = invert_permutation(&shuffle);

            // 0 for the first keep_count ranks, 1 after; gathered back to original order.
            for (n, &rank) in restore.iter().enumerate() {
                mask[[b, n]] = if rank < keep_count { 0.0 } else { 1.0 };
            }
            for &n in &shuffle[..keep_count] {
                masked
                    .slice_mut(s![b, n, ..])
                    .assign(&patches.slice(s![b, n, ..]));
            }

            ids_shuffle.row_mut(b).assign(&Array1::from(shuffle));
            ids_restore.row_mut(b).assign(&Array1::from(restore));
        }

        debug!(
            batch,
            num_patches,
            keep_count,
            mask_ratio = self.mask_ratio,
            "masked patch batch"
        );

        Ok(MaskedBatch {
            masked,
            mask,
            ids_shuffle,
            ids_restore,
            keep_count,
        })
    }
}

/// Stable ascending argsort of `keys`.
pub fn argsort(keys: &[f32]) -> Vec<usize> {
    let mut ids: Vec<usize> = (0..keys.len()).collect();
    ids.sort_by(|&a, &b| keys[a].total_cmp(&keys[b]));
    ids
}

/// Inverse of a permutation: `inverse[perm[i]] = i`.
pub fn invert_permutation(perm: &[usize]) -> Vec<usize> {
    let mut inverse = vec![0; perm.len()];
    for (i, &p) in perm.iter().enumerate() {
        inverse[p] = i;
    }
    inverse
}
