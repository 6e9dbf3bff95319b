//! Property tests for the patch codec, masking policy and masked loss.
//!
//! - decode(encode(x)) == x for any patch-aligned batch
//! - every mask row hides exactly N - floor(N * (1 - ratio)) patches
//! - masked sequence agrees with the mask position by position
//! - the loss ignores reconstruction error on visible patches
//! - a fixed seed reproduces the same mask

use ndarray::{s, Array, Array3, Array4};
use proptest::prelude::*;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rusty_mae::loss::{masked_mse, masked_mse_loss};
use rusty_mae::masking::MaskingPolicy;
use rusty_mae::patch::{decode, encode, PatchGrid};
use rusty_mae::tensor::Tensor;

// =============================================================================
// Strategy Helpers
// =============================================================================

/// (batch, channels, patch_size, grid_rows, grid_cols)
fn geometry() -> impl Strategy<Value = (usize, usize, usize, usize, usize)> {
    (1usize..4, 1usize..5, 1usize..5, 1usize..5, 1usize..5)
}

/// An image batch of the given geometry filled with arbitrary finite values.
fn image_batch(
    (batch, channels, p, rows, cols): (usize, usize, usize, usize, usize),
) -> impl Strategy<Value = Array4<f32>> {
    let len = batch * channels * rows * p * cols * p;
    proptest::collection::vec(-1.0e6f32..1.0e6, len).prop_map(move |values| {
        Array::from_shape_vec((batch, channels, rows * p, cols * p), values).unwrap()
    })
}

/// A patch sequence [B, N, D] with N >= 2, a mask ratio in whole percent and a seed.
fn patch_sequence() -> impl Strategy<Value = (Array3<f32>, usize, u64)> {
    (1usize..5, 2usize..40, 1usize..8, 5usize..95, any::<u64>()).prop_flat_map(
        |(batch, n, d, percent, seed)| {
            proptest::collection::vec(-100.0f32..100.0, batch * n * d).prop_map(move |values| {
                (
                    Array::from_shape_vec((batch, n, d), values).unwrap(),
                    percent,
                    seed,
                )
            })
        },
    )
}

fn policy(percent: usize) -> MaskingPolicy {
    MaskingPolicy::new(percent as f64 / 100.0).unwrap()
}

/// `floor(N * (100 - percent) / 100)` in integer arithmetic.
fn expected_keep(n: usize, percent: usize) -> usize {
    n * (100 - percent) / 100
}

fn non_degenerate(policy: &MaskingPolicy, n: usize) -> bool {
    let keep = policy.keep_count(n);
    keep > 0 && keep < n
}

// =============================================================================
// Patch Codec Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    #[test]
    fn prop_decode_inverts_encode(
        (geom, images) in geometry().prop_flat_map(|g| (Just(g), image_batch(g)))
    ) {
        let (batch, channels, p, rows, cols) = geom;
        let patches = encode(images.view(), p).unwrap();
        prop_assert_eq!(patches.dim(), (batch, rows * cols, p * p * channels));

        let restored = decode(patches.view(), p, channels, Some(PatchGrid::new(rows, cols))).unwrap();
        prop_assert_eq!(restored, images);
    }

    #[test]
    fn prop_square_images_decode_without_grid(
        (geom, images) in (1usize..3, 1usize..4, 1usize..5, 1usize..5)
            .prop_map(|(b, c, p, side)| (b, c, p, side, side))
            .prop_flat_map(|g| (Just(g), image_batch(g)))
    ) {
        let (_, channels, p, _, _) = geom;
        let patches = encode(images.view(), p).unwrap();
        let restored = decode(patches.view(), p, channels, None).unwrap();
        prop_assert_eq!(restored, images);
    }

    #[test]
    fn prop_encode_rejects_misaligned_images(
        p in 2usize..6,
        rows in 1usize..4,
        extra in 1usize..6,
    ) {
        prop_assume!(extra % p != 0);
        let images = Array4::<f32>::zeros((1, 3, rows * p + extra, p));
        prop_assert!(encode(images.view(), p).is_err());
    }
}

// =============================================================================
// Masking Policy Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    #[test]
    fn prop_mask_rows_hide_exact_count((patches, percent, seed) in patch_sequence()) {
        let policy = policy(percent);
        let n = patches.dim().1;
        let keep = expected_keep(n, percent);
        prop_assume!(keep > 0 && keep < n);

        prop_assert_eq!(policy.keep_count(n), keep);

        let out = policy.apply(patches.view(), &mut StdRng::seed_from_u64(seed)).unwrap();
        prop_assert_eq!(out.keep_count, keep);
        let expected_hidden = (n - keep) as f32;
        for row in out.mask.rows() {
            prop_assert_eq!(row.sum(), expected_hidden);
        }
    }

    #[test]
    fn prop_masked_sequence_matches_mask((patches, percent, seed) in patch_sequence()) {
        let policy = policy(percent);
        let (batch, n, _) = patches.dim();
        prop_assume!(non_degenerate(&policy, n));

        let out = policy.apply(patches.view(), &mut StdRng::seed_from_u64(seed)).unwrap();
        prop_assert_eq!(out.masked.dim(), patches.dim());
        for b in 0..batch {
            for i in 0..n {
                let masked_row = out.masked.slice(s![b, i, ..]);
                if out.mask[[b, i]] == 0.0 {
                    prop_assert_eq!(masked_row, patches.slice(s![b, i, ..]));
                } else {
                    prop_assert_eq!(out.mask[[b, i]], 1.0);
                    prop_assert!(masked_row.iter().all(|&v| v == 0.0));
                }
            }
        }
    }

    #[test]
    fn prop_restore_is_inverse_of_shuffle((patches, percent, seed) in patch_sequence()) {
        let policy = policy(percent);
        let (batch, n, _) = patches.dim();
        prop_assume!(non_degenerate(&policy, n));

        let out = policy.apply(patches.view(), &mut StdRng::seed_from_u64(seed)).unwrap();
        for b in 0..batch {
            for rank in 0..n {
                prop_assert_eq!(out.ids_restore[[b, out.ids_shuffle[[b, rank]]]], rank);
            }
        }
    }

    #[test]
    fn prop_fixed_seed_is_deterministic((patches, percent, seed) in patch_sequence()) {
        let policy = policy(percent);
        prop_assume!(non_degenerate(&policy, patches.dim().1));

        let a = policy.apply(patches.view(), &mut StdRng::seed_from_u64(seed)).unwrap();
        let b = policy.apply(patches.view(), &mut StdRng::seed_from_u64(seed)).unwrap();
        prop_assert_eq!(a.mask, b.mask);
        prop_assert_eq!(a.masked, b.masked);
    }
}

// =============================================================================
// Masked Loss Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    #[test]
    fn prop_loss_ignores_visible_error(
        (patches, percent, seed) in patch_sequence(),
        noise in -50.0f32..50.0,
    ) {
        let policy = policy(percent);
        prop_assume!(non_degenerate(&policy, patches.dim().1));
        let out = policy.apply(patches.view(), &mut StdRng::seed_from_u64(seed)).unwrap();

        let reconstructed = patches.mapv(|v| v * 0.5 + 1.0);
        let mut perturbed = reconstructed.clone();
        for ((b, i, _), v) in perturbed.indexed_iter_mut() {
            if out.mask[[b, i]] == 0.0 {
                *v += noise;
            }
        }

        let base = masked_mse(patches.view(), reconstructed.view(), out.mask.view()).unwrap();
        let moved = masked_mse(patches.view(), perturbed.view(), out.mask.view()).unwrap();
        prop_assert_eq!(base, moved);
    }

    #[test]
    fn prop_perfect_reconstruction_scores_zero((patches, percent, seed) in patch_sequence()) {
        let policy = policy(percent);
        prop_assume!(non_degenerate(&policy, patches.dim().1));
        let out = policy.apply(patches.view(), &mut StdRng::seed_from_u64(seed)).unwrap();

        let target = Tensor::from_array(patches.clone());
        let loss = masked_mse_loss(&target, &target, &Tensor::from_array(out.mask)).unwrap();
        prop_assert_eq!(loss.item(), 0.0);
    }

    #[test]
    fn prop_loss_is_finite_and_non_negative((patches, percent, seed) in patch_sequence()) {
        let policy = policy(percent);
        prop_assume!(non_degenerate(&policy, patches.dim().1));
        let out = policy.apply(patches.view(), &mut StdRng::seed_from_u64(seed)).unwrap();

        let value = masked_mse(patches.view(), out.masked.view(), out.mask.view()).unwrap();
        prop_assert!(value.is_finite());
        prop_assert!(value >= 0.0);
    }
}
