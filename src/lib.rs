//! Masked-patch image reconstruction.
//!
//! Images are cut into fixed-size patches ([`patch`]), a random subset of the
//! patches is hidden ([`masking`]), a model reconstructs the full patch
//! sequence ([`models`]) and the squared error is scored on hidden patches
//! only ([`loss`]).
//!
//! ```
//! use ndarray::Array4;
//! use rand::{rngs::StdRng, SeedableRng};
//! use rusty_mae::{loss, masking::MaskingPolicy, patch, tensor::Tensor};
//!
//! let images = Array4::<f32>::ones((2, 3, 8, 8));
//! let patches = patch::encode(images.view(), 4).unwrap();
//! assert_eq!(patches.dim(), (2, 4, 48));
//!
//! let mut rng = StdRng::seed_from_u64(0);
//! let masked = MaskingPolicy::new(0.5).unwrap().apply(patches.view(), &mut rng).unwrap();
//! assert!(masked.mask.rows().into_iter().all(|row| row.sum() == 2.0));
//!
//! let target = Tensor::from_array(patches.clone());
//! let loss = loss::masked_mse_loss(&target, &target, &Tensor::from_array(masked.mask)).unwrap();
//! assert_eq!(loss.item(), 0.0);
//! ```

pub mod checkpoint;
pub mod config;
pub mod data;
pub mod error;
pub mod loss;
pub mod masking;
pub mod models;
pub mod nn;
pub mod optimizer;
pub mod patch;
pub mod pipeline;
pub mod tensor;

pub use error::{MaeError, Result};
