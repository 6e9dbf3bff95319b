//! Run configuration.
//!
//! Loaded from JSON; every field has a default matching the reference
//! setup (32×32 RGB images, 4×4 patches, 75% of patches hidden).

use crate::error::{MaeError, Result};
use crate::masking::{DegeneratePolicy, MaskingPolicy};
use crate::models::mae::MaeModelConfig;
use crate::patch::PatchCodec;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizerKind {
    Sgd,
    #[default]
    Adam,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MaeConfig {
    pub image_size: usize,
    pub channels: usize,
    pub patch_size: usize,
    pub mask_ratio: f64,
    pub degenerate_masks: DegeneratePolicy,
    pub embed_dim: usize,
    pub num_heads: usize,
    pub num_layers: usize,
    pub mlp_ratio: usize,
    pub batch_size: usize,
    pub epochs: usize,
    pub learning_rate: f32,
    pub optimizer: OptimizerKind,
    pub clip_norm: Option<f32>,
    pub seed: u64,
}

impl Default for MaeConfig {
    fn default() -> Self {
        Self {
            image_size: 32,
            channels: 3,
            patch_size: 4,
            mask_ratio: 0.75,
            degenerate_masks: DegeneratePolicy::Reject,
            embed_dim: 64,
            num_heads: 4,
            num_layers: 2,
            mlp_ratio: 2,
            batch_size: 16,
            epochs: 5,
            learning_rate: 1e-3,
            optimizer: OptimizerKind::Adam,
            clip_norm: Some(1.0),
            seed: 42,
        }
    }
}

impl MaeConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| MaeError::Io {
            context: format!("reading config {}", path.display()),
            source,
        })?;
        Self::from_json_str(&text)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<()> {
        for (field, value) in [
            ("image_size", self.image_size),
            ("channels", self.channels),
            ("patch_size", self.patch_size),
            ("batch_size", self.batch_size),
        ] {
            if value == 0 {
                return Err(MaeError::config(field, "must be positive"));
            }
        }
        if self.image_size % self.patch_size != 0 {
            return Err(MaeError::config(
                "patch_size",
                format!(
                    "{} does not divide image_size {}",
                    self.patch_size, self.image_size
                ),
            ));
        }
        if !(self.learning_rate > 0.0) {
            return Err(MaeError::config("learning_rate", "must be positive"));
        }
        if matches!(self.clip_norm, Some(c) if !(c > 0.0)) {
            return Err(MaeError::config("clip_norm", "must be positive when set"));
        }
        self.masking_policy()?;
        self.model_config().validate()
    }

    pub fn num_patches(&self) -> usize {
        let side = self.image_size / self.patch_size;
        side * side
    }

    pub fn codec(&self) -> Result<PatchCodec> {
        PatchCodec::new(self.patch_size, self.channels)
    }

    pub fn masking_policy(&self) -> Result<MaskingPolicy> {
        Ok(MaskingPolicy::new(self.mask_ratio)?.with_degenerate(self.degenerate_masks))
    }

    pub fn model_config(&self) -> MaeModelConfig {
        MaeModelConfig {
            num_patches: self.num_patches(),
            patch_dim: self.patch_size * self.patch_size * self.channels,
            embed_dim: self.embed_dim,
            num_heads: self.num_heads,
            num_layers: self.num_layers,
            mlp_ratio: self.mlp_ratio,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid_reference_setup() {
        let config = MaeConfig::default();
        config.validate().unwrap();
        assert_eq!(config.num_patches(), 64);
        assert_eq!(config.model_config().patch_dim, 48);
        assert_eq!(config.masking_policy().unwrap().keep_count(64), 16);
    }

    #[test]
    fn partial_json_falls_back_to_defaults() {
        let config = MaeConfig::from_json_str(r#"{ "image_size": 8, "mask_ratio": 0.5, "optimizer": "sgd" }"#).unwrap();
        assert_eq!(config.image_size, 8);
        assert_eq!(config.optimizer, OptimizerKind::Sgd);
        assert_eq!(config.patch_size, 4);
        assert_eq!(config.num_patches(), 4);
    }

    #[test]
    fn rejects_indivisible_patch_size() {
        let err = MaeConfig::from_json_str(r#"{ "image_size": 30 }"#).unwrap_err();
        assert!(matches!(err, MaeError::Config { field: "patch_size", .. }));
    }

    #[test]
    fn rejects_mask_ratio_of_one() {
        let err = MaeConfig::from_json_str(r#"{ "mask_ratio": 1.0 }"#).unwrap_err();
        assert!(matches!(err, MaeError::Config { field: "mask_ratio", .. }));
    }

    #[test]
    fn json_mask_ratio_keeps_decimal_keep_count() {
        let config = MaeConfig::from_json_str(r#"{ "image_size": 40, "mask_ratio": 0.3 }"#).unwrap();
        assert_eq!(config.num_patches(), 100);
        assert_eq!(config.masking_policy().unwrap().keep_count(config.num_patches()), 70);
    }

    #[test]
    fn malformed_json_is_a_serialization_error() {
        assert!(matches!(
            MaeConfig::from_json_str("{ not json"),
            Err(MaeError::Serialization { .. })
        ));
    }

    #[test]
    fn json_round_trip() {
        let config = MaeConfig {
            degenerate_masks: DegeneratePolicy::Allow,
            ..MaeConfig::default()
        };
        let back = MaeConfig::from_json_str(&config.to_json().unwrap()).unwrap();
        assert_eq!(back, config);
    }
}
