//! Error types for the patch codec, masking policy and masked loss.
//!
//! Every failure in this crate is a synchronous validation failure; nothing
//! here is transient, so callers decide whether to abort or skip a batch.

use thiserror::Error;

/// Result type alias for rusty_mae operations.
pub type Result<T> = std::result::Result<T, MaeError>;

#[derive(Error, Debug)]
pub enum MaeError {
    /// Image or patch-sequence geometry does not fit the requested transform.
    #[error("Shape error in {context}: expected {expected}, got {actual}")]
    Shape {
        context: &'static str,
        expected: String,
        actual: String,
    },

    /// The mask ratio leaves either no visible or no hidden patch per image.
    #[error("Degenerate mask: keeping {keep_count} of {num_patches} patches\n  → Pick a mask ratio that hides at least one patch and keeps at least one")]
    DegenerateMask { num_patches: usize, keep_count: usize },

    /// Masked loss denominator is zero: the batch has no hidden patches.
    #[error("Masked loss is undefined: the mask hides no patches in this batch")]
    EmptyMask,

    /// Configuration value is invalid.
    #[error("Invalid configuration value for '{field}': {message}")]
    Config { field: &'static str, message: String },

    /// IO error with context.
    #[error("IO error: {context}\n  Cause: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    /// Checkpoint or config (de)serialization failed.
    #[error("Serialization error: {message}")]
    Serialization { message: String },
}

impl MaeError {
    /// Shorthand for a shape error built from two debuggable shapes.
    pub fn shape(
        context: &'static str,
        expected: impl std::fmt::Debug,
        actual: impl std::fmt::Debug,
    ) -> Self {
        Self::Shape {
            context,
            expected: format!("{expected:?}"),
            actual: format!("{actual:?}"),
        }
    }

    pub fn config(field: &'static str, message: impl Into<String>) -> Self {
        Self::Config {
            field,
            message: message.into(),
        }
    }
}

impl From<bincode::Error> for MaeError {
    fn from(e: bincode::Error) -> Self {
        Self::Serialization {
            message: e.to_string(),
        }
    }
}

impl From<serde_json::Error> for MaeError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization {
            message: e.to_string(),
        }
    }
}
