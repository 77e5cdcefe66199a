//! Error taxonomy for the compiler core.
//!
//! Structural and precision errors are fatal and abort the compilation;
//! quantizer problems are reported as warnings through
//! [`crate::optimizer::Diagnostics`] and never surface here.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CompileError {
    /// Graph integrity violated: dangling reference, duplicate name,
    /// ambiguous rewire target. Never silently repaired.
    #[error("structural error at layer `{layer}`: {reason}")]
    Structural { layer: String, reason: String },

    /// Malformed precision descriptor, rejected at construction time.
    #[error("invalid precision: {0}")]
    InvalidPrecision(String),

    /// The model is valid but outside what the downstream interface
    /// supports (e.g. more than one model input).
    #[error("unsupported configuration: {0}")]
    UnsupportedConfig(String),

    /// A raw decision tree that cannot be normalized.
    #[error("malformed ensemble, tree {tree}: {reason}")]
    MalformedEnsemble { tree: usize, reason: String },
}

impl CompileError {
    pub fn structural(layer: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Structural {
            layer: layer.into(),
            reason: reason.into(),
        }
    }

    pub fn ensemble(tree: usize, reason: impl Into<String>) -> Self {
        Self::MalformedEnsemble {
            tree,
            reason: reason.into(),
        }
    }
}

pub type Result<T, E = CompileError> = std::result::Result<T, E>;
