//! Core error type, result alias and serialization helpers shared by every module.

use thiserror::Error;

pub mod serialization;

pub use serialization::{from_json, to_json_pretty};

/// Errors surfaced by correlation factorization, basket construction and the loss engines.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CreditError {
    /// Input validation error (malformed tranche, curve, grid or basket).
    #[error("invalid input: {0}")]
    InvalidInput(String),
    /// Shapes of correlation or loading inputs do not agree.
    #[error("dimension mismatch: {0}")]
    DimensionMismatch(String),
    /// The requested strategy cannot honour this basket configuration.
    #[error("unsupported configuration: {0}")]
    Unsupported(String),
    /// Non-convergence in an iterative algorithm.
    #[error("convergence failure: {0}")]
    ConvergenceFailure(String),
    /// Numerical issue (non-finite intermediate, singular system, etc.).
    #[error("numerical error: {0}")]
    NumericalError(String),
}

impl CreditError {
    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    pub(crate) fn unsupported(msg: impl Into<String>) -> Self {
        Self::Unsupported(msg.into())
    }

    pub(crate) fn dimension(msg: impl Into<String>) -> Self {
        Self::DimensionMismatch(msg.into())
    }
}

/// Library-wide result alias.
pub type Result<T> = std::result::Result<T, CreditError>;
