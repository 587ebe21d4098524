//! Domain error model.

use thiserror::Error;

/// Result type used across the domain layer.
pub type DomainResult<T> = Result<T, DomainError>;

/// Domain-level error.
///
/// Keep this focused on deterministic failures caused by the caller's input
/// (validation, malformed identifiers). Infrastructure concerns belong to
/// `relaybox-infra`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// A value failed validation (e.g. malformed input).
    #[error("validation failed: {0}")]
    Validation(String),

    /// An identifier was invalid (e.g. parse failure or out of range).
    #[error("invalid identifier: {0}")]
    InvalidId(String),
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }
}

/// Failure of an identifier source.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdError {
    /// The generator ran past the end of its representable time range.
    #[error("identifier time range exhausted")]
    Exhausted,

    /// The generator could not be used (e.g. remote source unreachable).
    #[error("identifier source unavailable: {0}")]
    Unavailable(String),
}
