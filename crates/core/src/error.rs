//! Domain error model.

use thiserror::Error;

/// Deterministic failure raised before any infrastructure is involved.
///
/// Storage and transport problems have their own error types in `rentaldesk-infra`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// An identifier could not be parsed.
    #[error("invalid identifier: {0}")]
    InvalidId(String),
}

impl DomainError {
    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }
}
