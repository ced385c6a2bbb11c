//! Errors raised by pure record and id logic.

use thiserror::Error;

pub type DomainResult<T> = Result<T, DomainError>;

/// Deterministic failures only. Store and purchase-provider errors have their
/// own types in `fsv-entitlements`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// Input that does not parse into a known value (product id, platform, record JSON).
    #[error("validation failed: {0}")]
    Validation(String),

    /// A decoded subscription record contradicts itself.
    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    /// Not a valid `FamilyId`.
    #[error("invalid identifier: {0}")]
    InvalidId(String),
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invariant(msg: impl Into<String>) -> Self {
        Self::InvariantViolation(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }
}
