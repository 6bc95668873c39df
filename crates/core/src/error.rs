//! Domain error model.

use thiserror::Error;

/// Result type for pure domain code (identifier parsing, aggregate decisions).
pub type DomainResult<T> = Result<T, DomainError>;

/// Deterministic failure raised by domain code.
///
/// Reducers never fail; these errors come from identifier parsing and from the
/// `decide` step of a command, before anything is appended. Storage failures
/// are modelled separately in `eventvault-infra`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// Malformed input.
    #[error("validation failed: {0}")]
    Validation(String),

    /// An identifier could not be parsed or is out of range.
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// The command is not allowed in the aggregate's current state.
    #[error("rejected: {0}")]
    Rejected(String),

    /// The command targets something the aggregate does not hold.
    #[error("{0} not found")]
    NotFound(String),
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn rejected(msg: impl Into<String>) -> Self {
        Self::Rejected(msg.into())
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }
}
