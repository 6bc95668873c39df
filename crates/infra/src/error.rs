//! Storage-layer error taxonomy.

use thiserror::Error;

use eventvault_core::{AggregateId, ContextError, DomainError, ExpectedVersion};
use eventvault_events::ProjectionError;

/// Error returned by every storage operation in this crate.
///
/// ## Categories
///
/// - **ConcurrencyConflict**: a stale `ExpectedVersion` (or a lost race on the
///   atomic insert). Retryable, but only by the caller: reload, re-decide,
///   append again.
/// - **MissingTenantContext / InvalidContext**: programmer errors. Surfaced
///   immediately, never defaulted to tenant-wide access.
/// - **TenantIsolation**: data stamped for another tenant reached a
///   tenant-pinned operation.
/// - **NotFound**: something that must exist does not. An aggregate with zero
///   events is *not* this error; it is simply at version 0.
/// - **StorageUnavailable**: transient infrastructure failure, propagated.
/// - **Backend**: any other storage failure (a rejected statement, a
///   constraint other than the version guard). Not retryable.
/// - **Serialization / Integrity**: a payload, state or stored row that does
///   not decode, or a log that breaks its own invariants (gaps, ordering).
#[derive(Debug, Error)]
pub enum StoreError {
    #[error(
        "concurrency conflict on aggregate {aggregate_id}: expected {expected:?}, found {actual:?}"
    )]
    ConcurrencyConflict {
        aggregate_id: AggregateId,
        expected: ExpectedVersion,
        /// Current version when known; `None` when a concurrent insert won the race.
        actual: Option<u64>,
    },

    #[error("no tenant bound to the current unit of work")]
    MissingTenantContext,

    #[error("invalid session context: {0}")]
    InvalidContext(String),

    #[error("tenant isolation violation: {0}")]
    TenantIsolation(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("storage backend error: {0}")]
    Backend(String),

    #[error("serialization failed: {0}")]
    Serialization(String),

    #[error("event log integrity violation: {0}")]
    Integrity(String),

    #[error(transparent)]
    Domain(#[from] DomainError),
}

impl StoreError {
    /// Whether a caller may reasonably retry the whole unit of work.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StoreError::ConcurrencyConflict { .. } | StoreError::StorageUnavailable(_)
        )
    }

    pub(crate) fn poisoned(what: &str) -> Self {
        StoreError::StorageUnavailable(format!("{what} lock poisoned"))
    }
}

impl From<ContextError> for StoreError {
    fn from(value: ContextError) -> Self {
        match value {
            ContextError::MissingTenantContext => StoreError::MissingTenantContext,
            ContextError::InvalidContext(msg) => StoreError::InvalidContext(msg),
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(value: serde_json::Error) -> Self {
        StoreError::Serialization(value.to_string())
    }
}

/// Operation-agnostic mapping, see `crate::pg` for the table. A unique
/// violation lands in `Backend` here; only the append path knows the
/// aggregate and expected version needed for `ConcurrencyConflict`.
impl From<sqlx::Error> for StoreError {
    fn from(value: sqlx::Error) -> Self {
        crate::pg::map_sqlx_error("query", value)
    }
}

impl From<ProjectionError> for StoreError {
    fn from(value: ProjectionError) -> Self {
        match value {
            ProjectionError::TenantMismatch { .. } => StoreError::TenantIsolation(value.to_string()),
            ProjectionError::Gap { .. } | ProjectionError::OutOfOrder { .. } => {
                StoreError::Integrity(value.to_string())
            }
        }
    }
}
