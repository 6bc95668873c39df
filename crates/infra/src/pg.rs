//! Shared Postgres plumbing: session-scoped transactions and error mapping.
//!
//! ## Session propagation
//!
//! Every Postgres operation runs inside a transaction opened by
//! [`begin_scoped`]. It resolves the tenant from the `SessionContext` (failing
//! closed when none is bound) and publishes it to the row-level-security
//! policies through `set_config(.., is_local => true)`. Transaction-local
//! settings vanish at commit or rollback, including the implicit rollback when
//! a `Transaction` is dropped on an error path, so a pooled connection never
//! carries one request's identity into the next.
//!
//! ## Error mapping
//!
//! | SQLx error | Postgres code | StoreError |
//! |------------|---------------|------------|
//! | Database (unique violation) | `23505` | `ConcurrencyConflict` on event append, `Backend` elsewhere |
//! | Database (RLS / insufficient privilege) | `42501` | `TenantIsolation` |
//! | Database (other) | any | `Backend` |
//! | Io, Tls, PoolTimedOut, PoolClosed, WorkerCrashed | n/a | `StorageUnavailable` |
//! | Decode / ColumnDecode | n/a | `Serialization` |
//! | Other | n/a | `Backend` |
//!
//! `From<sqlx::Error> for StoreError` applies the same table without an
//! operation name.

use sqlx::{PgPool, Postgres, Transaction};

use eventvault_core::{SessionContext, TenantId};

use crate::error::StoreError;

pub(crate) type PgTx = Transaction<'static, Postgres>;

/// Embedded schema (tables, constraints, row-level-security policies).
pub const SCHEMA: &str = include_str!("../migrations/0001_eventvault.sql");

/// Apply the schema. Idempotent.
pub async fn migrate(pool: &PgPool) -> Result<(), StoreError> {
    sqlx::raw_sql(SCHEMA).execute(pool).await?;
    Ok(())
}

/// Open a transaction bound to the session's tenant (and user, when set).
pub(crate) async fn begin_scoped(
    pool: &PgPool,
    ctx: &SessionContext,
) -> Result<(PgTx, TenantId), StoreError> {
    let tenant_id = ctx.require_tenant()?;

    let mut tx = pool
        .begin()
        .await
        .map_err(|e| map_sqlx_error("begin_transaction", e))?;

    sqlx::query(
        "SELECT set_config('app.tenant_id', $1, true), set_config('app.user_id', $2, true)",
    )
    .bind(tenant_id.get().to_string())
    .bind(ctx.current_user().map(|u| u.to_string()).unwrap_or_default())
    .execute(&mut *tx)
    .await
    .map_err(|e| map_sqlx_error("bind_session", e))?;

    Ok((tx, tenant_id))
}

pub(crate) async fn commit(tx: PgTx, operation: &str) -> Result<(), StoreError> {
    tx.commit().await.map_err(|e| map_sqlx_error(operation, e))
}

/// Map SQLx errors to `StoreError`.
pub(crate) fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("42501") => StoreError::TenantIsolation(msg),
                _ => StoreError::Backend(msg),
            }
        }
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => {
            StoreError::StorageUnavailable(format!("{operation}: {err}"))
        }
        sqlx::Error::Decode(_) | sqlx::Error::ColumnDecode { .. } => {
            StoreError::Serialization(format!("{operation}: {err}"))
        }
        _ => StoreError::Backend(format!("sqlx error in {operation}: {err}")),
    }
}

/// Check if an error is a unique constraint violation.
pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        return db_err.code().as_deref() == Some("23505");
    }
    false
}

pub(crate) fn to_db_version(version: u64) -> Result<i64, StoreError> {
    i64::try_from(version)
        .map_err(|_| StoreError::Integrity(format!("version {version} exceeds storage range")))
}

pub(crate) fn from_db_version(version: i64) -> Result<u64, StoreError> {
    u64::try_from(version)
        .map_err(|_| StoreError::Integrity(format!("negative version {version} in storage")))
}

pub(crate) fn from_db_position(position: i64) -> Result<u64, StoreError> {
    u64::try_from(position)
        .map_err(|_| StoreError::Integrity(format!("negative position {position} in storage")))
}

pub(crate) fn tenant_from_db(raw: i64) -> Result<TenantId, StoreError> {
    TenantId::new(raw).map_err(|e| StoreError::Integrity(e.to_string()))
}
