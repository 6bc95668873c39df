//! Postgres-backed event store implementation.
//!
//! Tenant isolation is enforced twice: every query filters on `tenant_id`,
//! and row-level-security policies check the same value against the
//! transaction-local `app.tenant_id` setting (see `crate::pg`).
//!
//! ## Atomic append
//!
//! `append_batch()` reads `MAX(event_version)` and inserts inside one
//! transaction. Two transactions that both read version N race on the unique
//! constraint `(tenant_id, aggregate_id, event_version)`; the loser gets
//! SQLSTATE `23505`, which is reported as `ConcurrencyConflict` and rolls the
//! whole batch back. The expectation is checked even for an empty batch.
//!
//! ## Commit positions
//!
//! `position` is an identity column, so every inserted event gets a unique,
//! increasing number across all aggregates. Tenant-wide projection rebuilds
//! merge streams on it.
//!
//! ## Thread Safety
//!
//! `PostgresEventStore` is `Send + Sync` and cheap to clone; all operations go
//! through the SQLx connection pool.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::{Span, instrument};

use eventvault_core::{AggregateId, ExpectedVersion, SessionContext, UserId};
use eventvault_events::{EventEnvelope, NewEvent};

use super::r#trait::EventStore;
use crate::error::StoreError;
use crate::pg::{
    PgTx, begin_scoped, commit, from_db_position, from_db_version, is_unique_violation,
    map_sqlx_error, tenant_from_db, to_db_version,
};

/// Postgres-backed append-only event store.
#[derive(Debug, Clone)]
pub struct PostgresEventStore {
    pool: Arc<PgPool>,
}

impl PostgresEventStore {
    /// Create a new PostgresEventStore with the given connection pool.
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

/// Current version of a stream, read inside the append transaction.
async fn stream_version(
    tx: &mut PgTx,
    tenant_id: i64,
    aggregate_id: AggregateId,
) -> Result<u64, StoreError> {
    let row = sqlx::query(
        r#"
        SELECT COALESCE(MAX(event_version), 0) AS current_version
        FROM events
        WHERE tenant_id = $1 AND aggregate_id = $2
        "#,
    )
    .bind(tenant_id)
    .bind(aggregate_id.as_uuid())
    .fetch_one(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("stream_version", e))?;

    let current: i64 = row
        .try_get("current_version")
        .map_err(|e| map_sqlx_error("stream_version", e))?;
    from_db_version(current)
}

#[async_trait]
impl EventStore for PostgresEventStore {
    #[instrument(
        skip(self, ctx, events),
        fields(
            tenant_id = ?ctx.current_tenant(),
            aggregate_id = %aggregate_id,
            event_count = events.len(),
            expected_version = ?expected_version
        ),
        err
    )]
    async fn append_batch(
        &self,
        ctx: &SessionContext,
        aggregate_id: AggregateId,
        events: Vec<NewEvent>,
        expected_version: ExpectedVersion,
    ) -> Result<Vec<EventEnvelope>, StoreError> {
        let (mut tx, tenant_id) = begin_scoped(&self.pool, ctx).await?;

        let current = stream_version(&mut tx, tenant_id.get(), aggregate_id).await?;
        if !expected_version.matches(current) {
            // Dropping `tx` rolls back.
            return Err(StoreError::ConcurrencyConflict {
                aggregate_id,
                expected: expected_version,
                actual: Some(current),
            });
        }
        if events.is_empty() {
            commit(tx, "append_batch").await?;
            return Ok(vec![]);
        }

        let recorded_at = Utc::now();
        let recorded_by = ctx.current_user();
        let mut committed = Vec::with_capacity(events.len());

        for (event, event_version) in events.into_iter().zip(current + 1..) {
            let row = sqlx::query(
                r#"
                INSERT INTO events (
                    event_id,
                    tenant_id,
                    aggregate_id,
                    event_version,
                    event_type,
                    payload,
                    recorded_at,
                    recorded_by
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                RETURNING position
                "#,
            )
            .bind(event.event_id)
            .bind(tenant_id.get())
            .bind(aggregate_id.as_uuid())
            .bind(to_db_version(event_version)?)
            .bind(&event.event_type)
            .bind(&event.payload)
            .bind(recorded_at)
            .bind(recorded_by.map(|u| *u.as_uuid()))
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| {
                if is_unique_violation(&e) {
                    StoreError::ConcurrencyConflict {
                        aggregate_id,
                        expected: expected_version,
                        actual: None,
                    }
                } else {
                    map_sqlx_error("insert_event", e)
                }
            })?;
            let position: i64 = row
                .try_get("position")
                .map_err(|e| map_sqlx_error("insert_event", e))?;

            committed.push(EventEnvelope {
                event_id: event.event_id,
                tenant_id,
                aggregate_id,
                event_version,
                position: from_db_position(position)?,
                event_type: event.event_type,
                payload: event.payload,
                recorded_at,
                recorded_by,
            });
        }

        tx.commit().await.map_err(|e| {
            if is_unique_violation(&e) {
                StoreError::ConcurrencyConflict {
                    aggregate_id,
                    expected: expected_version,
                    actual: None,
                }
            } else {
                map_sqlx_error("commit_transaction", e)
            }
        })?;

        Span::current().record("event_count", committed.len());
        Ok(committed)
    }

    #[instrument(skip(self, ctx), fields(tenant_id = ?ctx.current_tenant(), aggregate_id = %aggregate_id), err)]
    async fn current_version(
        &self,
        ctx: &SessionContext,
        aggregate_id: AggregateId,
    ) -> Result<u64, StoreError> {
        let (mut tx, tenant_id) = begin_scoped(&self.pool, ctx).await?;
        let version = stream_version(&mut tx, tenant_id.get(), aggregate_id).await?;
        commit(tx, "current_version").await?;
        Ok(version)
    }

    #[instrument(
        skip(self, ctx),
        fields(tenant_id = ?ctx.current_tenant(), aggregate_id = %aggregate_id),
        err
    )]
    async fn read_range(
        &self,
        ctx: &SessionContext,
        aggregate_id: AggregateId,
        after: u64,
        up_to: u64,
        limit: usize,
    ) -> Result<Vec<EventEnvelope>, StoreError> {
        let (mut tx, tenant_id) = begin_scoped(&self.pool, ctx).await?;

        let rows = sqlx::query(
            r#"
            SELECT
                event_id,
                tenant_id,
                aggregate_id,
                event_version,
                position,
                event_type,
                payload,
                recorded_at,
                recorded_by
            FROM events
            WHERE tenant_id = $1
              AND aggregate_id = $2
              AND event_version > $3
              AND event_version <= $4
            ORDER BY event_version ASC
            LIMIT $5
            "#,
        )
        .bind(tenant_id.get())
        .bind(aggregate_id.as_uuid())
        .bind(to_db_version(after)?)
        .bind(to_db_version(up_to)?)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("read_range", e))?;
        commit(tx, "read_range").await?;

        rows.iter().map(event_from_row).collect()
    }

    #[instrument(skip(self, ctx), fields(tenant_id = ?ctx.current_tenant()), err)]
    async fn aggregate_ids(&self, ctx: &SessionContext) -> Result<Vec<AggregateId>, StoreError> {
        let (mut tx, tenant_id) = begin_scoped(&self.pool, ctx).await?;

        let rows = sqlx::query(
            "SELECT DISTINCT aggregate_id FROM events WHERE tenant_id = $1 ORDER BY aggregate_id",
        )
        .bind(tenant_id.get())
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("aggregate_ids", e))?;
        commit(tx, "aggregate_ids").await?;

        let mut ids = rows
            .iter()
            .map(|row| {
                row.try_get::<uuid::Uuid, _>("aggregate_id")
                    .map(AggregateId::from_uuid)
                    .map_err(|e| map_sqlx_error("aggregate_ids", e))
            })
            .collect::<Result<Vec<_>, _>>()?;
        ids.sort();
        Ok(ids)
    }
}

fn event_from_row(row: &PgRow) -> Result<EventEnvelope, StoreError> {
    let get_err = |e| map_sqlx_error("decode_event", e);

    let recorded_by: Option<uuid::Uuid> = row.try_get("recorded_by").map_err(get_err)?;
    let recorded_at: DateTime<Utc> = row.try_get("recorded_at").map_err(get_err)?;

    Ok(EventEnvelope {
        event_id: row.try_get("event_id").map_err(get_err)?,
        tenant_id: tenant_from_db(row.try_get("tenant_id").map_err(get_err)?)?,
        aggregate_id: AggregateId::from_uuid(row.try_get("aggregate_id").map_err(get_err)?),
        event_version: from_db_version(row.try_get("event_version").map_err(get_err)?)?,
        position: from_db_position(row.try_get("position").map_err(get_err)?)?,
        event_type: row.try_get("event_type").map_err(get_err)?,
        payload: row.try_get("payload").map_err(get_err)?,
        recorded_at,
        recorded_by: recorded_by.map(UserId::from_uuid),
    })
}
