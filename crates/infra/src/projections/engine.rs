//! Projection engine: full rebuilds, incremental updates and reads.
//!
//! ## Consistency
//!
//! Readers never wait. `read` returns the last state that was published as
//! `Ready`, tagged with the record's current status, so a caller can tell a
//! fresh view from one that is being rebuilt or known to be behind. A record
//! that has never finished a build has nothing to return and reads as
//! `NotFound`.
//!
//! Writers for the same `ProjectionKey` (rebuilds and incremental updates) are
//! serialized by a per-key async lock inside this process. Across processes
//! the generation number takes over: `begin_build` bumps it, and a publish only
//! lands if the generation is unchanged, so a slower overlapping build can
//! never overwrite a newer one. A lock entry lives only while some operation
//! holds or awaits it.
//!
//! ## Ordering
//!
//! A tenant-wide rebuild merges the per-aggregate cursors by commit position,
//! the same order incremental updates arrive in. An incremental event that
//! arrives behind the record's highest folded position is handled like a
//! version gap, so rebuilt and incrementally maintained states agree.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::{Arc, Mutex};

use serde::Deserialize;
use tracing::{debug, info, instrument, warn};

use eventvault_core::{AggregateId, SessionContext, TenantId};
use eventvault_events::{
    Applied, EventEnvelope, Projection, ProjectionError, ProjectionRunner, TenantScoped,
    Watermarks,
};

use super::store::{ProjectionKey, ProjectionRecord, ProjectionStatus, ProjectionStore};
use crate::config::ProjectionConfig;
use crate::error::StoreError;
use crate::event_store::{EventCursor, EventStore};

/// A published projection state as seen by a reader.
#[derive(Debug, Clone, PartialEq)]
pub struct ProjectionView<S> {
    pub state: S,
    /// `Ready`, or `Building`/`Stale` while the state is known to lag.
    pub status: ProjectionStatus,
    pub generation: u64,
    /// Last folded version per aggregate and highest folded position.
    pub watermarks: Watermarks,
}

/// What an incremental update did to one projection record.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum IncrementalOutcome {
    /// The event was folded and the new state published.
    Applied,
    /// The event was at or below the record's watermark.
    Duplicate,
    /// No published state exists for this key; nothing to update.
    NotMaterialized,
    /// The record is (now) stale and waits for a rebuild.
    MarkedStale,
    /// A gap or out-of-order event was detected and the record was rebuilt
    /// from the log.
    Rebuilt,
    /// A newer build started meanwhile; this update was discarded.
    Superseded,
}

type KeyLock = Arc<tokio::sync::Mutex<()>>;
type LockMap = Mutex<HashMap<ProjectionKey, KeyLock>>;

/// Exclusive access to one projection key. Dropping it releases the lock and
/// removes the map entry when nobody else holds or awaits it.
struct KeyGuard<'e> {
    locks: &'e LockMap,
    key: ProjectionKey,
    guard: Option<tokio::sync::OwnedMutexGuard<()>>,
}

impl Drop for KeyGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        // Clones are only taken under the map lock, so the count is stable here.
        if let Ok(mut locks) = self.locks.lock() {
            if locks
                .get(&self.key)
                .is_some_and(|lock| Arc::strong_count(lock) == 1)
            {
                locks.remove(&self.key);
            }
        }
    }
}

pub struct ProjectionEngine {
    events: Arc<dyn EventStore>,
    store: Arc<dyn ProjectionStore>,
    config: ProjectionConfig,
    page_size: usize,
    locks: LockMap,
}

impl ProjectionEngine {
    pub fn new(
        events: Arc<dyn EventStore>,
        store: Arc<dyn ProjectionStore>,
        config: ProjectionConfig,
        page_size: usize,
    ) -> Self {
        Self {
            events,
            store,
            config,
            page_size,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> ProjectionConfig {
        self.config
    }

    async fn lock_key(&self, key: &ProjectionKey) -> Result<KeyGuard<'_>, StoreError> {
        let lock = {
            let mut locks = self
                .locks
                .lock()
                .map_err(|_| StoreError::poisoned("projection locks"))?;
            locks.entry(key.clone()).or_default().clone()
        };
        let guard = lock.lock_owned().await;
        Ok(KeyGuard {
            locks: &self.locks,
            key: key.clone(),
            guard: Some(guard),
        })
    }

    fn key<P: Projection>(
        ctx: &SessionContext,
        projection: &P,
        aggregate_id: Option<AggregateId>,
    ) -> Result<ProjectionKey, StoreError> {
        let tenant_id = ctx.require_tenant()?;
        Ok(ProjectionKey::new(tenant_id, projection.name(), aggregate_id))
    }

    /// Rebuild from the full event log and publish the result as `Ready`.
    ///
    /// `aggregate_id = None` folds every aggregate of the session's tenant in
    /// commit order; `Some(id)` folds that aggregate only. On failure after
    /// the build started the record is left `Stale`.
    #[instrument(
        skip(self, ctx, projection),
        fields(tenant_id = ?ctx.current_tenant(), projection = projection.name()),
        err
    )]
    pub async fn rebuild<P: Projection>(
        &self,
        ctx: &SessionContext,
        projection: &P,
        aggregate_id: Option<AggregateId>,
    ) -> Result<ProjectionView<P::State>, StoreError> {
        let key = Self::key(ctx, projection, aggregate_id)?;
        let _guard = self.lock_key(&key).await?;
        self.rebuild_locked(ctx, projection, &key).await
    }

    async fn rebuild_locked<P: Projection>(
        &self,
        ctx: &SessionContext,
        projection: &P,
        key: &ProjectionKey,
    ) -> Result<ProjectionView<P::State>, StoreError> {
        let existing = self.store.load(ctx, key).await?;
        if existing.is_some_and(|record| record.status == ProjectionStatus::Ready) {
            self.store.set_status(ctx, key, ProjectionStatus::Stale).await?;
        }
        let generation = self.store.begin_build(ctx, key).await?;
        debug!(projection = %key, generation, "rebuild started");

        match self.build_and_publish(ctx, projection, key, generation).await {
            Ok(Some(view)) => {
                info!(projection = %key, generation, aggregates = view.watermarks.len(), "projection rebuilt");
                Ok(view)
            }
            Ok(None) => {
                info!(projection = %key, generation, "rebuild superseded by a newer build");
                self.read_key(ctx, key).await
            }
            Err(error) => {
                if let Err(mark) = self.store.set_status(ctx, key, ProjectionStatus::Stale).await {
                    warn!(projection = %key, error = %mark, "could not mark failed rebuild stale");
                }
                Err(error)
            }
        }
    }

    /// `None` when a newer build took the record over.
    async fn build_and_publish<P: Projection>(
        &self,
        ctx: &SessionContext,
        projection: &P,
        key: &ProjectionKey,
        generation: u64,
    ) -> Result<Option<ProjectionView<P::State>>, StoreError> {
        let (state, watermarks) = self.fold_log(ctx, projection, key).await?;
        let encoded = serde_json::to_value(&state)?;
        if !self
            .store
            .publish(ctx, key, generation, encoded, watermarks.clone())
            .await?
        {
            return Ok(None);
        }
        Ok(Some(ProjectionView {
            state,
            status: ProjectionStatus::Ready,
            generation,
            watermarks,
        }))
    }

    async fn fold_log<P: Projection>(
        &self,
        ctx: &SessionContext,
        projection: &P,
        key: &ProjectionKey,
    ) -> Result<(P::State, Watermarks), StoreError> {
        let aggregate_ids = match key.aggregate_id {
            Some(aggregate_id) => vec![aggregate_id],
            None => self.events.aggregate_ids(ctx).await?,
        };

        // One cursor per aggregate, merged on the lowest pending position.
        let mut cursors = Vec::with_capacity(aggregate_ids.len());
        let mut pending = Vec::with_capacity(aggregate_ids.len());
        let mut heads = BinaryHeap::new();
        for aggregate_id in aggregate_ids {
            let mut cursor =
                EventCursor::open(&*self.events, ctx, aggregate_id, 0, self.page_size).await?;
            let head = cursor.next().await?;
            if let Some(envelope) = &head {
                heads.push(Reverse((envelope.position, cursors.len())));
            }
            pending.push(head);
            cursors.push(cursor);
        }

        let mut runner = ProjectionRunner::new(projection, key.tenant_id);
        while let Some(Reverse((_, slot))) = heads.pop() {
            let Some(envelope) = pending[slot].take() else {
                continue;
            };
            runner.apply(&envelope)?;
            let next = cursors[slot].next().await?;
            if let Some(envelope) = &next {
                heads.push(Reverse((envelope.position, slot)));
            }
            pending[slot] = next;
        }
        Ok(runner.into_parts())
    }

    /// Fold one newly appended event into every materialized record covering
    /// it: the tenant-wide record and the record of its aggregate.
    #[instrument(
        skip(self, ctx, projection, event),
        fields(
            tenant_id = ?ctx.current_tenant(),
            projection = projection.name(),
            aggregate_id = %event.aggregate_id,
            event_version = event.event_version
        ),
        err
    )]
    pub async fn apply_incremental<P: Projection>(
        &self,
        ctx: &SessionContext,
        projection: &P,
        event: &EventEnvelope,
    ) -> Result<Vec<(ProjectionKey, IncrementalOutcome)>, StoreError> {
        let tenant_id = ctx.require_tenant()?;
        if !event.belongs_to(tenant_id) {
            return Err(ProjectionError::TenantMismatch {
                expected: tenant_id,
                found: event.tenant_id(),
            }
            .into());
        }

        let mut outcomes = Vec::with_capacity(2);
        for aggregate_id in [None, Some(event.aggregate_id)] {
            let key = ProjectionKey::new(tenant_id, projection.name(), aggregate_id);
            let _guard = self.lock_key(&key).await?;
            let outcome = self.apply_to_key(ctx, projection, tenant_id, &key, event).await?;
            debug!(projection = %key, ?outcome, "incremental update");
            outcomes.push((key, outcome));
        }
        Ok(outcomes)
    }

    async fn apply_to_key<P: Projection>(
        &self,
        ctx: &SessionContext,
        projection: &P,
        tenant_id: TenantId,
        key: &ProjectionKey,
        event: &EventEnvelope,
    ) -> Result<IncrementalOutcome, StoreError> {
        let Some(record) = self.store.load(ctx, key).await? else {
            return Ok(IncrementalOutcome::NotMaterialized);
        };
        let Some(published) = record.state.as_ref() else {
            return Ok(IncrementalOutcome::NotMaterialized);
        };
        if record.status != ProjectionStatus::Ready {
            return Ok(IncrementalOutcome::MarkedStale);
        }
        if !self.config.incremental_updates || !projection.supports_incremental() {
            self.store.set_status(ctx, key, ProjectionStatus::Stale).await?;
            return Ok(IncrementalOutcome::MarkedStale);
        }

        let state = decode_state::<P>(key, published)?;
        let ProjectionRecord {
            watermarks,
            generation,
            ..
        } = record;
        let mut runner = ProjectionRunner::resume(projection, tenant_id, state, watermarks);

        match runner.apply(event) {
            Ok(Applied::Duplicate) => Ok(IncrementalOutcome::Duplicate),
            Ok(Applied::Folded) => {
                let (state, watermarks) = runner.into_parts();
                let encoded = serde_json::to_value(&state)?;
                if self
                    .store
                    .publish(ctx, key, generation, encoded, watermarks)
                    .await?
                {
                    Ok(IncrementalOutcome::Applied)
                } else {
                    Ok(IncrementalOutcome::Superseded)
                }
            }
            Err(error @ (ProjectionError::Gap { .. } | ProjectionError::OutOfOrder { .. })) => {
                warn!(projection = %key, error = %error, "incremental update cannot be folded in order");
                self.store.set_status(ctx, key, ProjectionStatus::Stale).await?;
                if self.config.rebuild_on_gap {
                    self.rebuild_locked(ctx, projection, key).await?;
                    Ok(IncrementalOutcome::Rebuilt)
                } else {
                    Ok(IncrementalOutcome::MarkedStale)
                }
            }
            Err(error) => Err(error.into()),
        }
    }

    /// Last published state. Never blocks on a running rebuild.
    pub async fn read<P: Projection>(
        &self,
        ctx: &SessionContext,
        projection: &P,
        aggregate_id: Option<AggregateId>,
    ) -> Result<ProjectionView<P::State>, StoreError> {
        let key = Self::key(ctx, projection, aggregate_id)?;
        self.read_key(ctx, &key).await
    }

    async fn read_key<S>(
        &self,
        ctx: &SessionContext,
        key: &ProjectionKey,
    ) -> Result<ProjectionView<S>, StoreError>
    where
        S: for<'de> Deserialize<'de>,
    {
        let record = self
            .store
            .load(ctx, key)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("projection {key}")))?;
        let Some(published) = record.state.as_ref() else {
            return Err(StoreError::NotFound(format!(
                "published state of projection {key}"
            )));
        };

        Ok(ProjectionView {
            state: S::deserialize(published).map_err(|e| {
                StoreError::Serialization(format!("projection {key} state: {e}"))
            })?,
            status: record.status,
            generation: record.generation,
            watermarks: record.watermarks,
        })
    }

    /// Current lifecycle status; `Absent` when no record exists.
    pub async fn status(
        &self,
        ctx: &SessionContext,
        name: &str,
        aggregate_id: Option<AggregateId>,
    ) -> Result<ProjectionStatus, StoreError> {
        let key = ProjectionKey::new(ctx.require_tenant()?, name, aggregate_id);
        Ok(self
            .store
            .load(ctx, &key)
            .await?
            .map_or(ProjectionStatus::Absent, |record| record.status))
    }

    /// Flag a `Ready` record as behind the log. A no-op for other states.
    pub async fn mark_stale(
        &self,
        ctx: &SessionContext,
        name: &str,
        aggregate_id: Option<AggregateId>,
    ) -> Result<ProjectionStatus, StoreError> {
        let key = ProjectionKey::new(ctx.require_tenant()?, name, aggregate_id);
        let _guard = self.lock_key(&key).await?;

        match self.store.load(ctx, &key).await? {
            None => Ok(ProjectionStatus::Absent),
            Some(record) if record.status == ProjectionStatus::Ready => {
                self.store.set_status(ctx, &key, ProjectionStatus::Stale).await?;
                Ok(ProjectionStatus::Stale)
            }
            Some(record) => Ok(record.status),
        }
    }
}

fn decode_state<P: Projection>(
    key: &ProjectionKey,
    published: &serde_json::Value,
) -> Result<P::State, StoreError> {
    P::State::deserialize(published)
        .map_err(|e| StoreError::Serialization(format!("projection {key} state: {e}")))
}
