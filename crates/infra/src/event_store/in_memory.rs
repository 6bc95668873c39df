use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use chrono::Utc;

use eventvault_core::{AggregateId, ExpectedVersion, SessionContext, TenantId};
use eventvault_events::{EventEnvelope, NewEvent};

use super::r#trait::EventStore;
use crate::error::StoreError;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
struct StreamKey {
    tenant_id: TenantId,
    aggregate_id: AggregateId,
}

type Stream = Arc<Mutex<Vec<EventEnvelope>>>;

/// In-memory append-only event store.
///
/// Intended for tests/dev. Each stream has its own mutex, which is the
/// atomic check-and-insert point; the outer map lock is only held long enough
/// to find or create a stream, so appends to different aggregates never wait
/// on each other. Commit positions come from one store-wide counter, taken
/// while the stream is locked.
#[derive(Debug, Default)]
pub struct InMemoryEventStore {
    streams: RwLock<HashMap<StreamKey, Stream>>,
    last_position: AtomicU64,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn stream(&self, key: StreamKey) -> Result<Option<Stream>, StoreError> {
        let streams = self.streams.read().map_err(|_| StoreError::poisoned("stream map"))?;
        Ok(streams.get(&key).cloned())
    }

    fn stream_or_create(&self, key: StreamKey) -> Result<Stream, StoreError> {
        if let Some(stream) = self.stream(key)? {
            return Ok(stream);
        }
        let mut streams = self
            .streams
            .write()
            .map_err(|_| StoreError::poisoned("stream map"))?;
        Ok(streams.entry(key).or_default().clone())
    }

    fn current_version(stream: &[EventEnvelope]) -> u64 {
        stream.last().map(|e| e.event_version).unwrap_or(0)
    }

    /// Number of streams held, empty or not.
    #[cfg(test)]
    fn stream_count(&self) -> usize {
        self.streams.read().map(|streams| streams.len()).unwrap_or(0)
    }
}

fn check_expected(
    aggregate_id: AggregateId,
    expected_version: ExpectedVersion,
    current: u64,
) -> Result<(), StoreError> {
    if expected_version.matches(current) {
        return Ok(());
    }
    Err(StoreError::ConcurrencyConflict {
        aggregate_id,
        expected: expected_version,
        actual: Some(current),
    })
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn append_batch(
        &self,
        ctx: &SessionContext,
        aggregate_id: AggregateId,
        events: Vec<NewEvent>,
        expected_version: ExpectedVersion,
    ) -> Result<Vec<EventEnvelope>, StoreError> {
        let tenant_id = ctx.require_tenant()?;
        let key = StreamKey {
            tenant_id,
            aggregate_id,
        };

        let stream = match self.stream(key)? {
            Some(stream) => stream,
            None => {
                // Only an append that is going to write creates a stream.
                check_expected(aggregate_id, expected_version, 0)?;
                if events.is_empty() {
                    return Ok(vec![]);
                }
                self.stream_or_create(key)?
            }
        };
        let mut stream = stream.lock().map_err(|_| StoreError::poisoned("stream"))?;

        let current = Self::current_version(&stream);
        check_expected(aggregate_id, expected_version, current)?;
        if events.is_empty() {
            return Ok(vec![]);
        }

        let count = events.len() as u64;
        let first_position = self.last_position.fetch_add(count, Ordering::SeqCst) + 1;
        let recorded_at = Utc::now();
        let committed: Vec<EventEnvelope> = events
            .into_iter()
            .zip(current + 1..)
            .zip(first_position..)
            .map(|((event, event_version), position)| EventEnvelope {
                event_id: event.event_id,
                tenant_id,
                aggregate_id,
                event_version,
                position,
                event_type: event.event_type,
                payload: event.payload,
                recorded_at,
                recorded_by: ctx.current_user(),
            })
            .collect();

        stream.extend(committed.iter().cloned());
        Ok(committed)
    }

    async fn current_version(
        &self,
        ctx: &SessionContext,
        aggregate_id: AggregateId,
    ) -> Result<u64, StoreError> {
        let tenant_id = ctx.require_tenant()?;
        let Some(stream) = self.stream(StreamKey {
            tenant_id,
            aggregate_id,
        })?
        else {
            return Ok(0);
        };
        let stream = stream.lock().map_err(|_| StoreError::poisoned("stream"))?;
        Ok(Self::current_version(&stream))
    }

    async fn read_range(
        &self,
        ctx: &SessionContext,
        aggregate_id: AggregateId,
        after: u64,
        up_to: u64,
        limit: usize,
    ) -> Result<Vec<EventEnvelope>, StoreError> {
        let tenant_id = ctx.require_tenant()?;
        let Some(stream) = self.stream(StreamKey {
            tenant_id,
            aggregate_id,
        })?
        else {
            return Ok(vec![]);
        };
        let stream = stream.lock().map_err(|_| StoreError::poisoned("stream"))?;

        // Versions are gapless from 1, so version v sits at index v - 1.
        let start = usize::try_from(after).unwrap_or(usize::MAX).min(stream.len());
        let end = usize::try_from(up_to).unwrap_or(usize::MAX).min(stream.len());
        if start >= end {
            return Ok(vec![]);
        }
        Ok(stream[start..end].iter().take(limit).cloned().collect())
    }

    async fn aggregate_ids(&self, ctx: &SessionContext) -> Result<Vec<AggregateId>, StoreError> {
        let tenant_id = ctx.require_tenant()?;
        let streams = self.streams.read().map_err(|_| StoreError::poisoned("stream map"))?;

        let mut ids = Vec::new();
        for (key, stream) in streams.iter() {
            if key.tenant_id != tenant_id {
                continue;
            }
            let stream = stream.lock().map_err(|_| StoreError::poisoned("stream"))?;
            if !stream.is_empty() {
                ids.push(key.aggregate_id);
            }
        }
        ids.sort();
        Ok(ids)
    }
}
