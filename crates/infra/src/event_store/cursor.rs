//! Lazy, paged, restartable replay cursor.

use std::collections::VecDeque;

use eventvault_core::{AggregateId, SessionContext};
use eventvault_events::EventEnvelope;

use super::r#trait::EventStore;
use crate::error::StoreError;

/// Default number of events fetched per page.
pub const DEFAULT_PAGE_SIZE: usize = 500;

/// Ordered sequence of one aggregate's events with `event_version > since`.
///
/// The cursor pins a **watermark** (the stream's current version when it was
/// opened) and never reads past it. Events are immutable and versions gapless,
/// so everything a single fold sees is one consistent point-in-time view, even
/// while other writers keep appending. Pages are fetched on demand; `rewind`
/// restarts from `since` without re-pinning the watermark.
pub struct EventCursor<'a, S: ?Sized> {
    store: &'a S,
    ctx: SessionContext,
    aggregate_id: AggregateId,
    since: u64,
    position: u64,
    watermark: u64,
    page_size: usize,
    buffer: VecDeque<EventEnvelope>,
}

impl<'a, S> EventCursor<'a, S>
where
    S: EventStore + ?Sized,
{
    pub async fn open(
        store: &'a S,
        ctx: &SessionContext,
        aggregate_id: AggregateId,
        since: u64,
        page_size: usize,
    ) -> Result<Self, StoreError> {
        let watermark = store.current_version(ctx, aggregate_id).await?;
        Ok(Self {
            store,
            ctx: *ctx,
            aggregate_id,
            since,
            position: since,
            watermark,
            page_size: page_size.max(1),
            buffer: VecDeque::new(),
        })
    }

    pub fn aggregate_id(&self) -> AggregateId {
        self.aggregate_id
    }

    /// Version the cursor will stop at.
    pub fn watermark(&self) -> u64 {
        self.watermark
    }

    /// Version of the last event returned (or `since` before the first one).
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Next event in ascending version order, `None` once the watermark is reached.
    pub async fn next(&mut self) -> Result<Option<EventEnvelope>, StoreError> {
        if self.buffer.is_empty() {
            if self.position >= self.watermark {
                return Ok(None);
            }
            let page = self
                .store
                .read_range(
                    &self.ctx,
                    self.aggregate_id,
                    self.position,
                    self.watermark,
                    self.page_size,
                )
                .await?;
            if page.is_empty() {
                return Err(StoreError::Integrity(format!(
                    "aggregate {} has no events in ({}, {}]",
                    self.aggregate_id, self.position, self.watermark
                )));
            }
            self.buffer.extend(page);
        }

        let Some(event) = self.buffer.pop_front() else {
            return Ok(None);
        };
        if event.event_version != self.position + 1 {
            return Err(StoreError::Integrity(format!(
                "aggregate {} skips from version {} to {}",
                self.aggregate_id, self.position, event.event_version
            )));
        }
        self.position = event.event_version;
        Ok(Some(event))
    }

    /// Restart from `since` against the same watermark.
    pub fn rewind(&mut self) {
        self.position = self.since;
        self.buffer.clear();
    }

    /// Drain the remaining events.
    pub async fn collect(mut self) -> Result<Vec<EventEnvelope>, StoreError> {
        let mut events = Vec::new();
        while let Some(event) = self.next().await? {
            events.push(event);
        }
        Ok(events)
    }
}

/// Open a cursor over `aggregate_id`'s events after `since`.
pub async fn events_after<'a, S>(
    store: &'a S,
    ctx: &SessionContext,
    aggregate_id: AggregateId,
    since: u64,
) -> Result<EventCursor<'a, S>, StoreError>
where
    S: EventStore + ?Sized,
{
    EventCursor::open(store, ctx, aggregate_id, since, DEFAULT_PAGE_SIZE).await
}
