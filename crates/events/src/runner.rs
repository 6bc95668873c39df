//! Projection runner: folds envelopes into a projection state while tracking
//! per-aggregate watermarks.
//!
//! Read models are **disposable**; events are the source of truth. The runner
//! is the single place where tenant pinning, duplicate skipping, gap and
//! ordering checks happen, for both full rebuilds and incremental updates.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use eventvault_core::{AggregateId, TenantId};

use crate::{EventEnvelope, Projection, TenantScoped};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProjectionError {
    #[error("tenant mismatch: projection is pinned to {expected}, event belongs to {found}")]
    TenantMismatch { expected: TenantId, found: TenantId },

    #[error("version gap on aggregate {aggregate_id}: last applied {last}, received {found}")]
    Gap {
        aggregate_id: AggregateId,
        last: u64,
        found: u64,
    },

    #[error("event at position {found} arrived after position {last} was already folded")]
    OutOfOrder { last: u64, found: u64 },
}

/// What happened to one envelope.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Applied {
    Folded,
    /// At or below the watermark: already part of the state.
    Duplicate,
}

/// How far a projection state has folded the log.
///
/// `versions` holds the last folded version per aggregate and drives
/// duplicate and gap detection. `position` is the highest commit position
/// folded so far; events are only ever folded in ascending position order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Watermarks {
    versions: BTreeMap<AggregateId, u64>,
    position: u64,
}

impl Watermarks {
    /// Last folded version of `aggregate_id`, 0 when none.
    pub fn version(&self, aggregate_id: AggregateId) -> u64 {
        self.versions.get(&aggregate_id).copied().unwrap_or(0)
    }

    pub fn get(&self, aggregate_id: &AggregateId) -> Option<&u64> {
        self.versions.get(aggregate_id)
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    /// Number of aggregates folded.
    pub fn len(&self) -> usize {
        self.versions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.versions.is_empty()
    }

    fn advance(&mut self, envelope: &EventEnvelope) {
        self.versions
            .insert(envelope.aggregate_id, envelope.event_version);
        self.position = self.position.max(envelope.position);
    }
}

/// Runs envelopes through a projection for a single tenant.
pub struct ProjectionRunner<'p, P>
where
    P: Projection,
{
    projection: &'p P,
    tenant_id: TenantId,
    state: P::State,
    watermarks: Watermarks,
}

impl<'p, P> ProjectionRunner<'p, P>
where
    P: Projection,
{
    /// Start from the empty state (rebuild).
    pub fn new(projection: &'p P, tenant_id: TenantId) -> Self {
        Self::resume(projection, tenant_id, P::State::default(), Watermarks::default())
    }

    /// Continue from previously published state (incremental update).
    pub fn resume(
        projection: &'p P,
        tenant_id: TenantId,
        state: P::State,
        watermarks: Watermarks,
    ) -> Self {
        Self {
            projection,
            tenant_id,
            state,
            watermarks,
        }
    }

    pub fn state(&self) -> &P::State {
        &self.state
    }

    pub fn watermarks(&self) -> &Watermarks {
        &self.watermarks
    }

    /// Apply a single envelope, enforcing tenant pinning, gapless versions
    /// and ascending commit positions.
    pub fn apply(&mut self, envelope: &EventEnvelope) -> Result<Applied, ProjectionError> {
        if !envelope.belongs_to(self.tenant_id) {
            return Err(ProjectionError::TenantMismatch {
                expected: self.tenant_id,
                found: envelope.tenant_id(),
            });
        }

        let last = self.watermarks.version(envelope.aggregate_id);
        if envelope.event_version <= last {
            return Ok(Applied::Duplicate);
        }
        if envelope.event_version != last + 1 {
            return Err(ProjectionError::Gap {
                aggregate_id: envelope.aggregate_id,
                last,
                found: envelope.event_version,
            });
        }
        if envelope.position <= self.watermarks.position {
            return Err(ProjectionError::OutOfOrder {
                last: self.watermarks.position,
                found: envelope.position,
            });
        }

        self.projection.apply(&mut self.state, envelope);
        self.watermarks.advance(envelope);
        Ok(Applied::Folded)
    }

    /// Apply many envelopes in order.
    pub fn run<'a>(
        &mut self,
        envelopes: impl IntoIterator<Item = &'a EventEnvelope>,
    ) -> Result<(), ProjectionError> {
        for env in envelopes {
            self.apply(env)?;
        }
        Ok(())
    }

    pub fn into_parts(self) -> (P::State, Watermarks) {
        (self.state, self.watermarks)
    }
}
