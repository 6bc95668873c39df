use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use eventvault_core::{AggregateId, TenantId, UserId};

use crate::DomainEvent;

/// An event ready to be appended (no version assigned yet).
///
/// The store assigns `event_version`, `recorded_at` and stamps tenant/user
/// from the session context during append; callers only say *what* happened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewEvent {
    pub event_id: Uuid,
    pub event_type: String,
    pub payload: JsonValue,
}

impl NewEvent {
    pub fn new(event_type: impl Into<String>, payload: JsonValue) -> Self {
        Self {
            event_id: Uuid::now_v7(),
            event_type: event_type.into(),
            payload,
        }
    }

    /// Serialize a typed domain event, keeping its type name alongside.
    pub fn from_typed<E>(event: &E) -> Result<Self, serde_json::Error>
    where
        E: DomainEvent + Serialize,
    {
        Ok(Self::new(event.event_type(), serde_json::to_value(event)?))
    }
}

/// An immutable, persisted event.
///
/// Notes:
/// - **Multi-tenancy**: `tenant_id` is stamped from the appending session and
///   every read filters on it.
/// - **Append-only**: `event_version` is gapless per aggregate, starting at 1,
///   and `(tenant_id, aggregate_id, event_version)` is unique.
/// - **Commit order**: `position` is assigned by the store, unique and
///   increasing across all aggregates. It orders events of different streams.
/// - `payload` is opaque to the store; only reducers and projections read it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub event_id: Uuid,
    pub tenant_id: TenantId,
    pub aggregate_id: AggregateId,
    pub event_version: u64,
    pub position: u64,
    pub event_type: String,
    pub payload: JsonValue,
    pub recorded_at: DateTime<Utc>,
    pub recorded_by: Option<UserId>,
}

impl EventEnvelope {
    /// Decode the payload into the aggregate's (or projection's) event type.
    pub fn decode<E: DeserializeOwned>(&self) -> Result<E, serde_json::Error> {
        E::deserialize(&self.payload)
    }
}
