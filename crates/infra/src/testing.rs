//! Test fixtures: a small subscription aggregate and projections over it.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use eventvault_core::{Aggregate, AggregateId, DomainError, SessionContext, TenantId, UserId};
use eventvault_events::{DomainEvent, EventEnvelope, NewEvent, Projection};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SubscriptionEvent {
    Started { plan: String, seats: u32 },
    SeatsChanged { seats: u32 },
    Cancelled,
}

impl DomainEvent for SubscriptionEvent {
    fn event_type(&self) -> &'static str {
        match self {
            SubscriptionEvent::Started { .. } => "subscription.started",
            SubscriptionEvent::SeatsChanged { .. } => "subscription.seats_changed",
            SubscriptionEvent::Cancelled => "subscription.cancelled",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub plan: Option<String>,
    pub seats: u32,
    pub active: bool,
    pub changes: u64,
}

impl Aggregate for Subscription {
    type Event = SubscriptionEvent;

    const AGGREGATE_TYPE: &'static str = "billing.subscription";

    fn apply(&mut self, event: &Self::Event) {
        match event {
            SubscriptionEvent::Started { plan, seats } => {
                self.plan = Some(plan.clone());
                self.seats = *seats;
                self.active = true;
            }
            SubscriptionEvent::SeatsChanged { seats } => self.seats = *seats,
            SubscriptionEvent::Cancelled => self.active = false,
        }
        self.changes += 1;
    }
}

impl Subscription {
    /// Pure decision used by repository tests.
    pub fn change_seats(&self, seats: u32) -> Result<Vec<SubscriptionEvent>, DomainError> {
        if !self.active {
            return Err(DomainError::rejected("subscription is not active"));
        }
        if seats == 0 {
            return Err(DomainError::validation("seats must be positive"));
        }
        if seats == self.seats {
            return Ok(vec![]);
        }
        Ok(vec![SubscriptionEvent::SeatsChanged { seats }])
    }
}

/// Seats per active subscription.
#[derive(Debug, Default)]
pub struct SeatTotals;

impl Projection for SeatTotals {
    type State = BTreeMap<AggregateId, u32>;

    fn name(&self) -> &str {
        "seat_totals"
    }

    fn apply(&self, state: &mut Self::State, event: &EventEnvelope) {
        let Ok(decoded) = event.decode::<SubscriptionEvent>() else {
            return;
        };
        match decoded {
            SubscriptionEvent::Started { seats, .. } | SubscriptionEvent::SeatsChanged { seats } => {
                state.insert(event.aggregate_id, seats);
            }
            SubscriptionEvent::Cancelled => {
                state.remove(&event.aggregate_id);
            }
        }
    }
}

/// Event counts by type; only ever rebuilt.
#[derive(Debug, Default)]
pub struct EventTypeCounts;

impl Projection for EventTypeCounts {
    type State = BTreeMap<String, u64>;

    fn name(&self) -> &str {
        "event_type_counts"
    }

    fn apply(&self, state: &mut Self::State, event: &EventEnvelope) {
        *state.entry(event.event_type.clone()).or_default() += 1;
    }

    fn supports_incremental(&self) -> bool {
        false
    }
}

/// Aggregates in the order their first event was committed.
#[derive(Debug, Default)]
pub struct Arrivals;

impl Projection for Arrivals {
    type State = Vec<AggregateId>;

    fn name(&self) -> &str {
        "arrivals"
    }

    fn apply(&self, state: &mut Self::State, event: &EventEnvelope) {
        if event.event_version == 1 {
            state.push(event.aggregate_id);
        }
    }
}

/// Three fresh aggregate ids in ascending order.
pub fn ascending_ids() -> [AggregateId; 3] {
    let mut ids = [AggregateId::new(), AggregateId::new(), AggregateId::new()];
    ids.sort();
    ids
}

pub fn tenant(n: i64) -> TenantId {
    TenantId::new(n).expect("positive tenant id")
}

pub fn ctx(n: i64) -> SessionContext {
    SessionContext::for_tenant(tenant(n)).with_user(UserId::new())
}

pub fn new_event(event: &SubscriptionEvent) -> NewEvent {
    NewEvent::from_typed(event).expect("subscription events serialize")
}

pub fn started(seats: u32) -> NewEvent {
    new_event(&SubscriptionEvent::Started {
        plan: "team".into(),
        seats,
    })
}

pub fn seats(seats: u32) -> NewEvent {
    new_event(&SubscriptionEvent::SeatsChanged { seats })
}
