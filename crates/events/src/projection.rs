use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::EventEnvelope;

/// A projection folds the event log into a read model.
///
/// Projections implement the **CQRS read model pattern**: events stay the
/// source of truth, the projection state is a disposable, query-optimized
/// view that can be thrown away and rebuilt at any time.
///
/// ## Purity
///
/// `apply` must be a pure function of `(state, event)`. Rebuilding from the
/// same log must always produce the same state, byte for byte once
/// serialized; prefer ordered collections (`BTreeMap`) over hash maps in
/// `State` for that reason.
///
/// ## Ordering
///
/// Events of one aggregate arrive in version order. Events of different
/// aggregates arrive in commit order (`EventEnvelope::position`), on a
/// rebuild and on incremental updates alike, so a fold may depend on the
/// order across aggregates. An incremental event older than the last folded
/// position is never folded late; the record goes stale and waits for a
/// rebuild.
///
/// ## Idempotency
///
/// The engine tracks a per-aggregate watermark and never hands `apply` an
/// event it already folded, so `apply` itself does not need to deduplicate.
///
/// ## Tenant isolation
///
/// Every event handed to `apply` belongs to the tenant the projection
/// instance is keyed by; the runner rejects anything else before calling it.
///
/// ## Payloads
///
/// The store never interprets payloads. Projections decode the events they
/// care about (`EventEnvelope::decode`) and ignore the rest by `event_type`.
pub trait Projection: Send + Sync {
    type State: Default + Clone + Serialize + DeserializeOwned + Send + Sync;

    /// Stable name, part of the projection key.
    fn name(&self) -> &str;

    /// Fold one event into the state.
    fn apply(&self, state: &mut Self::State, event: &EventEnvelope);

    /// Whether new events may be applied one at a time on top of the existing
    /// state. Projections returning `false` are only ever rebuilt.
    fn supports_incremental(&self) -> bool {
        true
    }
}
