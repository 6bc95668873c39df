//! Aggregate reducer contract and optimistic concurrency expectations.

use serde::Serialize;
use serde::de::DeserializeOwned;

/// Optimistic concurrency expectation for an append.
///
/// `Any` means the caller did not supply an expected version; `Exact(v)` must
/// equal the stream's current version (`0` for a stream with no events).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum ExpectedVersion {
    #[default]
    Any,
    Exact(u64),
}

impl ExpectedVersion {
    pub fn matches(self, actual: u64) -> bool {
        match self {
            ExpectedVersion::Any => true,
            ExpectedVersion::Exact(v) => v == actual,
        }
    }

    pub fn exact(self) -> Option<u64> {
        match self {
            ExpectedVersion::Any => None,
            ExpectedVersion::Exact(v) => Some(v),
        }
    }
}

impl From<Option<u64>> for ExpectedVersion {
    fn from(value: Option<u64>) -> Self {
        value.map_or(ExpectedVersion::Any, ExpectedVersion::Exact)
    }
}

/// Event-sourced aggregate state (pure, deterministic).
///
/// `Default` is the empty initial state at version 0. `apply` is the reducer:
/// a total function over the closed set of `Self::Event` variants, so an event
/// type the aggregate does not know fails at decode time instead of being
/// silently ignored during a fold.
///
/// State is serialized into snapshots, hence the serde bounds. Folding the
/// same events onto the same starting state must always produce the same
/// result: snapshots rely on it.
pub trait Aggregate: Default + Clone + Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Closed set of events this aggregate folds.
    type Event: Serialize + DeserializeOwned + Clone + core::fmt::Debug + Send + Sync;

    /// Stable aggregate type name (e.g. "billing.subscription").
    const AGGREGATE_TYPE: &'static str;

    /// Evolve state by one event.
    fn apply(&mut self, event: &Self::Event);
}
