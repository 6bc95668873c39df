/// A typed domain event.
///
/// Event enums are closed sets (one variant per fact) serialized with a serde
/// tag, so the stored `event_type` and the payload's tag always agree and an
/// unknown type is rejected at decode time.
pub trait DomainEvent: Clone + core::fmt::Debug + Send + Sync + 'static {
    /// Stable event name/type identifier (e.g. "subscription.activated").
    fn event_type(&self) -> &'static str;
}
