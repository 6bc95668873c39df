//! Event records and projection mechanics.
//!
//! Pure data and folding logic only; persistence lives in `eventvault-infra`.

mod envelope;
mod event;
mod projection;
mod runner;
mod tenant;

pub use envelope::{EventEnvelope, NewEvent};
pub use event::DomainEvent;
pub use projection::Projection;
pub use runner::{Applied, ProjectionError, ProjectionRunner, Watermarks};
pub use tenant::TenantScoped;
