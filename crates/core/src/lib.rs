//! `eventvault-core`: identifiers, session context and the aggregate contract.
//!
//! This crate contains **pure** primitives shared by every layer: identifiers,
//! the aggregate reducer contract, optimistic concurrency expectations and the
//! explicit session (user/tenant) context. No IO lives here.

pub mod aggregate;
pub mod context;
pub mod error;
pub mod id;

pub use aggregate::{Aggregate, ExpectedVersion};
pub use context::{ContextError, SessionContext, SessionContextManager, SessionScope};
pub use error::{DomainError, DomainResult};
pub use id::{AggregateId, TenantId, UserId};
