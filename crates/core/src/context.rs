//! Session (user/tenant) context for one unit of work.
//!
//! The context is an explicit value: storage operations take a
//! `&SessionContext` argument and resolve the tenant from it, instead of
//! reading ambient thread- or connection-local state. That makes cross-request
//! leakage impossible by construction for code that only ever passes values.
//!
//! `SessionContextManager` exists for the places where a binding really does
//! outlive a call, e.g. a worker or pooled connection reused across requests.
//! It owns the binding lifetime and hands out `SessionScope` guards that clear
//! the slot on drop, so every exit path (early `?` returns, panics) releases it.

use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};

use thiserror::Error;
use tracing::debug;

use crate::id::{TenantId, UserId};

/// Context resolution failure. Both variants are programmer errors and are
/// surfaced immediately; neither ever degrades into unfiltered access.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ContextError {
    #[error("no tenant bound to the current unit of work")]
    MissingTenantContext,

    #[error("invalid session context: {0}")]
    InvalidContext(String),
}

/// Immutable (user, tenant) binding for a unit of work.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct SessionContext {
    user_id: Option<UserId>,
    tenant_id: Option<TenantId>,
}

impl SessionContext {
    /// A context with nothing bound. Every tenant-scoped operation rejects it.
    pub fn unset() -> Self {
        Self::default()
    }

    pub fn new(user_id: Option<UserId>, tenant_id: Option<TenantId>) -> Self {
        Self { user_id, tenant_id }
    }

    pub fn for_tenant(tenant_id: TenantId) -> Self {
        Self {
            user_id: None,
            tenant_id: Some(tenant_id),
        }
    }

    pub fn with_user(mut self, user_id: UserId) -> Self {
        self.user_id = Some(user_id);
        self
    }

    /// Build a context from raw request values.
    ///
    /// Values are optional, but each one that is present must be well formed:
    /// the tenant a positive integer, the user a UUID.
    pub fn parse(user_id: Option<&str>, tenant_id: Option<i64>) -> Result<Self, ContextError> {
        let user_id = user_id
            .map(UserId::from_str)
            .transpose()
            .map_err(|e| ContextError::InvalidContext(e.to_string()))?;
        let tenant_id = tenant_id
            .map(TenantId::new)
            .transpose()
            .map_err(|e| ContextError::InvalidContext(e.to_string()))?;
        Ok(Self { user_id, tenant_id })
    }

    pub fn current_tenant(&self) -> Option<TenantId> {
        self.tenant_id
    }

    pub fn current_user(&self) -> Option<UserId> {
        self.user_id
    }

    /// Resolve the tenant for a tenant-scoped operation (fail closed).
    pub fn require_tenant(&self) -> Result<TenantId, ContextError> {
        self.tenant_id.ok_or(ContextError::MissingTenantContext)
    }
}

/// Owner of one reusable context slot (a worker, a pooled connection).
///
/// `set` replaces the whole binding at once, so a unit of work that forgets to
/// `clear` still cannot leave half of its identity behind for the next one.
#[derive(Debug, Default)]
pub struct SessionContextManager {
    slot: Mutex<SessionContext>,
}

impl SessionContextManager {
    pub fn new() -> Self {
        Self::default()
    }

    // Poisoning only means another holder panicked mid-update; the slot is a
    // plain value, so recovering it keeps `clear` infallible.
    fn slot(&self) -> MutexGuard<'_, SessionContext> {
        self.slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Bind user and tenant for the current unit of work.
    ///
    /// On `InvalidContext` the slot is cleared: a rejected binding never leaves
    /// the previous unit of work's identity in place.
    pub fn set(&self, user_id: Option<&str>, tenant_id: Option<i64>) -> Result<(), ContextError> {
        let mut slot = self.slot();
        match SessionContext::parse(user_id, tenant_id) {
            Ok(ctx) => {
                *slot = ctx;
                Ok(())
            }
            Err(err) => {
                *slot = SessionContext::unset();
                Err(err)
            }
        }
    }

    /// Unbind both values. Safe to call when nothing was ever set.
    pub fn clear(&self) {
        *self.slot() = SessionContext::unset();
    }

    pub fn current_tenant(&self) -> Option<TenantId> {
        self.slot().current_tenant()
    }

    pub fn current_user(&self) -> Option<UserId> {
        self.slot().current_user()
    }

    /// Copy of the active binding, to be threaded into storage calls.
    pub fn current(&self) -> SessionContext {
        *self.slot()
    }

    /// Begin a unit of work: bind now, clear when the returned guard drops.
    pub fn scope(
        &self,
        user_id: Option<&str>,
        tenant_id: Option<i64>,
    ) -> Result<SessionScope<'_>, ContextError> {
        self.set(user_id, tenant_id)?;
        let context = self.current();
        debug!(
            tenant_id = ?context.current_tenant(),
            user_id = ?context.current_user(),
            "session scope entered"
        );
        Ok(SessionScope {
            manager: self,
            context,
        })
    }
}

/// Guard for one unit of work. Dropping it clears the manager's slot.
#[derive(Debug)]
pub struct SessionScope<'a> {
    manager: &'a SessionContextManager,
    context: SessionContext,
}

impl SessionScope<'_> {
    pub fn context(&self) -> &SessionContext {
        &self.context
    }
}

impl Drop for SessionScope<'_> {
    fn drop(&mut self) {
        self.manager.clear();
        debug!(tenant_id = ?self.context.current_tenant(), "session scope released");
    }
}
