use eventvault_core::TenantId;

use crate::EventEnvelope;

/// Messages that belong to exactly one tenant.
///
/// Infrastructure pinned to a tenant (a projection runner, a rebuild) uses
/// this to reject anything stamped for a different tenant before it can touch
/// tenant-scoped state.
pub trait TenantScoped {
    fn tenant_id(&self) -> TenantId;

    fn belongs_to(&self, tenant_id: TenantId) -> bool {
        self.tenant_id() == tenant_id
    }
}

impl TenantScoped for EventEnvelope {
    fn tenant_id(&self) -> TenantId {
        self.tenant_id
    }
}
