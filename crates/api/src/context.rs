use postrelay_core::TenantId;

/// Tenant context for a request.
///
/// Authentication is owned by an upstream gateway; by the time a request
/// reaches this service the tenant identity is established and immutable.
/// Every domain route requires it.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct TenantContext {
    tenant_id: TenantId,
}

impl TenantContext {
    pub fn new(tenant_id: TenantId) -> Self {
        Self { tenant_id }
    }

    pub fn tenant_id(&self) -> TenantId {
        self.tenant_id
    }
}
