use vellum_models::{TenantId, UserId};

/// Resolves the tenant an operation runs under. Identity resolution
/// happens outside this crate.
pub trait TenantContext: Send + Sync {
    fn current_tenant_id(&self) -> TenantId;
}

/// Tenant and user resolved for one request or gateway session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestContext {
    pub tenant_id: TenantId,
    pub user_id: UserId,
}

impl RequestContext {
    pub fn new(tenant_id: TenantId, user_id: UserId) -> Self {
        Self { tenant_id, user_id }
    }
}

impl TenantContext for RequestContext {
    fn current_tenant_id(&self) -> TenantId {
        self.tenant_id
    }
}

/// Context for operator and scheduled work that acts on a whole tenant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SystemContext(pub TenantId);

impl TenantContext for SystemContext {
    fn current_tenant_id(&self) -> TenantId {
        self.0
    }
}
