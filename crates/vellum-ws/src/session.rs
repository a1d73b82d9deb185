use vellum_core::tenant::RequestContext;
use vellum_models::{ConnectionId, TenantId, UserId};

/// Identity of one authenticated gateway connection.
pub struct Session {
    pub connection_id: ConnectionId,
    pub tenant_id: TenantId,
    pub user_id: UserId,
    pub frames_in: u64,
}

impl Session {
    pub fn new(connection_id: ConnectionId, tenant_id: TenantId, user_id: UserId) -> Self {
        Self {
            connection_id,
            tenant_id,
            user_id,
            frames_in: 0,
        }
    }

    /// Tenant and user every store call from this connection runs under.
    pub fn context(&self) -> RequestContext {
        RequestContext::new(self.tenant_id, self.user_id)
    }

    pub fn record_frame(&mut self) -> u64 {
        self.frames_in += 1;
        self.frames_in
    }
}
