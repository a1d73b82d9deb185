use crate::{ConnectionId, TenantId, UserId};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

pub const DEFAULT_PRESENCE_TTL_SECONDS: u64 = 120;
pub const DEFAULT_HEARTBEAT_INTERVAL_SECONDS: u64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    Online,
    Offline,
}

/// One live connection of a user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceRecord {
    pub tenant_id: TenantId,
    pub user_id: UserId,
    pub connection_id: ConnectionId,
    pub last_heartbeat_at: DateTime<Utc>,
    pub ttl_seconds: u64,
}

impl PresenceRecord {
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.last_heartbeat_at + Duration::seconds(self.ttl_seconds as i64)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at()
    }
}
