use crate::{InvalidArgument, TenantId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// SHA-256 output.
pub type Digest = [u8; 32];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditEventType {
    Sent,
    Edited,
    Read,
    Deleted,
}

impl AuditEventType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sent => "sent",
            Self::Edited => "edited",
            Self::Read => "read",
            Self::Deleted => "deleted",
        }
    }
}

impl fmt::Display for AuditEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AuditEventType {
    type Err = InvalidArgument;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sent" => Ok(Self::Sent),
            "edited" => Ok(Self::Edited),
            "read" => Ok(Self::Read),
            "deleted" => Ok(Self::Deleted),
            other => Err(InvalidArgument::new(format!(
                "unknown audit event type '{other}'"
            ))),
        }
    }
}

/// One link of a tenant's audit chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditEntry {
    pub tenant_id: TenantId,
    /// Monotonic per tenant, starting at 0.
    pub sequence_no: i64,
    pub event_type: AuditEventType,
    /// Message or conversation id the event is about.
    pub subject_id: i64,
    /// Canonical JSON text, hashed verbatim.
    pub payload: String,
    pub prev_hash: Digest,
    pub this_hash: Digest,
    pub created_at: DateTime<Utc>,
}

/// First record whose stored hash does not match the recomputed one.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error(
    "audit chain broken for tenant {tenant_id} at record {record_id}: expected {expected_hash}, found {actual_hash}"
)]
pub struct ChainBreak {
    pub tenant_id: TenantId,
    pub record_id: i64,
    /// Hex digest the verifier expected.
    pub expected_hash: String,
    /// Hex digest found in storage.
    pub actual_hash: String,
}
