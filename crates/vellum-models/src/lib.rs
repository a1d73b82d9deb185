pub mod audit;
pub mod conversation;
pub mod gateway;
pub mod message;
pub mod presence;

use thiserror::Error;

pub type TenantId = i64;
pub type UserId = i64;
pub type ConversationId = i64;
pub type MessageId = i64;
pub type ConnectionId = uuid::Uuid;

/// Sender id written over anonymized messages.
pub const ANONYMOUS_USER_ID: UserId = 0;

/// Raised when a typed entity is built from values that break its invariants.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid argument: {0}")]
pub struct InvalidArgument(pub String);

impl InvalidArgument {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}
