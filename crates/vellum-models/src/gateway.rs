use crate::presence::PresenceStatus;
use crate::{ConversationId, MessageId, TenantId, UserId};
use serde::{Deserialize, Serialize};

pub const HEARTBEAT_INTERVAL_MS: u64 = 30_000;

// Error codes carried by `ServerFrame::Error`.
pub const ERR_ACCESS_DENIED: &str = "access_denied";
pub const ERR_RATE_LIMITED: &str = "rate_limited";
pub const ERR_EDIT_WINDOW_EXPIRED: &str = "edit_window_expired";
pub const ERR_NOT_FOUND: &str = "not_found";
pub const ERR_BAD_REQUEST: &str = "bad_request";
pub const ERR_CONFLICT: &str = "conflict";
pub const ERR_INTERNAL: &str = "internal_error";
pub const ERR_INVALID_FRAME: &str = "invalid_frame";
pub const ERR_FLOODING: &str = "flooding";

/// Frames a client may send over the gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Ping {
        #[serde(default)]
        nonce: Option<String>,
    },
    Typing {
        conversation_id: ConversationId,
    },
    MarkRead {
        conversation_id: ConversationId,
    },
    SendMessage {
        conversation_id: ConversationId,
        content: String,
        #[serde(default)]
        confidential: bool,
        #[serde(default)]
        nonce: Option<String>,
    },
    EditMessage {
        message_id: MessageId,
        content: String,
        #[serde(default)]
        nonce: Option<String>,
    },
    DeleteMessage {
        message_id: MessageId,
        #[serde(default)]
        nonce: Option<String>,
    },
}

impl ClientFrame {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Ping { .. } => "ping",
            Self::Typing { .. } => "typing",
            Self::MarkRead { .. } => "mark_read",
            Self::SendMessage { .. } => "send_message",
            Self::EditMessage { .. } => "edit_message",
            Self::DeleteMessage { .. } => "delete_message",
        }
    }
}

/// Frames pushed to clients. None of them carry a message body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Hello {
        connection_id: String,
        user_id: UserId,
        tenant_id: TenantId,
        heartbeat_interval_ms: u64,
    },
    Pong {
        #[serde(skip_serializing_if = "Option::is_none")]
        nonce: Option<String>,
    },
    Ack {
        #[serde(skip_serializing_if = "Option::is_none")]
        nonce: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        message_id: Option<MessageId>,
        #[serde(skip_serializing_if = "Option::is_none")]
        read_count: Option<u64>,
    },
    Error {
        code: String,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        retry_after: Option<u64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        nonce: Option<String>,
    },
    MessageSent {
        conversation_id: ConversationId,
        message_id: MessageId,
        sender_id: UserId,
        /// Epoch seconds.
        sent_at: i64,
    },
    MessageEdited {
        conversation_id: ConversationId,
        message_id: MessageId,
        sender_id: UserId,
        edited_at: i64,
    },
    MessageRead {
        conversation_id: ConversationId,
        user_id: UserId,
        read_count: u64,
    },
    MessageDeleted {
        conversation_id: ConversationId,
        message_id: MessageId,
        deleted_at: i64,
    },
    ConversationCreated {
        conversation_id: ConversationId,
        conversation_type: String,
        participant_ids: Vec<UserId>,
        created_by: UserId,
    },
    Presence {
        user_id: UserId,
        status: PresenceStatus,
    },
    Typing {
        conversation_id: ConversationId,
        user_id: UserId,
    },
}

impl ServerFrame {
    pub fn error(code: &str, message: impl Into<String>) -> Self {
        Self::Error {
            code: code.to_string(),
            message: message.into(),
            retry_after: None,
            nonce: None,
        }
    }

    /// Serialize to the JSON text sent on the wire.
    pub fn to_json(&self) -> String {
        // Every variant holds plain scalars and strings; serialization cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }
}
