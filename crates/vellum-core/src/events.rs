use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use vellum_models::conversation::{ConversationStatus, ConversationType};
use vellum_models::{ConversationId, MessageId, TenantId, UserId};

/// State transition produced by a store operation. Never carries a body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoreEvent {
    ConversationCreated {
        tenant_id: TenantId,
        conversation_id: ConversationId,
        conversation_type: ConversationType,
        participant_ids: Vec<UserId>,
        created_by: UserId,
    },
    ConversationStatusChanged {
        tenant_id: TenantId,
        conversation_id: ConversationId,
        status: ConversationStatus,
    },
    ParticipantAdded {
        tenant_id: TenantId,
        conversation_id: ConversationId,
        user_id: UserId,
    },
    ParticipantRemoved {
        tenant_id: TenantId,
        conversation_id: ConversationId,
        user_id: UserId,
    },
    MessageSent {
        tenant_id: TenantId,
        conversation_id: ConversationId,
        message_id: MessageId,
        sender_id: UserId,
        sent_at: DateTime<Utc>,
        is_confidential: bool,
    },
    MessageEdited {
        tenant_id: TenantId,
        conversation_id: ConversationId,
        message_id: MessageId,
        sender_id: UserId,
        edited_at: DateTime<Utc>,
        is_confidential: bool,
    },
    MessageRead {
        tenant_id: TenantId,
        conversation_id: ConversationId,
        user_id: UserId,
        read_count: u64,
    },
    MessageDeleted {
        tenant_id: TenantId,
        conversation_id: ConversationId,
        message_id: MessageId,
        deleted_at: DateTime<Utc>,
        is_confidential: bool,
    },
}

impl CoreEvent {
    pub fn tenant_id(&self) -> TenantId {
        match self {
            Self::ConversationCreated { tenant_id, .. }
            | Self::ConversationStatusChanged { tenant_id, .. }
            | Self::ParticipantAdded { tenant_id, .. }
            | Self::ParticipantRemoved { tenant_id, .. }
            | Self::MessageSent { tenant_id, .. }
            | Self::MessageEdited { tenant_id, .. }
            | Self::MessageRead { tenant_id, .. }
            | Self::MessageDeleted { tenant_id, .. } => *tenant_id,
        }
    }

    pub fn conversation_id(&self) -> ConversationId {
        match self {
            Self::ConversationCreated {
                conversation_id, ..
            }
            | Self::ConversationStatusChanged {
                conversation_id, ..
            }
            | Self::ParticipantAdded {
                conversation_id, ..
            }
            | Self::ParticipantRemoved {
                conversation_id, ..
            }
            | Self::MessageSent {
                conversation_id, ..
            }
            | Self::MessageEdited {
                conversation_id, ..
            }
            | Self::MessageRead {
                conversation_id, ..
            }
            | Self::MessageDeleted {
                conversation_id, ..
            } => *conversation_id,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::ConversationCreated { .. } => "conversation_created",
            Self::ConversationStatusChanged { .. } => "conversation_status_changed",
            Self::ParticipantAdded { .. } => "participant_added",
            Self::ParticipantRemoved { .. } => "participant_removed",
            Self::MessageSent { .. } => "message_sent",
            Self::MessageEdited { .. } => "message_edited",
            Self::MessageRead { .. } => "message_read",
            Self::MessageDeleted { .. } => "message_deleted",
        }
    }
}

/// Broadcast-based event bus between the store and its consumers
/// (delivery broker, indexing queue).
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<CoreEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn publish(&self, event: CoreEvent) {
        // Ignore error if no receivers
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CoreEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(4096)
    }
}
