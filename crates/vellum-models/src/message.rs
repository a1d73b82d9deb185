use crate::{ConversationId, InvalidArgument, MessageId, TenantId, UserId};
use chrono::{DateTime, Duration, Utc};

/// AES-GCM nonce length (96 bits).
pub const IV_LEN: usize = 12;
/// AES-GCM authentication tag length (128 bits).
pub const TAG_LEN: usize = 16;
/// Longest key identifier accepted from the identity service.
pub const MAX_KEY_ID_LEN: usize = 64;

/// Encrypted message body. The only representation of a body that is ever
/// stored or sent anywhere.
#[derive(Clone, PartialEq, Eq)]
pub struct SealedPayload {
    ciphertext: Vec<u8>,
    iv: [u8; IV_LEN],
    tag: [u8; TAG_LEN],
    key_id: String,
}

impl SealedPayload {
    /// Build a payload, rejecting IVs and tags of the wrong length.
    pub fn new(
        ciphertext: Vec<u8>,
        iv: &[u8],
        tag: &[u8],
        key_id: impl Into<String>,
    ) -> Result<Self, InvalidArgument> {
        let iv: [u8; IV_LEN] = iv.try_into().map_err(|_| {
            InvalidArgument::new(format!("iv must be {IV_LEN} bytes, got {}", iv.len()))
        })?;
        let tag: [u8; TAG_LEN] = tag.try_into().map_err(|_| {
            InvalidArgument::new(format!("tag must be {TAG_LEN} bytes, got {}", tag.len()))
        })?;
        let key_id = key_id.into();
        if key_id.is_empty() || key_id.len() > MAX_KEY_ID_LEN {
            return Err(InvalidArgument::new(format!(
                "key_id must be 1..={MAX_KEY_ID_LEN} bytes"
            )));
        }
        Ok(Self {
            ciphertext,
            iv,
            tag,
            key_id,
        })
    }

    pub fn ciphertext(&self) -> &[u8] {
        &self.ciphertext
    }

    pub fn iv(&self) -> &[u8; IV_LEN] {
        &self.iv
    }

    pub fn tag(&self) -> &[u8; TAG_LEN] {
        &self.tag
    }

    pub fn key_id(&self) -> &str {
        &self.key_id
    }
}

// Ciphertext stays out of logs.
impl std::fmt::Debug for SealedPayload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SealedPayload")
            .field("key_id", &self.key_id)
            .field("ciphertext_len", &self.ciphertext.len())
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub tenant_id: TenantId,
    pub sender_id: UserId,
    /// `None` once the message has been tombstoned or anonymized.
    pub body: Option<SealedPayload>,
    /// Excluded from every downstream indexing pipeline.
    pub is_confidential: bool,
    pub sent_at: DateTime<Utc>,
    pub edited_at: Option<DateTime<Utc>>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Message {
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// An edit at `now` is allowed while `now - sent_at <= window`.
    pub fn within_edit_window(&self, now: DateTime<Utc>, window: Duration) -> bool {
        now.signed_duration_since(self.sent_at) <= window
    }
}
