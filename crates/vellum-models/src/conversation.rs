use crate::{ConversationId, InvalidArgument, TenantId, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationType {
    Direct,
    Group,
    Support,
}

impl ConversationType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Group => "group",
            Self::Support => "support",
        }
    }
}

impl fmt::Display for ConversationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConversationType {
    type Err = InvalidArgument;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "direct" => Ok(Self::Direct),
            "group" => Ok(Self::Group),
            "support" => Ok(Self::Support),
            other => Err(InvalidArgument::new(format!(
                "unknown conversation type '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationStatus {
    Active,
    Archived,
    Closed,
    Deleted,
}

impl ConversationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Archived => "archived",
            Self::Closed => "closed",
            Self::Deleted => "deleted",
        }
    }

    /// Transitions only move forward, except the `active`/`archived` pair.
    pub fn can_transition_to(self, next: ConversationStatus) -> bool {
        use ConversationStatus::*;
        match (self, next) {
            (a, b) if a == b => false,
            (Active, Archived) | (Archived, Active) => true,
            (Active | Archived, Closed) => true,
            (Active | Archived | Closed, Deleted) => true,
            _ => false,
        }
    }

    /// Whether new messages may be appended in this state.
    pub fn accepts_messages(self) -> bool {
        matches!(self, Self::Active | Self::Archived)
    }
}

impl fmt::Display for ConversationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConversationStatus {
    type Err = InvalidArgument;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "archived" => Ok(Self::Archived),
            "closed" => Ok(Self::Closed),
            "deleted" => Ok(Self::Deleted),
            other => Err(InvalidArgument::new(format!(
                "unknown conversation status '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conversation {
    pub id: ConversationId,
    pub tenant_id: TenantId,
    pub conversation_type: ConversationType,
    pub status: ConversationStatus,
    /// Sorted, duplicate-free.
    pub participant_ids: Vec<UserId>,
    pub message_count: i64,
    pub last_message_at: Option<DateTime<Utc>>,
    pub created_by: UserId,
    pub created_at: DateTime<Utc>,
}

impl Conversation {
    pub fn is_participant(&self, user_id: UserId) -> bool {
        self.participant_ids.binary_search(&user_id).is_ok()
    }

    /// Last activity, falling back to creation time for empty conversations.
    pub fn last_activity_at(&self) -> DateTime<Utc> {
        self.last_message_at.unwrap_or(self.created_at)
    }
}

/// Normalise a requested participant list: the creator is always included,
/// duplicates collapse, and direct conversations need exactly two people.
pub fn normalize_participants(
    conversation_type: ConversationType,
    creator_id: UserId,
    requested: &[UserId],
) -> Result<Vec<UserId>, InvalidArgument> {
    let mut set: BTreeSet<UserId> = requested.iter().copied().collect();
    set.insert(creator_id);
    if set.iter().any(|id| *id <= 0) {
        return Err(InvalidArgument::new("participant ids must be positive"));
    }
    if conversation_type == ConversationType::Direct && set.len() != 2 {
        return Err(InvalidArgument::new(
            "direct conversations need exactly two distinct participants",
        ));
    }
    Ok(set.into_iter().collect())
}

/// Stable key used to keep one direct conversation per user pair.
pub fn direct_key(a: UserId, b: UserId) -> String {
    let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
    format!("{lo}:{hi}")
}
