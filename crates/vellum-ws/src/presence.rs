use chrono::Duration;
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::Arc;
use vellum_models::presence::PresenceRecord;
use vellum_models::{ConnectionId, ConversationId, TenantId, UserId};
use vellum_util::time::TimeSource;

/// A connection that went away.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Departure {
    pub connection_id: ConnectionId,
    pub tenant_id: TenantId,
    pub user_id: UserId,
    /// The user has no live connection left.
    pub went_offline: bool,
    /// Conversations the connection was subscribed to.
    pub conversations: Vec<ConversationId>,
}

/// Who is online, on which connections, listening to which conversations.
///
/// Each map is sharded by `dashmap`; no method holds a guard on one map
/// while locking an entry of the same map.
pub struct PresenceTracker {
    records: DashMap<ConnectionId, PresenceRecord>,
    by_user: DashMap<(TenantId, UserId), HashSet<ConnectionId>>,
    subscriptions: DashMap<ConversationId, HashSet<ConnectionId>>,
    joined: DashMap<ConnectionId, HashSet<ConversationId>>,
    clock: Arc<dyn TimeSource>,
    ttl_seconds: u64,
}

impl PresenceTracker {
    pub fn new(clock: Arc<dyn TimeSource>, ttl_seconds: u64) -> Self {
        Self {
            records: DashMap::new(),
            by_user: DashMap::new(),
            subscriptions: DashMap::new(),
            joined: DashMap::new(),
            clock,
            ttl_seconds,
        }
    }

    /// Register a new connection. The flag is true when this is the user's
    /// first live connection.
    pub fn connect(&self, tenant_id: TenantId, user_id: UserId) -> (ConnectionId, bool) {
        let connection_id = uuid::Uuid::new_v4();
        self.records.insert(
            connection_id,
            PresenceRecord {
                tenant_id,
                user_id,
                connection_id,
                last_heartbeat_at: self.clock.now(),
                ttl_seconds: self.ttl_seconds,
            },
        );
        let mut set = self.by_user.entry((tenant_id, user_id)).or_default();
        let came_online = set.is_empty();
        set.insert(connection_id);
        (connection_id, came_online)
    }

    /// Refresh a connection. False when it is unknown or already expired.
    pub fn heartbeat(&self, connection_id: ConnectionId) -> bool {
        let now = self.clock.now();
        match self.records.get_mut(&connection_id) {
            Some(mut record) if !record.is_expired(now) => {
                record.last_heartbeat_at = now;
                true
            }
            _ => false,
        }
    }

    pub fn disconnect(&self, connection_id: ConnectionId) -> Option<Departure> {
        let (_, record) = self.records.remove(&connection_id)?;
        let key = (record.tenant_id, record.user_id);

        let went_offline = match self.by_user.get_mut(&key) {
            Some(mut set) => {
                set.remove(&connection_id);
                set.is_empty()
            }
            None => true,
        };
        if went_offline {
            self.by_user.remove_if(&key, |_, set| set.is_empty());
        }

        let conversations: Vec<ConversationId> = self
            .joined
            .remove(&connection_id)
            .map(|(_, set)| set.into_iter().collect())
            .unwrap_or_default();
        for conversation_id in &conversations {
            self.drop_subscriber(*conversation_id, connection_id);
        }

        Some(Departure {
            connection_id,
            tenant_id: record.tenant_id,
            user_id: record.user_id,
            went_offline,
            conversations,
        })
    }

    /// True while any of the user's connections is within its TTL.
    pub fn is_online(&self, tenant_id: TenantId, user_id: UserId) -> bool {
        let now = self.clock.now();
        self.connections_of(tenant_id, user_id)
            .into_iter()
            .any(|id| {
                self.records
                    .get(&id)
                    .is_some_and(|record| !record.is_expired(now))
            })
    }

    pub fn connections_of(&self, tenant_id: TenantId, user_id: UserId) -> Vec<ConnectionId> {
        self.by_user
            .get(&(tenant_id, user_id))
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn record(&self, connection_id: ConnectionId) -> Option<PresenceRecord> {
        self.records.get(&connection_id).map(|r| r.clone())
    }

    pub fn subscribe(&self, connection_id: ConnectionId, conversation_id: ConversationId) {
        if !self.records.contains_key(&connection_id) {
            return;
        }
        self.subscriptions
            .entry(conversation_id)
            .or_default()
            .insert(connection_id);
        self.joined
            .entry(connection_id)
            .or_default()
            .insert(conversation_id);
    }

    pub fn unsubscribe(&self, connection_id: ConnectionId, conversation_id: ConversationId) {
        self.drop_subscriber(conversation_id, connection_id);
        if let Some(mut set) = self.joined.get_mut(&connection_id) {
            set.remove(&conversation_id);
        }
    }

    /// Subscribe every live connection of a user.
    pub fn subscribe_user(&self, tenant_id: TenantId, user_id: UserId, conversation_id: ConversationId) {
        for connection_id in self.connections_of(tenant_id, user_id) {
            self.subscribe(connection_id, conversation_id);
        }
    }

    pub fn unsubscribe_user(&self, tenant_id: TenantId, user_id: UserId, conversation_id: ConversationId) {
        for connection_id in self.connections_of(tenant_id, user_id) {
            self.unsubscribe(connection_id, conversation_id);
        }
    }

    /// Forget a conversation entirely.
    pub fn close_conversation(&self, conversation_id: ConversationId) {
        if let Some((_, members)) = self.subscriptions.remove(&conversation_id) {
            for connection_id in members {
                if let Some(mut set) = self.joined.get_mut(&connection_id) {
                    set.remove(&conversation_id);
                }
            }
        }
    }

    pub fn subscribers_of(&self, conversation_id: ConversationId) -> HashSet<ConnectionId> {
        self.subscriptions
            .get(&conversation_id)
            .map(|set| set.clone())
            .unwrap_or_default()
    }

    pub fn is_subscribed(&self, connection_id: ConnectionId, conversation_id: ConversationId) -> bool {
        self.joined
            .get(&connection_id)
            .is_some_and(|set| set.contains(&conversation_id))
    }

    pub fn conversations_of(&self, connection_id: ConnectionId) -> Vec<ConversationId> {
        self.joined
            .get(&connection_id)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Remove every connection whose TTL ran out.
    pub fn sweep_expired(&self) -> Vec<Departure> {
        let now = self.clock.now();
        let expired: Vec<ConnectionId> = self
            .records
            .iter()
            .filter(|entry| entry.value().is_expired(now))
            .map(|entry| *entry.key())
            .collect();
        let departures: Vec<Departure> = expired
            .into_iter()
            .filter_map(|id| self.disconnect(id))
            .collect();
        if !departures.is_empty() {
            tracing::debug!(count = departures.len(), "presence records expired");
        }
        departures
    }

    pub fn ttl(&self) -> Duration {
        Duration::seconds(self.ttl_seconds as i64)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn drop_subscriber(&self, conversation_id: ConversationId, connection_id: ConnectionId) {
        let now_empty = match self.subscriptions.get_mut(&conversation_id) {
            Some(mut set) => {
                set.remove(&connection_id);
                set.is_empty()
            }
            None => false,
        };
        if now_empty {
            self.subscriptions
                .remove_if(&conversation_id, |_, set| set.is_empty());
        }
    }
}
