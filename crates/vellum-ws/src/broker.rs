use crate::presence::{Departure, PresenceTracker};
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use vellum_core::events::{CoreEvent, EventBus};
use vellum_models::conversation::ConversationStatus;
use vellum_models::gateway::ServerFrame;
use vellum_models::presence::PresenceStatus;
use vellum_models::{ConnectionId, ConversationId, TenantId, UserId};

/// The push target is gone. Swallowed by the broker; never fails the
/// operation that produced the event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("connection {0} is disconnected")]
pub struct Disconnected(pub ConnectionId);

/// A registered connection and the receiving end of its outbound queue.
pub struct Connection {
    pub id: ConnectionId,
    pub came_online: bool,
    pub outbound: mpsc::Receiver<Arc<str>>,
}

/// Real-time fan-out of store events to live connections.
///
/// Pushes never wait: each connection owns a bounded queue drained by its
/// writer task, and a connection whose queue is full is disconnected.
pub struct DeliveryBroker {
    presence: Arc<PresenceTracker>,
    outbound: DashMap<ConnectionId, mpsc::Sender<Arc<str>>>,
    queue_size: usize,
}

impl DeliveryBroker {
    pub fn new(presence: Arc<PresenceTracker>, queue_size: usize) -> Self {
        Self {
            presence,
            outbound: DashMap::new(),
            queue_size: queue_size.max(1),
        }
    }

    pub fn presence(&self) -> &Arc<PresenceTracker> {
        &self.presence
    }

    /// Register a connection, subscribe it to `conversations` and announce
    /// the user to co-participants if this is their first connection.
    pub fn connect(
        &self,
        tenant_id: TenantId,
        user_id: UserId,
        conversations: &[ConversationId],
    ) -> Connection {
        let (tx, rx) = mpsc::channel(self.queue_size);
        let (connection_id, came_online) = self.presence.connect(tenant_id, user_id);
        self.outbound.insert(connection_id, tx);
        for conversation_id in conversations {
            self.presence.subscribe(connection_id, *conversation_id);
        }
        if came_online {
            self.announce(tenant_id, user_id, conversations, PresenceStatus::Online);
        }
        tracing::debug!(
            tenant_id,
            user_id,
            %connection_id,
            conversations = conversations.len(),
            "connection registered"
        );
        Connection {
            id: connection_id,
            came_online,
            outbound: rx,
        }
    }

    /// Forget a connection. Dropping its sender ends the writer task.
    pub fn disconnect(&self, connection_id: ConnectionId) -> Option<Departure> {
        self.outbound.remove(&connection_id);
        let departure = self.presence.disconnect(connection_id)?;
        self.depart(&departure);
        Some(departure)
    }

    pub fn heartbeat(&self, connection_id: ConnectionId) -> bool {
        self.presence.heartbeat(connection_id)
    }

    pub fn is_connected(&self, connection_id: ConnectionId) -> bool {
        self.outbound.contains_key(&connection_id)
    }

    pub fn connection_count(&self) -> usize {
        self.outbound.len()
    }

    /// Queue one frame for a connection without waiting.
    pub fn send(&self, connection_id: ConnectionId, payload: Arc<str>) -> Result<(), Disconnected> {
        let Some(tx) = self.outbound.get(&connection_id).map(|tx| tx.clone()) else {
            return Err(Disconnected(connection_id));
        };
        match tx.try_send(payload) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(
                    %connection_id,
                    queue_size = self.queue_size,
                    "outbound queue full, disconnecting"
                );
                self.disconnect(connection_id);
                Err(Disconnected(connection_id))
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.disconnect(connection_id);
                Err(Disconnected(connection_id))
            }
        }
    }

    /// Push an event to every authorized subscriber. Returns how many
    /// connections accepted the frame.
    pub fn publish(&self, event: &CoreEvent) -> usize {
        let tenant_id = event.tenant_id();
        let conversation_id = event.conversation_id();

        let frame = match event {
            CoreEvent::ConversationCreated {
                conversation_type,
                participant_ids,
                created_by,
                ..
            } => {
                for user_id in participant_ids {
                    self.presence
                        .subscribe_user(tenant_id, *user_id, conversation_id);
                }
                ServerFrame::ConversationCreated {
                    conversation_id,
                    conversation_type: conversation_type.as_str().to_string(),
                    participant_ids: participant_ids.clone(),
                    created_by: *created_by,
                }
            }
            CoreEvent::ParticipantAdded { user_id, .. } => {
                self.presence
                    .subscribe_user(tenant_id, *user_id, conversation_id);
                return 0;
            }
            CoreEvent::ParticipantRemoved { user_id, .. } => {
                self.presence
                    .unsubscribe_user(tenant_id, *user_id, conversation_id);
                return 0;
            }
            CoreEvent::ConversationStatusChanged { status, .. } => {
                if *status == ConversationStatus::Deleted {
                    self.presence.close_conversation(conversation_id);
                }
                return 0;
            }
            CoreEvent::MessageSent {
                message_id,
                sender_id,
                sent_at,
                ..
            } => ServerFrame::MessageSent {
                conversation_id,
                message_id: *message_id,
                sender_id: *sender_id,
                sent_at: sent_at.timestamp(),
            },
            CoreEvent::MessageEdited {
                message_id,
                sender_id,
                edited_at,
                ..
            } => ServerFrame::MessageEdited {
                conversation_id,
                message_id: *message_id,
                sender_id: *sender_id,
                edited_at: edited_at.timestamp(),
            },
            CoreEvent::MessageRead {
                user_id,
                read_count,
                ..
            } => ServerFrame::MessageRead {
                conversation_id,
                user_id: *user_id,
                read_count: *read_count,
            },
            CoreEvent::MessageDeleted {
                message_id,
                deleted_at,
                ..
            } => ServerFrame::MessageDeleted {
                conversation_id,
                message_id: *message_id,
                deleted_at: deleted_at.timestamp(),
            },
        };

        let recipients: Vec<ConnectionId> = self
            .presence
            .subscribers_of(conversation_id)
            .into_iter()
            .filter(|id| self.belongs_to_tenant(*id, tenant_id))
            .collect();
        self.fan_out(recipients, &frame, event.name())
    }

    /// Relay a typing indicator to the other users subscribed to the
    /// conversation. Ignored unless the sender is subscribed.
    pub fn relay_typing(&self, connection_id: ConnectionId, conversation_id: ConversationId) -> usize {
        if !self.presence.is_subscribed(connection_id, conversation_id) {
            return 0;
        }
        let Some(sender) = self.presence.record(connection_id) else {
            return 0;
        };
        let recipients: Vec<ConnectionId> = self
            .presence
            .subscribers_of(conversation_id)
            .into_iter()
            .filter(|id| {
                self.presence.record(*id).is_some_and(|r| {
                    r.tenant_id == sender.tenant_id && r.user_id != sender.user_id
                })
            })
            .collect();
        let frame = ServerFrame::Typing {
            conversation_id,
            user_id: sender.user_id,
        };
        self.fan_out(recipients, &frame, "typing")
    }

    /// Drop connections whose presence expired. Returns how many went away.
    pub fn sweep_presence(&self) -> usize {
        let departures = self.presence.sweep_expired();
        for departure in &departures {
            self.outbound.remove(&departure.connection_id);
            self.depart(departure);
        }
        departures.len()
    }

    /// Consume the event bus until it closes.
    pub fn run(self: &Arc<Self>, bus: &EventBus) -> JoinHandle<()> {
        let broker = Arc::clone(self);
        let mut rx = bus.subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        broker.publish(&event);
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        // Clients recover missed pushes from history.
                        tracing::warn!(skipped, "delivery broker lagged behind the event bus");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }

    fn depart(&self, departure: &Departure) {
        if departure.went_offline {
            self.announce(
                departure.tenant_id,
                departure.user_id,
                &departure.conversations,
                PresenceStatus::Offline,
            );
        }
    }

    fn announce(
        &self,
        tenant_id: TenantId,
        user_id: UserId,
        conversations: &[ConversationId],
        status: PresenceStatus,
    ) {
        let mut recipients = HashSet::new();
        for conversation_id in conversations {
            recipients.extend(self.presence.subscribers_of(*conversation_id));
        }
        let recipients: Vec<ConnectionId> = recipients
            .into_iter()
            .filter(|id| {
                self.presence
                    .record(*id)
                    .is_some_and(|r| r.tenant_id == tenant_id && r.user_id != user_id)
            })
            .collect();
        self.fan_out(recipients, &ServerFrame::Presence { user_id, status }, "presence");
    }

    fn belongs_to_tenant(&self, connection_id: ConnectionId, tenant_id: TenantId) -> bool {
        self.presence
            .record(connection_id)
            .is_some_and(|r| r.tenant_id == tenant_id)
    }

    fn fan_out(&self, recipients: Vec<ConnectionId>, frame: &ServerFrame, kind: &str) -> usize {
        if recipients.is_empty() {
            return 0;
        }
        let payload: Arc<str> = Arc::from(frame.to_json());
        let mut delivered = 0;
        for connection_id in recipients {
            match self.send(connection_id, Arc::clone(&payload)) {
                Ok(()) => delivered += 1,
                Err(err) => tracing::debug!(kind, "push dropped: {err}"),
            }
        }
        delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};
    use serde_json::Value;
    use vellum_models::conversation::ConversationType;
    use vellum_util::time::ManualTimeSource;

    fn broker(queue_size: usize) -> (DeliveryBroker, Arc<ManualTimeSource>) {
        let clock = Arc::new(ManualTimeSource::fixed());
        let presence = Arc::new(PresenceTracker::new(clock.clone(), 120));
        (DeliveryBroker::new(presence, queue_size), clock)
    }

    fn sent(tenant_id: TenantId, conversation_id: ConversationId, message_id: i64) -> CoreEvent {
        CoreEvent::MessageSent {
            tenant_id,
            conversation_id,
            message_id,
            sender_id: 1,
            sent_at: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
            is_confidential: false,
        }
    }

    fn next_frame(conn: &mut Connection) -> Value {
        let raw = conn.outbound.try_recv().unwrap();
        serde_json::from_str(&raw).unwrap()
    }

    #[test]
    fn message_sent_reaches_subscribers_only() {
        let (broker, _) = broker(8);
        let mut bob = broker.connect(1, 2, &[42]);
        let mut carol = broker.connect(1, 3, &[7]);
        // no shared conversation, no presence frame
        assert!(bob.outbound.try_recv().is_err());

        assert_eq!(broker.publish(&sent(1, 42, 100)), 1);
        let frame = next_frame(&mut bob);
        assert_eq!(frame["type"], "message_sent");
        assert_eq!(frame["conversation_id"], 42);
        assert_eq!(frame["message_id"], 100);
        assert_eq!(frame["sent_at"], 1_700_000_000i64);
        assert!(frame.get("body").is_none());
        assert!(carol.outbound.try_recv().is_err());
    }

    #[test]
    fn events_never_cross_tenants() {
        let (broker, _) = broker(8);
        let mut other_tenant = broker.connect(2, 2, &[42]);
        assert_eq!(broker.publish(&sent(1, 42, 100)), 0);
        assert!(other_tenant.outbound.try_recv().is_err());
    }

    #[test]
    fn full_queue_disconnects_only_the_slow_connection() {
        let (broker, _) = broker(2);
        let slow = broker.connect(1, 2, &[42]);
        let mut fast = broker.connect(1, 3, &[42]);
        // slow now holds fast's presence frame and never drains.

        assert_eq!(broker.publish(&sent(1, 42, 1)), 2);
        assert_eq!(next_frame(&mut fast)["message_id"], 1);

        assert_eq!(broker.publish(&sent(1, 42, 2)), 1);
        assert!(!broker.is_connected(slow.id));
        assert!(broker.is_connected(fast.id));

        let mut kinds = vec![
            next_frame(&mut fast)["type"].as_str().unwrap().to_string(),
            next_frame(&mut fast)["type"].as_str().unwrap().to_string(),
        ];
        kinds.sort();
        assert_eq!(kinds, vec!["message_sent", "presence"]);
        assert!(matches!(
            broker.send(slow.id, Arc::from("x")),
            Err(Disconnected(_))
        ));
    }

    #[test]
    fn presence_is_announced_to_co_participants() {
        let (broker, _) = broker(8);
        let mut alice = broker.connect(1, 1, &[42]);
        let bob = broker.connect(1, 2, &[42]);
        let frame = next_frame(&mut alice);
        assert_eq!(frame["type"], "presence");
        assert_eq!(frame["user_id"], 2);
        assert_eq!(frame["status"], "online");

        // a second device does not announce again
        let bob_phone = broker.connect(1, 2, &[42]);
        assert!(!bob_phone.came_online);
        assert!(alice.outbound.try_recv().is_err());

        broker.disconnect(bob.id);
        assert!(alice.outbound.try_recv().is_err());
        broker.disconnect(bob_phone.id);
        let frame = next_frame(&mut alice);
        assert_eq!(frame["status"], "offline");
    }

    #[test]
    fn conversation_created_subscribes_participants() {
        let (broker, _) = broker(8);
        let mut bob = broker.connect(1, 2, &[]);
        let delivered = broker.publish(&CoreEvent::ConversationCreated {
            tenant_id: 1,
            conversation_id: 9,
            conversation_type: ConversationType::Group,
            participant_ids: vec![1, 2],
            created_by: 1,
        });
        assert_eq!(delivered, 1);
        let frame = next_frame(&mut bob);
        assert_eq!(frame["type"], "conversation_created");
        assert_eq!(frame["conversation_type"], "group");

        assert_eq!(broker.publish(&sent(1, 9, 5)), 1);

        broker.publish(&CoreEvent::ParticipantRemoved {
            tenant_id: 1,
            conversation_id: 9,
            user_id: 2,
        });
        assert_eq!(broker.publish(&sent(1, 9, 6)), 0);
    }

    #[test]
    fn typing_skips_the_typist_and_unsubscribed_senders() {
        let (broker, _) = broker(8);
        let alice = broker.connect(1, 1, &[42]);
        let mut alice_phone = broker.connect(1, 1, &[42]);
        let mut bob = broker.connect(1, 2, &[42]);
        next_frame(&mut alice_phone); // bob online

        assert_eq!(broker.relay_typing(alice.id, 42), 1);
        let frame = next_frame(&mut bob);
        assert_eq!(frame["type"], "typing");
        assert_eq!(frame["user_id"], 1);
        assert!(alice_phone.outbound.try_recv().is_err());

        assert_eq!(broker.relay_typing(alice.id, 43), 0);
    }

    #[test]
    fn expired_connections_are_swept() {
        let (broker, clock) = broker(8);
        let mut alice = broker.connect(1, 1, &[42]);
        let bob = broker.connect(1, 2, &[42]);
        next_frame(&mut alice);

        clock.advance(Duration::seconds(90));
        broker.heartbeat(alice.id);
        clock.advance(Duration::seconds(60));
        assert_eq!(broker.sweep_presence(), 1);
        assert!(!broker.is_connected(bob.id));
        assert_eq!(next_frame(&mut alice)["status"], "offline");
        assert!(broker.presence().is_online(1, 1));
    }

    #[tokio::test]
    async fn run_forwards_bus_events() {
        let (broker, _) = broker(8);
        let broker = Arc::new(broker);
        let bus = EventBus::new(16);
        let mut bob = broker.connect(1, 2, &[42]);
        let handle = broker.run(&bus);

        bus.publish(sent(1, 42, 77));
        let raw = tokio::time::timeout(std::time::Duration::from_secs(2), bob.outbound.recv())
            .await
            .unwrap()
            .unwrap();
        let frame: Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(frame["message_id"], 77);
        handle.abort();
    }
}
