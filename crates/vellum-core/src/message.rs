use crate::audit::AuditChain;
use crate::error::CoreError;
use crate::events::{CoreEvent, EventBus};
use crate::rate_limit::{RateLimit, RateLimiter, RateScope};
use crate::tenant::TenantContext;
use chrono::Duration;
use serde_json::json;
use std::sync::Arc;
use vellum_codec::CryptoCodec;
use vellum_db::DbPool;
use vellum_models::audit::{AuditEntry, AuditEventType};
use vellum_models::conversation::Conversation;
use vellum_models::message::Message;
use vellum_models::{ConversationId, MessageId, TenantId, UserId};
use vellum_util::pagination::CursorParams;
use vellum_util::time::TimeSource;
use vellum_util::validation::{validate_message_content, MAX_MESSAGE_LENGTH};

pub type ParticipantCache = moka::future::Cache<ConversationId, Arc<Vec<UserId>>>;

/// Business rules applied by the store.
#[derive(Debug, Clone)]
pub struct MessagingSettings {
    pub edit_window_minutes: i64,
    pub max_message_length: usize,
    pub user_limit: RateLimit,
    pub conversation_limit: RateLimit,
    /// Tenant-wide ceiling across all senders and conversations.
    pub global_limit: RateLimit,
}

impl Default for MessagingSettings {
    fn default() -> Self {
        Self {
            edit_window_minutes: 15,
            max_message_length: MAX_MESSAGE_LENGTH,
            user_limit: RateLimit::new(30, 60),
            conversation_limit: RateLimit::new(120, 60),
            global_limit: RateLimit::new(1200, 60),
        }
    }
}

/// Result of a state transition: the new value, the chain entry that
/// recorded it (if any) and the event that was published for it.
#[derive(Debug, Clone)]
pub struct Applied<T> {
    pub value: T,
    pub audit: Option<AuditEntry>,
    pub event: Option<CoreEvent>,
}

/// Durable conversation and message state. Every mutation goes through
/// here so the body is sealed, the chain entry is written in the same
/// transaction, and the event is published after commit.
pub struct MessageStore {
    pub(crate) pool: DbPool,
    pub(crate) codec: CryptoCodec,
    pub(crate) chain: Arc<AuditChain>,
    pub(crate) limiter: Arc<RateLimiter>,
    pub(crate) events: EventBus,
    pub(crate) clock: Arc<dyn TimeSource>,
    pub(crate) participants: ParticipantCache,
    pub(crate) settings: MessagingSettings,
    pub(crate) worker_id: u16,
}

impl MessageStore {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pool: DbPool,
        codec: CryptoCodec,
        chain: Arc<AuditChain>,
        limiter: Arc<RateLimiter>,
        events: EventBus,
        clock: Arc<dyn TimeSource>,
        participants: ParticipantCache,
        settings: MessagingSettings,
        worker_id: u16,
    ) -> Self {
        Self {
            pool,
            codec,
            chain,
            limiter,
            events,
            clock,
            participants,
            settings,
            worker_id,
        }
    }

    pub fn settings(&self) -> &MessagingSettings {
        &self.settings
    }

    pub fn edit_window(&self) -> Duration {
        Duration::minutes(self.settings.edit_window_minutes)
    }

    /// Participant ids of a conversation, cached.
    pub async fn participant_ids(
        &self,
        conversation_id: ConversationId,
    ) -> Result<Arc<Vec<UserId>>, CoreError> {
        if let Some(ids) = self.participants.get(&conversation_id).await {
            return Ok(ids);
        }
        let ids = Arc::new(
            vellum_db::conversations::get_participant_ids(&self.pool, conversation_id).await?,
        );
        self.participants
            .insert(conversation_id, ids.clone())
            .await;
        Ok(ids)
    }

    /// Conversation ids the user currently participates in.
    pub async fn user_conversations(
        &self,
        ctx: &dyn TenantContext,
        user_id: UserId,
    ) -> Result<Vec<ConversationId>, CoreError> {
        Ok(vellum_db::conversations::list_user_conversation_ids(
            &self.pool,
            ctx.current_tenant_id(),
            user_id,
        )
        .await?)
    }

    /// Load a conversation of the caller's tenant. Conversations of other
    /// tenants are reported as missing.
    pub(crate) async fn tenant_conversation(
        &self,
        tenant_id: TenantId,
        conversation_id: ConversationId,
    ) -> Result<Conversation, CoreError> {
        let row = vellum_db::conversations::get_conversation(&self.pool, conversation_id)
            .await?
            .filter(|row| row.tenant_id == tenant_id)
            .ok_or(CoreError::NotFound)?;
        let participants = self.participant_ids(conversation_id).await?;
        Ok(row.into_conversation(participants.as_ref().clone())?)
    }

    /// Conversation as seen by one of its participants.
    pub async fn conversation(
        &self,
        ctx: &dyn TenantContext,
        conversation_id: ConversationId,
        user_id: UserId,
    ) -> Result<Conversation, CoreError> {
        self.participant_conversation(ctx.current_tenant_id(), conversation_id, user_id)
            .await
    }

    async fn participant_conversation(
        &self,
        tenant_id: TenantId,
        conversation_id: ConversationId,
        user_id: UserId,
    ) -> Result<Conversation, CoreError> {
        let conversation = self.tenant_conversation(tenant_id, conversation_id).await?;
        if !conversation.is_participant(user_id) {
            return Err(CoreError::AccessDenied);
        }
        Ok(conversation)
    }

    async fn tenant_message(
        &self,
        tenant_id: TenantId,
        message_id: MessageId,
    ) -> Result<Message, CoreError> {
        let row = vellum_db::messages::get_message(&self.pool, message_id)
            .await?
            .filter(|row| row.tenant_id == tenant_id)
            .ok_or(CoreError::NotFound)?;
        Ok(row.into_message()?)
    }

    /// Seal and persist a new message, append its `sent` entry and publish
    /// `MessageSent`.
    pub async fn send(
        &self,
        ctx: &dyn TenantContext,
        conversation_id: ConversationId,
        sender_id: UserId,
        plaintext: &str,
        confidential: bool,
    ) -> Result<Applied<Message>, CoreError> {
        let tenant_id = ctx.current_tenant_id();
        validate_message_content(plaintext, self.settings.max_message_length)?;

        let conversation = self
            .participant_conversation(tenant_id, conversation_id, sender_id)
            .await?;
        if !conversation.status.accepts_messages() {
            return Err(CoreError::Conflict(format!(
                "conversation is {}",
                conversation.status
            )));
        }
        self.chain.ensure_writable(tenant_id).await?;

        self.limiter.check_and_increment_all(
            tenant_id,
            &[
                (RateScope::User(sender_id), self.settings.user_limit),
                (
                    RateScope::Conversation(conversation_id),
                    self.settings.conversation_limit,
                ),
                (RateScope::Global, self.settings.global_limit),
            ],
        )?;

        let sealed = self
            .codec
            .seal_for_tenant(tenant_id, plaintext.as_bytes())
            .map_err(CoreError::Encryption)?;

        let mut guard = self.chain.lock_tenant(tenant_id).await?;
        // Taken under the lock so id order, `sent_at` order and chain order agree.
        let message_id = vellum_util::snowflake::generate(self.worker_id);
        let sent_at = self.clock.now();
        let mut tx = self.pool.begin().await?;
        let row = vellum_db::messages::create_message(
            &mut *tx,
            message_id,
            conversation_id,
            tenant_id,
            sender_id,
            &sealed,
            confidential,
            sent_at,
        )
        .await?;
        vellum_db::conversations::record_message(&mut *tx, conversation_id, sent_at).await?;
        let entry = guard
            .append(
                &mut tx,
                AuditEventType::Sent,
                message_id,
                &json!({
                    "conversation_id": conversation_id,
                    "sender_id": sender_id,
                    "key_id": sealed.key_id(),
                    "confidential": confidential,
                }),
            )
            .await?;
        guard.commit(tx).await?;

        let message = row.into_message()?;
        let event = CoreEvent::MessageSent {
            tenant_id,
            conversation_id,
            message_id,
            sender_id,
            sent_at,
            is_confidential: confidential,
        };
        self.events.publish(event.clone());
        tracing::debug!(tenant_id, conversation_id, message_id, "message sent");

        Ok(Applied {
            value: message,
            audit: Some(entry),
            event: Some(event),
        })
    }

    /// Re-seal a message body. Only the sender may edit, and only inside
    /// the edit window (inclusive).
    pub async fn edit(
        &self,
        ctx: &dyn TenantContext,
        message_id: MessageId,
        editor_id: UserId,
        new_plaintext: &str,
    ) -> Result<Applied<Message>, CoreError> {
        let tenant_id = ctx.current_tenant_id();
        validate_message_content(new_plaintext, self.settings.max_message_length)?;

        let mut message = self.tenant_message(tenant_id, message_id).await?;
        if message.sender_id != editor_id {
            return Err(CoreError::AccessDenied);
        }
        if message.is_deleted() {
            return Err(CoreError::Conflict("message was deleted".into()));
        }
        let edited_at = self.clock.now();
        if !message.within_edit_window(edited_at, self.edit_window()) {
            return Err(CoreError::EditWindowExpired {
                window_minutes: self.settings.edit_window_minutes,
            });
        }
        self.chain.ensure_writable(tenant_id).await?;

        let sealed = self
            .codec
            .seal_for_tenant(tenant_id, new_plaintext.as_bytes())
            .map_err(CoreError::Encryption)?;

        let mut guard = self.chain.lock_tenant(tenant_id).await?;
        let mut tx = self.pool.begin().await?;
        vellum_db::messages::update_body(&mut *tx, message_id, &sealed, edited_at).await?;
        let entry = guard
            .append(
                &mut tx,
                AuditEventType::Edited,
                message_id,
                &json!({
                    "conversation_id": message.conversation_id,
                    "editor_id": editor_id,
                    "key_id": sealed.key_id(),
                }),
            )
            .await?;
        guard.commit(tx).await?;

        message.body = Some(sealed);
        message.edited_at = Some(edited_at);
        let event = CoreEvent::MessageEdited {
            tenant_id,
            conversation_id: message.conversation_id,
            message_id,
            sender_id: message.sender_id,
            edited_at,
            is_confidential: message.is_confidential,
        };
        self.events.publish(event.clone());

        Ok(Applied {
            value: message,
            audit: Some(entry),
            event: Some(event),
        })
    }

    /// Move the user's read marker to the newest message and return how
    /// many messages from other senders became read. A call that marks
    /// nothing appends no entry and publishes nothing.
    pub async fn mark_read(
        &self,
        ctx: &dyn TenantContext,
        conversation_id: ConversationId,
        user_id: UserId,
    ) -> Result<Applied<u64>, CoreError> {
        let tenant_id = ctx.current_tenant_id();
        self.participant_conversation(tenant_id, conversation_id, user_id)
            .await?;

        let mut guard = self.chain.lock_tenant(tenant_id).await?;
        let mut tx = self.pool.begin().await?;

        let Some(latest) =
            vellum_db::messages::latest_message_id(&mut *tx, conversation_id).await?
        else {
            return Ok(Applied {
                value: 0,
                audit: None,
                event: None,
            });
        };
        let marker = vellum_db::read_states::get_read_state(&mut *tx, conversation_id, user_id)
            .await?
            .map(|state| state.last_read_message_id)
            .unwrap_or(0);
        if latest <= marker {
            return Ok(Applied {
                value: 0,
                audit: None,
                event: None,
            });
        }

        let read_count = vellum_db::messages::count_unread(
            &mut *tx,
            conversation_id,
            user_id,
            marker,
            latest,
        )
        .await?
        .max(0) as u64;
        vellum_db::read_states::update_read_state(
            &mut *tx,
            conversation_id,
            user_id,
            latest,
            self.clock.now(),
        )
        .await?;

        let audit = if read_count > 0 {
            Some(
                guard
                    .append(
                        &mut tx,
                        AuditEventType::Read,
                        conversation_id,
                        &json!({
                            "user_id": user_id,
                            "read_count": read_count,
                            "up_to_message_id": latest,
                        }),
                    )
                    .await?,
            )
        } else {
            None
        };
        guard.commit(tx).await?;

        let event = (read_count > 0).then(|| CoreEvent::MessageRead {
            tenant_id,
            conversation_id,
            user_id,
            read_count,
        });
        if let Some(event) = &event {
            self.events.publish(event.clone());
        }

        Ok(Applied {
            value: read_count,
            audit,
            event,
        })
    }

    /// Sender-initiated tombstone. The body is wiped; history keeps the row
    /// and the chain keeps every earlier entry.
    pub async fn delete(
        &self,
        ctx: &dyn TenantContext,
        message_id: MessageId,
        actor_id: UserId,
    ) -> Result<Applied<Message>, CoreError> {
        let tenant_id = ctx.current_tenant_id();
        let mut message = self.tenant_message(tenant_id, message_id).await?;
        if message.sender_id != actor_id {
            return Err(CoreError::AccessDenied);
        }
        if message.is_deleted() {
            return Err(CoreError::Conflict("message already deleted".into()));
        }

        let deleted_at = self.clock.now();
        let mut guard = self.chain.lock_tenant(tenant_id).await?;
        let mut tx = self.pool.begin().await?;
        if !vellum_db::messages::tombstone(&mut *tx, message_id, deleted_at).await? {
            return Err(CoreError::Conflict("message already deleted".into()));
        }
        let entry = guard
            .append(
                &mut tx,
                AuditEventType::Deleted,
                message_id,
                &json!({
                    "conversation_id": message.conversation_id,
                    "actor_id": actor_id,
                    "reason": "user_delete",
                }),
            )
            .await?;
        guard.commit(tx).await?;

        message.body = None;
        message.deleted_at = Some(deleted_at);
        let event = CoreEvent::MessageDeleted {
            tenant_id,
            conversation_id: message.conversation_id,
            message_id,
            deleted_at,
            is_confidential: message.is_confidential,
        };
        self.events.publish(event.clone());

        Ok(Applied {
            value: message,
            audit: Some(entry),
            event: Some(event),
        })
    }

    /// Authoritative history page, oldest first. Tombstones come back
    /// without a body.
    pub async fn history(
        &self,
        ctx: &dyn TenantContext,
        conversation_id: ConversationId,
        user_id: UserId,
        params: CursorParams,
    ) -> Result<Vec<Message>, CoreError> {
        self.participant_conversation(ctx.current_tenant_id(), conversation_id, user_id)
            .await?;
        let rows = vellum_db::messages::get_conversation_messages(
            &self.pool,
            conversation_id,
            params.before,
            params.limit() as i64,
        )
        .await?;
        rows.into_iter()
            .map(|row| row.into_message().map_err(CoreError::from))
            .collect()
    }

    /// Decrypt a message for a participant.
    pub async fn open(
        &self,
        ctx: &dyn TenantContext,
        message_id: MessageId,
        user_id: UserId,
    ) -> Result<String, CoreError> {
        let tenant_id = ctx.current_tenant_id();
        let message = self.tenant_message(tenant_id, message_id).await?;
        self.participant_conversation(tenant_id, message.conversation_id, user_id)
            .await?;
        let body = message.body.as_ref().ok_or(CoreError::NotFound)?;

        let plaintext = self.codec.open(body).map_err(|err| {
            tracing::error!(
                target: "vellum::alert",
                tenant_id,
                message_id,
                key_id = %body.key_id(),
                error = %err,
                "message body failed to decrypt"
            );
            CoreError::Decryption(err)
        })?;
        String::from_utf8(plaintext)
            .map_err(|_| CoreError::Internal(format!("message {message_id} is not utf-8")))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::tenant::RequestContext;
    use vellum_codec::{KeyMaterial, Keyring};
    use vellum_models::conversation::ConversationType;
    use vellum_util::time::ManualTimeSource;

    pub(crate) struct Harness {
        pub store: MessageStore,
        pub chain: Arc<AuditChain>,
        pub clock: Arc<ManualTimeSource>,
        pub keyring: Arc<Keyring>,
        pub pool: DbPool,
        pub events: EventBus,
    }

    pub(crate) async fn harness(settings: MessagingSettings) -> Harness {
        let pool = vellum_db::create_pool("sqlite::memory:", 1).await.unwrap();
        vellum_db::run_migrations(&pool).await.unwrap();
        let clock = Arc::new(ManualTimeSource::fixed());
        let keyring = Arc::new(Keyring::with_master(KeyMaterial::new([7u8; 32])));
        keyring.rotate_derived(1).unwrap();
        keyring.rotate_derived(2).unwrap();
        let chain = Arc::new(AuditChain::new(pool.clone(), clock.clone()));
        let events = EventBus::new(64);
        let store = MessageStore::new(
            pool.clone(),
            CryptoCodec::new(keyring.clone()),
            chain.clone(),
            Arc::new(RateLimiter::new(clock.clone())),
            events.clone(),
            clock.clone(),
            crate::build_participant_cache(),
            settings,
            1,
        );
        Harness {
            store,
            chain,
            clock,
            keyring,
            pool,
            events,
        }
    }

    pub(crate) async fn group(h: &Harness, tenant: TenantId, members: &[UserId]) -> ConversationId {
        h.store
            .create_conversation(
                &RequestContext::new(tenant, members[0]),
                ConversationType::Group,
                members[0],
                members,
            )
            .await
            .unwrap()
            .value
            .id
    }

    #[tokio::test]
    async fn send_seals_persists_and_chains() {
        let h = harness(MessagingSettings::default()).await;
        let conv = group(&h, 1, &[10, 20]).await;
        let ctx = RequestContext::new(1, 10);
        let mut rx = h.events.subscribe();

        let sent = h.store.send(&ctx, conv, 10, "hello", false).await.unwrap();
        let body = sent.value.body.clone().unwrap();
        assert_ne!(body.ciphertext(), b"hello");
        let entry = sent.audit.unwrap();
        assert_eq!(entry.event_type, AuditEventType::Sent);
        assert_eq!(entry.subject_id, sent.value.id);

        assert!(matches!(rx.recv().await.unwrap(), CoreEvent::MessageSent { message_id, .. } if message_id == sent.value.id));
        assert_eq!(h.store.open(&ctx, sent.value.id, 20).await.unwrap(), "hello");

        let conversation = h.store.tenant_conversation(1, conv).await.unwrap();
        assert_eq!(conversation.message_count, 1);
    }

    #[tokio::test]
    async fn non_participants_are_denied() {
        let h = harness(MessagingSettings::default()).await;
        let conv = group(&h, 1, &[10, 20]).await;
        let err = h
            .store
            .send(&RequestContext::new(1, 30), conv, 30, "hi", false)
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::AccessDenied));

        let err = h
            .store
            .send(&RequestContext::new(2, 10), conv, 10, "hi", false)
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::NotFound));
    }

    #[tokio::test]
    async fn rate_limit_rejects_before_any_write() {
        let settings = MessagingSettings {
            conversation_limit: RateLimit::new(3, 60),
            ..MessagingSettings::default()
        };
        let h = harness(settings).await;
        let conv = group(&h, 1, &[10, 20]).await;
        let ctx = RequestContext::new(1, 10);
        for _ in 0..3 {
            h.store.send(&ctx, conv, 10, "x", false).await.unwrap();
        }
        let err = h.store.send(&ctx, conv, 10, "x", false).await.unwrap_err();
        assert!(matches!(err, CoreError::RateLimited(ref e) if e.limit == 3));
        assert_eq!(h.chain.entries(1, 0, 100).await.unwrap().len(), 3);

        h.clock.advance(Duration::seconds(60));
        h.store.send(&ctx, conv, 10, "x", false).await.unwrap();
    }

    #[tokio::test]
    async fn tenant_wide_limit_spans_conversations() {
        let settings = MessagingSettings {
            global_limit: RateLimit::new(3, 60),
            ..MessagingSettings::default()
        };
        let h = harness(settings).await;
        let first = group(&h, 1, &[10, 20]).await;
        let second = group(&h, 1, &[30, 40]).await;
        h.store.send(&RequestContext::new(1, 10), first, 10, "a", false).await.unwrap();
        h.store.send(&RequestContext::new(1, 20), first, 20, "b", false).await.unwrap();
        h.store.send(&RequestContext::new(1, 30), second, 30, "c", false).await.unwrap();

        let err = h
            .store
            .send(&RequestContext::new(1, 40), second, 40, "d", false)
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::RateLimited(ref e) if e.scope == "global" && e.limit == 3));

        // Other tenants have their own budget.
        let elsewhere = group(&h, 2, &[10, 20]).await;
        h.store
            .send(&RequestContext::new(2, 10), elsewhere, 10, "e", false)
            .await
            .unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_sends_chain_in_visible_order() {
        let h = harness(MessagingSettings::default()).await;
        let conv = group(&h, 1, &[10, 20, 30, 40]).await;
        let store = Arc::new(h.store);

        let tasks: Vec<_> = [10, 20, 30, 40]
            .into_iter()
            .map(|user| {
                let store = store.clone();
                tokio::spawn(async move {
                    let ctx = RequestContext::new(1, user);
                    for i in 0..5 {
                        let text = format!("{user}-{i}");
                        store.send(&ctx, conv, user, &text, false).await.unwrap();
                    }
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }

        let chained: Vec<MessageId> = h
            .chain
            .entries(1, 0, 1000)
            .await
            .unwrap()
            .into_iter()
            .filter(|e| e.event_type == AuditEventType::Sent)
            .map(|e| e.subject_id)
            .collect();
        let visible: Vec<MessageId> = store
            .history(
                &RequestContext::new(1, 10),
                conv,
                10,
                CursorParams { before: None, limit: Some(100) },
            )
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.id)
            .collect();
        assert_eq!(chained.len(), 20);
        assert_eq!(chained, visible);
        let mut sorted = chained.clone();
        sorted.sort_unstable();
        assert_eq!(chained, sorted);
    }

    #[tokio::test]
    async fn edit_window_boundaries() {
        let h = harness(MessagingSettings::default()).await;
        let conv = group(&h, 1, &[10, 20]).await;
        let ctx = RequestContext::new(1, 10);

        let early = h.store.send(&ctx, conv, 10, "one", false).await.unwrap().value;
        let late = h.store.send(&ctx, conv, 10, "two", false).await.unwrap().value;

        h.clock.advance(Duration::minutes(15) - Duration::seconds(1));
        let edited = h.store.edit(&ctx, early.id, 10, "one!").await.unwrap();
        assert!(edited.value.edited_at.is_some());
        assert_eq!(h.store.open(&ctx, early.id, 10).await.unwrap(), "one!");

        h.clock.advance(Duration::seconds(2));
        let err = h.store.edit(&ctx, late.id, 10, "two!").await.unwrap_err();
        assert!(matches!(
            err,
            CoreError::EditWindowExpired { window_minutes: 15 }
        ));
    }

    #[tokio::test]
    async fn only_sender_may_edit_or_delete() {
        let h = harness(MessagingSettings::default()).await;
        let conv = group(&h, 1, &[10, 20]).await;
        let msg = h
            .store
            .send(&RequestContext::new(1, 10), conv, 10, "mine", false)
            .await
            .unwrap()
            .value;
        let other = RequestContext::new(1, 20);
        assert!(matches!(
            h.store.edit(&other, msg.id, 20, "x").await,
            Err(CoreError::AccessDenied)
        ));
        assert!(matches!(
            h.store.delete(&other, msg.id, 20).await,
            Err(CoreError::AccessDenied)
        ));
    }

    #[tokio::test]
    async fn mark_read_is_idempotent() {
        let h = harness(MessagingSettings::default()).await;
        let conv = group(&h, 1, &[10, 20]).await;
        let sender = RequestContext::new(1, 10);
        let reader = RequestContext::new(1, 20);
        h.store.send(&sender, conv, 10, "a", false).await.unwrap();
        h.store.send(&sender, conv, 10, "b", false).await.unwrap();

        let first = h.store.mark_read(&reader, conv, 20).await.unwrap();
        assert_eq!(first.value, 2);
        let entry = first.audit.unwrap();
        assert_eq!(entry.event_type, AuditEventType::Read);
        assert_eq!(entry.subject_id, conv);

        let before = h.chain.entries(1, 0, 100).await.unwrap().len();
        let second = h.store.mark_read(&reader, conv, 20).await.unwrap();
        assert_eq!(second.value, 0);
        assert!(second.audit.is_none());
        assert!(second.event.is_none());
        assert_eq!(h.chain.entries(1, 0, 100).await.unwrap().len(), before);
    }

    #[tokio::test]
    async fn own_messages_do_not_count_as_read() {
        let h = harness(MessagingSettings::default()).await;
        let conv = group(&h, 1, &[10, 20]).await;
        let ctx = RequestContext::new(1, 10);
        h.store.send(&ctx, conv, 10, "a", false).await.unwrap();
        let applied = h.store.mark_read(&ctx, conv, 10).await.unwrap();
        assert_eq!(applied.value, 0);
        assert!(applied.audit.is_none());
    }

    #[tokio::test]
    async fn delete_tombstones_and_keeps_history() {
        let h = harness(MessagingSettings::default()).await;
        let conv = group(&h, 1, &[10, 20]).await;
        let ctx = RequestContext::new(1, 10);
        let msg = h.store.send(&ctx, conv, 10, "bye", false).await.unwrap().value;

        let deleted = h.store.delete(&ctx, msg.id, 10).await.unwrap();
        assert!(deleted.value.body.is_none());
        assert_eq!(deleted.audit.unwrap().event_type, AuditEventType::Deleted);
        assert!(matches!(
            h.store.delete(&ctx, msg.id, 10).await,
            Err(CoreError::Conflict(_))
        ));

        let page = h
            .store
            .history(&ctx, conv, 10, CursorParams::default())
            .await
            .unwrap();
        assert_eq!(page.len(), 1);
        assert!(page[0].is_deleted());
        assert!(matches!(
            h.store.open(&ctx, msg.id, 10).await,
            Err(CoreError::NotFound)
        ));

        let trail = h.chain.entries_for_subject(1, msg.id).await.unwrap();
        let kinds: Vec<_> = trail.iter().map(|e| e.event_type).collect();
        assert_eq!(kinds, vec![AuditEventType::Sent, AuditEventType::Deleted]);
        h.chain.verify(1, 0, None).await.unwrap();
    }

    #[tokio::test]
    async fn history_is_ordered_and_paged() {
        let h = harness(MessagingSettings::default()).await;
        let conv = group(&h, 1, &[10, 20]).await;
        let ctx = RequestContext::new(1, 10);
        let mut ids = Vec::new();
        for i in 0..5 {
            let text = format!("m{i}");
            ids.push(h.store.send(&ctx, conv, 10, &text, false).await.unwrap().value.id);
            h.clock.advance(Duration::seconds(1));
        }

        let page = h
            .store
            .history(&ctx, conv, 20, CursorParams { before: None, limit: Some(2) })
            .await
            .unwrap();
        assert_eq!(page.iter().map(|m| m.id).collect::<Vec<_>>(), ids[3..].to_vec());

        let older = h
            .store
            .history(&ctx, conv, 20, CursorParams { before: Some(ids[3]), limit: Some(10) })
            .await
            .unwrap();
        assert_eq!(older.iter().map(|m| m.id).collect::<Vec<_>>(), ids[..3].to_vec());
    }

    #[tokio::test]
    async fn retired_key_makes_open_fail() {
        let h = harness(MessagingSettings::default()).await;
        let conv = group(&h, 1, &[10, 20]).await;
        let ctx = RequestContext::new(1, 10);
        let msg = h.store.send(&ctx, conv, 10, "secret", false).await.unwrap().value;
        let key_id = msg.body.as_ref().unwrap().key_id().to_string();

        h.keyring.rotate_derived(1).unwrap();
        assert_eq!(h.store.open(&ctx, msg.id, 10).await.unwrap(), "secret");

        h.keyring.retire(&key_id);
        let err = h.store.open(&ctx, msg.id, 10).await.unwrap_err();
        assert!(matches!(err, CoreError::Decryption(_)));
        assert_eq!(err.client_reason().0, vellum_models::gateway::ERR_INTERNAL);
    }

    #[tokio::test]
    async fn frozen_chain_rejects_sends() {
        let h = harness(MessagingSettings::default()).await;
        let conv = group(&h, 1, &[10, 20]).await;
        let ctx = RequestContext::new(1, 10);
        h.store.send(&ctx, conv, 10, "a", false).await.unwrap();
        sqlx::query("UPDATE audit_chain SET subject_id = 1 WHERE tenant_id = 1")
            .execute(&h.pool)
            .await
            .unwrap();
        assert!(h.chain.verify(1, 0, None).await.is_err());

        let err = h.store.send(&ctx, conv, 10, "b", false).await.unwrap_err();
        assert!(matches!(err, CoreError::ChainFrozen(1)));
    }

    #[tokio::test]
    async fn content_is_validated() {
        let h = harness(MessagingSettings::default()).await;
        let conv = group(&h, 1, &[10, 20]).await;
        let ctx = RequestContext::new(1, 10);
        assert!(matches!(
            h.store.send(&ctx, conv, 10, "   ", false).await,
            Err(CoreError::BadRequest(_))
        ));
        let long = "x".repeat(MAX_MESSAGE_LENGTH + 1);
        assert!(matches!(
            h.store.send(&ctx, conv, 10, &long, false).await,
            Err(CoreError::BadRequest(_))
        ));
    }
}
