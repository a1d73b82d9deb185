use crate::error::CoreError;
use crate::events::CoreEvent;
use crate::message::{Applied, MessageStore};
use crate::tenant::TenantContext;
use serde_json::json;
use std::sync::Arc;
use vellum_models::audit::AuditEventType;
use vellum_models::conversation::{
    direct_key, normalize_participants, Conversation, ConversationStatus, ConversationType,
};
use vellum_models::message::Message;
use vellum_models::{ConversationId, TenantId, UserId};

impl MessageStore {
    /// Create a conversation. Direct conversations are unique per user pair
    /// within a tenant.
    pub async fn create_conversation(
        &self,
        ctx: &dyn TenantContext,
        conversation_type: ConversationType,
        creator_id: UserId,
        participants: &[UserId],
    ) -> Result<Applied<Conversation>, CoreError> {
        let tenant_id = ctx.current_tenant_id();
        let participant_ids = normalize_participants(conversation_type, creator_id, participants)?;
        let pair_key = (conversation_type == ConversationType::Direct)
            .then(|| direct_key(participant_ids[0], participant_ids[1]));

        if let Some(key) = &pair_key {
            if vellum_db::conversations::find_direct_conversation(&self.pool, tenant_id, key)
                .await?
                .is_some()
            {
                return Err(CoreError::Conflict(
                    "direct conversation already exists".into(),
                ));
            }
        }

        let conversation_id = vellum_util::snowflake::generate(self.worker_id);
        let now = self.clock.now();
        let mut tx = self.pool.begin().await?;
        let row = vellum_db::conversations::create_conversation(
            &mut *tx,
            conversation_id,
            tenant_id,
            conversation_type,
            creator_id,
            now,
            pair_key.as_deref(),
        )
        .await
        .map_err(|e| CoreError::from_insert(e, "direct conversation"))?;
        for user_id in &participant_ids {
            vellum_db::conversations::add_participant(&mut *tx, conversation_id, *user_id, now)
                .await?;
        }
        tx.commit().await?;

        self.participants
            .insert(conversation_id, Arc::new(participant_ids.clone()))
            .await;
        let conversation = row.into_conversation(participant_ids.clone())?;

        let event = CoreEvent::ConversationCreated {
            tenant_id,
            conversation_id,
            conversation_type,
            participant_ids,
            created_by: creator_id,
        };
        self.events.publish(event.clone());
        tracing::info!(
            tenant_id,
            conversation_id,
            conversation_type = %conversation_type,
            "conversation created"
        );

        Ok(Applied {
            value: conversation,
            audit: None,
            event: Some(event),
        })
    }

    /// Send to the direct conversation between two users, opening it on the
    /// first message.
    pub async fn send_direct(
        &self,
        ctx: &dyn TenantContext,
        sender_id: UserId,
        recipient_id: UserId,
        plaintext: &str,
        confidential: bool,
    ) -> Result<Applied<Message>, CoreError> {
        let tenant_id = ctx.current_tenant_id();
        vellum_util::validation::validate_message_content(
            plaintext,
            self.settings.max_message_length,
        )?;
        let conversation_id = self
            .find_or_create_direct(ctx, tenant_id, sender_id, recipient_id)
            .await?;
        self.send(ctx, conversation_id, sender_id, plaintext, confidential)
            .await
    }

    async fn find_or_create_direct(
        &self,
        ctx: &dyn TenantContext,
        tenant_id: TenantId,
        sender_id: UserId,
        recipient_id: UserId,
    ) -> Result<ConversationId, CoreError> {
        let key = direct_key(sender_id, recipient_id);
        if let Some(id) =
            vellum_db::conversations::find_direct_conversation(&self.pool, tenant_id, &key).await?
        {
            return Ok(id);
        }
        match self
            .create_conversation(ctx, ConversationType::Direct, sender_id, &[recipient_id])
            .await
        {
            Ok(applied) => Ok(applied.value.id),
            // Lost a race with the other participant.
            Err(CoreError::Conflict(_)) => {
                vellum_db::conversations::find_direct_conversation(&self.pool, tenant_id, &key)
                    .await?
                    .ok_or(CoreError::NotFound)
            }
            Err(err) => Err(err),
        }
    }

    /// Apply a status transition. Moving to `deleted` is recorded on the
    /// chain.
    pub async fn set_status(
        &self,
        ctx: &dyn TenantContext,
        conversation_id: ConversationId,
        actor_id: UserId,
        status: ConversationStatus,
    ) -> Result<Applied<Conversation>, CoreError> {
        let tenant_id = ctx.current_tenant_id();
        let mut conversation = self.tenant_conversation(tenant_id, conversation_id).await?;
        if !conversation.is_participant(actor_id) {
            return Err(CoreError::AccessDenied);
        }
        if !conversation.status.can_transition_to(status) {
            return Err(CoreError::Conflict(format!(
                "cannot move conversation from {} to {status}",
                conversation.status
            )));
        }

        let audit = if status == ConversationStatus::Deleted {
            let mut guard = self.chain.lock_tenant(tenant_id).await?;
            let mut tx = self.pool.begin().await?;
            vellum_db::conversations::set_status(&mut *tx, conversation_id, status).await?;
            let entry = guard
                .append(
                    &mut tx,
                    AuditEventType::Deleted,
                    conversation_id,
                    &json!({
                        "kind": "conversation",
                        "actor_id": actor_id,
                        "reason": "user_delete",
                    }),
                )
                .await?;
            guard.commit(tx).await?;
            Some(entry)
        } else {
            vellum_db::conversations::set_status(&self.pool, conversation_id, status).await?;
            None
        };

        conversation.status = status;
        let event = CoreEvent::ConversationStatusChanged {
            tenant_id,
            conversation_id,
            status,
        };
        self.events.publish(event.clone());

        Ok(Applied {
            value: conversation,
            audit,
            event: Some(event),
        })
    }

    /// Add a member to a group or support conversation. Any current
    /// participant may add.
    pub async fn add_participant(
        &self,
        ctx: &dyn TenantContext,
        conversation_id: ConversationId,
        actor_id: UserId,
        user_id: UserId,
    ) -> Result<Applied<bool>, CoreError> {
        let tenant_id = ctx.current_tenant_id();
        let conversation = self.membership_target(tenant_id, conversation_id, actor_id).await?;
        if user_id <= 0 {
            return Err(CoreError::BadRequest("participant ids must be positive".into()));
        }
        if conversation.is_participant(user_id) {
            return Ok(Applied {
                value: false,
                audit: None,
                event: None,
            });
        }

        let added = vellum_db::conversations::add_participant(
            &self.pool,
            conversation_id,
            user_id,
            self.clock.now(),
        )
        .await?;
        self.participants.invalidate(&conversation_id).await;

        let event = added.then(|| CoreEvent::ParticipantAdded {
            tenant_id,
            conversation_id,
            user_id,
        });
        if let Some(event) = &event {
            self.events.publish(event.clone());
        }
        Ok(Applied {
            value: added,
            audit: None,
            event,
        })
    }

    /// Remove a member. Users may leave; the creator may remove anyone.
    pub async fn remove_participant(
        &self,
        ctx: &dyn TenantContext,
        conversation_id: ConversationId,
        actor_id: UserId,
        user_id: UserId,
    ) -> Result<Applied<bool>, CoreError> {
        let tenant_id = ctx.current_tenant_id();
        let conversation = self.membership_target(tenant_id, conversation_id, actor_id).await?;
        if actor_id != user_id && actor_id != conversation.created_by {
            return Err(CoreError::AccessDenied);
        }

        let removed =
            vellum_db::conversations::remove_participant(&self.pool, conversation_id, user_id)
                .await?;
        self.participants.invalidate(&conversation_id).await;

        let event = removed.then(|| CoreEvent::ParticipantRemoved {
            tenant_id,
            conversation_id,
            user_id,
        });
        if let Some(event) = &event {
            self.events.publish(event.clone());
        }
        Ok(Applied {
            value: removed,
            audit: None,
            event,
        })
    }

    async fn membership_target(
        &self,
        tenant_id: TenantId,
        conversation_id: ConversationId,
        actor_id: UserId,
    ) -> Result<Conversation, CoreError> {
        let conversation = self.tenant_conversation(tenant_id, conversation_id).await?;
        if conversation.conversation_type == ConversationType::Direct {
            return Err(CoreError::BadRequest(
                "direct conversations have a fixed participant pair".into(),
            ));
        }
        if !conversation.is_participant(actor_id) {
            return Err(CoreError::AccessDenied);
        }
        if !conversation.status.accepts_messages() {
            return Err(CoreError::Conflict(format!(
                "conversation is {}",
                conversation.status
            )));
        }
        Ok(conversation)
    }
}
