use crate::audit::AuditChain;
use crate::error::CoreError;
use crate::events::{CoreEvent, EventBus};
use crate::tenant::TenantContext;
use chrono::{DateTime, Duration, Utc};
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use vellum_db::messages::MessageRow;
use vellum_db::DbPool;
use vellum_models::audit::AuditEventType;
use vellum_models::conversation::ConversationStatus;
use vellum_models::{InvalidArgument, TenantId, UserId};
use vellum_util::time::TimeSource;
use vellum_util::validation::validate_retention_days;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetentionMode {
    /// Remove expired rows outright.
    Delete,
    /// Wipe bodies and detach senders, keeping the rows.
    Anonymize,
}

impl RetentionMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Delete => "delete",
            Self::Anonymize => "anonymize",
        }
    }
}

impl fmt::Display for RetentionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RetentionMode {
    type Err = InvalidArgument;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "delete" => Ok(Self::Delete),
            "anonymize" => Ok(Self::Anonymize),
            other => Err(InvalidArgument::new(format!(
                "unknown retention mode '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionPolicy {
    pub message_days: i64,
    pub mode: RetentionMode,
}

#[derive(Debug, Clone)]
pub struct RetentionSettings {
    /// Applied to tenants without a stored policy. `None` leaves them alone.
    pub default_policy: Option<RetentionPolicy>,
    pub batch_size: i64,
    /// Batches per tenant per run; the cursor carries the rest over.
    pub max_batches: u32,
}

impl Default for RetentionSettings {
    fn default() -> Self {
        Self {
            default_policy: None,
            batch_size: 500,
            max_batches: 20,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TenantSweepReport {
    pub tenant_id: TenantId,
    pub messages_deleted: u64,
    pub messages_anonymized: u64,
    pub conversations_deleted: u64,
    /// False when the batch budget ran out before the pass finished.
    pub completed: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RetentionReport {
    pub tenants: Vec<TenantSweepReport>,
    pub failures: Vec<(TenantId, String)>,
}

impl RetentionReport {
    pub fn messages_removed(&self) -> u64 {
        self.tenants
            .iter()
            .map(|t| t.messages_deleted + t.messages_anonymized)
            .sum()
    }
}

/// Why a batch of messages is being removed.
#[derive(Debug, Clone, Copy)]
enum Removal {
    /// Older than the tenant's retention period.
    Expired(RetentionMode),
    /// Written by a user being erased.
    Authored(UserId),
}

impl Removal {
    fn mode(self) -> RetentionMode {
        match self {
            Self::Expired(mode) => mode,
            Self::Authored(_) => RetentionMode::Anonymize,
        }
    }

    fn reason(self) -> &'static str {
        match self {
            Self::Expired(_) => "retention",
            Self::Authored(_) => "gdpr_anonymize",
        }
    }

    fn still_applies(self, row: &MessageRow) -> bool {
        match self {
            Self::Expired(RetentionMode::Delete) => true,
            Self::Expired(RetentionMode::Anonymize) => row.deleted_at.is_none(),
            Self::Authored(user_id) => row.sender_id == user_id,
        }
    }
}

/// Scheduled cleanup of expired content and GDPR erasure.
///
/// Tenants are swept concurrently. Inside one tenant every batch takes the
/// tenant's chain lock, so sweeps interleave with live traffic without
/// forking the chain. Each removal appends its `deleted` entry in the same
/// transaction as the destructive write, and the sweep cursor is saved in
/// that transaction too, so an interrupted run resumes where it stopped.
pub struct RetentionService {
    pool: DbPool,
    chain: Arc<AuditChain>,
    events: EventBus,
    clock: Arc<dyn TimeSource>,
    settings: RetentionSettings,
}

impl RetentionService {
    pub fn new(
        pool: DbPool,
        chain: Arc<AuditChain>,
        events: EventBus,
        clock: Arc<dyn TimeSource>,
        settings: RetentionSettings,
    ) -> Self {
        Self {
            pool,
            chain,
            events,
            clock,
            settings,
        }
    }

    pub async fn policy_for(&self, tenant_id: TenantId) -> Result<Option<RetentionPolicy>, CoreError> {
        match vellum_db::retention::get_policy(&self.pool, tenant_id).await? {
            Some(row) => Ok(Some(RetentionPolicy {
                message_days: row.message_days,
                mode: row.mode.parse()?,
            })),
            None => Ok(self.settings.default_policy),
        }
    }

    pub async fn set_policy(
        &self,
        ctx: &dyn TenantContext,
        policy: RetentionPolicy,
    ) -> Result<RetentionPolicy, CoreError> {
        validate_retention_days(policy.message_days)?;
        let tenant_id = ctx.current_tenant_id();
        vellum_db::retention::upsert_policy(
            &self.pool,
            tenant_id,
            policy.message_days,
            policy.mode.as_str(),
            self.clock.now(),
        )
        .await?;
        tracing::info!(
            tenant_id,
            message_days = policy.message_days,
            mode = %policy.mode,
            "retention policy updated"
        );
        Ok(policy)
    }

    pub async fn clear_policy(&self, ctx: &dyn TenantContext) -> Result<bool, CoreError> {
        Ok(vellum_db::retention::delete_policy(&self.pool, ctx.current_tenant_id()).await?)
    }

    /// Entry point for the scheduler. Safe to call repeatedly; a failing
    /// tenant is reported and does not stop the others.
    pub async fn run_scheduled_cleanup(&self) -> Result<RetentionReport, CoreError> {
        let tenants = vellum_db::conversations::list_tenant_ids(&self.pool).await?;
        let results = join_all(tenants.iter().map(|&tenant_id| self.sweep_tenant(tenant_id))).await;

        let mut report = RetentionReport::default();
        for (tenant_id, result) in tenants.into_iter().zip(results) {
            match result {
                Ok(tenant_report) => report.tenants.push(tenant_report),
                Err(err) => {
                    tracing::warn!(tenant_id, error = %err, "retention sweep failed");
                    report.failures.push((tenant_id, err.to_string()));
                }
            }
        }
        tracing::info!(
            tenants = report.tenants.len(),
            failures = report.failures.len(),
            removed = report.messages_removed(),
            "retention sweep finished"
        );
        Ok(report)
    }

    pub async fn sweep_tenant(&self, tenant_id: TenantId) -> Result<TenantSweepReport, CoreError> {
        let mut report = TenantSweepReport {
            tenant_id,
            completed: true,
            ..TenantSweepReport::default()
        };
        let Some(policy) = self.policy_for(tenant_id).await? else {
            return Ok(report);
        };
        self.chain.ensure_writable(tenant_id).await?;
        let cutoff = self.clock.now() - Duration::days(policy.message_days);

        report.completed = false;
        let mut cursor = vellum_db::retention::get_cursor(&self.pool, tenant_id).await?;
        for _ in 0..self.settings.max_batches {
            // Tombstones hold no body but still count against the
            // retention period when rows are being removed.
            let rows = vellum_db::messages::list_expired(
                &self.pool,
                tenant_id,
                cutoff,
                cursor,
                policy.mode == RetentionMode::Delete,
                self.settings.batch_size,
            )
            .await?;
            let last_batch = (rows.len() as i64) < self.settings.batch_size;
            let next_cursor = if last_batch {
                0
            } else {
                rows.last().map(|r| r.id).unwrap_or(0)
            };

            let removed = self
                .remove_batch(tenant_id, &rows, Removal::Expired(policy.mode), Some(next_cursor))
                .await?;
            match policy.mode {
                RetentionMode::Delete => report.messages_deleted += removed,
                RetentionMode::Anonymize => report.messages_anonymized += removed,
            }

            cursor = next_cursor;
            if last_batch {
                report.completed = true;
                break;
            }
        }

        report.conversations_deleted = self.expire_conversations(tenant_id, cutoff).await?;
        tracing::debug!(
            tenant_id,
            deleted = report.messages_deleted,
            anonymized = report.messages_anonymized,
            conversations = report.conversations_deleted,
            "tenant retention sweep"
        );
        Ok(report)
    }

    /// Remove one batch under the chain lock. Rows are read again inside
    /// the transaction: a row that was deleted, anonymized or removed since
    /// it was listed is skipped and gets no second chain entry. `cursor` is
    /// the value the tenant's sweep cursor takes when the batch commits;
    /// `None` leaves the cursor alone.
    async fn remove_batch(
        &self,
        tenant_id: TenantId,
        rows: &[MessageRow],
        removal: Removal,
        cursor: Option<i64>,
    ) -> Result<u64, CoreError> {
        if rows.is_empty() && cursor.is_none() {
            return Ok(0);
        }
        let now = self.clock.now();
        let mode = removal.mode();

        let mut guard = self.chain.lock_tenant(tenant_id).await?;
        let mut tx = self.pool.begin().await?;
        let mut removed = Vec::with_capacity(rows.len());
        for listed in rows {
            let Some(row) = vellum_db::messages::get_message(&mut *tx, listed.id).await? else {
                continue;
            };
            if !removal.still_applies(&row) {
                continue;
            }
            let changed = match mode {
                RetentionMode::Delete => vellum_db::messages::hard_delete(&mut *tx, row.id).await?,
                RetentionMode::Anonymize => {
                    vellum_db::messages::anonymize(&mut *tx, row.id, now).await?
                }
            };
            if !changed {
                continue;
            }
            guard
                .append(
                    &mut tx,
                    AuditEventType::Deleted,
                    row.id,
                    &json!({
                        "conversation_id": row.conversation_id,
                        "reason": removal.reason(),
                        "mode": mode.as_str(),
                    }),
                )
                .await?;
            removed.push(row);
        }
        if let Some(cursor) = cursor {
            vellum_db::retention::set_cursor(&mut *tx, tenant_id, cursor, now).await?;
        }
        guard.commit(tx).await?;

        for row in removed.iter().filter(|row| row.deleted_at.is_none()) {
            self.events.publish(CoreEvent::MessageDeleted {
                tenant_id,
                conversation_id: row.conversation_id,
                message_id: row.id,
                deleted_at: now,
                is_confidential: row.is_confidential,
            });
        }
        Ok(removed.len() as u64)
    }

    async fn expire_conversations(
        &self,
        tenant_id: TenantId,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, CoreError> {
        let stale = vellum_db::conversations::list_inactive(
            &self.pool,
            tenant_id,
            cutoff,
            self.settings.batch_size,
        )
        .await?;
        if stale.is_empty() {
            return Ok(0);
        }

        let mut guard = self.chain.lock_tenant(tenant_id).await?;
        let mut tx = self.pool.begin().await?;
        let mut expired = Vec::with_capacity(stale.len());
        for listed in &stale {
            // Skip conversations deleted or written to since the listing.
            let Some(conversation) =
                vellum_db::conversations::get_conversation(&mut *tx, listed.id).await?
            else {
                continue;
            };
            let last_activity = conversation
                .last_message_at
                .unwrap_or(conversation.created_at);
            if conversation.status()? == ConversationStatus::Deleted || last_activity >= cutoff {
                continue;
            }
            vellum_db::conversations::set_status(
                &mut *tx,
                conversation.id,
                ConversationStatus::Deleted,
            )
            .await?;
            guard
                .append(
                    &mut tx,
                    AuditEventType::Deleted,
                    conversation.id,
                    &json!({
                        "kind": "conversation",
                        "reason": "retention",
                    }),
                )
                .await?;
            expired.push(conversation.id);
        }
        guard.commit(tx).await?;

        for &conversation_id in &expired {
            self.events.publish(CoreEvent::ConversationStatusChanged {
                tenant_id,
                conversation_id,
                status: ConversationStatus::Deleted,
            });
        }
        Ok(expired.len() as u64)
    }

    /// Erase one user's authorship within the tenant: every message they
    /// sent is wiped and re-attributed to the anonymous id, and their read
    /// markers are dropped.
    pub async fn anonymize_user(
        &self,
        ctx: &dyn TenantContext,
        user_id: UserId,
    ) -> Result<u64, CoreError> {
        let tenant_id = ctx.current_tenant_id();
        if user_id <= 0 {
            return Err(CoreError::BadRequest("user id must be positive".into()));
        }
        self.chain.ensure_writable(tenant_id).await?;

        let mut after_id = 0;
        let mut total = 0u64;
        loop {
            let rows = vellum_db::messages::list_by_sender(
                &self.pool,
                tenant_id,
                user_id,
                after_id,
                self.settings.batch_size,
            )
            .await?;
            let Some(last) = rows.last() else {
                break;
            };
            after_id = last.id;
            total += self
                .remove_batch(tenant_id, &rows, Removal::Authored(user_id), None)
                .await?;
            if (rows.len() as i64) < self.settings.batch_size {
                break;
            }
        }

        let read_states =
            vellum_db::read_states::delete_user_read_states(&self.pool, tenant_id, user_id)
                .await?;
        tracing::info!(tenant_id, user_id, messages = total, read_states, "user anonymized");
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::tests::{group, harness, Harness};
    use crate::message::MessagingSettings;
    use crate::tenant::{RequestContext, SystemContext};

    fn service(h: &Harness, settings: RetentionSettings) -> RetentionService {
        RetentionService::new(
            h.pool.clone(),
            h.chain.clone(),
            h.events.clone(),
            h.clock.clone(),
            settings,
        )
    }

    #[test]
    fn mode_parses() {
        assert_eq!("anonymize".parse::<RetentionMode>().unwrap(), RetentionMode::Anonymize);
        assert!("purge".parse::<RetentionMode>().is_err());
    }

    #[tokio::test]
    async fn tenants_without_policy_are_untouched() {
        let h = harness(MessagingSettings::default()).await;
        let conv = group(&h, 1, &[10, 20]).await;
        h.store
            .send(&RequestContext::new(1, 10), conv, 10, "keep", false)
            .await
            .unwrap();
        h.clock.advance(Duration::days(400));

        let report = service(&h, RetentionSettings::default())
            .run_scheduled_cleanup()
            .await
            .unwrap();
        assert_eq!(report.messages_removed(), 0);
        assert!(report.failures.is_empty());
    }

    #[tokio::test]
    async fn expired_messages_are_deleted_with_chain_entries() {
        let h = harness(MessagingSettings::default()).await;
        let conv = group(&h, 1, &[10, 20]).await;
        let ctx = RequestContext::new(1, 10);
        let old = h.store.send(&ctx, conv, 10, "old", false).await.unwrap().value;
        h.clock.advance(Duration::days(31));
        let fresh = h.store.send(&ctx, conv, 10, "new", false).await.unwrap().value;

        let retention = service(&h, RetentionSettings::default());
        retention
            .set_policy(
                &SystemContext(1),
                RetentionPolicy {
                    message_days: 30,
                    mode: RetentionMode::Delete,
                },
            )
            .await
            .unwrap();

        let report = retention.run_scheduled_cleanup().await.unwrap();
        assert_eq!(report.messages_removed(), 1);
        assert!(report.tenants.iter().all(|t| t.completed));

        let page = h
            .store
            .history(&ctx, conv, 10, Default::default())
            .await
            .unwrap();
        assert_eq!(page.iter().map(|m| m.id).collect::<Vec<_>>(), vec![fresh.id]);

        let trail = h.chain.entries_for_subject(1, old.id).await.unwrap();
        assert_eq!(trail.last().unwrap().event_type, AuditEventType::Deleted);
        h.chain.verify(1, 0, None).await.unwrap();

        // A second run finds nothing new.
        let again = retention.run_scheduled_cleanup().await.unwrap();
        assert_eq!(again.messages_removed(), 0);
    }

    #[tokio::test]
    async fn small_batches_resume_from_cursor() {
        let h = harness(MessagingSettings::default()).await;
        let conv = group(&h, 1, &[10, 20]).await;
        let ctx = RequestContext::new(1, 10);
        for i in 0..5 {
            h.store
                .send(&ctx, conv, 10, &format!("m{i}"), false)
                .await
                .unwrap();
        }
        h.clock.advance(Duration::days(10));

        let retention = service(
            &h,
            RetentionSettings {
                default_policy: Some(RetentionPolicy {
                    message_days: 7,
                    mode: RetentionMode::Anonymize,
                }),
                batch_size: 2,
                max_batches: 1,
            },
        );
        let first = retention.sweep_tenant(1).await.unwrap();
        assert_eq!(first.messages_anonymized, 2);
        assert!(!first.completed);

        let second = retention.sweep_tenant(1).await.unwrap();
        assert_eq!(second.messages_anonymized, 2);
        let third = retention.sweep_tenant(1).await.unwrap();
        assert_eq!(third.messages_anonymized, 1);
        assert!(third.completed);

        let page = h
            .store
            .history(&ctx, conv, 20, Default::default())
            .await
            .unwrap();
        assert!(page.iter().all(|m| m.body.is_none() && m.sender_id == 0));
        h.chain.verify(1, 0, None).await.unwrap();
    }

    #[tokio::test]
    async fn stale_conversations_are_deleted() {
        let h = harness(MessagingSettings::default()).await;
        let conv = group(&h, 1, &[10, 20]).await;
        h.clock.advance(Duration::days(2));

        let retention = service(
            &h,
            RetentionSettings {
                default_policy: Some(RetentionPolicy {
                    message_days: 1,
                    mode: RetentionMode::Delete,
                }),
                ..RetentionSettings::default()
            },
        );
        let report = retention.sweep_tenant(1).await.unwrap();
        assert_eq!(report.conversations_deleted, 1);

        let conversation = h.store.tenant_conversation(1, conv).await.unwrap();
        assert_eq!(conversation.status, ConversationStatus::Deleted);
        let trail = h.chain.entries_for_subject(1, conv).await.unwrap();
        assert_eq!(trail.len(), 1);
    }

    #[tokio::test]
    async fn anonymize_user_wipes_authorship() {
        let h = harness(MessagingSettings::default()).await;
        let conv = group(&h, 1, &[10, 20]).await;
        let alice = RequestContext::new(1, 10);
        let bob = RequestContext::new(1, 20);
        h.store.send(&alice, conv, 10, "a1", false).await.unwrap();
        h.store.send(&bob, conv, 20, "b1", false).await.unwrap();
        h.store.send(&alice, conv, 10, "a2", false).await.unwrap();
        h.store.mark_read(&alice, conv, 10).await.unwrap();

        let retention = service(&h, RetentionSettings::default());
        assert_eq!(retention.anonymize_user(&SystemContext(1), 10).await.unwrap(), 2);

        let page = h
            .store
            .history(&bob, conv, 20, Default::default())
            .await
            .unwrap();
        let senders: Vec<_> = page.iter().map(|m| m.sender_id).collect();
        assert_eq!(senders, vec![0, 20, 0]);
        assert!(vellum_db::read_states::get_read_state(&h.pool, conv, 10)
            .await
            .unwrap()
            .is_none());

        let entries = h.chain.entries(1, 0, 100).await.unwrap();
        let gdpr = entries
            .iter()
            .filter(|e| e.payload.contains("gdpr_anonymize"))
            .count();
        assert_eq!(gdpr, 2);
        h.chain.verify(1, 0, None).await.unwrap();

        // Nothing left to erase.
        assert_eq!(retention.anonymize_user(&SystemContext(1), 10).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn rows_changed_after_listing_are_skipped() {
        let h = harness(MessagingSettings::default()).await;
        let conv = group(&h, 1, &[10, 20]).await;
        let ctx = RequestContext::new(1, 10);
        let live = h.store.send(&ctx, conv, 10, "a", false).await.unwrap().value;
        let gone = h.store.send(&ctx, conv, 10, "b", false).await.unwrap().value;
        h.clock.advance(Duration::days(10));

        let retention = service(&h, RetentionSettings::default());
        let cutoff = h.clock.now() - Duration::days(7);
        let listed = vellum_db::messages::list_expired(&h.pool, 1, cutoff, 0, false, 100)
            .await
            .unwrap();
        assert_eq!(listed.len(), 2);

        // The sender deletes one of them before the batch takes the lock.
        h.store.delete(&ctx, gone.id, 10).await.unwrap();
        let mut rx = h.events.subscribe();

        let anonymize = Removal::Expired(RetentionMode::Anonymize);
        assert_eq!(retention.remove_batch(1, &listed, anonymize, None).await.unwrap(), 1);
        match rx.try_recv().unwrap() {
            CoreEvent::MessageDeleted { message_id, .. } => assert_eq!(message_id, live.id),
            other => panic!("unexpected event {other:?}"),
        }
        assert!(rx.try_recv().is_err());
        assert_eq!(retention.remove_batch(1, &listed, anonymize, None).await.unwrap(), 0);

        let trail: Vec<_> = h
            .chain
            .entries_for_subject(1, gone.id)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.event_type)
            .collect();
        assert_eq!(trail, vec![AuditEventType::Sent, AuditEventType::Deleted]);

        // Erasure still detaches the tombstone from its sender, once.
        let erase = Removal::Authored(10);
        assert_eq!(retention.remove_batch(1, &listed, erase, None).await.unwrap(), 1);
        assert_eq!(retention.remove_batch(1, &listed, erase, None).await.unwrap(), 0);

        let delete = Removal::Expired(RetentionMode::Delete);
        assert_eq!(retention.remove_batch(1, &listed, delete, None).await.unwrap(), 2);
        assert_eq!(retention.remove_batch(1, &listed, delete, None).await.unwrap(), 0);
        h.chain.verify(1, 0, None).await.unwrap();
    }
}
