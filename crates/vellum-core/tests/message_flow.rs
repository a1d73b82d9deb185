use chrono::Duration;
use std::sync::Arc;
use vellum_codec::{KeyMaterial, Keyring};
use vellum_core::error::CoreError;
use vellum_core::events::CoreEvent;
use vellum_core::retention::{RetentionMode, RetentionPolicy};
use vellum_core::tenant::{RequestContext, SystemContext};
use vellum_core::{AppState, StateOptions};
use vellum_models::audit::AuditEventType;
use vellum_models::conversation::ConversationType;
use vellum_util::time::ManualTimeSource;

async fn state() -> (AppState, Arc<ManualTimeSource>) {
    let pool = vellum_db::create_pool("sqlite::memory:", 1).await.unwrap();
    vellum_db::run_migrations(&pool).await.unwrap();
    let clock = Arc::new(ManualTimeSource::fixed());
    let keyring = Arc::new(Keyring::with_master(KeyMaterial::new([42u8; 32])));
    keyring.rotate_derived(1).unwrap();
    let state = AppState::new(pool, keyring, clock.clone(), StateOptions::default());
    (state, clock)
}

#[tokio::test]
async fn hello_reaches_the_store_the_chain_and_the_bus() {
    let (state, _) = state().await;
    let alice = RequestContext::new(1, 1);
    let conversation = state
        .store
        .create_conversation(&alice, ConversationType::Group, 1, &[2, 3])
        .await
        .unwrap()
        .value;

    let mut rx = state.event_bus.subscribe();
    let sent = state
        .store
        .send(&alice, conversation.id, 1, "hello", false)
        .await
        .unwrap();

    let refreshed = state.store.conversation(&alice, conversation.id, 1).await.unwrap();
    assert_eq!(refreshed.message_count, 1);
    assert!(refreshed.last_message_at.is_some());

    let entry = sent.audit.unwrap();
    assert_eq!(entry.event_type, AuditEventType::Sent);
    assert_eq!(entry.subject_id, sent.value.id);
    assert_eq!(entry.sequence_no, 0);

    match rx.recv().await.unwrap() {
        CoreEvent::MessageSent {
            conversation_id,
            message_id,
            sender_id,
            ..
        } => {
            assert_eq!(conversation_id, conversation.id);
            assert_eq!(message_id, sent.value.id);
            assert_eq!(sender_id, 1);
        }
        other => panic!("unexpected event {other:?}"),
    }

    // A participant who was offline finds it in history.
    let carol = RequestContext::new(1, 3);
    let history = state
        .store
        .history(&carol, conversation.id, 3, Default::default())
        .await
        .unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(state.store.open(&carol, sent.value.id, 3).await.unwrap(), "hello");

    state.chain.verify(1, 0, None).await.unwrap();
}

#[tokio::test]
async fn retention_keeps_the_chain_verifiable() {
    let (state, clock) = state().await;
    let alice = RequestContext::new(1, 1);
    let bob = RequestContext::new(1, 2);
    let conversation = state
        .store
        .create_conversation(&alice, ConversationType::Direct, 1, &[2])
        .await
        .unwrap()
        .value;

    let old = state
        .store
        .send(&alice, conversation.id, 1, "old news", false)
        .await
        .unwrap()
        .value;
    state.store.mark_read(&bob, conversation.id, 2).await.unwrap();
    clock.advance(Duration::days(100));
    state
        .store
        .send(&bob, conversation.id, 2, "still here", false)
        .await
        .unwrap();

    state
        .retention
        .set_policy(
            &SystemContext(1),
            RetentionPolicy {
                message_days: 90,
                mode: RetentionMode::Delete,
            },
        )
        .await
        .unwrap();
    let report = state.retention.run_scheduled_cleanup().await.unwrap();
    assert_eq!(report.messages_removed(), 1);

    let trail = state.chain.entries_for_subject(1, old.id).await.unwrap();
    let kinds: Vec<_> = trail.iter().map(|e| e.event_type).collect();
    assert_eq!(kinds, vec![AuditEventType::Sent, AuditEventType::Deleted]);

    let checked = state.chain.verify(1, 0, None).await.unwrap();
    // sent, read, sent, deleted
    assert_eq!(checked, 4);
}

#[tokio::test]
async fn tampered_history_freezes_only_that_tenant() {
    let (state, _) = state().await;
    let alice = RequestContext::new(1, 1);
    let conversation = state
        .store
        .create_conversation(&alice, ConversationType::Group, 1, &[2])
        .await
        .unwrap()
        .value;
    for text in ["one", "two", "three"] {
        state
            .store
            .send(&alice, conversation.id, 1, text, false)
            .await
            .unwrap();
    }

    sqlx::query("UPDATE audit_chain SET created_at = '2020-01-01T00:00:00.000000Z' WHERE tenant_id = 1 AND sequence_no = 1")
        .execute(&state.db)
        .await
        .unwrap();

    match state.chain.verify(1, 0, None).await {
        Err(CoreError::Integrity(brk)) => assert_eq!(brk.record_id, 1),
        other => panic!("expected a chain break, got {other:?}"),
    }
    assert!(matches!(
        state.store.send(&alice, conversation.id, 1, "four", false).await,
        Err(CoreError::ChainFrozen(1))
    ));
}
