pub mod audit;
pub mod conversation;
pub mod error;
pub mod events;
pub mod indexing;
pub mod message;
pub mod rate_limit;
pub mod retention;
pub mod tenant;

use audit::AuditChain;
use indexing::IndexingQueue;
use message::{MessageStore, MessagingSettings, ParticipantCache};
use rate_limit::RateLimiter;
use retention::{RetentionService, RetentionSettings};
use std::sync::Arc;
use tokio::sync::Notify;
use vellum_codec::{CryptoCodec, KeyProvider};
use vellum_db::DbPool;
use vellum_util::time::TimeSource;

/// Build the participant cache with a 5-minute TTL and 10k max entries.
pub fn build_participant_cache() -> ParticipantCache {
    moka::future::Cache::builder()
        .max_capacity(10_000)
        .time_to_live(std::time::Duration::from_secs(300))
        .build()
}

/// Gateway and delivery settings shared with the WebSocket layer.
#[derive(Clone, Debug)]
pub struct AppConfig {
    pub jwt_secret: String,
    pub heartbeat_interval_seconds: u64,
    pub presence_ttl_seconds: u64,
    /// Frames buffered per connection before it is disconnected.
    pub outbound_queue_size: usize,
    pub push_timeout_ms: u64,
    /// Inbound frames per second a single connection may send.
    pub inbound_frames_per_second: u32,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            jwt_secret: String::new(),
            heartbeat_interval_seconds: vellum_models::presence::DEFAULT_HEARTBEAT_INTERVAL_SECONDS,
            presence_ttl_seconds: vellum_models::presence::DEFAULT_PRESENCE_TTL_SECONDS,
            outbound_queue_size: 256,
            push_timeout_ms: 5_000,
            inbound_frames_per_second: 20,
        }
    }
}

/// Everything besides storage, keys and time needed to assemble the state.
#[derive(Clone, Debug, Default)]
pub struct StateOptions {
    pub config: AppConfig,
    pub messaging: MessagingSettings,
    pub retention: RetentionSettings,
    pub worker_id: u16,
    pub indexing_capacity: usize,
}

#[derive(Clone)]
pub struct AppState {
    pub db: DbPool,
    pub event_bus: events::EventBus,
    pub config: AppConfig,
    pub clock: Arc<dyn TimeSource>,
    pub chain: Arc<AuditChain>,
    pub limiter: Arc<RateLimiter>,
    pub store: Arc<MessageStore>,
    pub retention: Arc<RetentionService>,
    /// Non-confidential message ids waiting for the search indexer.
    pub indexing: Arc<IndexingQueue>,
    pub shutdown: Arc<Notify>,
}

impl AppState {
    pub fn new(
        db: DbPool,
        keys: Arc<dyn KeyProvider>,
        clock: Arc<dyn TimeSource>,
        options: StateOptions,
    ) -> Self {
        let event_bus = events::EventBus::default();
        let chain = Arc::new(AuditChain::new(db.clone(), clock.clone()));
        let limiter = Arc::new(RateLimiter::new(clock.clone()));
        let store = Arc::new(MessageStore::new(
            db.clone(),
            CryptoCodec::new(keys),
            chain.clone(),
            limiter.clone(),
            event_bus.clone(),
            clock.clone(),
            build_participant_cache(),
            options.messaging,
            options.worker_id,
        ));
        let retention = Arc::new(RetentionService::new(
            db.clone(),
            chain.clone(),
            event_bus.clone(),
            clock.clone(),
            options.retention,
        ));
        let indexing = Arc::new(IndexingQueue::new(if options.indexing_capacity == 0 {
            10_000
        } else {
            options.indexing_capacity
        }));

        Self {
            db,
            event_bus,
            config: options.config,
            clock,
            chain,
            limiter,
            store,
            retention,
            indexing,
            shutdown: Arc::new(Notify::new()),
        }
    }
}
