use anyhow::Result;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fs;
use std::str::FromStr;
use vellum_core::message::MessagingSettings;
use vellum_core::rate_limit::RateLimit;
use vellum_core::retention::{RetentionMode, RetentionPolicy, RetentionSettings};
use vellum_core::{AppConfig, StateOptions};

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub auth: AuthConfig,
    pub crypto: CryptoConfig,
    #[serde(default)]
    pub messaging: MessagingConfig,
    #[serde(default)]
    pub rate_limits: RateLimitConfig,
    #[serde(default)]
    pub presence: PresenceConfig,
    #[serde(default)]
    pub delivery: DeliveryConfig,
    #[serde(default)]
    pub retention: RetentionConfig,
    #[serde(default)]
    pub indexing: IndexingConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Set when `load` wrote a fresh file.
    #[serde(skip)]
    pub generated: bool,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct ServerConfig {
    pub bind_address: String,
    /// Snowflake worker id; must differ between instances sharing a database.
    #[serde(default)]
    pub worker_id: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8090".into(),
            worker_id: 0,
        }
    }
}

#[derive(Debug, Deserialize, Serialize)]
pub struct DatabaseConfig {
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// PostgreSQL `statement_timeout`; 0 disables it. Ignored for SQLite.
    #[serde(default = "default_statement_timeout_secs")]
    pub statement_timeout_secs: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://./data/vellum.db?mode=rwc".into(),
            max_connections: default_max_connections(),
            statement_timeout_secs: default_statement_timeout_secs(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize)]
pub struct AuthConfig {
    /// HS256 secret shared with the identity service that mints gateway tokens.
    pub jwt_secret: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_secret: generate_random_hex(64),
        }
    }
}

#[derive(Debug, Deserialize, Serialize)]
pub struct CryptoConfig {
    /// 32-byte master secret, hex encoded. Tenant keys are derived from it.
    pub master_key_hex: String,
    /// Key ids that must no longer decrypt anything.
    #[serde(default)]
    pub retired_key_ids: Vec<String>,
}

impl Default for CryptoConfig {
    fn default() -> Self {
        Self {
            master_key_hex: generate_random_hex(64),
            retired_key_ids: Vec::new(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize)]
pub struct MessagingConfig {
    #[serde(default = "default_edit_window_minutes")]
    pub edit_window_minutes: i64,
    #[serde(default = "default_max_message_length")]
    pub max_message_length: usize,
}

impl Default for MessagingConfig {
    fn default() -> Self {
        Self {
            edit_window_minutes: default_edit_window_minutes(),
            max_message_length: default_max_message_length(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_user_messages")]
    pub user_messages: u32,
    #[serde(default = "default_window_seconds")]
    pub user_window_seconds: u64,
    #[serde(default = "default_conversation_messages")]
    pub conversation_messages: u32,
    #[serde(default = "default_window_seconds")]
    pub conversation_window_seconds: u64,
    /// Messages per window across a whole tenant.
    #[serde(default = "default_global_messages")]
    pub global_messages: u32,
    #[serde(default = "default_window_seconds")]
    pub global_window_seconds: u64,
    /// Inbound gateway frames per second per connection.
    #[serde(default = "default_inbound_frames_per_second")]
    pub inbound_frames_per_second: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            user_messages: default_user_messages(),
            user_window_seconds: default_window_seconds(),
            conversation_messages: default_conversation_messages(),
            conversation_window_seconds: default_window_seconds(),
            global_messages: default_global_messages(),
            global_window_seconds: default_window_seconds(),
            inbound_frames_per_second: default_inbound_frames_per_second(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize)]
pub struct PresenceConfig {
    #[serde(default = "default_presence_ttl")]
    pub ttl_seconds: u64,
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_seconds: u64,
    #[serde(default = "default_presence_sweep")]
    pub sweep_interval_seconds: u64,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            ttl_seconds: default_presence_ttl(),
            heartbeat_interval_seconds: default_heartbeat_interval(),
            sweep_interval_seconds: default_presence_sweep(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize)]
pub struct DeliveryConfig {
    #[serde(default = "default_outbound_queue_size")]
    pub outbound_queue_size: usize,
    #[serde(default = "default_push_timeout_ms")]
    pub push_timeout_ms: u64,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            outbound_queue_size: default_outbound_queue_size(),
            push_timeout_ms: default_push_timeout_ms(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize)]
pub struct RetentionConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_retention_interval_seconds")]
    pub interval_seconds: u64,
    #[serde(default = "default_retention_batch_size")]
    pub batch_size: i64,
    #[serde(default = "default_retention_max_batches")]
    pub max_batches: u32,
    /// Policy for tenants without their own; none keeps messages forever.
    #[serde(default)]
    pub message_days: Option<i64>,
    #[serde(default = "default_retention_mode")]
    pub mode: RetentionMode,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_seconds: default_retention_interval_seconds(),
            batch_size: default_retention_batch_size(),
            max_batches: default_retention_max_batches(),
            message_days: None,
            mode: default_retention_mode(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize)]
pub struct IndexingConfig {
    #[serde(default = "default_indexing_interval")]
    pub interval_seconds: u64,
    #[serde(default = "default_indexing_batch")]
    pub batch_size: usize,
    #[serde(default = "default_indexing_capacity")]
    pub queue_capacity: usize,
}

impl Default for IndexingConfig {
    fn default() -> Self {
        Self {
            interval_seconds: default_indexing_interval(),
            batch_size: default_indexing_batch(),
            queue_capacity: default_indexing_capacity(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_filter")]
    pub filter: String,
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
            json: false,
        }
    }
}

// ── Helpers ──────────────────────────────────────────────────────────────────

/// Generate a cryptographically random hex string of the given length.
fn generate_random_hex(len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| {
            let idx = rng.gen_range(0..16u8);
            char::from(if idx < 10 { b'0' + idx } else { b'a' + idx - 10 })
        })
        .collect()
}

fn default_max_connections() -> u32 {
    10
}
fn default_statement_timeout_secs() -> u64 {
    30
}
fn default_edit_window_minutes() -> i64 {
    15
}
fn default_max_message_length() -> usize {
    vellum_util::validation::MAX_MESSAGE_LENGTH
}
fn default_user_messages() -> u32 {
    30
}
fn default_conversation_messages() -> u32 {
    120
}
fn default_global_messages() -> u32 {
    1200
}
fn default_window_seconds() -> u64 {
    60
}
fn default_inbound_frames_per_second() -> u32 {
    20
}
fn default_presence_ttl() -> u64 {
    vellum_models::presence::DEFAULT_PRESENCE_TTL_SECONDS
}
fn default_heartbeat_interval() -> u64 {
    vellum_models::presence::DEFAULT_HEARTBEAT_INTERVAL_SECONDS
}
fn default_presence_sweep() -> u64 {
    15
}
fn default_outbound_queue_size() -> usize {
    256
}
fn default_push_timeout_ms() -> u64 {
    5_000
}
fn default_retention_interval_seconds() -> u64 {
    3600
}
fn default_retention_batch_size() -> i64 {
    500
}
fn default_retention_max_batches() -> u32 {
    20
}
fn default_retention_mode() -> RetentionMode {
    RetentionMode::Delete
}
fn default_indexing_interval() -> u64 {
    30
}
fn default_indexing_batch() -> usize {
    500
}
fn default_indexing_capacity() -> usize {
    10_000
}
fn default_log_filter() -> String {
    "vellum=info,tower_http=info".into()
}

fn looks_like_placeholder_secret(raw: &str) -> bool {
    let normalized = raw.trim().to_ascii_lowercase();
    normalized.is_empty()
        || normalized.contains("change_me")
        || normalized.contains("replace_me")
        || normalized.starts_with("example")
        || normalized == "secret"
}

fn validate(config: &Config) -> Result<()> {
    let jwt_secret = config.auth.jwt_secret.trim();
    if jwt_secret.len() < 32 || looks_like_placeholder_secret(jwt_secret) {
        anyhow::bail!(
            "Invalid auth.jwt_secret: use a strong random secret (at least 32 characters)"
        );
    }
    if vellum_codec::KeyMaterial::from_hex(config.crypto.master_key_hex.trim()).is_err() {
        anyhow::bail!("Invalid crypto.master_key_hex: expected 64 hex characters (32 bytes)");
    }
    if config.presence.heartbeat_interval_seconds >= config.presence.ttl_seconds {
        anyhow::bail!(
            "presence.heartbeat_interval_seconds must be below presence.ttl_seconds"
        );
    }
    if let Some(days) = config.retention.message_days {
        vellum_util::validation::validate_retention_days(days)?;
    }
    Ok(())
}

/// Generate a commented config file template with the given values filled in.
fn generate_config_template(config: &Config) -> String {
    format!(
        r#"# Vellum Configuration
# Generated automatically on first run. Edit as needed.

[server]
bind_address = "{bind_address}"
worker_id = {worker_id}

[database]
# sqlite://... or postgres://...
url = "{db_url}"
max_connections = {max_connections}
# PostgreSQL only; 0 disables the timeout.
statement_timeout_secs = {statement_timeout}

[auth]
# Shared with the identity service that issues gateway tokens.
jwt_secret = "{jwt_secret}"

[crypto]
# Per-tenant message keys are derived from this secret. Losing it makes
# every stored message unreadable.
master_key_hex = "{master_key_hex}"
retired_key_ids = []

[messaging]
edit_window_minutes = {edit_window}
max_message_length = {max_length}

[rate_limits]
user_messages = {user_messages}
user_window_seconds = {user_window}
conversation_messages = {conversation_messages}
conversation_window_seconds = {conversation_window}
global_messages = {global_messages}
global_window_seconds = {global_window}
inbound_frames_per_second = {inbound_fps}

[presence]
ttl_seconds = {presence_ttl}
heartbeat_interval_seconds = {heartbeat}
sweep_interval_seconds = {presence_sweep}

[delivery]
outbound_queue_size = {queue_size}
push_timeout_ms = {push_timeout}

[retention]
enabled = {retention_enabled}
interval_seconds = {retention_interval}
batch_size = {retention_batch}
max_batches = {retention_max_batches}
# Default policy for tenants without their own:
# message_days = 365
mode = "{retention_mode}"

[indexing]
interval_seconds = {indexing_interval}
batch_size = {indexing_batch}
queue_capacity = {indexing_capacity}

[logging]
filter = "{log_filter}"
json = {log_json}
"#,
        bind_address = config.server.bind_address,
        worker_id = config.server.worker_id,
        db_url = config.database.url,
        max_connections = config.database.max_connections,
        statement_timeout = config.database.statement_timeout_secs,
        jwt_secret = config.auth.jwt_secret,
        master_key_hex = config.crypto.master_key_hex,
        edit_window = config.messaging.edit_window_minutes,
        max_length = config.messaging.max_message_length,
        user_messages = config.rate_limits.user_messages,
        user_window = config.rate_limits.user_window_seconds,
        conversation_messages = config.rate_limits.conversation_messages,
        conversation_window = config.rate_limits.conversation_window_seconds,
        global_messages = config.rate_limits.global_messages,
        global_window = config.rate_limits.global_window_seconds,
        inbound_fps = config.rate_limits.inbound_frames_per_second,
        presence_ttl = config.presence.ttl_seconds,
        heartbeat = config.presence.heartbeat_interval_seconds,
        presence_sweep = config.presence.sweep_interval_seconds,
        queue_size = config.delivery.outbound_queue_size,
        push_timeout = config.delivery.push_timeout_ms,
        retention_enabled = config.retention.enabled,
        retention_interval = config.retention.interval_seconds,
        retention_batch = config.retention.batch_size,
        retention_max_batches = config.retention.max_batches,
        retention_mode = config.retention.mode.as_str(),
        indexing_interval = config.indexing.interval_seconds,
        indexing_batch = config.indexing.batch_size,
        indexing_capacity = config.indexing.queue_capacity,
        log_filter = config.logging.filter,
        log_json = config.logging.json,
    )
}

fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<T>().ok())
}

// ── Config Loading ───────────────────────────────────────────────────────────

impl Config {
    pub fn load(path: &str) -> Result<Self> {
        let mut config = if std::path::Path::new(path).exists() {
            let content = fs::read_to_string(path)?;
            toml::from_str(&content)?
        } else {
            let mut config = Config::default();
            if let Some(parent) = std::path::Path::new(path).parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(path, generate_config_template(&config))?;
            config.generated = true;
            config
        };

        config.apply_env_overrides();
        validate(&config)?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(value) = std::env::var("VELLUM_BIND_ADDRESS") {
            self.server.bind_address = value;
        }
        if let Some(value) = env_parse("VELLUM_WORKER_ID") {
            self.server.worker_id = value;
        }
        if let Ok(value) = std::env::var("VELLUM_DATABASE_URL") {
            self.database.url = value;
        }
        if let Some(value) = env_parse::<u32>("VELLUM_DATABASE_MAX_CONNECTIONS") {
            self.database.max_connections = value.max(1);
        }
        if let Some(value) = env_parse::<u64>("VELLUM_DB_STATEMENT_TIMEOUT_SECS") {
            self.database.statement_timeout_secs = value;
        }
        if let Ok(value) = std::env::var("VELLUM_JWT_SECRET") {
            self.auth.jwt_secret = value;
        }
        if let Ok(value) = std::env::var("VELLUM_MASTER_KEY_HEX") {
            self.crypto.master_key_hex = value;
        }
        if let Some(value) = env_parse::<i64>("VELLUM_EDIT_WINDOW_MINUTES") {
            self.messaging.edit_window_minutes = value.max(0);
        }
        if let Some(value) = env_parse::<usize>("VELLUM_MAX_MESSAGE_LENGTH") {
            self.messaging.max_message_length = value.max(1);
        }
        if let Some(value) = env_parse::<u32>("VELLUM_USER_MESSAGES_PER_WINDOW") {
            self.rate_limits.user_messages = value;
        }
        if let Some(value) = env_parse::<u32>("VELLUM_CONVERSATION_MESSAGES_PER_WINDOW") {
            self.rate_limits.conversation_messages = value;
        }
        if let Some(value) = env_parse::<u32>("VELLUM_GLOBAL_MESSAGES_PER_WINDOW") {
            self.rate_limits.global_messages = value;
        }
        if let Some(value) = env_parse::<u32>("VELLUM_INBOUND_FRAMES_PER_SECOND") {
            self.rate_limits.inbound_frames_per_second = value;
        }
        if let Some(value) = env_parse::<u64>("VELLUM_PRESENCE_TTL_SECONDS") {
            self.presence.ttl_seconds = value.max(1);
        }
        if let Some(value) = env_parse::<u64>("VELLUM_HEARTBEAT_INTERVAL_SECONDS") {
            self.presence.heartbeat_interval_seconds = value;
        }
        if let Some(value) = env_parse::<usize>("VELLUM_OUTBOUND_QUEUE_SIZE") {
            self.delivery.outbound_queue_size = value.max(1);
        }
        if let Some(value) = env_parse::<u64>("VELLUM_PUSH_TIMEOUT_MS") {
            self.delivery.push_timeout_ms = value.max(1);
        }
        if let Some(value) = env_parse("VELLUM_RETENTION_ENABLED") {
            self.retention.enabled = value;
        }
        if let Some(value) = env_parse::<u64>("VELLUM_RETENTION_INTERVAL_SECONDS") {
            self.retention.interval_seconds = value.max(60);
        }
        if let Some(value) = env_parse::<i64>("VELLUM_RETENTION_BATCH_SIZE") {
            self.retention.batch_size = value.clamp(1, 10_000);
        }
        if let Ok(value) = std::env::var("VELLUM_RETENTION_MESSAGE_DAYS") {
            self.retention.message_days = value.trim().parse::<i64>().ok().filter(|d| *d > 0);
        }
        if let Some(value) = env_parse("VELLUM_RETENTION_MODE") {
            self.retention.mode = value;
        }
        if let Ok(value) = std::env::var("VELLUM_LOG_FILTER") {
            self.logging.filter = value;
        }
        if let Some(value) = env_parse("VELLUM_LOG_JSON") {
            self.logging.json = value;
        }
    }

    /// Per-connection options for PostgreSQL pools.
    pub fn pg_options(&self) -> vellum_db::PgConnectOptions {
        vellum_db::PgConnectOptions {
            statement_timeout_secs: self.database.statement_timeout_secs,
        }
    }

    /// Settings handed to `AppState::new`.
    pub fn state_options(&self) -> StateOptions {
        StateOptions {
            config: AppConfig {
                jwt_secret: self.auth.jwt_secret.clone(),
                heartbeat_interval_seconds: self.presence.heartbeat_interval_seconds,
                presence_ttl_seconds: self.presence.ttl_seconds,
                outbound_queue_size: self.delivery.outbound_queue_size,
                push_timeout_ms: self.delivery.push_timeout_ms,
                inbound_frames_per_second: self.rate_limits.inbound_frames_per_second,
            },
            messaging: MessagingSettings {
                edit_window_minutes: self.messaging.edit_window_minutes,
                max_message_length: self.messaging.max_message_length,
                user_limit: RateLimit::new(
                    self.rate_limits.user_messages,
                    self.rate_limits.user_window_seconds,
                ),
                conversation_limit: RateLimit::new(
                    self.rate_limits.conversation_messages,
                    self.rate_limits.conversation_window_seconds,
                ),
                global_limit: RateLimit::new(
                    self.rate_limits.global_messages,
                    self.rate_limits.global_window_seconds,
                ),
            },
            retention: RetentionSettings {
                default_policy: self.retention.message_days.map(|message_days| RetentionPolicy {
                    message_days,
                    mode: self.retention.mode,
                }),
                batch_size: self.retention.batch_size,
                max_batches: self.retention.max_batches,
            },
            worker_id: self.server.worker_id,
            indexing_capacity: self.indexing.queue_capacity,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_values() {
        let config = Config::default();
        assert_eq!(config.messaging.edit_window_minutes, 15);
        assert_eq!(config.messaging.max_message_length, 5000);
        assert_eq!(config.rate_limits.user_messages, 30);
        assert_eq!(config.rate_limits.conversation_messages, 120);
        assert_eq!(config.rate_limits.global_messages, 1200);
        assert_eq!(config.database.statement_timeout_secs, 30);
        assert_eq!(config.presence.ttl_seconds, 120);
        assert_eq!(config.presence.heartbeat_interval_seconds, 30);
        assert_eq!(config.delivery.outbound_queue_size, 256);
        assert!(!config.retention.enabled);
        assert_eq!(config.auth.jwt_secret.len(), 64);
        validate(&config).unwrap();
    }

    #[test]
    fn generated_template_parses_back() {
        let original = Config::default();
        let parsed: Config = toml::from_str(&generate_config_template(&original)).unwrap();
        assert_eq!(parsed.auth.jwt_secret, original.auth.jwt_secret);
        assert_eq!(parsed.crypto.master_key_hex, original.crypto.master_key_hex);
        assert_eq!(parsed.retention.mode, RetentionMode::Delete);
        assert_eq!(parsed.retention.message_days, None);
        assert_eq!(parsed.logging.filter, "vellum=info,tower_http=info");
    }

    #[test]
    fn weak_secrets_are_rejected() {
        let mut config = Config::default();
        config.auth.jwt_secret = "change_me".into();
        assert!(validate(&config).is_err());

        let mut config = Config::default();
        config.crypto.master_key_hex = "abcd".into();
        assert!(validate(&config).is_err());

        let mut config = Config::default();
        config.presence.heartbeat_interval_seconds = config.presence.ttl_seconds;
        assert!(validate(&config).is_err());
    }

    #[test]
    fn state_options_carry_the_default_policy() {
        let mut config = Config::default();
        config.retention.message_days = Some(90);
        config.retention.mode = RetentionMode::Anonymize;
        let options = config.state_options();
        assert_eq!(
            options.retention.default_policy,
            Some(RetentionPolicy {
                message_days: 90,
                mode: RetentionMode::Anonymize
            })
        );
        assert_eq!(options.messaging.user_limit, RateLimit::new(30, 60));
        assert_eq!(options.messaging.global_limit, RateLimit::new(1200, 60));
    }

    #[test]
    fn tenant_limit_and_statement_timeout_round_trip() {
        let mut original = Config::default();
        original.rate_limits.global_messages = 50;
        original.rate_limits.global_window_seconds = 10;
        original.database.statement_timeout_secs = 0;
        let parsed: Config = toml::from_str(&generate_config_template(&original)).unwrap();
        assert_eq!(
            parsed.state_options().messaging.global_limit,
            RateLimit::new(50, 10)
        );
        assert_eq!(parsed.pg_options().statement_timeout_secs, 0);
    }

    #[test]
    fn load_generates_a_file_and_applies_env_overrides() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("conf").join("vellum.toml");
        let path = path.to_str().expect("config path utf8");

        std::env::set_var("VELLUM_RETENTION_MODE", "anonymize");
        let config = Config::load(path).expect("load config");
        std::env::remove_var("VELLUM_RETENTION_MODE");

        assert!(config.generated);
        assert_eq!(config.retention.mode, RetentionMode::Anonymize);
        assert!(std::path::Path::new(path).exists());

        let again = Config::load(path).expect("reload config");
        assert!(!again.generated);
        assert_eq!(again.auth.jwt_secret, config.auth.jwt_secret);
        assert_eq!(again.retention.mode, RetentionMode::Delete);
    }
}
