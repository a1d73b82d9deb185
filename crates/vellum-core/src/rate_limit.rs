use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use vellum_models::{ConversationId, TenantId, UserId};
use vellum_util::time::TimeSource;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RateScope {
    Conversation(ConversationId),
    User(UserId),
    Global,
}

impl fmt::Display for RateScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Conversation(id) => write!(f, "conversation:{id}"),
            Self::User(id) => write!(f, "user:{id}"),
            Self::Global => f.write_str("global"),
        }
    }
}

/// `limit` events per `window_seconds`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimit {
    pub limit: u32,
    pub window_seconds: u64,
}

impl RateLimit {
    pub const fn new(limit: u32, window_seconds: u64) -> Self {
        Self {
            limit,
            window_seconds,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("rate limit of {limit} per {window_seconds}s exceeded for {scope}")]
pub struct RateLimitExceeded {
    pub limit: u32,
    pub window_seconds: u64,
    pub scope: String,
    /// Seconds until the current window closes.
    pub retry_after: u64,
}

#[derive(Debug, Clone, Copy)]
struct WindowCounter {
    window_start: DateTime<Utc>,
    window: Duration,
    count: u32,
}

/// Fixed-window counters keyed by tenant and scope.
///
/// A window opens on the first hit and closes `window_seconds` later. The
/// check and the increment happen under the map entry's lock, so concurrent
/// callers on one key never lose an update.
pub struct RateLimiter {
    windows: DashMap<(TenantId, RateScope), WindowCounter>,
    clock: Arc<dyn TimeSource>,
}

impl RateLimiter {
    pub fn new(clock: Arc<dyn TimeSource>) -> Self {
        Self {
            windows: DashMap::new(),
            clock,
        }
    }

    pub fn check_and_increment(
        &self,
        tenant_id: TenantId,
        scope: RateScope,
        limit: RateLimit,
    ) -> Result<(), RateLimitExceeded> {
        let now = self.clock.now();
        let window = Duration::seconds(limit.window_seconds as i64);
        let mut counter = self
            .windows
            .entry((tenant_id, scope))
            .or_insert(WindowCounter {
                window_start: now,
                window,
                count: 0,
            });

        if now - counter.window_start >= window || counter.window != window {
            counter.window_start = now;
            counter.window = window;
            counter.count = 0;
        }

        if counter.count >= limit.limit {
            let remaining = counter.window_start + window - now;
            let retry_after = (remaining.num_milliseconds().max(0) as u64).div_ceil(1000).max(1);
            tracing::debug!(tenant_id, scope = %scope, limit = limit.limit, "rate limit hit");
            return Err(RateLimitExceeded {
                limit: limit.limit,
                window_seconds: limit.window_seconds,
                scope: scope.to_string(),
                retry_after,
            });
        }

        counter.count += 1;
        Ok(())
    }

    /// Consume one unit from every scope, or from none of them.
    pub fn check_and_increment_all(
        &self,
        tenant_id: TenantId,
        checks: &[(RateScope, RateLimit)],
    ) -> Result<(), RateLimitExceeded> {
        for (i, (scope, limit)) in checks.iter().enumerate() {
            if let Err(err) = self.check_and_increment(tenant_id, *scope, *limit) {
                for (taken, _) in &checks[..i] {
                    self.release(tenant_id, *taken);
                }
                return Err(err);
            }
        }
        Ok(())
    }

    fn release(&self, tenant_id: TenantId, scope: RateScope) {
        if let Some(mut counter) = self.windows.get_mut(&(tenant_id, scope)) {
            counter.count = counter.count.saturating_sub(1);
        }
    }

    /// Drop counters whose window has closed. Returns how many were removed.
    pub fn prune(&self) -> usize {
        let now = self.clock.now();
        let before = self.windows.len();
        self.windows
            .retain(|_, counter| now - counter.window_start < counter.window);
        before.saturating_sub(self.windows.len())
    }

    pub fn len(&self) -> usize {
        self.windows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }
}
