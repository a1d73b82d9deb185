use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Custom epoch: 2025-01-01T00:00:00Z
const VELLUM_EPOCH: u64 = 1_735_689_600_000;

static LAST_ID: AtomicU64 = AtomicU64::new(0);

/// Generate a Snowflake ID.
/// Format: 42 bits timestamp | 10 bits worker | 12 bits sequence
///
/// Ids handed out by one process are strictly increasing, even when the
/// sequence wraps within a millisecond or the wall clock steps backwards.
/// Message ordering ties on `sent_at` are broken by this id.
pub fn generate(worker_id: u16) -> i64 {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(VELLUM_EPOCH);
    let timestamp = now.saturating_sub(VELLUM_EPOCH);
    let candidate = (timestamp << 22) | ((worker_id as u64 & 0x3FF) << 12);

    let mut last = LAST_ID.load(Ordering::Relaxed);
    loop {
        let next = candidate.max(last + 1);
        match LAST_ID.compare_exchange_weak(last, next, Ordering::AcqRel, Ordering::Relaxed) {
            Ok(_) => return next as i64,
            Err(seen) => last = seen,
        }
    }
}

/// Extract the Unix timestamp (ms) from a snowflake.
pub fn timestamp_millis(id: i64) -> u64 {
    ((id as u64) >> 22) + VELLUM_EPOCH
}
