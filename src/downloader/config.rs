//! Archive configuration constants

use std::time::Duration;

/// Maximum number of attempts per remote call, including the first one.
/// After this many transient failures the call escalates to a fatal failure.
pub const MAX_ATTEMPTS: u32 = 5;

/// Initial backoff delay in milliseconds.
pub const INITIAL_BACKOFF_MS: u64 = 500;

/// Maximum backoff delay in milliseconds.
pub const MAX_BACKOFF_MS: u64 = 30_000;

/// Upper bound (exclusive) of the uniform jitter added to each backoff, in milliseconds.
pub const JITTER_WINDOW_MS: u64 = 200;

/// Default token bucket capacity. The remote allows three method calls per second per token.
pub const DEFAULT_RATE_CAPACITY: u32 = 3;

/// Default token refill rate per second.
pub const DEFAULT_REFILL_PER_SEC: f64 = 3.0;

/// Deadline for one remote call.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Items requested per page.
pub const DEFAULT_PAGE_SIZE: u32 = 100;

/// Largest page size the remote accepts.
pub const MAX_PAGE_SIZE: u32 = 200;

/// Concurrent downloader tasks per run.
pub const DEFAULT_CONCURRENCY: usize = 3;

/// Concurrent payload downloads within one page.
pub const DEFAULT_MEDIA_CONCURRENCY: usize = 4;

/// Upper bound for both concurrency settings.
pub const MAX_CONCURRENCY: usize = 32;

/// Heartbeat age after which a target lock may be reclaimed.
pub const DEFAULT_STALE_LOCK_AFTER: Duration = Duration::from_secs(300);

/// Interval between lock heartbeats. Must stay well below the staleness threshold.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Poll interval while waiting for a lock in blocking mode.
pub const DEFAULT_LOCK_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// `min(base * 2^retry_count, max)`, saturating instead of overflowing
pub fn backoff_between(retry_count: u32, base: Duration, max: Duration) -> Duration {
    let factor = 2u32.checked_pow(retry_count).unwrap_or(u32::MAX);
    base.checked_mul(factor).unwrap_or(max).min(max)
}
