//! Token bucket rate limiting
//!
//! One [`RateLimiter`] exists per credential and is shared by every task of a
//! run. It is a hard ceiling: remote "too many requests" signals are handled
//! by the retry policy, never by adapting the bucket.

use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};
use tracing::debug;

/// Token bucket limiter
///
/// Callers queue on a fair mutex, so tokens are handed out in request order
/// through a single serialized decrement.
#[derive(Debug)]
pub struct RateLimiter {
    capacity: u32,
    refill_per_sec: f64,
    state: Mutex<BucketState>,
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

impl BucketState {
    fn refill(&mut self, capacity: u32, refill_per_sec: f64) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * refill_per_sec).min(f64::from(capacity));
        self.last_refill = now;
    }
}

impl RateLimiter {
    /// Create a limiter holding at most `capacity` tokens, refilled at `refill_per_sec`
    ///
    /// The bucket starts full.
    pub fn new(capacity: u32, refill_per_sec: f64) -> Result<Self, RateLimitError> {
        if capacity == 0 {
            return Err(RateLimitError::InvalidConfiguration(
                "capacity must be at least 1".to_string(),
            ));
        }
        if !refill_per_sec.is_finite() || refill_per_sec <= 0.0 {
            return Err(RateLimitError::InvalidConfiguration(format!(
                "refill rate must be a positive number, got {refill_per_sec}"
            )));
        }
        Ok(Self {
            capacity,
            refill_per_sec,
            state: Mutex::new(BucketState {
                tokens: f64::from(capacity),
                last_refill: Instant::now(),
            }),
        })
    }

    /// Limiter allowing `requests` calls per second with a burst of the same size
    pub fn per_second(requests: u32) -> Result<Self, RateLimitError> {
        Self::new(requests, f64::from(requests))
    }

    /// Bucket capacity
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Refill rate in tokens per second
    pub fn refill_per_sec(&self) -> f64 {
        self.refill_per_sec
    }

    /// Wait until a token is available and take it
    ///
    /// Dropping the returned future before completion consumes nothing.
    pub async fn acquire(&self) {
        let started = Instant::now();
        let mut state = self.state.lock().await;
        state.refill(self.capacity, self.refill_per_sec);

        if state.tokens < 1.0 {
            let deficit = 1.0 - state.tokens;
            let wait = Duration::from_secs_f64(deficit / self.refill_per_sec);
            debug!(wait_ms = wait.as_millis() as u64, "Rate limiter waiting for token");
            sleep(wait).await;
            state.refill(self.capacity, self.refill_per_sec);
        }

        // Guard against float rounding leaving the bucket a hair short.
        state.tokens = (state.tokens - 1.0).max(0.0);
        crate::metrics::record_rate_limiter_wait(started.elapsed());
    }

    /// Take a token only if one is immediately available
    pub async fn try_acquire(&self) -> bool {
        let mut state = self.state.lock().await;
        state.refill(self.capacity, self.refill_per_sec);
        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Currently available whole tokens
    pub async fn available(&self) -> u32 {
        let mut state = self.state.lock().await;
        state.refill(self.capacity, self.refill_per_sec);
        state.tokens.floor() as u32
    }
}

/// Rate limiter errors
#[derive(Debug, thiserror::Error)]
pub enum RateLimitError {
    /// Invalid limiter parameters
    #[error("invalid rate limit configuration: {0}")]
    InvalidConfiguration(String),
}
