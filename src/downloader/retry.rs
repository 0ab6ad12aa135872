//! Retry and backoff policy for remote calls
//!
//! Every outcome is classified into a [`CallOutcome`]. Transient failures and
//! rate signals are retried with `min(base * 2^attempt, max) + jitter`; fatal
//! failures return immediately. No retry path is unbounded: after
//! `max_attempts` calls the last error is wrapped in
//! [`FetcherError::RetriesExhausted`], which itself classifies as fatal.

use super::config::{
    backoff_between, INITIAL_BACKOFF_MS, JITTER_WINDOW_MS, MAX_ATTEMPTS, MAX_BACKOFF_MS,
};
use crate::fetcher::{FetcherError, FetcherResult};
use crate::shutdown::ShutdownCoordinator;
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Classification of one remote-call outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallOutcome {
    /// Call succeeded
    Success,
    /// Network, timeout or server-side failure
    TransientFailure,
    /// Remote rate signal
    RateExceeded,
    /// Permission, not-found or other rejected request
    FatalFailure,
}

impl CallOutcome {
    /// Classify a call result
    pub fn classify<T>(result: &FetcherResult<T>) -> Self {
        match result {
            Ok(_) => CallOutcome::Success,
            Err(err) => Self::of_error(err),
        }
    }

    /// Classify an error
    pub fn of_error(err: &FetcherError) -> Self {
        match err {
            FetcherError::Network(_) | FetcherError::Timeout(_) | FetcherError::Server { .. } => {
                CallOutcome::TransientFailure
            }
            FetcherError::RateLimitExceeded(_) => CallOutcome::RateExceeded,
            FetcherError::Authorization(_)
            | FetcherError::NotFound(_)
            | FetcherError::Api { .. }
            | FetcherError::Parse(_)
            | FetcherError::RetriesExhausted { .. }
            | FetcherError::Cancelled => CallOutcome::FatalFailure,
        }
    }

    /// Whether the outcome is retried
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CallOutcome::TransientFailure | CallOutcome::RateExceeded
        )
    }

    /// Lowercase label for logs and metrics
    pub fn as_str(&self) -> &'static str {
        match self {
            CallOutcome::Success => "success",
            CallOutcome::TransientFailure => "transient",
            CallOutcome::RateExceeded => "rate_exceeded",
            CallOutcome::FatalFailure => "fatal",
        }
    }
}

/// Bounded exponential backoff with uniform jitter
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
    jitter_window: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: MAX_ATTEMPTS,
            base_delay: Duration::from_millis(INITIAL_BACKOFF_MS),
            max_delay: Duration::from_millis(MAX_BACKOFF_MS),
            jitter_window: Duration::from_millis(JITTER_WINDOW_MS),
        }
    }
}

impl RetryPolicy {
    /// Create a policy; `max_attempts` counts the first call
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            jitter_window: Duration::ZERO,
        }
    }

    /// Set the jitter window
    pub fn with_jitter(mut self, jitter_window: Duration) -> Self {
        self.jitter_window = jitter_window;
        self
    }

    /// Set the attempt limit
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Attempt limit, including the first call
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Validate settings
    pub fn validate(&self) -> Result<(), String> {
        if self.max_attempts == 0 {
            return Err("retry attempts must be at least 1".to_string());
        }
        if self.base_delay > self.max_delay {
            return Err(format!(
                "base backoff {:?} exceeds maximum backoff {:?}",
                self.base_delay, self.max_delay
            ));
        }
        Ok(())
    }

    /// Deterministic part of the delay before retry number `retry` (0-based)
    pub fn backoff(&self, retry: u32) -> Duration {
        backoff_between(retry, self.base_delay, self.max_delay)
    }

    /// Full delay before retry number `retry`, jitter included
    pub fn delay_for(&self, retry: u32) -> Duration {
        let jitter = if self.jitter_window.is_zero() {
            Duration::ZERO
        } else {
            let window_ms = self.jitter_window.as_millis().max(1) as u64;
            Duration::from_millis(rand::thread_rng().gen_range(0..window_ms))
        };
        self.backoff(retry) + jitter
    }

    /// Run `operation` until it succeeds, fails fatally, or attempts run out
    ///
    /// `operation` receives the 1-based attempt number. Backoff sleeps end
    /// early with [`FetcherError::Cancelled`] when `shutdown` fires.
    pub async fn execute<T, F, Fut>(
        &self,
        operation: &str,
        shutdown: Option<&ShutdownCoordinator>,
        mut call: F,
    ) -> FetcherResult<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = FetcherResult<T>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let err = match call(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            let outcome = CallOutcome::of_error(&err);
            if !outcome.is_retryable() {
                debug!(operation, attempt, error = %err, "Call failed fatally");
                return Err(err);
            }

            if attempt >= self.max_attempts {
                warn!(
                    operation,
                    attempts = attempt,
                    error = %err,
                    "Retries exhausted"
                );
                return Err(FetcherError::RetriesExhausted {
                    attempts: attempt,
                    last: Box::new(err),
                });
            }

            let delay = self.delay_for(attempt - 1);
            warn!(
                operation,
                attempt,
                max_attempts = self.max_attempts,
                outcome = outcome.as_str(),
                backoff_ms = delay.as_millis() as u64,
                error = %err,
                "Retrying after backoff delay"
            );
            crate::metrics::record_retry(operation, outcome, delay);

            match shutdown {
                Some(shutdown) => {
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {},
                        _ = shutdown.wait_for_shutdown() => return Err(FetcherError::Cancelled),
                    }
                }
                None => tokio::time::sleep(delay).await,
            }
        }
    }
}

/// Bound `call` by `deadline`, mapping expiry to a transient timeout
pub async fn with_deadline<T, Fut>(deadline: Duration, call: Fut) -> FetcherResult<T>
where
    Fut: Future<Output = FetcherResult<T>>,
{
    match tokio::time::timeout(deadline, call).await {
        Ok(result) => result,
        Err(_) => Err(FetcherError::Timeout(deadline)),
    }
}
