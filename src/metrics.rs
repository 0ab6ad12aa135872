//! Observability metrics for archive runs
//!
//! Covers remote call volume and latency, retry behavior, rate limiter
//! pressure, item throughput per content kind, and lock contention.
//!
//! ## Architecture
//!
//! - Uses `metrics` crate for low-overhead metric collection
//! - Prometheus exporter for scraping endpoint, started only when requested
//! - Without an installed recorder every call is a no-op

use crate::downloader::retry::CallOutcome;
use crate::fetcher::FetcherResult;
use crate::ContentKind;
use metrics::{counter, describe_counter, describe_histogram, histogram, Unit};
use metrics_exporter_prometheus::PrometheusBuilder;
use once_cell::sync::Lazy;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Global metrics registry initialization flag
static METRICS_INITIALIZED: Lazy<Arc<RwLock<bool>>> = Lazy::new(|| Arc::new(RwLock::new(false)));

/// Initialize metrics system with Prometheus exporter
///
/// Idempotent: later calls return without reinstalling.
pub async fn init_metrics(addr: SocketAddr) -> Result<(), Box<dyn std::error::Error>> {
    let mut initialized = METRICS_INITIALIZED.write().await;
    if *initialized {
        debug!("Metrics already initialized, skipping");
        return Ok(());
    }

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| format!("Failed to install Prometheus exporter: {e}"))?;

    describe_counter!(
        "remote_calls_total",
        Unit::Count,
        "Remote list calls by collection and outcome"
    );
    describe_histogram!(
        "remote_call_duration_seconds",
        Unit::Seconds,
        "Remote list call duration in seconds"
    );
    describe_counter!(
        "remote_rate_exceeded_total",
        Unit::Count,
        "Rate exceeded signals returned by the remote"
    );
    describe_counter!(
        "retries_total",
        Unit::Count,
        "Retry attempts by operation and outcome"
    );
    describe_histogram!(
        "retry_backoff_duration_seconds",
        Unit::Seconds,
        "Duration of retry backoff in seconds"
    );
    describe_histogram!(
        "rate_limit_queue_wait_seconds",
        Unit::Seconds,
        "Time spent waiting for a rate limiter token"
    );
    describe_counter!(
        "items_written_total",
        Unit::Count,
        "Items durably written by content kind"
    );
    describe_counter!(
        "items_skipped_total",
        Unit::Count,
        "Items skipped as already archived"
    );
    describe_counter!(
        "items_failed_total",
        Unit::Count,
        "Items that failed and will be retried on the next run"
    );
    describe_counter!(
        "bytes_written_total",
        Unit::Bytes,
        "Payload and record bytes written"
    );
    describe_counter!(
        "lock_conflicts_total",
        Unit::Count,
        "Target lock acquisitions refused because of a live holder"
    );
    describe_counter!(
        "stale_locks_reclaimed_total",
        Unit::Count,
        "Stale target locks forcibly reclaimed"
    );

    *initialized = true;
    info!(%addr, "Metrics system initialized");
    Ok(())
}

/// Check if metrics system is initialized
pub async fn is_initialized() -> bool {
    *METRICS_INITIALIZED.read().await
}

/// Record one remote list call
pub fn record_remote_call<T>(collection: &str, duration: Duration, result: &FetcherResult<T>) {
    let outcome = CallOutcome::classify(result);
    counter!(
        "remote_calls_total",
        "collection" => collection.to_string(),
        "outcome" => outcome.as_str(),
    )
    .increment(1);
    histogram!(
        "remote_call_duration_seconds",
        "collection" => collection.to_string(),
    )
    .record(duration.as_secs_f64());

    if outcome == CallOutcome::RateExceeded {
        counter!(
            "remote_rate_exceeded_total",
            "collection" => collection.to_string(),
        )
        .increment(1);
    }
}

/// Record a retry and its backoff delay
pub fn record_retry(operation: &str, outcome: CallOutcome, delay: Duration) {
    counter!(
        "retries_total",
        "operation" => operation.to_string(),
        "outcome" => outcome.as_str(),
    )
    .increment(1);
    histogram!("retry_backoff_duration_seconds").record(delay.as_secs_f64());
}

/// Record time spent waiting for a rate limiter token
pub fn record_rate_limiter_wait(wait: Duration) {
    histogram!("rate_limit_queue_wait_seconds").record(wait.as_secs_f64());
}

/// Record a refused lock acquisition
pub fn record_lock_conflict() {
    counter!("lock_conflicts_total").increment(1);
}

/// Record a forced stale lock reclamation
pub fn record_stale_lock_reclaimed() {
    counter!("stale_locks_reclaimed_total").increment(1);
}

/// Per-task item metrics
#[derive(Debug, Clone)]
pub struct TaskMetrics {
    kind: ContentKind,
    start_time: Instant,
}

impl TaskMetrics {
    /// Start tracking a task
    pub fn start(kind: ContentKind) -> Self {
        Self {
            kind,
            start_time: Instant::now(),
        }
    }

    /// Record a written item and its bytes
    pub fn record_written(&self, bytes: u64) {
        counter!("items_written_total", "kind" => self.kind.as_str()).increment(1);
        counter!("bytes_written_total", "kind" => self.kind.as_str()).increment(bytes);
    }

    /// Record an item skipped as already archived
    pub fn record_skipped(&self) {
        counter!("items_skipped_total", "kind" => self.kind.as_str()).increment(1);
    }

    /// Record a failed item
    pub fn record_failed(&self) {
        counter!("items_failed_total", "kind" => self.kind.as_str()).increment(1);
    }

    /// Time since the task started
    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }
}
