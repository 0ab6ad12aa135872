//! Archive job configuration and task status tracking

use super::config::{
    DEFAULT_CALL_TIMEOUT, DEFAULT_CONCURRENCY, DEFAULT_HEARTBEAT_INTERVAL,
    DEFAULT_LOCK_POLL_INTERVAL, DEFAULT_MEDIA_CONCURRENCY, DEFAULT_PAGE_SIZE,
    DEFAULT_RATE_CAPACITY, DEFAULT_REFILL_PER_SEC, DEFAULT_STALE_LOCK_AFTER, MAX_CONCURRENCY,
    MAX_PAGE_SIZE,
};
use super::retry::RetryPolicy;
use crate::consistency::LockOptions;
use crate::{ContentKind, ContentSelector, TargetDescriptor, TimeWindow};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

pub use crate::consistency::LockMode;
pub use crate::resume::ResumeMode;

/// Token bucket settings
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimitConfig {
    /// Burst size
    pub capacity: u32,
    /// Tokens added per second
    pub refill_per_sec: f64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_RATE_CAPACITY,
            refill_per_sec: DEFAULT_REFILL_PER_SEC,
        }
    }
}

/// Immutable configuration of one archive run
#[derive(Debug, Clone)]
pub struct ArchiveJob {
    /// Entity to archive
    pub target: TargetDescriptor,
    /// Content kinds to archive
    pub selector: ContentSelector,
    /// Directory holding one subdirectory per target
    pub storage_root: PathBuf,
    /// Optional date window on items
    pub window: Option<TimeWindow>,
    /// Optional cap on items delivered per content kind in this run
    pub max_items: Option<u64>,
    /// Concurrent downloader tasks
    pub concurrency: usize,
    /// Concurrent payload downloads within one page
    pub media_concurrency: usize,
    /// Treatment of persisted cursors
    pub resume: ResumeMode,
    /// Report the plan without mutating anything
    pub dry_run: bool,
    /// Remote call rate
    pub rate_limit: RateLimitConfig,
    /// Retry and backoff
    pub retry: RetryPolicy,
    /// Behavior when the target is already locked
    pub lock_mode: LockMode,
    /// Heartbeat age after which a lock may be reclaimed
    pub stale_lock_after: Duration,
    /// Interval of the lock heartbeat
    pub heartbeat_interval: Duration,
    /// Deadline for one remote call
    pub call_timeout: Duration,
    /// Items requested per page
    pub page_size: u32,
    /// Re-verify checksums of already archived payloads
    pub verify_checksums: bool,
}

impl ArchiveJob {
    /// Job with default settings
    pub fn new(
        target: TargetDescriptor,
        selector: ContentSelector,
        storage_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            target,
            selector,
            storage_root: storage_root.into(),
            window: None,
            max_items: None,
            concurrency: DEFAULT_CONCURRENCY,
            media_concurrency: DEFAULT_MEDIA_CONCURRENCY,
            resume: ResumeMode::On,
            dry_run: false,
            rate_limit: RateLimitConfig::default(),
            retry: RetryPolicy::default(),
            lock_mode: LockMode::FailFast,
            stale_lock_after: DEFAULT_STALE_LOCK_AFTER,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            call_timeout: DEFAULT_CALL_TIMEOUT,
            page_size: DEFAULT_PAGE_SIZE,
            verify_checksums: false,
        }
    }

    /// Set the date window
    pub fn with_window(mut self, window: Option<TimeWindow>) -> Self {
        self.window = window;
        self
    }

    /// Set the per-kind item cap
    pub fn with_max_items(mut self, max_items: Option<u64>) -> Self {
        self.max_items = max_items;
        self
    }

    /// Set the task worker ceiling
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    /// Set the payload download ceiling
    pub fn with_media_concurrency(mut self, media_concurrency: usize) -> Self {
        self.media_concurrency = media_concurrency;
        self
    }

    /// Set the resume mode
    pub fn with_resume(mut self, resume: ResumeMode) -> Self {
        self.resume = resume;
        self
    }

    /// Enable plan-only mode
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Set the remote call rate
    pub fn with_rate_limit(mut self, rate_limit: RateLimitConfig) -> Self {
        self.rate_limit = rate_limit;
        self
    }

    /// Set the retry policy
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Set lock conflict behavior
    pub fn with_lock_mode(mut self, lock_mode: LockMode) -> Self {
        self.lock_mode = lock_mode;
        self
    }

    /// Set lock staleness and heartbeat timing
    pub fn with_lock_timing(mut self, stale_after: Duration, heartbeat_interval: Duration) -> Self {
        self.stale_lock_after = stale_after;
        self.heartbeat_interval = heartbeat_interval;
        self
    }

    /// Set the per-call deadline
    pub fn with_call_timeout(mut self, call_timeout: Duration) -> Self {
        self.call_timeout = call_timeout;
        self
    }

    /// Set the page size
    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size;
        self
    }

    /// Enable checksum re-verification
    pub fn with_verify_checksums(mut self, verify: bool) -> Self {
        self.verify_checksums = verify;
        self
    }

    /// Blocking lock mode with the default poll interval
    pub fn blocking_lock(timeout: Option<Duration>) -> LockMode {
        LockMode::Block {
            poll_interval: DEFAULT_LOCK_POLL_INTERVAL,
            timeout,
        }
    }

    /// Lock settings derived from this job
    pub fn lock_options(&self) -> LockOptions {
        LockOptions {
            mode: self.lock_mode,
            stale_after: self.stale_lock_after,
            heartbeat_interval: self.heartbeat_interval,
        }
    }

    /// Validate job parameters
    pub fn validate(&self) -> Result<(), String> {
        self.target.validate()?;
        self.selector.validate_for(self.target.kind)?;
        if let Some(window) = &self.window {
            window.validate()?;
        }
        if self.max_items == Some(0) {
            return Err("item cap must be at least 1".to_string());
        }
        if self.concurrency == 0 || self.concurrency > MAX_CONCURRENCY {
            return Err(format!(
                "concurrency must be between 1 and {MAX_CONCURRENCY}, got {}",
                self.concurrency
            ));
        }
        if self.media_concurrency == 0 || self.media_concurrency > MAX_CONCURRENCY {
            return Err(format!(
                "media concurrency must be between 1 and {MAX_CONCURRENCY}, got {}",
                self.media_concurrency
            ));
        }
        if self.rate_limit.capacity == 0 {
            return Err("rate limit capacity must be at least 1".to_string());
        }
        if !(self.rate_limit.refill_per_sec.is_finite() && self.rate_limit.refill_per_sec > 0.0) {
            return Err(format!(
                "rate limit refill must be positive, got {}",
                self.rate_limit.refill_per_sec
            ));
        }
        self.retry.validate()?;
        if self.page_size == 0 || self.page_size > MAX_PAGE_SIZE {
            return Err(format!(
                "page size must be between 1 and {MAX_PAGE_SIZE}, got {}",
                self.page_size
            ));
        }
        if self.call_timeout.is_zero() {
            return Err("call timeout must be positive".to_string());
        }
        if self.heartbeat_interval.is_zero() || self.heartbeat_interval >= self.stale_lock_after {
            return Err(format!(
                "heartbeat interval ({:?}) must be positive and below the staleness threshold ({:?})",
                self.heartbeat_interval, self.stale_lock_after
            ));
        }
        Ok(())
    }

    /// Kinds this job schedules
    pub fn kinds(&self) -> Vec<ContentKind> {
        self.selector.kinds_for(self.target.kind)
    }
}

/// Downloader task lifecycle
///
/// ```text
/// Idle -> Fetching -> ItemReady -> Persisting -> Fetching | Idle -> ... -> Done
/// ```
///
/// A task walking several streams (photo albums) returns to `Idle` between them.
///
/// `Failed` is reached only when the stream itself becomes inaccessible.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Not started, or between pages
    #[default]
    Idle,
    /// Waiting for a page
    Fetching,
    /// A page's items are ready
    ItemReady,
    /// Items are being written
    Persisting,
    /// Stream exhausted or cap reached
    Done,
    /// Stream became permanently inaccessible
    Failed,
    /// Run cancellation stopped the task
    Cancelled,
}

impl TaskStatus {
    /// Whether the task has finished
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Done | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// Whether moving to `next` is a legal transition
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        match (self, next) {
            (Done | Failed | Cancelled, _) => false,
            (_, Failed | Cancelled) => true,
            (Idle, Fetching | Done) => true,
            (Fetching, ItemReady | Idle | Done) => true,
            (ItemReady, Persisting) => true,
            (Persisting, Fetching | Idle | Done) => true,
            _ => false,
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TaskStatus::Idle => "idle",
            TaskStatus::Fetching => "fetching",
            TaskStatus::ItemReady => "item_ready",
            TaskStatus::Persisting => "persisting",
            TaskStatus::Done => "done",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}
