//! Crawl orchestration and rate limiting
//!
//! This module provides the execution engine that archives one target:
//!
//! 1. **Job Creation**: Describe the run with [`job::ArchiveJob`]
//! 2. **Execution**: Run the job with [`orchestrator::Orchestrator`]
//! 3. **Rate Limiting**: One shared token bucket, [`rate_limit::RateLimiter`]
//! 4. **Retries**: Bounded exponential backoff, [`retry::RetryPolicy`]
//! 5. **Tasks**: One [`task::DownloaderTask`] per content kind
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use vk_archiver::downloader::{ArchiveJob, Orchestrator};
//! use vk_archiver::fetcher::vk_http::VkHttpClient;
//! use vk_archiver::{ContentSelector, TargetDescriptor};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let job = ArchiveJob::new(
//!     "user:1".parse::<TargetDescriptor>()?,
//!     ContentSelector::All,
//!     "./archive",
//! );
//! let orchestrator = Orchestrator::new(Arc::new(VkHttpClient::new("token")?));
//! let summary = orchestrator.run(job).await?;
//! println!("{} failed items", summary.failed_items.len());
//! # Ok(())
//! # }
//! ```
//!
//! # Error Handling
//!
//! Run-level failures surface as [`DownloadError`]. Per-item failures never
//! do: they are collected in the [`orchestrator::RunSummary`] and retried on
//! the next run because the item was never recorded as archived.

pub mod config;
pub mod context;
pub mod job;
pub mod media;
pub mod orchestrator;
pub mod progress;
pub mod rate_limit;
pub mod retry;
pub mod task;

pub use context::TaskContext;
pub use job::{ArchiveJob, LockMode, RateLimitConfig, ResumeMode, TaskStatus};
pub use orchestrator::{Orchestrator, PlanEntry, PlanReport, RunSummary};
pub use rate_limit::{RateLimitError, RateLimiter};
pub use retry::{CallOutcome, RetryPolicy};
pub use task::{DownloaderTask, FailedItem, TaskOutcome};

use crate::consistency::ConsistencyError;
use crate::fetcher::FetcherError;
use crate::output::OutputError;
use crate::resume::ResumeError;

/// Run-level errors
#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    /// Invalid job parameters
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Another live run holds the target
    #[error("target {target} is being archived by {owner} (heartbeat {heartbeat_age_secs}s ago)")]
    ConsistencyConflict {
        /// Target storage key
        target: String,
        /// Holder's owner id
        owner: String,
        /// Age of the holder's heartbeat
        heartbeat_age_secs: u64,
    },

    /// Persisted resume state cannot be used
    #[error("corrupt resume state: {0}")]
    CorruptState(String),

    /// Remote failure outside any task
    #[error("fetcher error: {0}")]
    Fetcher(#[from] FetcherError),

    /// Dedup index or lock failure
    #[error("consistency error: {0}")]
    Consistency(ConsistencyError),

    /// Resume state I/O failure
    #[error("resume error: {0}")]
    Resume(ResumeError),

    /// Storage tree failure
    #[error("output error: {0}")]
    Output(#[from] OutputError),

    /// Invalid limiter settings
    #[error("rate limit error: {0}")]
    RateLimit(#[from] RateLimitError),

    /// The run was cancelled
    #[error("run cancelled")]
    Cancelled,
}

impl DownloadError {
    /// Whether the error stems from cancellation
    pub fn is_cancelled(&self) -> bool {
        matches!(
            self,
            DownloadError::Cancelled | DownloadError::Fetcher(FetcherError::Cancelled)
        )
    }
}

impl From<ConsistencyError> for DownloadError {
    fn from(err: ConsistencyError) -> Self {
        match err {
            ConsistencyError::Conflict {
                target,
                owner,
                heartbeat_age_secs,
            } => DownloadError::ConsistencyConflict {
                target,
                owner,
                heartbeat_age_secs,
            },
            ConsistencyError::Cancelled => DownloadError::Cancelled,
            other => DownloadError::Consistency(other),
        }
    }
}

impl From<ResumeError> for DownloadError {
    fn from(err: ResumeError) -> Self {
        if err.is_corrupt() {
            DownloadError::CorruptState(format!(
                "{err}; rerun with resume mode 'reset' to start over"
            ))
        } else {
            DownloadError::Resume(err)
        }
    }
}
