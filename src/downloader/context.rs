//! Shared context handed to every downloader task
//!
//! One instance per run. Holds the only rate limiter, the only consistency
//! store handle and the resume tracker, so tasks never reach for globals.

use super::job::ArchiveJob;
use super::rate_limit::RateLimiter;
use super::retry::with_deadline;
use crate::consistency::ConsistencyStore;
use crate::fetcher::pagination::Paginator;
use crate::fetcher::{Collection, Cursor, FetcherError, FetcherResult, PageRequest, RemoteApi};
use crate::output::TargetStorage;
use crate::resume::ResumeTracker;
use crate::shutdown::SharedShutdown;
use crate::Target;
use bytes::Bytes;
use std::sync::Arc;

/// Run-wide handles and configuration
#[derive(Clone)]
pub struct TaskContext {
    /// Remote API
    pub api: Arc<dyn RemoteApi>,
    /// Shared token bucket
    pub limiter: Arc<RateLimiter>,
    /// Dedup index
    pub store: Arc<ConsistencyStore>,
    /// Persisted cursors
    pub tracker: Arc<ResumeTracker>,
    /// Target storage tree
    pub storage: TargetStorage,
    /// Run configuration
    pub job: Arc<ArchiveJob>,
    /// Resolved target
    pub target: Target,
    /// Run cancellation
    pub shutdown: SharedShutdown,
}

impl TaskContext {
    /// Paginator over `collection` of the target starting at `cursor`
    ///
    /// `cap` bounds the items this paginator delivers.
    pub fn paginator(
        &self,
        collection: Collection,
        cursor: Option<Cursor>,
        cap: Option<u64>,
    ) -> Paginator {
        let request = PageRequest {
            owner: self.target.clone(),
            collection,
            cursor,
            page_size: self.job.page_size,
            window: self.job.window,
        };
        Paginator::new(
            Arc::clone(&self.api),
            Arc::clone(&self.limiter),
            self.job.retry.clone(),
            request,
        )
        .with_cap(cap)
        .with_call_timeout(self.job.call_timeout)
        .with_shutdown(Arc::clone(&self.shutdown))
    }

    /// Fetch a binary payload under the retry policy and call deadline
    ///
    /// Payload fetches do not take rate limiter tokens; the limiter meters
    /// API method calls only. Cancellation aborts an in-flight fetch.
    pub async fn fetch_binary(&self, url: &str) -> FetcherResult<Bytes> {
        let deadline = self.job.call_timeout;
        let fetch = self
            .job
            .retry
            .execute("fetch_binary", Some(self.shutdown.as_ref()), |_| {
                with_deadline(deadline, self.api.fetch_binary(url))
            });
        tokio::select! {
            result = fetch => result,
            _ = self.shutdown.wait_for_shutdown() => Err(FetcherError::Cancelled),
        }
    }

    /// Whether run cancellation was requested
    pub fn is_cancelled(&self) -> bool {
        self.shutdown.is_shutdown_requested()
    }
}
