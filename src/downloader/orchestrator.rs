//! Run orchestration for one target
//!
//! The [`Orchestrator`] resolves the target, takes its lock, loads resume
//! state and runs one [`DownloaderTask`] per selected content kind with a
//! bounded worker ceiling. The lock is released on every exit path once it
//! was acquired, including task failures and cancellation.
//!
//! In plan-only mode nothing is locked or written: the orchestrator issues
//! one read-only page request per kind and reports projected counts.

use super::context::TaskContext;
use super::job::{ArchiveJob, ResumeMode, TaskStatus};
use super::rate_limit::RateLimiter;
use super::retry::with_deadline;
use super::task::{DownloaderTask, FailedItem, TaskOutcome};
use super::DownloadError;
use crate::consistency::{scan_counts, ConsistencyStore, LockOwner, TargetLock};
use crate::fetcher::pagination::Paginator;
use crate::fetcher::{Collection, Cursor, PageRequest, RemoteApi};
use crate::output::TargetStorage;
use crate::resume::{ResumeState, ResumeTracker};
use crate::shutdown::{SharedShutdown, ShutdownCoordinator};
use crate::{ContentKind, Target};
use futures_util::{stream, StreamExt};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn, Instrument};

/// Projected work for one content kind
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlanEntry {
    /// Content kind
    pub kind: ContentKind,
    /// Remote collection the task would list
    pub collection: String,
    /// Items the remote reports for the collection
    pub remote_total: Option<u64>,
    /// Items already recorded in the dedup index
    pub recorded: u64,
    /// Cursor the task would start from
    pub resume_cursor: Option<Cursor>,
    /// Items a run would download, honoring the cap
    pub projected_new: Option<u64>,
    /// Why the collection could not be inspected
    pub error: Option<String>,
}

/// Result of plan-only mode
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlanReport {
    /// One entry per selected kind, in scheduling order
    pub entries: Vec<PlanEntry>,
}

impl PlanReport {
    /// Sum of projected downloads over kinds with a known total
    pub fn projected_total(&self) -> u64 {
        self.entries.iter().filter_map(|e| e.projected_new).sum()
    }
}

/// Aggregated outcome of one run
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    /// Archived target
    pub target: Target,
    /// Present in plan-only mode
    pub plan: Option<PlanReport>,
    /// Per-kind outcomes, in scheduling order
    pub tasks: Vec<TaskOutcome>,
    /// Items durably written
    pub items_written: u64,
    /// Items skipped as already archived
    pub items_skipped: u64,
    /// Bytes written
    pub bytes_written: u64,
    /// Items that failed across all tasks
    pub failed_items: Vec<FailedItem>,
    /// Wall-clock duration of the run
    pub elapsed: Duration,
    /// Whether cancellation cut the run short
    pub cancelled: bool,
}

impl RunSummary {
    fn from_tasks(target: Target, tasks: Vec<TaskOutcome>, elapsed: Duration, cancelled: bool) -> Self {
        let failed_items = tasks
            .iter()
            .flat_map(|t| t.failed_items.iter().cloned())
            .collect();
        Self {
            items_written: tasks.iter().map(|t| t.items_written).sum(),
            items_skipped: tasks.iter().map(|t| t.items_skipped).sum(),
            bytes_written: tasks.iter().map(|t| t.bytes_written).sum(),
            cancelled: cancelled || tasks.iter().any(|t| t.status == TaskStatus::Cancelled),
            target,
            plan: None,
            tasks,
            failed_items,
            elapsed,
        }
    }

    fn plan_only(target: Target, plan: PlanReport, elapsed: Duration) -> Self {
        Self {
            target,
            plan: Some(plan),
            tasks: Vec::new(),
            items_written: 0,
            items_skipped: 0,
            bytes_written: 0,
            failed_items: Vec::new(),
            elapsed,
            cancelled: false,
        }
    }

    /// Outcome of the task for `kind`
    pub fn task(&self, kind: ContentKind) -> Option<&TaskOutcome> {
        self.tasks.iter().find(|t| t.kind == kind)
    }

    /// Tasks that ended on a stream-level failure
    pub fn failed_tasks(&self) -> impl Iterator<Item = &TaskOutcome> {
        self.tasks.iter().filter(|t| t.status == TaskStatus::Failed)
    }

    /// Every task finished and no item failed
    pub fn is_clean(&self) -> bool {
        !self.cancelled && self.failed_items.is_empty() && self.tasks.iter().all(TaskOutcome::is_success)
    }
}

/// Top-level coordinator of one archive run
pub struct Orchestrator {
    api: Arc<dyn RemoteApi>,
    shutdown: SharedShutdown,
}

impl Orchestrator {
    /// Orchestrator over `api` with its own cancellation signal
    pub fn new(api: Arc<dyn RemoteApi>) -> Self {
        Self {
            api,
            shutdown: ShutdownCoordinator::shared(),
        }
    }

    /// Use an externally owned cancellation signal
    pub fn with_shutdown(mut self, shutdown: SharedShutdown) -> Self {
        self.shutdown = shutdown;
        self
    }

    /// Cancellation signal of this orchestrator
    pub fn shutdown(&self) -> SharedShutdown {
        Arc::clone(&self.shutdown)
    }

    /// Execute `job`
    pub async fn run(&self, job: ArchiveJob) -> Result<RunSummary, DownloadError> {
        let span = tracing::info_span!(
            "archive_run",
            descriptor = %job.target,
            content = %job.selector,
            dry_run = job.dry_run,
        );
        self.run_job(job).instrument(span).await
    }

    async fn run_job(&self, job: ArchiveJob) -> Result<RunSummary, DownloadError> {
        let started = Instant::now();
        job.validate().map_err(DownloadError::Configuration)?;
        let limiter = Arc::new(RateLimiter::new(
            job.rate_limit.capacity,
            job.rate_limit.refill_per_sec,
        )?);

        let target = self.resolve_target(&job, &limiter).await?;
        let kinds = job.selector.kinds_for(target.kind);
        job.selector
            .validate_for(target.kind)
            .map_err(DownloadError::Configuration)?;
        info!(resolved = %target, kinds = ?kinds, "Resolved target");

        let storage = TargetStorage::new(&job.storage_root, &target);
        if job.dry_run {
            let plan = self.plan(&job, &target, &storage, &limiter, &kinds).await;
            for entry in &plan.entries {
                info!(
                    kind = %entry.kind,
                    remote_total = ?entry.remote_total,
                    recorded = entry.recorded,
                    projected_new = ?entry.projected_new,
                    "Planned"
                );
            }
            return Ok(RunSummary::plan_only(target, plan, started.elapsed()));
        }

        // Nothing but the lock record is touched until the lock is held
        let lock = TargetLock::acquire(
            storage.root(),
            &target.storage_key(),
            LockOwner::current(),
            &job.lock_options(),
            Some(self.shutdown.as_ref()),
        )
        .await?;
        info!(owner = %lock.owner().owner_id, "Acquired target lock");

        let result = match ConsistencyStore::open(storage.root(), target.storage_key()) {
            Ok(store) => {
                self.execute(job, target, storage, Arc::new(store), limiter, &kinds, started)
                    .await
            }
            Err(e) => Err(e.into()),
        };

        if let Err(e) = lock.heartbeat() {
            warn!(error = %e, "Target lock was taken over during the run");
        }
        match (result, lock.release()) {
            (Ok(summary), Ok(())) => Ok(summary),
            (Ok(_), Err(release_err)) => Err(release_err.into()),
            (Err(e), Err(release_err)) => {
                warn!(error = %release_err, "Failed to release target lock after run error");
                Err(e)
            }
            (Err(e), Ok(())) => Err(e),
        }
    }

    async fn resolve_target(
        &self,
        job: &ArchiveJob,
        limiter: &RateLimiter,
    ) -> Result<Target, DownloadError> {
        let api = self.api.as_ref();
        let descriptor = &job.target;
        let deadline = job.call_timeout;
        let target = job
            .retry
            .execute("resolve_target", Some(self.shutdown.as_ref()), |_| async move {
                limiter.acquire().await;
                with_deadline(deadline, api.resolve_target(descriptor)).await
            })
            .await?;
        Ok(target)
    }

    #[allow(clippy::too_many_arguments)]
    async fn execute(
        &self,
        job: ArchiveJob,
        target: Target,
        storage: TargetStorage,
        store: Arc<ConsistencyStore>,
        limiter: Arc<RateLimiter>,
        kinds: &[ContentKind],
        started: Instant,
    ) -> Result<RunSummary, DownloadError> {
        storage.prepare(kinds)?;
        storage.write_target_info(&target)?;
        let tracker = Arc::new(ResumeTracker::open(
            &storage.state_path(),
            &target.storage_key(),
            job.resume,
        )?);

        let mut scheduled = Vec::with_capacity(kinds.len());
        for kind in kinds {
            scheduled.push((*kind, tracker.start_cursor(*kind)?));
        }

        let concurrency = job.concurrency;
        let ctx = TaskContext {
            api: Arc::clone(&self.api),
            limiter,
            store,
            tracker: Arc::clone(&tracker),
            storage,
            job: Arc::new(job),
            target: target.clone(),
            shutdown: Arc::clone(&self.shutdown),
        };

        let ctx_ref = &ctx;
        let mut tasks: Vec<TaskOutcome> = stream::iter(scheduled)
            .map(|(kind, cursor)| async move {
                DownloaderTask::for_kind(kind).run(ctx_ref, cursor).await
            })
            .buffer_unordered(concurrency)
            .collect()
            .await;
        tasks.sort_by_key(|t| t.kind);
        tracker.flush()?;

        let summary = RunSummary::from_tasks(
            target,
            tasks,
            started.elapsed(),
            self.shutdown.is_shutdown_requested(),
        );
        info!(
            written = summary.items_written,
            skipped = summary.items_skipped,
            bytes = summary.bytes_written,
            failed_items = summary.failed_items.len(),
            failed_tasks = summary.failed_tasks().count(),
            cancelled = summary.cancelled,
            duration_secs = summary.elapsed.as_secs_f64(),
            "Archive run finished"
        );
        Ok(summary)
    }

    /// Read-only projection of the work a run would do
    async fn plan(
        &self,
        job: &ArchiveJob,
        target: &Target,
        storage: &TargetStorage,
        limiter: &Arc<RateLimiter>,
        kinds: &[ContentKind],
    ) -> PlanReport {
        let recorded = scan_counts(storage.root()).unwrap_or_else(|e| {
            warn!(error = %e, "Could not read dedup index for plan");
            Default::default()
        });
        let state = match job.resume {
            ResumeMode::On => ResumeState::peek(&storage.state_path()).unwrap_or_else(|e| {
                warn!(error = %e, "Resume state unreadable; a real run requires resume mode 'reset'");
                None
            }),
            ResumeMode::Off | ResumeMode::Reset => None,
        };

        let mut entries = Vec::with_capacity(kinds.len());
        for kind in kinds {
            let task = DownloaderTask::for_kind(*kind);
            let collection = task.collection(target);
            let paginator = Paginator::new(
                Arc::clone(&self.api),
                Arc::clone(limiter),
                job.retry.clone(),
                PageRequest {
                    owner: target.clone(),
                    collection: collection.clone(),
                    cursor: None,
                    page_size: job.page_size,
                    window: job.window,
                },
            )
            .with_call_timeout(job.call_timeout)
            .with_shutdown(Arc::clone(&self.shutdown));

            let recorded = recorded.get(kind).copied().unwrap_or(0);
            let resume_cursor = state.as_ref().and_then(|s| s.start_cursor(*kind));
            let (remote_total, error) = match paginator.fetch_page(None).await {
                Ok(page) if collection == Collection::Albums => {
                    let photos = page
                        .items
                        .iter()
                        .filter_map(|album| album.get("size").and_then(Value::as_u64))
                        .sum();
                    (Some(photos), None)
                }
                Ok(page) => {
                    let total = page
                        .total
                        .or_else(|| page.next.is_none().then_some(page.items.len() as u64));
                    (total, None)
                }
                Err(e) => {
                    warn!(kind = %kind, error = %e, "Could not inspect collection");
                    (None, Some(e.to_string()))
                }
            };
            let projected_new = remote_total.map(|total| {
                let new = total.saturating_sub(recorded);
                job.max_items.map_or(new, |cap| new.min(cap))
            });

            entries.push(PlanEntry {
                kind: *kind,
                collection: collection.to_string(),
                remote_total,
                recorded,
                resume_cursor,
                projected_new,
                error,
            });
        }
        PlanReport { entries }
    }
}
