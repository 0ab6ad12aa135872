//! Archive command implementation

use crate::downloader::config::{
    DEFAULT_CALL_TIMEOUT, DEFAULT_CONCURRENCY, DEFAULT_HEARTBEAT_INTERVAL,
    DEFAULT_MEDIA_CONCURRENCY, DEFAULT_PAGE_SIZE, DEFAULT_RATE_CAPACITY, DEFAULT_REFILL_PER_SEC,
    DEFAULT_STALE_LOCK_AFTER, MAX_ATTEMPTS, MAX_CONCURRENCY,
};
use crate::downloader::{
    ArchiveJob, DownloadError, LockMode, Orchestrator, RateLimitConfig, ResumeMode, RetryPolicy,
    RunSummary,
};
use crate::fetcher::vk_http::{VkHttpClient, DEFAULT_BASE_URL};
use crate::shutdown::SharedShutdown;
use crate::{ContentSelector, TargetDescriptor, TimeWindow};
use chrono::{DateTime, NaiveDate};
use clap::{Args, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use super::CliError;

/// Exit code when some items or kinds failed
pub const EXIT_PARTIAL: i32 = 2;

/// Exit code after cancellation
pub const EXIT_CANCELLED: i32 = 130;

/// Exit code when another run holds the target
pub const EXIT_LOCKED: i32 = 3;

/// Exit code when a target of a batch could not be archived
pub const EXIT_FAILED: i32 = 1;

/// Try to parse datetime from RFC3339 format
///
/// Inputs without a timezone designator are taken as UTC. Returns Unix seconds.
fn try_parse_datetime_rfc3339(input: &str) -> Option<i64> {
    let input = input.trim();

    if let Ok(dt) = DateTime::parse_from_rfc3339(input) {
        return Some(dt.timestamp());
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(&format!("{input}Z")) {
        return Some(dt.timestamp());
    }

    None
}

/// Parse a window start from YYYY-MM-DD (start of day, UTC) or RFC3339
fn parse_since(input: &str) -> Result<i64, String> {
    if let Some(ts) = try_parse_datetime_rfc3339(input) {
        return Ok(ts);
    }
    let date = NaiveDate::parse_from_str(input.trim(), "%Y-%m-%d")
        .map_err(|e| format!("Invalid start date '{input}': {e}"))?;
    date.and_hms_opt(0, 0, 0)
        .map(|dt| dt.and_utc().timestamp())
        .ok_or_else(|| format!("Invalid start date '{input}'"))
}

/// Parse a window end from YYYY-MM-DD (end of day, UTC) or RFC3339
///
/// A date-only end includes the whole day.
fn parse_until(input: &str) -> Result<i64, String> {
    if let Some(ts) = try_parse_datetime_rfc3339(input) {
        return Ok(ts);
    }
    let date = NaiveDate::parse_from_str(input.trim(), "%Y-%m-%d")
        .map_err(|e| format!("Invalid end date '{input}': {e}"))?;
    date.and_hms_opt(23, 59, 59)
        .map(|dt| dt.and_utc().timestamp())
        .ok_or_else(|| format!("Invalid end date '{input}'"))
}

/// Parse and validate a worker ceiling
fn parse_concurrency(s: &str) -> Result<usize, String> {
    let value: usize = s
        .parse()
        .map_err(|_| format!("'{s}' is not a valid number"))?;

    if value == 0 {
        return Err("concurrency must be at least 1".to_string());
    }
    if value > MAX_CONCURRENCY {
        return Err(format!(
            "concurrency {value} exceeds maximum of {MAX_CONCURRENCY}"
        ));
    }
    Ok(value)
}

/// Summary output format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// JSON output
    Json,
    /// Human-readable output
    Human,
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "json" => Ok(OutputFormat::Json),
            "human" => Ok(OutputFormat::Human),
            _ => Err(format!("Invalid output format: {s}")),
        }
    }
}

/// VK archiver CLI
#[derive(Parser, Debug)]
#[command(name = "vk-archiver")]
#[command(about = "Archive users, groups and conversations from VK to local storage", long_about = None)]
#[command(version)]
pub struct Cli {
    /// Command to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Output format (json or human)
    #[arg(long, global = true, default_value = "human")]
    pub output_format: OutputFormat,

    /// Storage root holding one directory per target
    #[arg(long, global = true, default_value = "archive", env = "VK_ARCHIVE_DIR")]
    pub storage_dir: PathBuf,

    /// Serve Prometheus metrics on this address (e.g. 127.0.0.1:9000)
    #[arg(long, global = true)]
    pub metrics_addr: Option<SocketAddr>,
}

/// CLI commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Archive one or more users, groups or conversations
    Archive(ArchiveArgs),

    /// Show resume state and recorded items of archived targets
    Status(super::StatusArgs),
}

/// Arguments of the archive command
#[derive(Args, Debug)]
pub struct ArchiveArgs {
    /// Targets as <kind>:<handle>, e.g. group:apiclub, user:1, conversation:12;
    /// several targets are archived one after another
    #[arg(required = true, num_args = 1..)]
    pub targets: Vec<TargetDescriptor>,

    /// Content kinds: all, or a comma list of metadata, wall, photos, videos, documents, stories
    #[arg(long, default_value = "all")]
    pub content: ContentSelector,

    /// API access token
    #[arg(long, env = "VK_TOKEN", hide_env_values = true)]
    pub token: String,

    /// API endpoint
    #[arg(long, default_value = DEFAULT_BASE_URL)]
    pub api_base_url: String,

    /// Only items dated on or after this date (YYYY-MM-DD or RFC3339)
    #[arg(long, value_parser = parse_since)]
    pub since: Option<i64>,

    /// Only items dated on or before this date (YYYY-MM-DD or RFC3339)
    #[arg(long, value_parser = parse_until)]
    pub until: Option<i64>,

    /// Stop each content kind after this many items
    #[arg(long)]
    pub max_items: Option<u64>,

    /// Content kinds archived concurrently
    #[arg(long, default_value_t = DEFAULT_CONCURRENCY, value_parser = parse_concurrency)]
    pub concurrency: usize,

    /// Media files downloaded concurrently within one page
    #[arg(long, default_value_t = DEFAULT_MEDIA_CONCURRENCY, value_parser = parse_concurrency)]
    pub media_concurrency: usize,

    /// Resume mode: on, off or reset
    #[arg(long, default_value = "on")]
    pub resume: ResumeMode,

    /// Report the plan without locking or writing anything
    #[arg(long, default_value_t = false)]
    pub dry_run: bool,

    /// Burst size of the API rate limiter
    #[arg(long, default_value_t = DEFAULT_RATE_CAPACITY)]
    pub rate_capacity: u32,

    /// API calls per second
    #[arg(long, default_value_t = DEFAULT_REFILL_PER_SEC)]
    pub rate_per_sec: f64,

    /// Attempts per remote call before giving up (range: 1-20)
    #[arg(long, default_value_t = MAX_ATTEMPTS, value_parser = clap::value_parser!(u32).range(1..=20))]
    pub max_attempts: u32,

    /// Wait for a running archive of the same target instead of failing
    #[arg(long, default_value_t = false)]
    pub wait_for_lock: bool,

    /// Give up waiting for the lock after this many seconds
    #[arg(long, requires = "wait_for_lock")]
    pub lock_timeout_secs: Option<u64>,

    /// Seconds without heartbeat after which a lock is considered abandoned
    #[arg(long, default_value_t = DEFAULT_STALE_LOCK_AFTER.as_secs())]
    pub stale_lock_secs: u64,

    /// Seconds between lock heartbeats
    #[arg(long, default_value_t = DEFAULT_HEARTBEAT_INTERVAL.as_secs())]
    pub heartbeat_secs: u64,

    /// Deadline of one remote call, in seconds
    #[arg(long, default_value_t = DEFAULT_CALL_TIMEOUT.as_secs())]
    pub call_timeout_secs: u64,

    /// Items requested per page
    #[arg(long, default_value_t = DEFAULT_PAGE_SIZE)]
    pub page_size: u32,

    /// Re-verify checksums of files archived by earlier runs
    #[arg(long, default_value_t = false)]
    pub verify_checksums: bool,
}

impl ArchiveArgs {
    /// Build one job per target, in command line order
    pub fn to_jobs(&self, storage_dir: PathBuf) -> Result<Vec<ArchiveJob>, CliError> {
        self.targets
            .iter()
            .map(|target| self.to_job(target.clone(), storage_dir.clone()))
            .collect()
    }

    /// Build the immutable job configuration for `target`
    pub fn to_job(
        &self,
        target: TargetDescriptor,
        storage_dir: PathBuf,
    ) -> Result<ArchiveJob, CliError> {
        let window = match (self.since, self.until) {
            (None, None) => None,
            (since, until) => Some(TimeWindow::new(since, until)),
        };
        let lock_mode = if self.wait_for_lock {
            ArchiveJob::blocking_lock(self.lock_timeout_secs.map(Duration::from_secs))
        } else {
            LockMode::FailFast
        };

        let job = ArchiveJob::new(target, self.content.clone(), storage_dir)
            .with_window(window)
            .with_max_items(self.max_items)
            .with_concurrency(self.concurrency)
            .with_media_concurrency(self.media_concurrency)
            .with_resume(self.resume)
            .with_dry_run(self.dry_run)
            .with_rate_limit(RateLimitConfig {
                capacity: self.rate_capacity,
                refill_per_sec: self.rate_per_sec,
            })
            .with_retry(RetryPolicy::default().with_max_attempts(self.max_attempts))
            .with_lock_mode(lock_mode)
            .with_lock_timing(
                Duration::from_secs(self.stale_lock_secs),
                Duration::from_secs(self.heartbeat_secs),
            )
            .with_call_timeout(Duration::from_secs(self.call_timeout_secs))
            .with_page_size(self.page_size)
            .with_verify_checksums(self.verify_checksums);

        job.validate().map_err(CliError::Configuration)?;
        Ok(job)
    }

    /// Run the archive command, returning the process exit code
    ///
    /// Targets run one after another. A target that is locked or fails does
    /// not stop the remaining ones; cancellation does.
    pub async fn execute(&self, cli: &Cli, shutdown: SharedShutdown) -> Result<i32, CliError> {
        let jobs = self.to_jobs(cli.storage_dir.clone())?;
        let call_timeout = Duration::from_secs(self.call_timeout_secs);
        let client = VkHttpClient::with_timeout(self.token.clone(), call_timeout)?
            .with_base_url(self.api_base_url.clone());
        let orchestrator = Orchestrator::new(Arc::new(client)).with_shutdown(shutdown.clone());

        let batch = jobs.len();
        let mut codes = Vec::with_capacity(batch);
        for (position, job) in jobs.into_iter().enumerate() {
            if shutdown.is_shutdown_requested() {
                warn!(remaining = batch - position, "Cancelled before all targets were archived");
                codes.push(EXIT_CANCELLED);
                break;
            }
            match self.archive_one(cli, &orchestrator, job).await {
                Ok(code) => codes.push(code),
                Err(e) if batch == 1 => return Err(e),
                // Already logged with its target
                Err(_) => codes.push(EXIT_FAILED),
            }
        }
        Ok(combine_exit_codes(&codes))
    }

    async fn archive_one(
        &self,
        cli: &Cli,
        orchestrator: &Orchestrator,
        job: ArchiveJob,
    ) -> Result<i32, CliError> {
        info!(
            target_descriptor = %job.target,
            content = %job.selector,
            storage = %job.storage_root.display(),
            dry_run = job.dry_run,
            "Starting archive"
        );

        let spinner = (cli.output_format == OutputFormat::Human).then(|| create_spinner(&job));
        let target = job.target.clone();
        let result = orchestrator.run(job).await;
        if let Some(spinner) = spinner {
            spinner.finish_and_clear();
        }

        match result {
            Ok(summary) => {
                match cli.output_format {
                    OutputFormat::Json => println!("{}", serde_json::to_string(&summary)?),
                    OutputFormat::Human => print_summary(&summary),
                }
                Ok(exit_code(&summary))
            }
            Err(e @ DownloadError::ConsistencyConflict { .. }) => {
                eprintln!("{e}");
                eprintln!("Use --wait-for-lock to wait for the running archive to finish.");
                Ok(EXIT_LOCKED)
            }
            Err(e) if e.is_cancelled() => {
                warn!(error = %e, "Archive cancelled");
                Ok(EXIT_CANCELLED)
            }
            Err(e) => {
                error!(target_descriptor = %target, error = %e, "Archive failed");
                Err(e.into())
            }
        }
    }
}

/// Exit code of a batch: the most severe code of its targets
pub fn combine_exit_codes(codes: &[i32]) -> i32 {
    let severity = |code: i32| match code {
        0 => 0,
        EXIT_PARTIAL => 1,
        EXIT_LOCKED => 2,
        EXIT_CANCELLED => 4,
        _ => 3,
    };
    codes.iter().copied().max_by_key(|code| severity(*code)).unwrap_or(0)
}

/// Exit code of a finished run
pub fn exit_code(summary: &RunSummary) -> i32 {
    if summary.cancelled {
        EXIT_CANCELLED
    } else if summary.is_clean() {
        0
    } else {
        EXIT_PARTIAL
    }
}

fn print_summary(summary: &RunSummary) {
    if let Some(plan) = &summary.plan {
        println!("\nPlan for {}", summary.target);
        for entry in &plan.entries {
            let total = entry
                .remote_total
                .map_or_else(|| "?".to_string(), |t| t.to_string());
            let projected = entry
                .projected_new
                .map_or_else(|| "?".to_string(), |p| p.to_string());
            let resume = entry
                .resume_cursor
                .as_ref()
                .map_or_else(|| "start".to_string(), ToString::to_string);
            println!(
                "  {:<10} remote {:>8}  recorded {:>8}  new {:>8}  from {}",
                entry.kind.as_str(),
                total,
                entry.recorded,
                projected,
                resume
            );
            if let Some(err) = &entry.error {
                println!("  {:<10} not accessible: {}", "", err);
            }
        }
        println!("Projected downloads: {}", plan.projected_total());
        return;
    }

    println!("\nArchive of {} finished", summary.target);
    for task in &summary.tasks {
        println!(
            "  {:<10} {:<10} written {:>6}  skipped {:>6}  failed {:>4}",
            task.kind.as_str(),
            task.status.to_string(),
            task.items_written,
            task.items_skipped,
            task.failed_items.len()
        );
        if let Some(err) = &task.error {
            println!("  {:<10} {}", "", err);
        }
    }
    println!(
        "Items written: {}  skipped: {}  bytes: {}  elapsed: {:.1}s",
        summary.items_written,
        summary.items_skipped,
        summary.bytes_written,
        summary.elapsed.as_secs_f64()
    );
    if !summary.failed_items.is_empty() {
        println!("Failed items ({}), retried on the next run:", summary.failed_items.len());
        for failed in summary.failed_items.iter().take(20) {
            println!("  {} {}: {}", failed.kind, failed.item_id, failed.reason);
        }
    }
    if summary.cancelled {
        println!("Run was cancelled; rerun to continue where it stopped.");
    }
}

/// Spinner shown while the run is in progress
fn create_spinner(job: &ArchiveJob) -> ProgressBar {
    let spinner = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::default_spinner().template("{spinner:.green} [{elapsed_precise}] {msg}") {
        spinner.set_style(style);
    }
    spinner.set_message(format!("Archiving {} ({})", job.target, job.selector));
    spinner.enable_steady_tick(Duration::from_millis(120));
    spinner
}
