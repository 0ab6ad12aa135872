//! Unit tests for command-line parsing and the status view

use crate::support::{self, MockRemote};
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use tempfile::TempDir;
use vk_archiver::cli::{ArchiveArgs, Cli, CliError, Commands, OutputFormat, TargetStatus};
use vk_archiver::downloader::{LockMode, Orchestrator, RateLimitConfig, ResumeMode};
use vk_archiver::fetcher::Collection;
use vk_archiver::{ContentKind, ContentSelector, TargetKind};

fn archive_args(cli: &Cli) -> &ArchiveArgs {
    match &cli.command {
        Commands::Archive(args) => args,
        other => panic!("expected archive command, got {other:?}"),
    }
}

#[test]
fn test_archive_defaults() {
    let cli = Cli::try_parse_from(["vk-archiver", "archive", "user:1", "--token", "t"]).unwrap();
    assert_eq!(cli.output_format, OutputFormat::Human);
    assert!(cli.metrics_addr.is_none());

    let args = archive_args(&cli);
    assert_eq!(args.targets.len(), 1);
    assert_eq!(args.targets[0].kind, TargetKind::User);
    assert_eq!(args.targets[0].handle, "1");
    assert_eq!(args.content, ContentSelector::All);

    let job = args.to_jobs(PathBuf::from("archive")).unwrap().remove(0);
    assert_eq!(job.concurrency, 3);
    assert_eq!(job.media_concurrency, 4);
    assert_eq!(job.page_size, 100);
    assert_eq!(job.resume, ResumeMode::On);
    assert_eq!(job.lock_mode, LockMode::FailFast);
    assert_eq!(job.rate_limit, RateLimitConfig::default());
    assert_eq!(job.retry.max_attempts(), 5);
    assert_eq!(job.stale_lock_after, Duration::from_secs(300));
    assert_eq!(job.heartbeat_interval, Duration::from_secs(30));
    assert!(job.window.is_none());
    assert!(job.max_items.is_none());
    assert!(!job.dry_run);
    assert!(!job.verify_checksums);
}

#[test]
fn test_archive_flags_reach_the_job() {
    let cli = Cli::try_parse_from([
        "vk-archiver",
        "--output-format",
        "json",
        "archive",
        "club:apiclub",
        "--token",
        "t",
        "--since",
        "2024-01-01",
        "--until",
        "2024-01-31",
        "--rate-capacity",
        "1",
        "--rate-per-sec",
        "0.5",
        "--max-attempts",
        "2",
        "--page-size",
        "50",
        "--dry-run",
        "--verify-checksums",
    ])
    .unwrap();
    assert_eq!(cli.output_format, OutputFormat::Json);

    let job = archive_args(&cli).to_jobs(PathBuf::from("out")).unwrap().remove(0);
    assert_eq!(job.target.kind, TargetKind::Group);
    let window = job.window.unwrap();
    assert_eq!(window.since, Some(1_704_067_200));
    assert_eq!(window.until, Some(1_706_745_599));
    assert_eq!(
        job.rate_limit,
        RateLimitConfig {
            capacity: 1,
            refill_per_sec: 0.5
        }
    );
    assert_eq!(job.retry.max_attempts(), 2);
    assert_eq!(job.page_size, 50);
    assert!(job.dry_run);
    assert!(job.verify_checksums);
}

#[test]
fn test_argument_errors() {
    // Malformed target
    assert!(Cli::try_parse_from(["vk-archiver", "archive", "apiclub", "--token", "t"]).is_err());
    // No target at all
    assert!(Cli::try_parse_from(["vk-archiver", "archive", "--token", "t"]).is_err());
    // Unknown content kind
    assert!(Cli::try_parse_from([
        "vk-archiver",
        "archive",
        "user:1",
        "--token",
        "t",
        "--content",
        "music"
    ])
    .is_err());
    // Lock timeout only makes sense when waiting
    assert!(Cli::try_parse_from([
        "vk-archiver",
        "archive",
        "user:1",
        "--token",
        "t",
        "--lock-timeout-secs",
        "5"
    ])
    .is_err());
    // Attempts outside 1..=20
    assert!(Cli::try_parse_from([
        "vk-archiver",
        "archive",
        "user:1",
        "--token",
        "t",
        "--max-attempts",
        "0"
    ])
    .is_err());
}

#[test]
fn test_inverted_window_is_a_configuration_error() {
    let cli = Cli::try_parse_from([
        "vk-archiver",
        "archive",
        "user:1",
        "--token",
        "t",
        "--since",
        "2024-02-01",
        "--until",
        "2024-01-01",
    ])
    .unwrap();
    assert!(matches!(
        archive_args(&cli).to_jobs(PathBuf::from("out")),
        Err(CliError::Configuration(_))
    ));
}

#[test]
fn test_status_command_parses() {
    let cli = Cli::try_parse_from(["vk-archiver", "status", "group_42"]).unwrap();
    match &cli.command {
        Commands::Status(args) => assert_eq!(args.target_key.as_deref(), Some("group_42")),
        other => panic!("expected status command, got {other:?}"),
    }
}

#[tokio::test]
async fn test_status_reads_archived_target() {
    let storage = TempDir::new().unwrap();
    let remote = MockRemote::with_group();
    remote.set_items(Collection::Wall, support::wall(5));

    Orchestrator::new(remote.clone())
        .run(
            support::job(storage.path(), "metadata,wall")
                .with_page_size(2)
                .with_max_items(Some(3)),
        )
        .await
        .unwrap();

    let status = TargetStatus::read(&support::group_root(storage.path())).unwrap();
    assert_eq!(status.target_key, "group_42");
    assert_eq!(status.recorded.get(&ContentKind::Metadata), Some(&1));
    assert_eq!(status.recorded.get(&ContentKind::Wall), Some(&3));
    assert!(status.resume_error.is_none());

    let resume = status.resume.unwrap();
    let wall = resume.stream(ContentKind::Wall).unwrap();
    assert!(!wall.completed);
    assert!(resume.stream(ContentKind::Metadata).unwrap().completed);
    assert!(!status.lock.unwrap().is_held());
}

#[test]
fn test_batch_rejected_when_one_target_is_invalid() {
    // Wall is not available for conversations, so the whole batch is refused
    let cli = Cli::try_parse_from([
        "vk-archiver",
        "archive",
        "group:apiclub",
        "conversation:5",
        "--token",
        "t",
        "--content",
        "wall",
    ])
    .unwrap();
    assert_eq!(archive_args(&cli).targets.len(), 2);
    assert!(matches!(
        archive_args(&cli).to_jobs(PathBuf::from("out")),
        Err(CliError::Configuration(_))
    ));
}
