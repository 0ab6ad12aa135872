//! Integration tests for resume capability

use crate::support::{self, MockRemote};
use tempfile::TempDir;
use vk_archiver::downloader::{DownloadError, Orchestrator, ResumeMode, TaskStatus};
use vk_archiver::fetcher::{AttachmentMedia, Collection, Cursor, FetcherError};
use vk_archiver::output::STATE_FILE_NAME;
use vk_archiver::resume::ResumeState;
use vk_archiver::{ContentKind, Target, TargetDescriptor, TargetKind};

fn server_error() -> FetcherError {
    FetcherError::Server {
        status: 503,
        message: "unavailable".into(),
    }
}

#[tokio::test]
async fn test_resume_after_interrupted_run() {
    let storage = TempDir::new().unwrap();
    let remote = MockRemote::with_group();
    remote.set_items(Collection::Wall, support::wall(10));
    // The third page keeps failing: the run dies after two durable pages
    remote.break_at(Collection::Wall, 6, server_error());

    let first = Orchestrator::new(remote.clone())
        .run(support::job(storage.path(), "wall").with_page_size(3))
        .await
        .unwrap();
    let task = first.task(ContentKind::Wall).unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.items_written, 6);
    assert_eq!(task.cursor_out, Some(Cursor::Offset { offset: 6 }));
    assert!(task.error.as_deref().unwrap().contains("3 attempts"));

    let state = ResumeState::load(&support::group_root(storage.path()).join(STATE_FILE_NAME))
        .unwrap();
    assert_eq!(
        state.start_cursor(ContentKind::Wall),
        Some(Cursor::Offset { offset: 6 })
    );

    remote.heal();
    remote.clear_calls();
    let second = Orchestrator::new(remote.clone())
        .run(support::job(storage.path(), "wall").with_page_size(3))
        .await
        .unwrap();
    let task = second.task(ContentKind::Wall).unwrap();
    assert_eq!(task.status, TaskStatus::Done);
    assert_eq!(task.items_written, 4);
    assert_eq!(task.items_skipped, 0);
    assert!(task.completed);

    // Continued exactly where the first run stopped
    let calls = remote.calls_for(&Collection::Wall);
    assert_eq!(calls[0].cursor, Some(Cursor::Offset { offset: 6 }));
    assert_eq!(support::index_lines(storage.path()), 10);
}

#[tokio::test]
async fn test_token_cursor_resume_for_conversation() {
    let storage = TempDir::new().unwrap();
    let remote = MockRemote::with_group();
    remote.add_target("7", Target::new(TargetKind::Conversation, 7, "Chat"));
    let docs = Collection::Attachments {
        media: AttachmentMedia::Doc,
    };
    remote.set_items(
        docs.clone(),
        (1..=5)
            .map(|id| {
                let mut doc = support::document(id, "shared");
                doc["owner_id"] = serde_json::json!(1);
                doc
            })
            .collect(),
    );

    let job = |max_items: Option<u64>| {
        let mut job = support::job(storage.path(), "documents")
            .with_page_size(2)
            .with_max_items(max_items);
        job.target = TargetDescriptor::new(TargetKind::Conversation, "7");
        job
    };

    // The cap lands mid-page; a token cannot address that position
    let first = Orchestrator::new(remote.clone()).run(job(Some(3))).await.unwrap();
    assert_eq!(first.items_written, 3);
    let task = first.task(ContentKind::Documents).unwrap();
    assert_eq!(
        task.cursor_out,
        Some(Cursor::Token {
            token: "from:2".into()
        })
    );

    remote.clear_calls();
    let second = Orchestrator::new(remote.clone()).run(job(None)).await.unwrap();
    assert_eq!(second.items_written, 2);
    assert_eq!(second.items_skipped, 1);
    assert!(second.task(ContentKind::Documents).unwrap().completed);

    let calls = remote.calls_for(&docs);
    assert_eq!(
        calls[0].cursor,
        Some(Cursor::Token {
            token: "from:2".into()
        })
    );
    assert!(storage
        .path()
        .join("conversation_7/documents/files/1_5_shared.pdf")
        .exists());
}

#[tokio::test]
async fn test_failed_item_retried_on_next_run() {
    let storage = TempDir::new().unwrap();
    let remote = MockRemote::with_group();
    remote.set_items(
        Collection::Videos,
        vec![
            support::video(1, true),
            support::video(2, true),
            support::video(3, true),
        ],
    );
    remote.fail_binary(
        &support::video_url(2),
        FetcherError::Server {
            status: 502,
            message: "bad gateway".into(),
        },
    );

    let first = Orchestrator::new(remote.clone())
        .run(support::job(storage.path(), "videos"))
        .await
        .unwrap();
    assert_eq!(first.items_written, 2);
    assert_eq!(first.failed_items.len(), 1);
    assert_eq!(first.failed_items[0].item_id, "-42_2");
    assert!(!first.is_clean());
    // The checkpoint stays at the page holding the failure
    let task = first.task(ContentKind::Videos).unwrap();
    assert_eq!(task.status, TaskStatus::Done);
    assert!(!task.completed);
    assert_eq!(task.cursor_out, None);

    remote.heal();
    let second = Orchestrator::new(remote.clone())
        .run(support::job(storage.path(), "videos"))
        .await
        .unwrap();
    assert_eq!(second.items_written, 1);
    assert_eq!(second.items_skipped, 2);
    assert!(second.is_clean());
    assert!(second.task(ContentKind::Videos).unwrap().completed);
}

#[tokio::test]
async fn test_reset_mode_starts_from_beginning() {
    let storage = TempDir::new().unwrap();
    let remote = MockRemote::with_group();
    remote.set_items(Collection::Wall, support::wall(6));

    let capped = support::job(storage.path(), "wall")
        .with_page_size(2)
        .with_max_items(Some(4));
    Orchestrator::new(remote.clone()).run(capped).await.unwrap();

    remote.clear_calls();
    let reset = support::job(storage.path(), "wall")
        .with_page_size(2)
        .with_resume(ResumeMode::Reset);
    let summary = Orchestrator::new(remote.clone()).run(reset).await.unwrap();

    assert_eq!(remote.calls_for(&Collection::Wall)[0].cursor, None);
    assert_eq!(summary.items_written, 2);
    assert_eq!(summary.items_skipped, 4);
}

#[tokio::test]
async fn test_corrupt_resume_state_requires_reset() {
    let storage = TempDir::new().unwrap();
    let remote = MockRemote::with_group();
    remote.set_items(Collection::Wall, support::wall(2));

    let root = support::group_root(storage.path());
    std::fs::create_dir_all(&root).unwrap();
    std::fs::write(root.join(STATE_FILE_NAME), b"{ this is not json").unwrap();

    let err = Orchestrator::new(remote.clone())
        .run(support::job(storage.path(), "wall"))
        .await
        .unwrap_err();
    assert!(matches!(err, DownloadError::CorruptState(_)), "{err:?}");
    assert!(err.to_string().contains("reset"));

    // The lock was released despite the error
    let lock = vk_archiver::consistency::inspect_lock(&root).unwrap().unwrap();
    assert!(!lock.is_held());

    let summary = Orchestrator::new(remote.clone())
        .run(support::job(storage.path(), "wall").with_resume(ResumeMode::Reset))
        .await
        .unwrap();
    assert_eq!(summary.items_written, 2);
    assert!(ResumeState::load(&root.join(STATE_FILE_NAME)).is_ok());
}

#[tokio::test]
async fn test_capped_stories_resume_past_the_cap() {
    let storage = TempDir::new().unwrap();
    let remote = MockRemote::with_group();
    remote.set_items(
        Collection::Stories,
        (1..=5).map(support::story).collect(),
    );

    let capped = || support::job(storage.path(), "stories").with_max_items(Some(2));
    let first = Orchestrator::new(remote.clone()).run(capped()).await.unwrap();
    let task = first.task(ContentKind::Stories).unwrap();
    assert_eq!(task.items_written, 2);
    assert_eq!(task.cursor_out, Some(Cursor::Offset { offset: 2 }));
    assert!(!task.completed);

    remote.clear_calls();
    let second = Orchestrator::new(remote.clone()).run(capped()).await.unwrap();
    assert_eq!(
        remote.calls_for(&Collection::Stories)[0].cursor,
        Some(Cursor::Offset { offset: 2 })
    );
    assert_eq!(second.items_written, 2);
    assert_eq!(second.items_skipped, 0);

    let third = Orchestrator::new(remote.clone()).run(capped()).await.unwrap();
    assert_eq!(third.items_written, 1);
    assert!(third.task(ContentKind::Stories).unwrap().completed);
    assert_eq!(support::recorded(storage.path())[&ContentKind::Stories], 5);
}
