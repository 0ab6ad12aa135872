//! Integration tests for idempotent reruns

use crate::support::{self, MockRemote};
use tempfile::TempDir;
use vk_archiver::consistency::ConsistencyStore;
use vk_archiver::downloader::Orchestrator;
use vk_archiver::fetcher::Collection;
use vk_archiver::ContentKind;

fn populated_remote() -> std::sync::Arc<MockRemote> {
    let remote = MockRemote::with_group();
    remote.set_items(Collection::Wall, support::wall(7));
    remote.add_album(1, "Wall photos", support::photos(1, 1, 3));
    remote.set_items(
        Collection::Videos,
        vec![support::video(10, true), support::video(11, false)],
    );
    remote.set_items(
        Collection::Documents,
        vec![support::document(20, "a"), support::document(21, "b")],
    );
    remote.set_items(Collection::Stories, vec![support::story(30)]);
    remote
}

#[tokio::test]
async fn test_rerun_writes_nothing_new() {
    let storage = TempDir::new().unwrap();
    let remote = populated_remote();

    let first = Orchestrator::new(remote.clone())
        .run(support::job(storage.path(), "all").with_page_size(2))
        .await
        .unwrap();
    // 1 profile, 7 posts, 3 photos, 2 videos, 2 documents, 1 story
    assert_eq!(first.items_written, 16);
    let files_after_first = support::files_under(&support::group_root(storage.path()));
    let binaries_after_first = remote.binary_calls().len();

    let second = Orchestrator::new(remote.clone())
        .run(support::job(storage.path(), "all").with_page_size(2))
        .await
        .unwrap();
    assert_eq!(second.items_written, 0);
    assert_eq!(second.items_skipped, 16);
    assert_eq!(second.bytes_written, 0);
    assert!(second.is_clean());

    // No payload was fetched again and no file appeared
    assert_eq!(remote.binary_calls().len(), binaries_after_first);
    assert_eq!(support::index_lines(storage.path()), 16);
    assert_eq!(
        support::files_under(&support::group_root(storage.path())).len(),
        files_after_first.len()
    );
}

#[tokio::test]
async fn test_new_remote_items_are_picked_up() {
    let storage = TempDir::new().unwrap();
    let remote = MockRemote::with_group();
    remote.set_items(Collection::Wall, support::wall(3));

    let first = Orchestrator::new(remote.clone())
        .run(support::job(storage.path(), "wall"))
        .await
        .unwrap();
    assert_eq!(first.items_written, 3);

    // Two newer posts arrive at the top of the wall
    remote.set_items(Collection::Wall, support::wall(5));
    let second = Orchestrator::new(remote.clone())
        .run(support::job(storage.path(), "wall"))
        .await
        .unwrap();
    assert_eq!(second.items_written, 2);
    assert_eq!(second.items_skipped, 3);
    assert_eq!(
        support::recorded(storage.path()).get(&ContentKind::Wall),
        Some(&5)
    );
}

#[tokio::test]
async fn test_reference_only_video_is_recorded_without_payload() {
    let storage = TempDir::new().unwrap();
    let remote = MockRemote::with_group();
    remote.set_items(Collection::Videos, vec![support::video(11, false)]);

    let summary = Orchestrator::new(remote.clone())
        .run(support::job(storage.path(), "videos"))
        .await
        .unwrap();
    assert_eq!(summary.items_written, 1);
    assert!(summary.failed_items.is_empty());
    assert!(remote.binary_calls().is_empty());

    let root = support::group_root(storage.path());
    let store = ConsistencyStore::open(&root, "group_42").unwrap();
    let record = store.get(ContentKind::Videos, "-42_11").unwrap().unwrap();
    assert!(record.reference_only);
    assert!(record.checksum.is_none());

    let json: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(root.join("videos/-42_11.json")).unwrap())
            .unwrap();
    assert_eq!(json["media"]["source"], "reference");
    assert!(json["media"]["url"]
        .as_str()
        .unwrap()
        .contains("video_ext.php"));
    assert!(json["media_path"].is_null());
}

#[tokio::test]
async fn test_checksum_verification_flags_tampered_payload() {
    let storage = TempDir::new().unwrap();
    let remote = MockRemote::with_group();
    remote.set_items(
        Collection::Documents,
        vec![support::document(1, "x"), support::document(2, "y")],
    );

    Orchestrator::new(remote.clone())
        .run(support::job(storage.path(), "documents"))
        .await
        .unwrap();

    let tampered = support::group_root(storage.path()).join("documents/files/-42_1_x.pdf");
    std::fs::write(&tampered, b"not the original bytes").unwrap();

    let verified = Orchestrator::new(remote.clone())
        .run(support::job(storage.path(), "documents").with_verify_checksums(true))
        .await
        .unwrap();
    assert_eq!(verified.items_written, 0);
    assert_eq!(verified.items_skipped, 1);
    assert_eq!(verified.failed_items.len(), 1);
    assert_eq!(verified.failed_items[0].item_id, "-42_1");
    assert!(verified.failed_items[0].reason.contains("checksum"));

    // Without verification the rerun just skips both
    let plain = Orchestrator::new(remote.clone())
        .run(support::job(storage.path(), "documents"))
        .await
        .unwrap();
    assert_eq!(plain.items_skipped, 2);
    assert!(plain.failed_items.is_empty());
}

#[tokio::test]
async fn test_files_left_by_interrupted_run_are_kept() {
    let storage = TempDir::new().unwrap();
    let remote = MockRemote::with_group();
    remote.set_items(Collection::Documents, vec![support::document(1, "x")]);

    // Payload and record landed, the index entry did not
    let root = support::group_root(storage.path());
    let payload = root.join("documents/files/-42_1_x.pdf");
    let record = root.join("documents/-42_1.json");
    std::fs::create_dir_all(payload.parent().unwrap()).unwrap();
    std::fs::write(&payload, b"bytes from the first attempt").unwrap();
    std::fs::write(&record, b"{\"kept\": true}").unwrap();

    let summary = Orchestrator::new(remote.clone())
        .run(support::job(storage.path(), "documents"))
        .await
        .unwrap();
    assert_eq!(summary.items_written, 1);
    assert!(remote.binary_calls().is_empty());
    assert_eq!(std::fs::read(&payload).unwrap(), b"bytes from the first attempt");
    assert_eq!(std::fs::read(&record).unwrap(), b"{\"kept\": true}");

    let store = ConsistencyStore::open(&root, "group_42").unwrap();
    let entry = store.get(ContentKind::Documents, "-42_1").unwrap().unwrap();
    assert_eq!(
        entry.checksum.as_deref(),
        Some(vk_archiver::downloader::media::sha256_hex(b"bytes from the first attempt").as_str())
    );
    assert_eq!(entry.size, Some(28));
}
