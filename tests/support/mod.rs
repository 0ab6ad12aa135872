//! Shared fixtures: an in-memory remote API and job builders

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;
use vk_archiver::consistency::{scan_counts, INDEX_FILE_NAME};
use vk_archiver::downloader::{ArchiveJob, RateLimitConfig, RetryPolicy};
use vk_archiver::fetcher::{
    Collection, Cursor, FetcherError, FetcherResult, Page, PageRequest, RemoteApi,
};
use vk_archiver::{ContentKind, ContentSelector, Target, TargetDescriptor, TargetKind};

/// Id of the fixture group
pub const GROUP_ID: i64 = 42;

/// Screen name of the fixture group
pub const GROUP_HANDLE: &str = "G";

/// One recorded list call
#[derive(Debug, Clone)]
pub struct CallRecord {
    pub at: Instant,
    pub collection: Collection,
    pub cursor: Option<Cursor>,
}

#[derive(Default)]
struct MockState {
    targets: HashMap<String, Target>,
    collections: HashMap<Collection, Vec<Value>>,
    queued_failures: HashMap<Collection, VecDeque<FetcherError>>,
    broken: HashMap<Collection, FetcherError>,
    broken_at: HashMap<(Collection, u64), FetcherError>,
    binary_failures: HashMap<String, FetcherError>,
    list_delay: Duration,
    binary_delay: Duration,
    calls: Vec<CallRecord>,
    resolve_calls: usize,
    binary_calls: Vec<String>,
}

impl MockState {
    fn page(&mut self, request: &PageRequest) -> FetcherResult<Page> {
        let collection = &request.collection;
        let offset = request.cursor.as_ref().and_then(Cursor::offset).unwrap_or(0);

        if let Some(err) = self.broken.get(collection) {
            return Err(err.clone());
        }
        if let Some(err) = self.broken_at.get(&(collection.clone(), offset)) {
            return Err(err.clone());
        }
        if let Some(err) = self
            .queued_failures
            .get_mut(collection)
            .and_then(VecDeque::pop_front)
        {
            return Err(err);
        }

        let items = self.collections.get(collection).cloned().unwrap_or_default();
        let total = items.len() as u64;
        match collection {
            Collection::Profile => Ok(Page::new(items.into_iter().take(1).collect(), None)
                .with_total(total.min(1))),
            Collection::Attachments { .. } => {
                let start = match &request.cursor {
                    Some(Cursor::Token { token }) => token
                        .trim_start_matches("from:")
                        .parse::<usize>()
                        .unwrap_or(0),
                    _ => 0,
                };
                let (slice, end) = slice_page(&items, start, request.page_size);
                let next = (end < items.len()).then(|| Cursor::Token {
                    token: format!("from:{end}"),
                });
                Ok(Page::new(slice, next))
            }
            Collection::Stories => Ok(Page::new(
                items.into_iter().skip(offset as usize).collect(),
                None,
            )
            .with_total(total)),
            _ => {
                let (slice, end) = slice_page(&items, offset as usize, request.page_size);
                let next = (end < items.len()).then_some(Cursor::Offset { offset: end as u64 });
                Ok(Page::new(slice, next).with_total(total))
            }
        }
    }
}

fn slice_page(items: &[Value], start: usize, page_size: u32) -> (Vec<Value>, usize) {
    let start = start.min(items.len());
    let end = (start + page_size as usize).min(items.len());
    (items[start..end].to_vec(), end)
}

/// In-memory remote serving fixed collections
#[derive(Default)]
pub struct MockRemote {
    state: Mutex<MockState>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

struct InFlight<'a>(&'a MockRemote);

impl<'a> InFlight<'a> {
    fn enter(remote: &'a MockRemote) -> Self {
        let now = remote.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        remote.max_in_flight.fetch_max(now, Ordering::SeqCst);
        Self(remote)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

impl MockRemote {
    /// Remote knowing only the fixture group, with its profile
    pub fn with_group() -> Arc<Self> {
        let remote = Arc::new(Self::default());
        remote.add_target(GROUP_HANDLE, group());
        remote.set_items(Collection::Profile, vec![profile()]);
        remote
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }

    pub fn add_target(&self, handle: &str, target: Target) {
        self.state().targets.insert(handle.to_string(), target);
    }

    pub fn set_items(&self, collection: Collection, items: Vec<Value>) {
        self.state().collections.insert(collection, items);
    }

    /// Add an album holding `photos` to the album listing
    pub fn add_album(&self, album_id: i64, title: &str, photos: Vec<Value>) {
        let mut state = self.state();
        let album = json!({
            "id": album_id,
            "owner_id": -GROUP_ID,
            "title": title,
            "size": photos.len(),
        });
        state
            .collections
            .entry(Collection::Albums)
            .or_default()
            .push(album);
        state
            .collections
            .insert(Collection::AlbumPhotos { album_id }, photos);
    }

    /// Fail the next calls on `collection` with `errors`, in order
    pub fn fail_next(&self, collection: Collection, errors: Vec<FetcherError>) {
        self.state()
            .queued_failures
            .entry(collection)
            .or_default()
            .extend(errors);
    }

    /// Fail every call on `collection`
    pub fn break_collection(&self, collection: Collection, err: FetcherError) {
        self.state().broken.insert(collection, err);
    }

    /// Fail every call on `collection` requested at `offset`
    pub fn break_at(&self, collection: Collection, offset: u64, err: FetcherError) {
        self.state().broken_at.insert((collection, offset), err);
    }

    pub fn fail_binary(&self, url: &str, err: FetcherError) {
        self.state().binary_failures.insert(url.to_string(), err);
    }

    /// Remove every injected failure
    pub fn heal(&self) {
        let mut state = self.state();
        state.queued_failures.clear();
        state.broken.clear();
        state.broken_at.clear();
        state.binary_failures.clear();
    }

    pub fn set_list_delay(&self, delay: Duration) {
        self.state().list_delay = delay;
    }

    pub fn set_binary_delay(&self, delay: Duration) {
        self.state().binary_delay = delay;
    }

    pub fn calls(&self) -> Vec<CallRecord> {
        self.state().calls.clone()
    }

    pub fn calls_for(&self, collection: &Collection) -> Vec<CallRecord> {
        self.calls()
            .into_iter()
            .filter(|c| &c.collection == collection)
            .collect()
    }

    pub fn clear_calls(&self) {
        let mut state = self.state();
        state.calls.clear();
        state.binary_calls.clear();
        state.resolve_calls = 0;
    }

    pub fn resolve_calls(&self) -> usize {
        self.state().resolve_calls
    }

    pub fn binary_calls(&self) -> Vec<String> {
        self.state().binary_calls.clone()
    }

    /// Highest number of list calls observed in flight at once
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RemoteApi for MockRemote {
    async fn resolve_target(&self, descriptor: &TargetDescriptor) -> FetcherResult<Target> {
        let mut state = self.state();
        state.resolve_calls += 1;
        state
            .targets
            .get(&descriptor.handle)
            .cloned()
            .ok_or_else(|| FetcherError::NotFound(format!("target {descriptor}")))
    }

    async fn list_page(&self, request: &PageRequest) -> FetcherResult<Page> {
        let (result, delay) = {
            let mut state = self.state();
            state.calls.push(CallRecord {
                at: Instant::now(),
                collection: request.collection.clone(),
                cursor: request.cursor.clone(),
            });
            (state.page(request), state.list_delay)
        };
        let _in_flight = InFlight::enter(self);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        result
    }

    async fn fetch_binary(&self, url: &str) -> FetcherResult<Bytes> {
        let (failure, delay) = {
            let mut state = self.state();
            state.binary_calls.push(url.to_string());
            (state.binary_failures.get(url).cloned(), state.binary_delay)
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        match failure {
            Some(err) => Err(err),
            None => Ok(Bytes::from(binary_body(url))),
        }
    }
}

/// Bytes the mock serves for `url`
pub fn binary_body(url: &str) -> Vec<u8> {
    format!("binary:{url}").into_bytes()
}

pub fn group() -> Target {
    Target::new(TargetKind::Group, GROUP_ID, "Group G")
}

pub fn group_descriptor() -> TargetDescriptor {
    TargetDescriptor::new(TargetKind::Group, GROUP_HANDLE)
}

pub fn profile() -> Value {
    json!({
        "id": GROUP_ID,
        "name": "Group G",
        "screen_name": GROUP_HANDLE,
        "description": "fixture group",
        "members_count": 3,
    })
}

/// Wall post dated `date`
pub fn post(id: i64, date: i64) -> Value {
    json!({
        "id": id,
        "owner_id": -GROUP_ID,
        "from_id": -GROUP_ID,
        "date": date,
        "text": format!("post {id}"),
    })
}

/// Newest first, as the wall lists them
pub fn wall(count: i64) -> Vec<Value> {
    (1..=count)
        .rev()
        .map(|id| post(id, 1_700_000_000 + id * 60))
        .collect()
}

pub fn photo_url(album_id: i64, id: i64) -> String {
    format!("https://cdn.test/photos/{album_id}/{id}.jpg")
}

pub fn photo(album_id: i64, id: i64) -> Value {
    json!({
        "id": id,
        "owner_id": -GROUP_ID,
        "album_id": album_id,
        "date": 1_700_000_000 + id,
        "sizes": [
            {"type": "s", "width": 75, "height": 50, "url": format!("https://cdn.test/photos/{album_id}/{id}_s.jpg")},
            {"type": "x", "width": 604, "height": 403, "url": photo_url(album_id, id)},
        ],
    })
}

/// `count` photos of `album_id` with ids starting at `first_id`
pub fn photos(album_id: i64, first_id: i64, count: i64) -> Vec<Value> {
    (first_id..first_id + count)
        .map(|id| photo(album_id, id))
        .collect()
}

pub fn video_url(id: i64) -> String {
    format!("https://cdn.test/videos/{id}_720.mp4")
}

/// Video with a direct file, or with a player link only
pub fn video(id: i64, direct: bool) -> Value {
    if direct {
        json!({
            "id": id,
            "owner_id": -GROUP_ID,
            "title": format!("video {id}"),
            "files": {"mp4_720": video_url(id)},
        })
    } else {
        json!({
            "id": id,
            "owner_id": -GROUP_ID,
            "title": format!("video {id}"),
            "player": format!("https://vk.test/video_ext.php?oid=-{GROUP_ID}&id={id}"),
        })
    }
}

pub fn document_url(id: i64) -> String {
    format!("https://cdn.test/docs/{id}.pdf")
}

pub fn document(id: i64, title: &str) -> Value {
    json!({
        "id": id,
        "owner_id": -GROUP_ID,
        "title": title,
        "ext": "pdf",
        "size": 1024,
        "url": document_url(id),
    })
}

pub fn story(id: i64) -> Value {
    json!({
        "id": id,
        "owner_id": -GROUP_ID,
        "type": "photo",
        "photo": photo(0, 9_000 + id),
    })
}

/// Retry policy with millisecond backoff
pub fn fast_retry() -> RetryPolicy {
    RetryPolicy::new(3, Duration::from_millis(1), Duration::from_millis(5))
}

/// Job archiving the fixture group into `storage`
pub fn job(storage: &Path, content: &str) -> ArchiveJob {
    ArchiveJob::new(
        group_descriptor(),
        content.parse::<ContentSelector>().unwrap(),
        storage,
    )
    .with_retry(fast_retry())
    .with_rate_limit(RateLimitConfig {
        capacity: 1_000,
        refill_per_sec: 1_000.0,
    })
    .with_call_timeout(Duration::from_secs(5))
}

/// Root directory of the fixture group under `storage`
pub fn group_root(storage: &Path) -> PathBuf {
    storage.join(group().storage_key())
}

/// Recorded items per kind
pub fn recorded(storage: &Path) -> BTreeMap<ContentKind, u64> {
    scan_counts(&group_root(storage)).unwrap()
}

/// Lines of the dedup index, one per recorded item
pub fn index_lines(storage: &Path) -> usize {
    std::fs::read_to_string(group_root(storage).join(INDEX_FILE_NAME))
        .map(|text| text.lines().filter(|l| !l.trim().is_empty()).count())
        .unwrap_or(0)
}

/// Every file below `dir`
pub fn files_under(dir: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();
    let Ok(entries) = std::fs::read_dir(dir) else {
        return files;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            files.extend(files_under(&path));
        } else {
            files.push(path);
        }
    }
    files.sort();
    files
}

/// Leftover temporary files of interrupted atomic writes
pub fn temp_files_under(dir: &Path) -> Vec<PathBuf> {
    files_under(dir)
        .into_iter()
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with(".tmp"))
        })
        .collect()
}
