//! Downloader tasks, one per content kind
//!
//! Every variant shares one contract: [`DownloaderTask::run`] takes the
//! persisted cursor of its kind and reports items written, the cursor to
//! resume from and the items that failed. A task never returns an error;
//! stream-level failures end the task with [`TaskStatus::Failed`] while the
//! run carries on with the other kinds.
//!
//! Per page, items are persisted with bounded payload concurrency and the
//! cursor is checkpointed only once every item of the page was durably
//! written, skipped or recorded as failed. A page interrupted by
//! cancellation is never checkpointed, so the next run fetches it again.
//!
//! Once an item fails to persist, the checkpoint stays at the start of its
//! page for the rest of the run. The next run walks forward from there,
//! skipping what the dedup index already holds and retrying the failures.
//! Items rejected as malformed never hold the checkpoint back.

use super::context::TaskContext;
use super::job::TaskStatus;
use super::media::{
    extension_from_url, post_photos, select_document_source, select_photo_source,
    select_story_source, select_video_source, sha256_hex,
};
use super::progress::ProgressState;
use super::DownloadError;
use crate::fetcher::pagination::Paginator;
use crate::fetcher::{AttachmentMedia, Collection, Cursor, FetcherError};
use crate::metrics::TaskMetrics;
use crate::output::ItemPathBuilder;
use crate::{AttachedFile, ContentKind, Item, MediaSource, Target, TargetKind};
use chrono::Utc;
use futures_util::{stream, StreamExt};
use serde::Serialize;
use serde_json::{json, Value};
use std::path::Path;
use tracing::{debug, error, info, warn, Instrument};

/// Item that could not be archived in this run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedItem {
    /// Content kind
    pub kind: ContentKind,
    /// Item id, or its position in the page when it had none
    pub item_id: String,
    /// Failure description
    pub reason: String,
}

/// Result of one task run
#[derive(Debug, Clone, Serialize)]
pub struct TaskOutcome {
    /// Content kind
    pub kind: ContentKind,
    /// Terminal status
    pub status: TaskStatus,
    /// Items durably written in this run
    pub items_written: u64,
    /// Items skipped as already archived
    pub items_skipped: u64,
    /// Record and payload bytes written
    pub bytes_written: u64,
    /// Pages handled
    pub pages: u64,
    /// Cursor to resume from
    pub cursor_out: Option<Cursor>,
    /// Whether the collection was fully walked
    pub completed: bool,
    /// Items that failed in this run
    pub failed_items: Vec<FailedItem>,
    /// Stream-level error that ended the task
    pub error: Option<String>,
}

impl TaskOutcome {
    fn new(kind: ContentKind, cursor_in: Option<Cursor>) -> Self {
        Self {
            kind,
            status: TaskStatus::Idle,
            items_written: 0,
            items_skipped: 0,
            bytes_written: 0,
            pages: 0,
            cursor_out: cursor_in,
            completed: false,
            failed_items: Vec::new(),
            error: None,
        }
    }

    /// Finished without a stream-level error or cancellation
    pub fn is_success(&self) -> bool {
        self.status == TaskStatus::Done
    }
}

/// Downloader for one content kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DownloaderTask {
    /// Profile or community description
    Metadata,
    /// Wall posts
    Wall,
    /// Photos grouped by album
    Photos,
    /// Videos, reference-only when no direct file is available
    Videos,
    /// Documents, reference-only without a download link
    Documents,
    /// Stories, reference-only for unsupported media types
    Stories,
}

impl DownloaderTask {
    /// Task archiving `kind`
    pub fn for_kind(kind: ContentKind) -> Self {
        match kind {
            ContentKind::Metadata => DownloaderTask::Metadata,
            ContentKind::Wall => DownloaderTask::Wall,
            ContentKind::Photos => DownloaderTask::Photos,
            ContentKind::Videos => DownloaderTask::Videos,
            ContentKind::Documents => DownloaderTask::Documents,
            ContentKind::Stories => DownloaderTask::Stories,
        }
    }

    /// Content kind of this task
    pub fn kind(&self) -> ContentKind {
        match self {
            DownloaderTask::Metadata => ContentKind::Metadata,
            DownloaderTask::Wall => ContentKind::Wall,
            DownloaderTask::Photos => ContentKind::Photos,
            DownloaderTask::Videos => ContentKind::Videos,
            DownloaderTask::Documents => ContentKind::Documents,
            DownloaderTask::Stories => ContentKind::Stories,
        }
    }

    /// Remote collection listed by this task for `target`
    ///
    /// Photos of users and groups are walked album by album; this returns
    /// the album listing for them.
    pub fn collection(&self, target: &Target) -> Collection {
        let conversation = target.kind == TargetKind::Conversation;
        match self {
            DownloaderTask::Metadata => Collection::Profile,
            DownloaderTask::Wall => Collection::Wall,
            DownloaderTask::Photos if conversation => Collection::Attachments {
                media: AttachmentMedia::Photo,
            },
            DownloaderTask::Photos => Collection::Albums,
            DownloaderTask::Videos if conversation => Collection::Attachments {
                media: AttachmentMedia::Video,
            },
            DownloaderTask::Videos => Collection::Videos,
            DownloaderTask::Documents if conversation => Collection::Attachments {
                media: AttachmentMedia::Doc,
            },
            DownloaderTask::Documents => Collection::Documents,
            DownloaderTask::Stories => Collection::Stories,
        }
    }

    fn walks_albums(&self, target: &Target) -> bool {
        *self == DownloaderTask::Photos && target.kind != TargetKind::Conversation
    }

    /// Stable item id, unique within kind and target
    ///
    /// Wall posts use the post id, media items `{owner_id}_{id}` and the
    /// description the fixed id `profile`.
    pub fn item_id(&self, target: &Target, raw: &Value) -> Option<String> {
        if *self == DownloaderTask::Metadata {
            return Some("profile".to_string());
        }
        let id = raw.get("id").and_then(Value::as_i64)?;
        if *self == DownloaderTask::Wall {
            return Some(id.to_string());
        }
        let owner = raw
            .get("owner_id")
            .and_then(Value::as_i64)
            .unwrap_or_else(|| target.owner_id());
        Some(format!("{owner}_{id}"))
    }

    /// Normalize a raw remote item into an [`Item`] with its destinations
    pub fn normalize(&self, target: &Target, raw: Value, group: Option<&str>) -> Result<Item, String> {
        let kind = self.kind();
        let id = self
            .item_id(target, &raw)
            .ok_or_else(|| "item has no numeric id".to_string())?;

        let mut paths = ItemPathBuilder::new(kind, &id);
        if let Some(group) = group {
            paths = paths.with_group(group);
        }
        let media = match self {
            DownloaderTask::Metadata | DownloaderTask::Wall => None,
            DownloaderTask::Photos => Some(select_photo_source(&raw)),
            DownloaderTask::Videos => Some(select_video_source(&raw)),
            DownloaderTask::Documents => {
                if let Some(title) = raw.get("title").and_then(Value::as_str) {
                    paths = paths.with_label(title);
                }
                Some(select_document_source(&raw))
            }
            DownloaderTask::Stories => Some(select_story_source(&raw)),
        };
        let media_destination = match &media {
            Some(MediaSource::Direct { extension, .. }) => Some(paths.media_path(extension)),
            _ => None,
        };
        let attachments = match self {
            DownloaderTask::Wall => post_photos(&raw)
                .into_iter()
                .map(|photo| AttachedFile {
                    destination: ItemPathBuilder::new(kind, &format!("{id}_{}", photo.id))
                        .media_path(&extension_from_url(&photo.url, "jpg")),
                    id: photo.id,
                    url: photo.url,
                })
                .collect(),
            _ => Vec::new(),
        };

        Ok(Item {
            kind,
            id,
            destination: paths.record_path(),
            media_destination,
            media,
            attachments,
            payload: raw,
        })
    }

    /// Archive this kind starting at `cursor_in`
    pub async fn run(&self, ctx: &TaskContext, cursor_in: Option<Cursor>) -> TaskOutcome {
        let kind = self.kind();
        let span = tracing::info_span!(
            "archive_task",
            target_key = %ctx.target.storage_key(),
            kind = %kind,
        );

        async move {
            info!(cursor = ?cursor_in, "Starting task");
            let mut run = TaskRun::new(*self, ctx, cursor_in.clone());

            let result = if self.walks_albums(&ctx.target) {
                run.walk_albums(cursor_in).await
            } else {
                let collection = self.collection(&ctx.target);
                let paginator = ctx.paginator(collection, cursor_in, ctx.job.max_items);
                run.drive(paginator, None, &|cursor: Option<&Cursor>, exhausted: bool| {
                    (cursor.cloned(), exhausted)
                })
                .await
            };

            match result {
                Ok(StreamEnd::Cancelled) => run.transition(TaskStatus::Cancelled),
                Ok(_) => run.transition(TaskStatus::Done),
                Err(e) if e.is_cancelled() => run.transition(TaskStatus::Cancelled),
                Err(e) => {
                    match &e {
                        DownloadError::Fetcher(f) if f.is_authorization() => {
                            warn!(error = %e, "Content kind not accessible with this credential, skipping")
                        }
                        DownloadError::Fetcher(f) if f.is_not_found() => {
                            warn!(error = %e, "Content kind not found on the remote, skipping")
                        }
                        _ => error!(error = %e, "Task failed"),
                    }
                    run.outcome.error = Some(e.to_string());
                    run.transition(TaskStatus::Failed);
                }
            }
            run.finish()
        }
        .instrument(span)
        .await
    }
}

/// How one paginated stream ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamEnd {
    /// The collection has no further pages
    Exhausted,
    /// Cap or iteration limit reached before the end
    Stopped,
    /// Cancellation interrupted the stream
    Cancelled,
}

enum ItemResult {
    Written(u64),
    Skipped,
    /// Worth retrying next run
    Failed(FailedItem),
    /// Malformed remote item
    Rejected(FailedItem),
    Cancelled,
}

/// Maps a stream cursor and the exhausted flag to the persisted cursor and
/// whether the kind is complete
type Checkpoint<'c> = dyn Fn(Option<&Cursor>, bool) -> (Option<Cursor>, bool) + Sync + 'c;

/// Album of a photo stream
struct AlbumDir {
    id: i64,
    dir: String,
    title: String,
    raw: Value,
}

impl AlbumDir {
    fn from_raw(raw: Value) -> Option<Self> {
        let id = raw.get("id").and_then(Value::as_i64)?;
        let title = raw
            .get("title")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        Some(Self {
            id,
            dir: format!("{id}_{title}"),
            title,
            raw,
        })
    }
}

/// Mutable state of one task run
struct TaskRun<'a> {
    task: DownloaderTask,
    ctx: &'a TaskContext,
    outcome: TaskOutcome,
    progress: ProgressState,
    metrics: TaskMetrics,
    delivered: u64,
    /// Checkpoint pinned at the first page with a failed item
    held: Option<Option<Cursor>>,
}

impl<'a> TaskRun<'a> {
    fn new(task: DownloaderTask, ctx: &'a TaskContext, cursor_in: Option<Cursor>) -> Self {
        let kind = task.kind();
        Self {
            task,
            ctx,
            outcome: TaskOutcome::new(kind, cursor_in),
            progress: ProgressState::new(kind),
            metrics: TaskMetrics::start(kind),
            delivered: 0,
            held: None,
        }
    }

    fn transition(&mut self, next: TaskStatus) {
        if self.outcome.status == next {
            return;
        }
        if !self.outcome.status.can_transition_to(next) {
            debug!(from = %self.outcome.status, to = %next, "Unexpected task transition");
        }
        self.outcome.status = next;
    }

    fn finish(self) -> TaskOutcome {
        info!(
            status = %self.outcome.status,
            written = self.outcome.items_written,
            skipped = self.outcome.items_skipped,
            failed = self.outcome.failed_items.len(),
            pages = self.outcome.pages,
            completed = self.outcome.completed,
            duration_secs = self.metrics.elapsed().as_secs_f64(),
            "Task finished"
        );
        self.outcome
    }

    /// Walk one paginated stream, checkpointing each handled page
    async fn drive(
        &mut self,
        paginator: Paginator,
        album: Option<&AlbumDir>,
        checkpoint: &Checkpoint<'_>,
    ) -> Result<StreamEnd, DownloadError> {
        let ctx = self.ctx;
        let kind = self.task.kind();
        let mut pages = paginator.into_stream();
        let mut exhausted = false;

        loop {
            self.transition(TaskStatus::Fetching);
            let next = tokio::select! {
                next = pages.next() => next,
                _ = ctx.shutdown.wait_for_shutdown() => return Ok(StreamEnd::Cancelled),
            };
            let batch = match next {
                None => break,
                Some(Err(FetcherError::Cancelled)) => return Ok(StreamEnd::Cancelled),
                Some(Err(e)) => return Err(e.into()),
                Some(Ok(batch)) => batch,
            };
            self.outcome.pages += 1;
            self.delivered += batch.items.len() as u64;
            self.progress.observe_total(batch.total);
            self.transition(TaskStatus::ItemReady);

            let group = album.map(|a| a.dir.as_str());
            let task = self.task;
            let items: Vec<Result<Item, FailedItem>> = batch
                .items
                .iter()
                .enumerate()
                .map(|(position, raw)| {
                    task.normalize(&ctx.target, raw.clone(), group)
                        .map_err(|reason| FailedItem {
                            kind,
                            item_id: format!("#{position}@{}", describe_cursor(&batch.cursor_before)),
                            reason,
                        })
                })
                .collect();

            self.transition(TaskStatus::Persisting);
            let metrics = self.metrics.clone();
            let results: Vec<ItemResult> = stream::iter(items)
                .map(|item| {
                    let metrics = &metrics;
                    async move {
                        match item {
                            Ok(item) => persist_item(ctx, metrics, item).await,
                            Err(failed) => {
                                metrics.record_failed();
                                ItemResult::Rejected(failed)
                            }
                        }
                    }
                })
                .buffer_unordered(ctx.job.media_concurrency)
                .collect()
                .await;

            let mut cancelled = false;
            let mut page_failed = false;
            let handled = results.len() as u64;
            for result in results {
                match result {
                    ItemResult::Written(bytes) => {
                        self.outcome.items_written += 1;
                        self.outcome.bytes_written += bytes;
                    }
                    ItemResult::Skipped => self.outcome.items_skipped += 1,
                    ItemResult::Failed(failed) => {
                        warn!(item = %failed.item_id, reason = %failed.reason, "Item failed");
                        page_failed = true;
                        self.outcome.failed_items.push(failed);
                    }
                    ItemResult::Rejected(failed) => {
                        warn!(item = %failed.item_id, reason = %failed.reason, "Item rejected");
                        self.outcome.failed_items.push(failed);
                    }
                    ItemResult::Cancelled => cancelled = true,
                }
            }
            self.progress.update(handled);
            if self.progress.should_emit_update() {
                info!("{}", self.progress.format_progress());
                self.progress.mark_emitted();
            }
            if cancelled {
                info!("Cancelled mid-page, page will be fetched again next run");
                return Ok(StreamEnd::Cancelled);
            }

            if page_failed && self.held.is_none() {
                let (restart, _) = checkpoint(batch.cursor_before.as_ref(), false);
                info!(cursor = ?restart, "Holding checkpoint at page with failed items");
                self.held = Some(restart);
            }
            let (cursor, completed) = match &self.held {
                Some(restart) => (restart.clone(), false),
                None => checkpoint(batch.cursor_after.as_ref(), batch.exhausted),
            };
            ctx.tracker
                .advance(kind, cursor.clone(), batch.items.len() as u64, completed)?;
            debug!(cursor = ?cursor, completed, "Checkpointed page");
            self.outcome.cursor_out = cursor;
            self.outcome.completed = completed;
            exhausted = batch.exhausted;
        }

        self.transition(TaskStatus::Idle);
        Ok(if exhausted {
            StreamEnd::Exhausted
        } else {
            StreamEnd::Stopped
        })
    }

    /// Photos of a user or group: every album in turn
    async fn walk_albums(&mut self, cursor_in: Option<Cursor>) -> Result<StreamEnd, DownloadError> {
        let ctx = self.ctx;
        let kind = self.task.kind();
        let albums = self.list_albums().await?;
        if albums.is_empty() {
            ctx.tracker.advance(kind, None, 0, true)?;
            self.outcome.cursor_out = None;
            self.outcome.completed = true;
            return Ok(StreamEnd::Exhausted);
        }

        let (start, start_offset) = match &cursor_in {
            None => (0, 0),
            Some(Cursor::Album { album_id, offset }) => {
                match albums.iter().position(|a| a.id == *album_id) {
                    Some(position) => (position, *offset),
                    None => {
                        warn!(album_id, "Resume album no longer exists, restarting photos");
                        (0, 0)
                    }
                }
            }
            Some(other) => {
                warn!(cursor = %other, "Ignoring non-album cursor for photos");
                (0, 0)
            }
        };

        let cap = ctx.job.max_items;
        for (position, album) in albums.iter().enumerate().skip(start) {
            let remaining = match cap {
                Some(cap) if self.delivered >= cap => return Ok(StreamEnd::Stopped),
                Some(cap) => Some(cap - self.delivered),
                None => None,
            };
            let offset = if position == start { start_offset } else { 0 };
            let album_id = album.id;
            let next_album = albums.get(position + 1).map(|a| a.id);

            self.write_album_info(album);
            self.progress.set_phase(Some(format!("album {}", album.title)));

            let cursor = (offset > 0).then_some(Cursor::Offset { offset });
            let paginator = ctx.paginator(Collection::AlbumPhotos { album_id }, cursor, remaining);
            let checkpoint = move |cursor: Option<&Cursor>, exhausted: bool| {
                if exhausted {
                    match next_album {
                        Some(next) => (
                            Some(Cursor::Album {
                                album_id: next,
                                offset: 0,
                            }),
                            false,
                        ),
                        None => (None, true),
                    }
                } else {
                    let offset = cursor.and_then(Cursor::offset).unwrap_or(offset);
                    (Some(Cursor::Album { album_id, offset }), false)
                }
            };

            match self.drive(paginator, Some(album), &checkpoint).await? {
                StreamEnd::Exhausted => continue,
                end => return Ok(end),
            }
        }
        Ok(StreamEnd::Exhausted)
    }

    async fn list_albums(&self) -> Result<Vec<AlbumDir>, DownloadError> {
        let ctx = self.ctx;
        let mut pages = ctx.paginator(Collection::Albums, None, None).into_stream();
        let mut albums = Vec::new();
        loop {
            let next = tokio::select! {
                next = pages.next() => next,
                _ = ctx.shutdown.wait_for_shutdown() => return Err(DownloadError::Cancelled),
            };
            let Some(batch) = next else { break };
            for raw in batch?.items {
                match AlbumDir::from_raw(raw) {
                    Some(album) => albums.push(album),
                    None => warn!("Skipping album without id"),
                }
            }
        }
        info!(albums = albums.len(), "Listed photo albums");
        Ok(albums)
    }

    /// Album description, written once and never overwritten
    fn write_album_info(&self, album: &AlbumDir) {
        let path = ItemPathBuilder::new(ContentKind::Photos, "album")
            .with_group(&album.dir)
            .record_path();
        if let Err(e) = self.ctx.storage.write_if_absent(&path, &album.raw) {
            warn!(album_id = album.id, error = %e, "Failed to write album description");
        }
    }
}

fn describe_cursor(cursor: &Option<Cursor>) -> String {
    cursor
        .as_ref()
        .map_or_else(|| "start".to_string(), ToString::to_string)
}

/// Persist one item: payloads first, then its record, then the index entry
async fn persist_item(ctx: &TaskContext, metrics: &TaskMetrics, item: Item) -> ItemResult {
    let failed = |reason: String| {
        metrics.record_failed();
        ItemResult::Failed(FailedItem {
            kind: item.kind,
            item_id: item.id.clone(),
            reason,
        })
    };

    let existing = match ctx.store.get(item.kind, &item.id) {
        Ok(existing) => existing,
        Err(e) => return failed(format!("dedup lookup failed: {e}")),
    };
    if let Some(record) = existing {
        if ctx.job.verify_checksums {
            if let Err(e) = ctx.store.verify(&record) {
                return failed(e.to_string());
            }
        }
        metrics.record_skipped();
        return ItemResult::Skipped;
    }
    if ctx.is_cancelled() {
        return ItemResult::Cancelled;
    }

    let mut record = ctx.store.record(item.kind, &item.id);
    let mut bytes_written = 0u64;
    let mut checksum = None;
    let mut size = None;

    match (&item.media, &item.media_destination) {
        (Some(MediaSource::Direct { url, .. }), Some(destination)) => {
            let stored = match store_file(ctx, url, destination).await {
                Ok(stored) => stored,
                Err(None) => return ItemResult::Cancelled,
                Err(Some(reason)) => return failed(format!("payload {reason}")),
            };
            bytes_written += stored.written;
            record = record.with_payload(stored.checksum.clone(), stored.size, path_string(destination));
            checksum = Some(stored.checksum);
            size = Some(stored.size);
        }
        (Some(MediaSource::Reference { reason, .. }), _) => {
            debug!(item = %item.id, reason = %reason, "Archiving reference only");
            record = record.reference_only();
        }
        _ => {}
    }

    let mut attached = Vec::with_capacity(item.attachments.len());
    for file in &item.attachments {
        let stored = match store_file(ctx, &file.url, &file.destination).await {
            Ok(stored) => stored,
            Err(None) => return ItemResult::Cancelled,
            Err(Some(reason)) => return failed(format!("attachment {} {reason}", file.id)),
        };
        bytes_written += stored.written;
        attached.push(json!({
            "id": file.id,
            "path": path_string(&file.destination),
            "checksum": stored.checksum,
            "size": stored.size,
        }));
    }

    let envelope = json!({
        "kind": item.kind,
        "id": item.id,
        "target": ctx.target,
        "archived_at": Utc::now().to_rfc3339(),
        "media": item.media,
        "media_path": item.media_destination.as_deref().map(path_string),
        "checksum": checksum,
        "size": size,
        "attachments": attached,
        "payload": item.payload,
    });
    match ctx.storage.write_record(&item.destination, &envelope) {
        Ok(written) => bytes_written += written,
        Err(e) => return failed(format!("record write failed: {e}")),
    }

    match ctx.store.mark_downloaded(record) {
        Ok(true) => {
            metrics.record_written(bytes_written);
            ItemResult::Written(bytes_written)
        }
        Ok(false) => {
            metrics.record_skipped();
            ItemResult::Skipped
        }
        Err(e) => failed(format!("index update failed: {e}")),
    }
}

/// Binary file in the target tree
struct StoredFile {
    written: u64,
    checksum: String,
    size: u64,
}

/// Download `url` to `destination`, or adopt the file an interrupted run left there
///
/// `Err(None)` means cancelled.
async fn store_file(
    ctx: &TaskContext,
    url: &str,
    destination: &Path,
) -> Result<StoredFile, Option<String>> {
    if ctx.storage.exists(destination) {
        let bytes = ctx
            .storage
            .read(destination)
            .map_err(|e| Some(format!("read failed: {e}")))?;
        debug!(path = %destination.display(), "Adopting existing payload");
        return Ok(StoredFile {
            written: 0,
            checksum: sha256_hex(&bytes),
            size: bytes.len() as u64,
        });
    }

    let bytes = match ctx.fetch_binary(url).await {
        Ok(bytes) => bytes,
        Err(FetcherError::Cancelled) => return Err(None),
        Err(e) => return Err(Some(format!("download failed: {e}"))),
    };
    let written = ctx
        .storage
        .write_payload(destination, &bytes)
        .map_err(|e| Some(format!("write failed: {e}")))?;
    Ok(StoredFile {
        written,
        checksum: sha256_hex(&bytes),
        size: bytes.len() as u64,
    })
}

fn path_string(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}
