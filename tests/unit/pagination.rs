//! Unit tests for the paginated fetcher

use crate::support::{self, MockRemote};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use serde_json::json;
use std::sync::Arc;
use vk_archiver::downloader::RateLimiter;
use vk_archiver::fetcher::pagination::{item_date, PageBatch, Paginator};
use vk_archiver::fetcher::{
    Collection, Cursor, FetcherError, FetcherResult, Page, PageRequest, RemoteApi,
};
use vk_archiver::{Target, TargetDescriptor, TimeWindow};

fn paginator(
    remote: Arc<dyn RemoteApi>,
    collection: Collection,
    cursor: Option<Cursor>,
    page_size: u32,
    window: Option<TimeWindow>,
) -> Paginator {
    Paginator::new(
        remote,
        Arc::new(RateLimiter::new(1_000, 1_000.0).unwrap()),
        support::fast_retry(),
        PageRequest {
            owner: support::group(),
            collection,
            cursor,
            page_size,
            window,
        },
    )
}

async fn collect(paginator: Paginator) -> Vec<FetcherResult<PageBatch>> {
    paginator.into_stream().collect().await
}

fn ids(batches: &[FetcherResult<PageBatch>]) -> Vec<i64> {
    batches
        .iter()
        .flat_map(|b| b.as_ref().unwrap().items.iter())
        .map(|item| item["id"].as_i64().unwrap())
        .collect()
}

#[tokio::test]
async fn test_stream_is_lazy_and_walks_all_pages() {
    let remote = MockRemote::with_group();
    remote.set_items(Collection::Wall, support::wall(7));

    let stream = paginator(remote.clone(), Collection::Wall, None, 3, None).into_stream();
    assert!(remote.calls().is_empty());

    let batches: Vec<_> = stream.collect().await;
    assert_eq!(batches.len(), 3);
    assert_eq!(ids(&batches), vec![7, 6, 5, 4, 3, 2, 1]);

    let last = batches.last().unwrap().as_ref().unwrap();
    assert!(last.exhausted);
    assert_eq!(last.cursor_before, Some(Cursor::Offset { offset: 6 }));
    assert_eq!(last.cursor_after, None);
    assert_eq!(last.total, Some(7));
}

#[tokio::test]
async fn test_restart_from_cursor_yields_remainder() {
    let remote = MockRemote::with_group();
    remote.set_items(Collection::Videos, (1..=6).map(|id| support::video(id, false)).collect());

    let full = collect(paginator(remote.clone(), Collection::Videos, None, 2, None)).await;
    let resume_from = full[0].as_ref().unwrap().cursor_after.clone();
    assert_eq!(resume_from, Some(Cursor::Offset { offset: 2 }));

    let rest = collect(paginator(remote.clone(), Collection::Videos, resume_from, 2, None)).await;
    assert_eq!(ids(&rest), vec![3, 4, 5, 6]);
    assert_eq!(ids(&full)[2..], ids(&rest)[..]);
}

#[tokio::test]
async fn test_cap_truncates_mid_page() {
    let remote = MockRemote::with_group();
    remote.set_items(Collection::Wall, support::wall(10));

    let capped = paginator(remote.clone(), Collection::Wall, None, 4, None).with_cap(Some(6));
    let batches = collect(capped).await;

    assert_eq!(ids(&batches).len(), 6);
    let last = batches.last().unwrap().as_ref().unwrap();
    assert!(!last.exhausted);
    assert_eq!(last.cursor_after, Some(Cursor::Offset { offset: 6 }));
    // No page is requested once the cap is reached
    assert_eq!(remote.calls().len(), 2);
}

#[tokio::test]
async fn test_cap_on_token_stream_keeps_page_start() {
    let remote = MockRemote::with_group();
    let media = Collection::Attachments {
        media: vk_archiver::fetcher::AttachmentMedia::Photo,
    };
    remote.set_items(media.clone(), support::photos(0, 1, 5));

    let capped = paginator(remote.clone(), media, None, 2, None).with_cap(Some(3));
    let batches = collect(capped).await;
    assert_eq!(ids(&batches), vec![1, 2, 3]);
    let last = batches.last().unwrap().as_ref().unwrap();
    assert_eq!(last.cursor_before, last.cursor_after);
}

#[tokio::test]
async fn test_window_filters_and_stops_early() {
    let remote = MockRemote::with_group();
    // Post n is dated 1_700_000_000 + 60n, newest first
    remote.set_items(Collection::Wall, support::wall(20));
    let window = TimeWindow::new(Some(1_700_000_000 + 60 * 14), Some(1_700_000_000 + 60 * 18));

    let batches = collect(paginator(remote.clone(), Collection::Wall, None, 4, Some(window))).await;
    assert_eq!(ids(&batches), vec![18, 17, 16, 15, 14]);
    let filtered: usize = batches.iter().map(|b| b.as_ref().unwrap().filtered).sum();
    assert_eq!(filtered, 3);
    // Pages [20..17], [16..13]; the second already reaches before the window
    assert_eq!(remote.calls().len(), 2);
    assert!(batches.last().unwrap().as_ref().unwrap().exhausted);
}

#[tokio::test]
async fn test_error_is_yielded_once() {
    let remote = MockRemote::with_group();
    remote.set_items(Collection::Wall, support::wall(6));
    remote.break_at(
        Collection::Wall,
        3,
        FetcherError::Authorization("access denied".into()),
    );

    let batches = collect(paginator(remote.clone(), Collection::Wall, None, 3, None)).await;
    assert_eq!(batches.len(), 2);
    assert!(batches[0].is_ok());
    assert!(batches[1].as_ref().unwrap_err().is_authorization());
}

#[tokio::test]
async fn test_empty_collection_ends_stream() {
    let remote = MockRemote::with_group();
    let batches = collect(paginator(remote.clone(), Collection::Documents, None, 10, None)).await;
    assert_eq!(batches.len(), 1);
    let only = batches[0].as_ref().unwrap();
    assert!(only.items.is_empty());
    assert!(only.exhausted);
}

/// Remote whose cursor never moves
struct StuckRemote;

#[async_trait]
impl RemoteApi for StuckRemote {
    async fn resolve_target(&self, _descriptor: &TargetDescriptor) -> FetcherResult<Target> {
        Ok(support::group())
    }

    async fn list_page(&self, _request: &PageRequest) -> FetcherResult<Page> {
        Ok(Page::new(
            vec![json!({"id": 1})],
            Some(Cursor::Offset { offset: 0 }),
        ))
    }

    async fn fetch_binary(&self, _url: &str) -> FetcherResult<Bytes> {
        Ok(Bytes::new())
    }
}

#[tokio::test]
async fn test_stuck_cursor_terminates() {
    let batches = collect(paginator(Arc::new(StuckRemote), Collection::Wall, None, 10, None)).await;
    assert_eq!(batches.len(), 2);
    assert!(batches[1].as_ref().unwrap().exhausted);
}

#[test]
fn test_item_date() {
    assert_eq!(item_date(&json!({"date": 1_700_000_000})), Some(1_700_000_000));
    assert_eq!(item_date(&json!({"date": "yesterday"})), None);
    assert_eq!(item_date(&json!({})), None);
}
