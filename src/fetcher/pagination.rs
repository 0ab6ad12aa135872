//! Cursor-driven pagination over one remote collection
//!
//! [`Paginator`] turns a [`PageRequest`] into a lazy stream of [`PageBatch`]es.
//! Every page request takes a rate limiter token, runs under the per-call
//! deadline and goes through the retry policy. The stream is restartable: a
//! paginator built with any previously persisted cursor continues from exactly
//! that position.
//!
//! The stream ends when the remote reports no further page, when a page comes
//! back empty, when the item cap is reached, or after [`MAX_ITERATIONS`] pages.

use super::{Collection, Cursor, FetcherError, FetcherResult, Page, PageRequest, RemoteApi};
use crate::downloader::config::DEFAULT_CALL_TIMEOUT;
use crate::downloader::rate_limit::RateLimiter;
use crate::downloader::retry::{with_deadline, RetryPolicy};
use crate::shutdown::SharedShutdown;
use futures_util::stream::{self, Stream};
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Maximum pages fetched by one stream, guarding against a remote that never terminates
pub const MAX_ITERATIONS: usize = 10_000;

/// Items of one page that survived filtering and the cap, with the cursors around them
#[derive(Debug, Clone, PartialEq)]
pub struct PageBatch {
    /// Items to handle, in remote order
    pub items: Vec<serde_json::Value>,
    /// Cursor the page was requested with
    pub cursor_before: Option<Cursor>,
    /// Cursor to persist once every item of the batch is durably handled
    pub cursor_after: Option<Cursor>,
    /// Whether the collection has no further pages
    pub exhausted: bool,
    /// Items dropped by the time window
    pub filtered: usize,
    /// Total collection size, when reported
    pub total: Option<u64>,
}

/// Stream of page batches
pub type BatchStream = Pin<Box<dyn Stream<Item = FetcherResult<PageBatch>> + Send>>;

/// Paginated fetcher for one collection
#[derive(Clone)]
pub struct Paginator {
    api: Arc<dyn RemoteApi>,
    limiter: Arc<RateLimiter>,
    policy: RetryPolicy,
    request: PageRequest,
    cap: Option<u64>,
    call_timeout: Duration,
    shutdown: Option<SharedShutdown>,
}

impl Paginator {
    /// Create a paginator starting at `request.cursor`
    pub fn new(
        api: Arc<dyn RemoteApi>,
        limiter: Arc<RateLimiter>,
        policy: RetryPolicy,
        request: PageRequest,
    ) -> Self {
        Self {
            api,
            limiter,
            policy,
            request,
            cap: None,
            call_timeout: DEFAULT_CALL_TIMEOUT,
            shutdown: None,
        }
    }

    /// Stop after `cap` delivered items
    pub fn with_cap(mut self, cap: Option<u64>) -> Self {
        self.cap = cap;
        self
    }

    /// Set the per-call deadline
    pub fn with_call_timeout(mut self, call_timeout: Duration) -> Self {
        self.call_timeout = call_timeout;
        self
    }

    /// Attach run cancellation
    pub fn with_shutdown(mut self, shutdown: SharedShutdown) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    /// Collection being paged
    pub fn collection(&self) -> &Collection {
        &self.request.collection
    }

    /// Fetch a single page at `cursor` through the limiter, deadline and retry policy
    pub async fn fetch_page(&self, cursor: Option<Cursor>) -> FetcherResult<Page> {
        let operation = format!("list:{}", self.request.collection);
        let this = self;
        self.policy
            .execute(&operation, self.shutdown.as_deref(), |attempt| {
                let request = PageRequest {
                    cursor: cursor.clone(),
                    ..this.request.clone()
                };
                async move {
                    this.limiter.acquire().await;
                    let started = Instant::now();
                    let result =
                        with_deadline(this.call_timeout, this.api.list_page(&request)).await;
                    crate::metrics::record_remote_call(
                        &request.collection.to_string(),
                        started.elapsed(),
                        &result,
                    );
                    debug!(
                        collection = %request.collection,
                        cursor = ?request.cursor,
                        attempt,
                        ok = result.is_ok(),
                        "Fetched page"
                    );
                    result
                }
            })
            .await
    }

    /// Turn the paginator into a lazy stream of batches
    ///
    /// Nothing is requested until the stream is polled. After an error the
    /// stream yields that error once and ends.
    pub fn into_stream(self) -> BatchStream {
        let cursor = self.request.cursor.clone();
        let state = StreamState {
            paginator: self,
            cursor,
            delivered: 0,
            iterations: 0,
            finished: false,
        };

        Box::pin(stream::unfold(state, |mut state| async move {
            if state.finished {
                return None;
            }
            match state.next_batch().await {
                Ok(Some(batch)) => Some((Ok(batch), state)),
                Ok(None) => None,
                Err(err) => {
                    state.finished = true;
                    Some((Err(err), state))
                }
            }
        }))
    }
}

struct StreamState {
    paginator: Paginator,
    cursor: Option<Cursor>,
    delivered: u64,
    iterations: usize,
    finished: bool,
}

impl StreamState {
    fn cap_reached(&self, pending: usize) -> bool {
        self.paginator
            .cap
            .is_some_and(|cap| self.delivered + pending as u64 >= cap)
    }

    async fn next_batch(&mut self) -> FetcherResult<Option<PageBatch>> {
        if self.cap_reached(0) {
            debug!(delivered = self.delivered, "Item cap reached");
            return Ok(None);
        }
        if self.iterations >= MAX_ITERATIONS {
            warn!(
                collection = %self.paginator.request.collection,
                iterations = self.iterations,
                "Reached maximum pagination iterations, stopping"
            );
            return Ok(None);
        }
        if self
            .paginator
            .shutdown
            .as_ref()
            .is_some_and(|s| s.is_shutdown_requested())
        {
            return Err(FetcherError::Cancelled);
        }
        self.iterations += 1;

        let before = self.cursor.clone();
        let page = self.paginator.fetch_page(before.clone()).await?;
        let collection = &self.paginator.request.collection;
        let window = self.paginator.request.window;
        let raw_len = page.items.len();
        let older_than_window = collection.is_reverse_chronological()
            && window.is_some_and(|w| {
                page.items
                    .last()
                    .and_then(item_date)
                    .is_some_and(|date| w.is_before(date))
            });

        let mut items = Vec::with_capacity(raw_len);
        let mut consumed = 0usize;
        let mut filtered = 0usize;
        for item in page.items {
            if self.cap_reached(items.len()) {
                break;
            }
            consumed += 1;
            if let (Some(w), Some(date)) = (window, item_date(&item)) {
                if !w.contains(date) {
                    filtered += 1;
                    continue;
                }
            }
            items.push(item);
        }

        let truncated = consumed < raw_len;
        let mut exhausted = page.next.is_none() || raw_len == 0 || older_than_window;
        let cursor_after = if truncated {
            exhausted = false;
            partial_cursor(collection, before.as_ref(), consumed)
        } else {
            page.next.clone()
        };

        if !truncated && !exhausted && cursor_after == before {
            warn!(
                collection = %collection,
                cursor = ?before,
                "Remote cursor did not advance, stopping"
            );
            exhausted = true;
        }

        self.delivered += items.len() as u64;
        self.cursor = cursor_after.clone();
        self.finished = exhausted || truncated;

        debug!(
            collection = %collection,
            raw = raw_len,
            kept = items.len(),
            filtered,
            exhausted,
            truncated,
            "Page batch ready"
        );

        Ok(Some(PageBatch {
            items,
            cursor_before: before,
            cursor_after,
            exhausted,
            filtered,
            total: page.total,
        }))
    }
}

/// Cursor after consuming only the first `consumed` items of the page at `before`
///
/// Offsets advance by the consumed count. Token cursors cannot address the
/// middle of a page, so they stay at the page start and the page is delivered
/// again on resume.
fn partial_cursor(collection: &Collection, before: Option<&Cursor>, consumed: usize) -> Option<Cursor> {
    if collection.uses_tokens() {
        return before.cloned();
    }
    let consumed = consumed as u64;
    match before {
        None => Some(Cursor::Offset { offset: consumed }),
        Some(Cursor::Offset { offset }) => Some(Cursor::Offset {
            offset: offset + consumed,
        }),
        Some(Cursor::Album { album_id, offset }) => Some(Cursor::Album {
            album_id: *album_id,
            offset: offset + consumed,
        }),
        Some(Cursor::Token { .. }) => before.cloned(),
    }
}

/// Item date in Unix seconds, when the item carries one
pub fn item_date(item: &serde_json::Value) -> Option<i64> {
    item.get("date").and_then(serde_json::Value::as_i64)
}
