//! Remote collection access
//!
//! The crawl engine consumes a fixed family of paginated list operations
//! through the [`RemoteApi`] trait. [`pagination::Paginator`] drives one
//! collection as a lazy, restartable stream of pages and
//! [`vk_http::VkHttpClient`] is the production implementation.

use crate::{Target, TargetDescriptor, TimeWindow};
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

pub mod pagination;
pub mod vk_http;

/// Fetcher errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum FetcherError {
    /// Connection or transport failure
    #[error("network error: {0}")]
    Network(String),

    /// Call exceeded its deadline
    #[error("call timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// Remote reported an internal failure
    #[error("server error {status}: {message}")]
    Server {
        /// HTTP status or remote error code
        status: u16,
        /// Remote message
        message: String,
    },

    /// Remote asked us to slow down
    #[error("rate limit exceeded: {0}")]
    RateLimitExceeded(String),

    /// Credential lacks permission for this collection
    #[error("authorization error: {0}")]
    Authorization(String),

    /// Item or target no longer exists
    #[error("not found: {0}")]
    NotFound(String),

    /// Other rejected request
    #[error("API error {code}: {message}")]
    Api {
        /// Remote error code
        code: i64,
        /// Remote message
        message: String,
    },

    /// Response could not be interpreted
    #[error("parse error: {0}")]
    Parse(String),

    /// Transient failures persisted past the attempt limit
    #[error("giving up after {attempts} attempts: {last}")]
    RetriesExhausted {
        /// Attempts made
        attempts: u32,
        /// Last observed error
        last: Box<FetcherError>,
    },

    /// Run cancellation interrupted the call
    #[error("cancelled")]
    Cancelled,
}

impl FetcherError {
    /// Whether the credential lacks permission, looking through retry exhaustion
    pub fn is_authorization(&self) -> bool {
        match self {
            FetcherError::Authorization(_) => true,
            FetcherError::RetriesExhausted { last, .. } => last.is_authorization(),
            _ => false,
        }
    }

    /// Whether the item or target is gone
    pub fn is_not_found(&self) -> bool {
        matches!(self, FetcherError::NotFound(_))
    }
}

/// Result type for fetcher operations
pub type FetcherResult<T> = Result<T, FetcherError>;

/// Position marker within one paginated stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Cursor {
    /// Numeric offset into an offset-paged collection
    Offset {
        /// Items preceding the position
        offset: u64,
    },
    /// Opaque continuation token
    Token {
        /// Token returned by the remote
        token: String,
    },
    /// Position inside one album of an album-grouped collection
    Album {
        /// Album being fetched
        album_id: i64,
        /// Items of that album preceding the position
        offset: u64,
    },
}

impl Cursor {
    /// Offset component, for offset and album cursors
    pub fn offset(&self) -> Option<u64> {
        match self {
            Cursor::Offset { offset } | Cursor::Album { offset, .. } => Some(*offset),
            Cursor::Token { .. } => None,
        }
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cursor::Offset { offset } => write!(f, "offset:{offset}"),
            Cursor::Token { token } => write!(f, "token:{token}"),
            Cursor::Album { album_id, offset } => write!(f, "album:{album_id}@{offset}"),
        }
    }
}

/// Media type for conversation attachment history
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttachmentMedia {
    /// Photo attachments
    Photo,
    /// Video attachments
    Video,
    /// Document attachments
    Doc,
}

impl AttachmentMedia {
    /// Remote name of the media type
    pub fn as_str(&self) -> &'static str {
        match self {
            AttachmentMedia::Photo => "photo",
            AttachmentMedia::Video => "video",
            AttachmentMedia::Doc => "doc",
        }
    }
}

/// Remote collection addressed by a list operation
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Collection {
    /// Single-record description of the target
    Profile,
    /// Message-board posts, newest first
    Wall,
    /// Photo albums
    Albums,
    /// Photos of one album
    AlbumPhotos {
        /// Album id
        album_id: i64,
    },
    /// Videos
    Videos,
    /// Documents
    Documents,
    /// Active stories
    Stories,
    /// Conversation attachment history
    Attachments {
        /// Attachment media type
        media: AttachmentMedia,
    },
}

impl Collection {
    /// Whether the remote returns items newest first
    pub fn is_reverse_chronological(&self) -> bool {
        matches!(self, Collection::Wall | Collection::Attachments { .. })
    }

    /// Whether pagination uses continuation tokens rather than offsets
    pub fn uses_tokens(&self) -> bool {
        matches!(self, Collection::Attachments { .. })
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Collection::Profile => f.write_str("profile"),
            Collection::Wall => f.write_str("wall"),
            Collection::Albums => f.write_str("albums"),
            Collection::AlbumPhotos { album_id } => write!(f, "album_photos[{album_id}]"),
            Collection::Videos => f.write_str("videos"),
            Collection::Documents => f.write_str("documents"),
            Collection::Stories => f.write_str("stories"),
            Collection::Attachments { media } => write!(f, "attachments[{}]", media.as_str()),
        }
    }
}

/// One list-operation request
#[derive(Debug, Clone, PartialEq)]
pub struct PageRequest {
    /// Owner of the collection
    pub owner: Target,
    /// Collection to list
    pub collection: Collection,
    /// Position to start from, `None` for the beginning
    pub cursor: Option<Cursor>,
    /// Requested items per page
    pub page_size: u32,
    /// Optional date filter forwarded to the remote
    pub window: Option<TimeWindow>,
}

/// One page of a remote collection
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Page {
    /// Raw items in remote order
    pub items: Vec<serde_json::Value>,
    /// Cursor of the following page, `None` when the collection is exhausted
    pub next: Option<Cursor>,
    /// Total collection size, when reported
    pub total: Option<u64>,
}

impl Page {
    /// Create a page
    pub fn new(items: Vec<serde_json::Value>, next: Option<Cursor>) -> Self {
        Self {
            items,
            next,
            total: None,
        }
    }

    /// Attach the reported collection size
    pub fn with_total(mut self, total: u64) -> Self {
        self.total = Some(total);
        self
    }
}

/// Remote API consumed by the crawl engine
#[async_trait]
pub trait RemoteApi: Send + Sync {
    /// Map a human-readable handle to a resolved target
    async fn resolve_target(&self, descriptor: &TargetDescriptor) -> FetcherResult<Target>;

    /// Fetch one page of a collection
    async fn list_page(&self, request: &PageRequest) -> FetcherResult<Page>;

    /// Fetch a binary payload in full
    async fn fetch_binary(&self, url: &str) -> FetcherResult<Bytes>;
}
