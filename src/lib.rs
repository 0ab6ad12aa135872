//! # VK Archiver Library
//!
//! A crawl orchestration engine that archives everything a remote social-network
//! entity owns (a user, a group or a conversation) into a local storage tree.
//!
//! ## Features
//!
//! - **Rate Limiting**: one token bucket per credential shared by every task
//! - **Bounded Retries**: exponential backoff with jitter, escalating to fatal after a fixed attempt count
//! - **Resume Capability**: per content kind cursors persisted after every durably handled page
//! - **Idempotence**: an append-only dedup index makes reruns skip everything already archived
//! - **Multi-Process Safety**: target lock records with owner identity and heartbeat
//! - **Failure Isolation**: one broken item never aborts its task, one forbidden kind never aborts the run
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use vk_archiver::downloader::{ArchiveJob, Orchestrator};
//! use vk_archiver::fetcher::vk_http::VkHttpClient;
//! use vk_archiver::{ContentSelector, TargetDescriptor};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let api = Arc::new(VkHttpClient::new("token")?);
//! let job = ArchiveJob::new(
//!     "group:apiclub".parse::<TargetDescriptor>()?,
//!     "photos,wall".parse::<ContentSelector>()?,
//!     "./archive",
//! )
//! .with_max_items(Some(500));
//!
//! let summary = Orchestrator::new(api).run(job).await?;
//! println!("{} items written", summary.items_written);
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - [`downloader`] - Rate limiter, retry policy, per-kind tasks and the orchestrator
//! - [`fetcher`] - Remote API contract, pagination and the HTTP client
//! - [`consistency`] - Dedup index and target lock records
//! - [`resume`] - Persisted cursors per content kind
//! - [`output`] - Storage tree layout and atomic file writes
//! - [`shutdown`] - Run-level cancellation
//! - [`metrics`] - Counters and histograms for observability

#![warn(missing_docs)]
#![warn(clippy::all)]

/// Command-line interface
pub mod cli;
/// Dedup index and cross-process target locking
pub mod consistency;
/// Crawl orchestration
pub mod downloader;
/// Remote collection access
pub mod fetcher;
/// Observability metrics
pub mod metrics;
/// Storage tree layout and writers
pub mod output;
/// Resume state persistence
pub mod resume;
/// Graceful shutdown coordination
pub mod shutdown;

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Offset added to a conversation id to obtain its peer id
pub const CONVERSATION_PEER_OFFSET: i64 = 2_000_000_000;

/// Kind of remote entity being archived
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetKind {
    /// A personal profile
    User,
    /// A community (group or public page)
    Group,
    /// A multi-user conversation
    Conversation,
}

impl TargetKind {
    /// Lowercase name used in descriptors and directory names
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetKind::User => "user",
            TargetKind::Group => "group",
            TargetKind::Conversation => "conversation",
        }
    }
}

impl fmt::Display for TargetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TargetKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "user" | "id" => Ok(TargetKind::User),
            "group" | "club" | "public" => Ok(TargetKind::Group),
            "conversation" | "chat" => Ok(TargetKind::Conversation),
            _ => Err(format!(
                "Invalid target kind: {s}. Valid options: user, group, conversation"
            )),
        }
    }
}

/// Unresolved reference to a target, e.g. `group:apiclub` or `conversation:12`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetDescriptor {
    /// Entity kind
    pub kind: TargetKind,
    /// Screen name or numeric id
    pub handle: String,
}

impl TargetDescriptor {
    /// Create a descriptor
    pub fn new(kind: TargetKind, handle: impl Into<String>) -> Self {
        Self {
            kind,
            handle: handle.into(),
        }
    }

    /// Numeric id if the handle is already numeric
    pub fn numeric_id(&self) -> Option<i64> {
        self.handle.parse::<i64>().ok().filter(|id| *id > 0)
    }

    /// Validate descriptor
    pub fn validate(&self) -> Result<(), String> {
        if self.handle.trim().is_empty() {
            return Err("target handle cannot be empty".to_string());
        }
        if self.handle.chars().any(char::is_whitespace) {
            return Err(format!(
                "target handle '{}' must not contain whitespace",
                self.handle
            ));
        }
        if self.kind == TargetKind::Conversation && self.numeric_id().is_none() {
            return Err(format!(
                "conversation handle '{}' must be a positive numeric id",
                self.handle
            ));
        }
        Ok(())
    }
}

impl fmt::Display for TargetDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.handle)
    }
}

impl FromStr for TargetDescriptor {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, handle) = s
            .split_once(':')
            .ok_or_else(|| format!("Invalid target '{s}'. Expected <kind>:<handle>"))?;
        let descriptor = TargetDescriptor::new(kind.parse()?, handle.trim());
        descriptor.validate()?;
        Ok(descriptor)
    }
}

/// Resolved identity of the archived entity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    /// Entity kind
    pub kind: TargetKind,
    /// Positive numeric id
    pub id: i64,
    /// Display name
    pub name: String,
}

impl Target {
    /// Create a resolved target
    pub fn new(kind: TargetKind, id: i64, name: impl Into<String>) -> Self {
        Self {
            kind,
            id,
            name: name.into(),
        }
    }

    /// Owner id for owner-scoped list operations (negative for groups)
    pub fn owner_id(&self) -> i64 {
        match self.kind {
            TargetKind::User => self.id,
            TargetKind::Group => -self.id,
            TargetKind::Conversation => CONVERSATION_PEER_OFFSET + self.id,
        }
    }

    /// Directory name of the target root, stable across renames
    pub fn storage_key(&self) -> String {
        format!("{}_{}", self.kind, self.id)
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} ({})", self.kind, self.id, self.name)
    }
}

/// Content kinds that can be archived
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum ContentKind {
    /// Profile or community description
    Metadata,
    /// Message-board posts
    Wall,
    /// Photos, grouped by album
    Photos,
    /// Videos
    Videos,
    /// Uploaded documents
    Documents,
    /// Ephemeral stories
    Stories,
}

impl ContentKind {
    /// Every kind, in scheduling order
    pub const ALL: [ContentKind; 6] = [
        ContentKind::Metadata,
        ContentKind::Wall,
        ContentKind::Photos,
        ContentKind::Videos,
        ContentKind::Documents,
        ContentKind::Stories,
    ];

    /// Lowercase name, also the kind's subdirectory
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentKind::Metadata => "metadata",
            ContentKind::Wall => "wall",
            ContentKind::Photos => "photos",
            ContentKind::Videos => "videos",
            ContentKind::Documents => "documents",
            ContentKind::Stories => "stories",
        }
    }

    /// Whether a target of `kind` exposes this content
    pub fn supported_by(&self, kind: TargetKind) -> bool {
        !(kind == TargetKind::Conversation
            && matches!(self, ContentKind::Wall | ContentKind::Stories))
    }
}

impl fmt::Display for ContentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ContentKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "metadata" | "meta" | "info" => Ok(ContentKind::Metadata),
            "wall" | "posts" => Ok(ContentKind::Wall),
            "photos" | "photo" => Ok(ContentKind::Photos),
            "videos" | "video" => Ok(ContentKind::Videos),
            "documents" | "docs" | "doc" => Ok(ContentKind::Documents),
            "stories" | "story" => Ok(ContentKind::Stories),
            _ => Err(format!(
                "Invalid content kind: {s}. Valid options: metadata, wall, photos, videos, documents, stories"
            )),
        }
    }
}

/// Requested subset of content kinds
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentSelector {
    /// Every kind the target supports
    All,
    /// An explicit set
    Kinds(BTreeSet<ContentKind>),
}

impl ContentSelector {
    /// Selector for an explicit list of kinds
    pub fn only(kinds: impl IntoIterator<Item = ContentKind>) -> Self {
        ContentSelector::Kinds(kinds.into_iter().collect())
    }

    /// Kinds to schedule for a target of `target_kind`, in scheduling order.
    ///
    /// `All` silently drops kinds the target does not support; an explicit
    /// selection keeps them so [`ContentSelector::validate_for`] can reject it.
    pub fn kinds_for(&self, target_kind: TargetKind) -> Vec<ContentKind> {
        match self {
            ContentSelector::All => ContentKind::ALL
                .into_iter()
                .filter(|kind| kind.supported_by(target_kind))
                .collect(),
            ContentSelector::Kinds(kinds) => kinds.iter().copied().collect(),
        }
    }

    /// Whether `kind` is selected
    pub fn contains(&self, kind: ContentKind) -> bool {
        match self {
            ContentSelector::All => true,
            ContentSelector::Kinds(kinds) => kinds.contains(&kind),
        }
    }

    /// Validate the selection against a target kind
    pub fn validate_for(&self, target_kind: TargetKind) -> Result<(), String> {
        if let ContentSelector::Kinds(kinds) = self {
            if kinds.is_empty() {
                return Err("content selection cannot be empty".to_string());
            }
            if let Some(kind) = kinds.iter().find(|k| !k.supported_by(target_kind)) {
                return Err(format!("{kind} is not available for {target_kind} targets"));
            }
        }
        Ok(())
    }
}

impl fmt::Display for ContentSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContentSelector::All => f.write_str("all"),
            ContentSelector::Kinds(kinds) => {
                let names: Vec<&str> = kinds.iter().map(ContentKind::as_str).collect();
                f.write_str(&names.join(","))
            }
        }
    }
}

impl FromStr for ContentSelector {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.trim().eq_ignore_ascii_case("all") {
            return Ok(ContentSelector::All);
        }
        let kinds = s
            .split(',')
            .filter(|part| !part.trim().is_empty())
            .map(ContentKind::from_str)
            .collect::<Result<BTreeSet<_>, _>>()?;
        if kinds.is_empty() {
            return Err("content selection cannot be empty".to_string());
        }
        Ok(ContentSelector::Kinds(kinds))
    }
}

/// Inclusive window on item dates, in Unix seconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TimeWindow {
    /// Earliest accepted date
    pub since: Option<i64>,
    /// Latest accepted date
    pub until: Option<i64>,
}

impl TimeWindow {
    /// Create a window
    pub fn new(since: Option<i64>, until: Option<i64>) -> Self {
        Self { since, until }
    }

    /// Whether `timestamp` falls inside the window
    pub fn contains(&self, timestamp: i64) -> bool {
        self.since.map_or(true, |since| timestamp >= since)
            && self.until.map_or(true, |until| timestamp <= until)
    }

    /// Whether `timestamp` lies before the window start
    pub fn is_before(&self, timestamp: i64) -> bool {
        self.since.is_some_and(|since| timestamp < since)
    }

    /// Validate bounds
    pub fn validate(&self) -> Result<(), String> {
        if let (Some(since), Some(until)) = (self.since, self.until) {
            if since > until {
                return Err(format!(
                    "time window start ({since}) must not be after its end ({until})"
                ));
            }
        }
        Ok(())
    }
}

/// Source chosen for an item's binary payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum MediaSource {
    /// Directly downloadable file
    Direct {
        /// File URL
        url: String,
        /// File extension without dot
        extension: String,
    },
    /// No direct link is available; only a reference is archived
    Reference {
        /// Player or page URL, when known
        url: Option<String>,
        /// Why no direct link was selected
        reason: String,
    },
}

/// Photo attached to a wall post, downloaded alongside the post record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachedFile {
    /// Attachment id, `{owner_id}_{id}`
    pub id: String,
    /// File URL
    pub url: String,
    /// File path relative to the target root
    pub destination: PathBuf,
}

/// One normalized unit returned by a remote list call
#[derive(Debug, Clone, PartialEq)]
pub struct Item {
    /// Content kind
    pub kind: ContentKind,
    /// Stable id, unique within kind and target
    pub id: String,
    /// Record path relative to the target root
    pub destination: PathBuf,
    /// Payload file path relative to the target root, when a payload exists
    pub media_destination: Option<PathBuf>,
    /// Selected payload source
    pub media: Option<MediaSource>,
    /// Further files carried by the item
    pub attachments: Vec<AttachedFile>,
    /// Raw remote payload
    pub payload: serde_json::Value,
}
