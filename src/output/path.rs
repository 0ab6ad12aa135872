//! Storage path generation for archived items
//!
//! Every item lands under its content kind directory of the target root:
//!
//! ```text
//! <kind>/[<group>/]<stem>.json            item record
//! <kind>/[<group>/]files/<stem>.<ext>     binary payload
//! ```
//!
//! `group` is the album for photos and is absent for the other kinds.
//!
//! # Usage Example
//!
//! ```rust
//! use vk_archiver::output::ItemPathBuilder;
//! use vk_archiver::ContentKind;
//!
//! let builder = ItemPathBuilder::new(ContentKind::Photos, "-1_457")
//!     .with_group("Summer: 2024");
//!
//! assert_eq!(
//!     builder.record_path().to_string_lossy(),
//!     "photos/Summer_ 2024/-1_457.json"
//! );
//! assert_eq!(
//!     builder.media_path("jpg").to_string_lossy(),
//!     "photos/Summer_ 2024/files/-1_457.jpg"
//! );
//! ```

use crate::ContentKind;
use std::path::PathBuf;

/// Directory holding binary payloads next to their records
pub const FILES_DIR: &str = "files";

/// Longest sanitized path component, in characters
pub const MAX_COMPONENT_CHARS: usize = 100;

/// Relative path builder for one item
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemPathBuilder {
    kind: ContentKind,
    group: Option<String>,
    stem: String,
    label: Option<String>,
}

impl ItemPathBuilder {
    /// Create a builder for an item of `kind` named by `stem`
    ///
    /// The stem is sanitized, so remote ids and titles can be passed as is.
    pub fn new(kind: ContentKind, stem: &str) -> Self {
        Self {
            kind,
            group: None,
            stem: sanitize_component(stem),
            label: None,
        }
    }

    /// Place the item inside a named group directory
    pub fn with_group(mut self, group: &str) -> Self {
        self.group = Some(sanitize_component(group));
        self
    }

    /// Append a human-readable label to the payload file name
    pub fn with_label(mut self, label: &str) -> Self {
        if !label.trim().is_empty() {
            self.label = Some(sanitize_component(label));
        }
        self
    }

    fn dir(&self) -> PathBuf {
        let mut dir = PathBuf::from(self.kind.as_str());
        if let Some(group) = &self.group {
            dir.push(group);
        }
        dir
    }

    /// Record path relative to the target root
    pub fn record_path(&self) -> PathBuf {
        self.dir().join(format!("{}.json", self.stem))
    }

    /// Payload path relative to the target root
    pub fn media_path(&self, extension: &str) -> PathBuf {
        let extension = sanitize_component(extension);
        let name = match &self.label {
            Some(label) => format!("{}_{}.{}", self.stem, label, extension),
            None => format!("{}.{}", self.stem, extension),
        };
        self.dir().join(FILES_DIR).join(name)
    }
}

/// Make a remote-supplied name safe as a single path component
///
/// Replaces `/ \ | : * ? " < > .` and control characters with `_`, trims
/// surrounding whitespace, caps the length at [`MAX_COMPONENT_CHARS`], and
/// never returns an empty string.
pub fn sanitize_component(name: &str) -> String {
    let sanitized: String = name
        .trim()
        .chars()
        .map(|c| match c {
            '/' | '\\' | '|' | ':' | '*' | '?' | '"' | '<' | '>' | '.' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .take(MAX_COMPONENT_CHARS)
        .collect();

    if sanitized.trim().is_empty() {
        "_".to_string()
    } else {
        sanitized
    }
}
