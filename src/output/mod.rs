//! Target storage tree and atomic writers
//!
//! Layout under the storage root:
//!
//! ```text
//! <storage_root>/<kind>_<id>/
//!     target.json          resolved target description
//!     resume.json          per-kind cursors
//!     downloaded.jsonl     dedup index
//!     archive.lock         lock record
//!     <kind>/...           item records and payloads (see [`path`])
//! ```
//!
//! Every file is written to a temporary sibling first and renamed into place,
//! so readers never observe a partially written record or payload. Nothing in
//! the tree is ever deleted. Records, payloads and `target.json` are
//! create-only; only the resume state and the lock record are replaced.

use crate::{ContentKind, Target};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

pub mod path;

pub use path::{sanitize_component, ItemPathBuilder};

/// Resume state file name at the target root
pub const STATE_FILE_NAME: &str = "resume.json";

/// Target description file name at the target root
pub const TARGET_FILE_NAME: &str = "target.json";

/// Output writer errors
#[derive(Debug, thiserror::Error)]
pub enum OutputError {
    /// IO error
    #[error("IO error: {0}")]
    IoError(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    SerializationError(String),

    /// Path escapes the target root
    #[error("invalid path: {0}")]
    InvalidPath(String),
}

/// Result type for output operations
pub type OutputResult<T> = Result<T, OutputError>;

/// Write `bytes` to `path` through a synced temporary file and a rename
///
/// The parent directory is created when missing and synced after the rename.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> OutputResult<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent).map_err(|e| {
        OutputError::IoError(format!(
            "Failed to create directory {}: {e}",
            parent.display()
        ))
    })?;

    let mut temp_file = tempfile::NamedTempFile::new_in(parent)
        .map_err(|e| OutputError::IoError(format!("Failed to create temp file: {e}")))?;
    temp_file
        .write_all(bytes)
        .map_err(|e| OutputError::IoError(format!("Failed to write to temp file: {e}")))?;
    temp_file
        .flush()
        .map_err(|e| OutputError::IoError(format!("Failed to flush temp file: {e}")))?;
    temp_file
        .as_file()
        .sync_all()
        .map_err(|e| OutputError::IoError(format!("Failed to sync temp file: {e}")))?;
    temp_file.persist(path).map_err(|e| {
        OutputError::IoError(format!("Failed to persist {}: {}", path.display(), e.error))
    })?;

    if let Ok(dir) = std::fs::File::open(parent) {
        let _ = dir.sync_all();
    }
    Ok(())
}

/// Like [`write_atomic`], but never replaces an existing file
///
/// Returns `false` and leaves the file untouched when `path` already exists.
pub fn write_new(path: &Path, bytes: &[u8]) -> OutputResult<bool> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent).map_err(|e| {
        OutputError::IoError(format!(
            "Failed to create directory {}: {e}",
            parent.display()
        ))
    })?;
    if path.exists() {
        return Ok(false);
    }

    let mut temp_file = tempfile::NamedTempFile::new_in(parent)
        .map_err(|e| OutputError::IoError(format!("Failed to create temp file: {e}")))?;
    temp_file
        .write_all(bytes)
        .and_then(|()| temp_file.as_file().sync_all())
        .map_err(|e| OutputError::IoError(format!("Failed to write temp file: {e}")))?;
    match temp_file.persist_noclobber(path) {
        Ok(_) => {}
        Err(e) if e.error.kind() == std::io::ErrorKind::AlreadyExists => {
            debug!(path = %path.display(), "File appeared concurrently, keeping it");
            return Ok(false);
        }
        Err(e) => {
            return Err(OutputError::IoError(format!(
                "Failed to persist {}: {}",
                path.display(),
                e.error
            )))
        }
    }

    if let Ok(dir) = std::fs::File::open(parent) {
        let _ = dir.sync_all();
    }
    Ok(true)
}

/// Storage tree of one target
#[derive(Debug, Clone)]
pub struct TargetStorage {
    root: PathBuf,
}

impl TargetStorage {
    /// Storage for `target` under `storage_root`
    pub fn new(storage_root: &Path, target: &Target) -> Self {
        Self {
            root: storage_root.join(target.storage_key()),
        }
    }

    /// Target root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resume state path
    pub fn state_path(&self) -> PathBuf {
        self.root.join(STATE_FILE_NAME)
    }

    /// Directory of one content kind
    pub fn kind_dir(&self, kind: ContentKind) -> PathBuf {
        self.root.join(kind.as_str())
    }

    /// Create the target root and one directory per kind
    pub fn prepare(&self, kinds: &[ContentKind]) -> OutputResult<()> {
        for dir in std::iter::once(self.root.clone()).chain(kinds.iter().map(|k| self.kind_dir(*k)))
        {
            std::fs::create_dir_all(&dir).map_err(|e| {
                OutputError::IoError(format!(
                    "Failed to create directory {}: {e}",
                    dir.display()
                ))
            })?;
        }
        debug!(root = %self.root.display(), kinds = kinds.len(), "Prepared target storage");
        Ok(())
    }

    /// Absolute path of a root-relative path
    pub fn resolve(&self, relative: &Path) -> OutputResult<PathBuf> {
        if relative.is_absolute()
            || relative
                .components()
                .any(|c| matches!(c, std::path::Component::ParentDir))
        {
            return Err(OutputError::InvalidPath(relative.display().to_string()));
        }
        Ok(self.root.join(relative))
    }

    /// Whether a root-relative file exists
    pub fn exists(&self, relative: &Path) -> bool {
        self.resolve(relative).is_ok_and(|p| p.exists())
    }

    /// Create a pretty JSON record, returning the bytes written
    ///
    /// An existing record is kept and counts as zero bytes.
    pub fn write_record(&self, relative: &Path, value: &serde_json::Value) -> OutputResult<u64> {
        let json = serde_json::to_vec_pretty(value)
            .map_err(|e| OutputError::SerializationError(e.to_string()))?;
        self.write_payload(relative, &json)
    }

    /// Create a binary payload, returning the bytes written
    ///
    /// An existing file is kept and counts as zero bytes.
    pub fn write_payload(&self, relative: &Path, bytes: &[u8]) -> OutputResult<u64> {
        let path = self.resolve(relative)?;
        if write_new(&path, bytes)? {
            Ok(bytes.len() as u64)
        } else {
            Ok(0)
        }
    }

    /// Contents of a root-relative file
    pub fn read(&self, relative: &Path) -> OutputResult<Vec<u8>> {
        let path = self.resolve(relative)?;
        std::fs::read(&path)
            .map_err(|e| OutputError::IoError(format!("Failed to read {}: {e}", path.display())))
    }

    /// Write a JSON record only when no file exists yet; `true` when written
    pub fn write_if_absent(
        &self,
        relative: &Path,
        value: &serde_json::Value,
    ) -> OutputResult<bool> {
        let json = serde_json::to_vec_pretty(value)
            .map_err(|e| OutputError::SerializationError(e.to_string()))?;
        write_new(&self.resolve(relative)?, &json)
    }

    /// Write the resolved target description on the first run
    pub fn write_target_info(&self, target: &Target) -> OutputResult<()> {
        let value = serde_json::to_value(target)
            .map_err(|e| OutputError::SerializationError(e.to_string()))?;
        if !self.write_if_absent(Path::new(TARGET_FILE_NAME), &value)? {
            debug!(target_key = %target.storage_key(), "Target description already present");
        }
        Ok(())
    }
}
