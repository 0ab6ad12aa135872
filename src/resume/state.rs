//! Resume state persistence
//!
//! Writes go through a temporary file and an atomic rename under an exclusive
//! advisory lock, so a crash never leaves a half-written state file. The
//! schema version is checked on every load.

use super::checkpoint::StreamCheckpoint;
use crate::fetcher::Cursor;
use crate::output::write_atomic;
use crate::ContentKind;
use chrono::{DateTime, Utc};
use fd_lock::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::path::Path;
use tracing::{debug, info, warn};

/// Current resume state schema version
const SCHEMA_VERSION: &str = "1.0.0";

/// Maximum allowed state file size (10 MB) to prevent memory exhaustion
pub const MAX_STATE_FILE_SIZE: u64 = 10 * 1024 * 1024;

/// Resume state for one target
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResumeState {
    schema_version: String,
    target: String,
    #[serde(default)]
    streams: BTreeMap<ContentKind, StreamCheckpoint>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl ResumeState {
    /// Empty state for the target with storage key `target`
    pub fn new(target: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            schema_version: SCHEMA_VERSION.to_string(),
            target: target.into(),
            streams: BTreeMap::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Target storage key
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Checkpoint of one stream
    pub fn stream(&self, kind: ContentKind) -> Option<&StreamCheckpoint> {
        self.streams.get(&kind)
    }

    /// All checkpoints
    pub fn streams(&self) -> &BTreeMap<ContentKind, StreamCheckpoint> {
        &self.streams
    }

    /// Cursor a new run of `kind` starts from
    pub fn start_cursor(&self, kind: ContentKind) -> Option<Cursor> {
        self.streams.get(&kind).and_then(StreamCheckpoint::start_cursor)
    }

    /// Record one durably handled page of `kind`
    pub fn record_page(
        &mut self,
        kind: ContentKind,
        cursor: Option<Cursor>,
        items: u64,
        completed: bool,
    ) {
        let checkpoint = self.streams.entry(kind).or_default();
        checkpoint.advance(cursor, items, completed);
        self.updated_at = Utc::now();
        debug!(
            kind = %kind,
            cursor = ?checkpoint.cursor,
            items_seen = checkpoint.items_seen,
            completed,
            "Checkpoint advanced"
        );
    }

    /// When the state was last modified
    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    /// Validate schema version (accepts current version only)
    pub fn validate_schema_version(&self) -> Result<(), ResumeError> {
        if self.schema_version != SCHEMA_VERSION {
            return Err(ResumeError::SchemaVersionMismatch {
                expected: SCHEMA_VERSION.to_string(),
                found: self.schema_version.clone(),
            });
        }
        Ok(())
    }

    /// Save state to `path` atomically under an exclusive lock
    pub fn save(&self, path: &Path) -> Result<(), ResumeError> {
        let json = serde_json::to_vec_pretty(self)
            .map_err(|e| ResumeError::SerializationError(e.to_string()))?;

        let mut lock = RwLock::new(open_lock_file(path)?);
        let _guard = lock
            .write()
            .map_err(|e| ResumeError::LockError(format!("Failed to acquire write lock: {e}")))?;

        write_atomic(path, &json).map_err(|e| ResumeError::IoError(e.to_string()))?;

        debug!(
            path = %path.display(),
            streams = self.streams.len(),
            "Resume state saved"
        );
        Ok(())
    }

    /// Load state from `path` under a shared lock
    pub fn load(path: &Path) -> Result<Self, ResumeError> {
        let lock = RwLock::new(open_lock_file(path)?);
        let _guard = lock
            .read()
            .map_err(|e| ResumeError::LockError(format!("Failed to acquire read lock: {e}")))?;
        let state = Self::read_unlocked(path)?;
        info!(
            path = %path.display(),
            streams = state.streams.len(),
            "Resume state loaded"
        );
        Ok(state)
    }

    /// Read state without locking or creating anything; `None` when absent
    pub fn peek(path: &Path) -> Result<Option<Self>, ResumeError> {
        if !path.exists() {
            return Ok(None);
        }
        Self::read_unlocked(path).map(Some)
    }

    fn read_unlocked(path: &Path) -> Result<Self, ResumeError> {
        let metadata = std::fs::metadata(path).map_err(|e| ResumeError::IoError(e.to_string()))?;
        if metadata.len() > MAX_STATE_FILE_SIZE {
            return Err(ResumeError::StateTooLarge {
                size: metadata.len(),
                max: MAX_STATE_FILE_SIZE,
            });
        }

        let contents =
            std::fs::read_to_string(path).map_err(|e| ResumeError::IoError(e.to_string()))?;
        let state: ResumeState = serde_json::from_str(&contents).map_err(|e| {
            warn!(path = %path.display(), error = %e, "Failed to deserialize resume state");
            ResumeError::DeserializationError(e.to_string())
        })?;

        if let Err(e) = state.validate_schema_version() {
            warn!(
                found_version = %state.schema_version,
                expected_version = SCHEMA_VERSION,
                "Resume state schema version mismatch"
            );
            return Err(e);
        }
        Ok(state)
    }
}

fn open_lock_file(path: &Path) -> Result<std::fs::File, ResumeError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| ResumeError::IoError(e.to_string()))?;
    }
    let lock_path = path.with_extension("lock");
    OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(&lock_path)
        .map_err(|e| ResumeError::LockError(format!("Failed to create lock file: {e}")))
}

/// Errors related to resume state
#[derive(Debug, thiserror::Error)]
pub enum ResumeError {
    /// Schema version mismatch
    #[error("schema version mismatch: expected {expected}, found {found}")]
    SchemaVersionMismatch {
        /// Expected schema version
        expected: String,
        /// Found schema version
        found: String,
    },

    /// State file too large
    #[error("state file too large: {size} bytes (max: {max} bytes)")]
    StateTooLarge {
        /// Actual file size
        size: u64,
        /// Maximum allowed size
        max: u64,
    },

    /// State belongs to a different target
    #[error("state belongs to target {found}, expected {expected}")]
    TargetMismatch {
        /// Target being archived
        expected: String,
        /// Target recorded in the file
        found: String,
    },

    /// IO error
    #[error("IO error: {0}")]
    IoError(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    SerializationError(String),

    /// Deserialization error
    #[error("deserialization error: {0}")]
    DeserializationError(String),

    /// Lock error
    #[error("lock error: {0}")]
    LockError(String),
}

impl ResumeError {
    /// Whether the state file exists but cannot be trusted
    pub fn is_corrupt(&self) -> bool {
        matches!(
            self,
            ResumeError::SchemaVersionMismatch { .. }
                | ResumeError::StateTooLarge { .. }
                | ResumeError::TargetMismatch { .. }
                | ResumeError::DeserializationError(_)
        )
    }
}
