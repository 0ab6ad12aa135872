//! Consistency store for one target's storage tree
//!
//! Two pieces of state guard an archive against duplicates and concurrent
//! writers:
//! - [`index::DownloadIndex`]: append-only record of durably written items
//! - [`lock::TargetLock`]: the exclusive right to mutate the tree
//!
//! Both live at the target root next to the resume state.

pub mod index;
pub mod lock;

pub use index::{DownloadIndex, DownloadRecord, RecordKey, INDEX_FILE_NAME};
pub use lock::{
    inspect as inspect_lock, LockMode, LockOptions, LockOwner, LockRecord, TargetLock,
    LOCK_FILE_NAME,
};

use crate::shutdown::ShutdownCoordinator;
use crate::ContentKind;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Consistency store errors
#[derive(Error, Debug, Clone)]
pub enum ConsistencyError {
    /// Another live run holds the target lock
    #[error("target {target} is locked by {owner} (heartbeat {heartbeat_age_secs}s ago)")]
    Conflict {
        /// Target storage key
        target: String,
        /// Holder's owner id
        owner: String,
        /// Age of the holder's last heartbeat
        heartbeat_age_secs: u64,
    },

    /// The lock record was taken over while held
    #[error("target lock for {target} was lost")]
    Lost {
        /// Target storage key
        target: String,
    },

    /// Filesystem failure
    #[error("I/O error: {0}")]
    Io(String),

    /// Advisory lock failure
    #[error("lock error: {0}")]
    Lock(String),

    /// Record could not be encoded
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Stored payload no longer matches its recorded checksum
    #[error("checksum mismatch for {path}: recorded {expected}, found {actual}")]
    ChecksumMismatch {
        /// Payload path
        path: String,
        /// Recorded digest
        expected: String,
        /// Digest of the current file
        actual: String,
    },

    /// Waiting was interrupted by cancellation
    #[error("cancelled while waiting for the target lock")]
    Cancelled,
}

/// Consistency result alias
pub type ConsistencyResult<T> = Result<T, ConsistencyError>;

/// Dedup index plus lock access for one target root
#[derive(Debug)]
pub struct ConsistencyStore {
    root: PathBuf,
    target: String,
    index: DownloadIndex,
}

impl ConsistencyStore {
    /// Open the store under `root` for the target `target` storage key
    pub fn open(root: impl Into<PathBuf>, target: impl Into<String>) -> ConsistencyResult<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)
            .map_err(|e| ConsistencyError::Io(format!("create {}: {e}", root.display())))?;
        let index = DownloadIndex::open(root.join(INDEX_FILE_NAME))?;
        Ok(Self {
            root,
            target: target.into(),
            index,
        })
    }

    /// Target root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Target storage key
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Underlying index
    pub fn index(&self) -> &DownloadIndex {
        &self.index
    }

    fn key(&self, kind: ContentKind, item_id: &str) -> RecordKey {
        RecordKey::new(&self.target, kind, item_id)
    }

    /// Whether `item_id` of `kind` was already durably written
    pub fn is_downloaded(&self, kind: ContentKind, item_id: &str) -> ConsistencyResult<bool> {
        self.index.contains(&self.key(kind, item_id))
    }

    /// Record an item as written; `false` when it was already present
    ///
    /// Check and mark happen under one exclusive lock, so two concurrent
    /// callers for the same item see exactly one `true`.
    pub fn mark_downloaded(&self, record: DownloadRecord) -> ConsistencyResult<bool> {
        self.index.insert(record)
    }

    /// Build a record for `item_id` of `kind`
    pub fn record(&self, kind: ContentKind, item_id: &str) -> DownloadRecord {
        DownloadRecord::new(self.key(kind, item_id))
    }

    /// Stored record for `item_id` of `kind`
    pub fn get(&self, kind: ContentKind, item_id: &str) -> ConsistencyResult<Option<DownloadRecord>> {
        self.index.get(&self.key(kind, item_id))
    }

    /// Items recorded for `kind`
    pub fn count_for_kind(&self, kind: ContentKind) -> ConsistencyResult<u64> {
        self.index.count_kind(kind)
    }

    /// Recompute the checksum of a recorded payload and compare
    ///
    /// Records without a checksum or path verify trivially.
    pub fn verify(&self, record: &DownloadRecord) -> ConsistencyResult<()> {
        let (Some(expected), Some(relative)) = (&record.checksum, &record.path) else {
            return Ok(());
        };
        let path = self.root.join(relative);
        let bytes = std::fs::read(&path)
            .map_err(|e| ConsistencyError::Io(format!("read {}: {e}", path.display())))?;
        let actual = crate::downloader::media::sha256_hex(&bytes);
        if &actual != expected {
            return Err(ConsistencyError::ChecksumMismatch {
                path: path.display().to_string(),
                expected: expected.clone(),
                actual,
            });
        }
        Ok(())
    }

    /// Acquire the target lock
    pub async fn acquire_target_lock(
        &self,
        options: &LockOptions,
        shutdown: Option<&ShutdownCoordinator>,
    ) -> ConsistencyResult<TargetLock> {
        TargetLock::acquire(
            &self.root,
            &self.target,
            LockOwner::current(),
            options,
            shutdown,
        )
        .await
    }
}

/// Per-kind record counts under `root`, without creating anything
pub fn scan_counts(root: &Path) -> ConsistencyResult<BTreeMap<ContentKind, u64>> {
    DownloadIndex::scan(&root.join(INDEX_FILE_NAME))
}
