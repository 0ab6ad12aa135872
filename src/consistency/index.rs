//! Append-only dedup index
//!
//! One JSON line per [`DownloadRecord`] in `downloaded.jsonl` at the target
//! root. Every operation takes an advisory lock on the index file for its
//! critical section only, then folds in lines appended since the last read
//! (possibly by another process) before answering. The index only grows.

use super::{ConsistencyError, ConsistencyResult};
use crate::ContentKind;
use chrono::{DateTime, Utc};
use fd_lock::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, warn};

/// Index file name at the target root
pub const INDEX_FILE_NAME: &str = "downloaded.jsonl";

/// Identity of one archived item
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RecordKey {
    /// Target storage key
    pub target: String,
    /// Content kind
    pub kind: ContentKind,
    /// Item id within kind
    pub item_id: String,
}

impl RecordKey {
    /// Create a key
    pub fn new(target: impl Into<String>, kind: ContentKind, item_id: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            kind,
            item_id: item_id.into(),
        }
    }

    fn index_key(&self) -> String {
        format!("{}/{}/{}", self.target, self.kind, self.item_id)
    }
}

/// Durable proof that one item was processed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadRecord {
    /// Item identity
    #[serde(flatten)]
    pub key: RecordKey,
    /// SHA-256 of the payload, hex encoded
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    /// Payload size in bytes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    /// Payload path relative to the target root
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// Whether only a reference to the payload was archived
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub reference_only: bool,
    /// When the record was appended
    pub recorded_at: DateTime<Utc>,
}

impl DownloadRecord {
    /// Record for an item without payload
    pub fn new(key: RecordKey) -> Self {
        Self {
            key,
            checksum: None,
            size: None,
            path: None,
            reference_only: false,
            recorded_at: Utc::now(),
        }
    }

    /// Attach payload details
    pub fn with_payload(mut self, checksum: String, size: u64, path: impl Into<String>) -> Self {
        self.checksum = Some(checksum);
        self.size = Some(size);
        self.path = Some(path.into());
        self
    }

    /// Mark the payload as archived by reference only
    pub fn reference_only(mut self) -> Self {
        self.reference_only = true;
        self
    }
}

#[derive(Debug, Default)]
struct IndexCache {
    records: HashMap<String, DownloadRecord>,
    read_offset: u64,
    torn_tail: bool,
}

impl IndexCache {
    /// Fold in complete lines past `read_offset`
    fn refresh(&mut self, mut file: &File, path: &Path) -> ConsistencyResult<()> {
        file.seek(SeekFrom::Start(self.read_offset))
            .map_err(|e| ConsistencyError::Io(format!("seek {}: {e}", path.display())))?;
        let mut appended = Vec::new();
        file.read_to_end(&mut appended)
            .map_err(|e| ConsistencyError::Io(format!("read {}: {e}", path.display())))?;

        let complete = match appended.iter().rposition(|b| *b == b'\n') {
            Some(last_newline) => last_newline + 1,
            None => 0,
        };
        self.torn_tail = complete < appended.len();

        for line in appended[..complete].split(|b| *b == b'\n') {
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            match serde_json::from_slice::<DownloadRecord>(line) {
                Ok(record) => {
                    self.records.insert(record.key.index_key(), record);
                }
                Err(e) => warn!(
                    path = %path.display(),
                    error = %e,
                    "Skipping unreadable index line; its item will be fetched again"
                ),
            }
        }
        self.read_offset += complete as u64;
        Ok(())
    }
}

/// Dedup index backed by a JSON-lines file
#[derive(Debug)]
pub struct DownloadIndex {
    path: PathBuf,
    cache: Mutex<IndexCache>,
}

impl DownloadIndex {
    /// Open or create the index at `path`
    pub fn open(path: impl Into<PathBuf>) -> ConsistencyResult<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| ConsistencyError::Io(format!("create {}: {e}", parent.display())))?;
        }
        let index = Self {
            path,
            cache: Mutex::new(IndexCache::default()),
        };
        index.with_shared(|_| Ok(()))?;
        debug!(path = %index.path.display(), records = index.len()?, "Opened dedup index");
        Ok(index)
    }

    /// Count records per kind in an existing index without creating or locking anything
    pub fn scan(path: &Path) -> ConsistencyResult<BTreeMap<ContentKind, u64>> {
        let mut counts = BTreeMap::new();
        if !path.exists() {
            return Ok(counts);
        }
        let file = File::open(path)
            .map_err(|e| ConsistencyError::Io(format!("open {}: {e}", path.display())))?;
        let mut cache = IndexCache::default();
        cache.refresh(&file, path)?;
        for record in cache.records.values() {
            *counts.entry(record.key.kind).or_insert(0) += 1;
        }
        Ok(counts)
    }

    /// Index file path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether `key` is recorded
    pub fn contains(&self, key: &RecordKey) -> ConsistencyResult<bool> {
        let index_key = key.index_key();
        self.with_shared(|cache| Ok(cache.records.contains_key(&index_key)))
    }

    /// Recorded entry for `key`
    pub fn get(&self, key: &RecordKey) -> ConsistencyResult<Option<DownloadRecord>> {
        let index_key = key.index_key();
        self.with_shared(|cache| Ok(cache.records.get(&index_key).cloned()))
    }

    /// Number of records
    pub fn len(&self) -> ConsistencyResult<usize> {
        let cache = self.lock_cache()?;
        Ok(cache.records.len())
    }

    /// Whether the index holds no records
    pub fn is_empty(&self) -> ConsistencyResult<bool> {
        Ok(self.len()? == 0)
    }

    /// Records of `kind`
    pub fn count_kind(&self, kind: ContentKind) -> ConsistencyResult<u64> {
        self.with_shared(|cache| {
            Ok(cache
                .records
                .values()
                .filter(|record| record.key.kind == kind)
                .count() as u64)
        })
    }

    /// Append `record` unless its key is already present
    ///
    /// Check and append happen under one exclusive lock, so of two racing
    /// writers exactly one gets `true`.
    pub fn insert(&self, record: DownloadRecord) -> ConsistencyResult<bool> {
        let index_key = record.key.index_key();
        let mut cache = self.lock_cache()?;
        let file = self.open_file()?;
        let mut lock = RwLock::new(file);
        let mut guard = lock
            .write()
            .map_err(|e| ConsistencyError::Lock(format!("index write lock: {e}")))?;

        cache.refresh(&guard, &self.path)?;
        if cache.records.contains_key(&index_key) {
            return Ok(false);
        }

        let mut line = serde_json::to_vec(&record)
            .map_err(|e| ConsistencyError::Serialization(e.to_string()))?;
        line.push(b'\n');
        if cache.torn_tail {
            // Terminate a line left torn by a crash so ours parses on its own.
            line.insert(0, b'\n');
        }

        let file: &mut File = &mut guard;
        file.write_all(&line)
            .and_then(|()| file.sync_data())
            .map_err(|e| ConsistencyError::Io(format!("append {}: {e}", self.path.display())))?;

        // Our own line is consumed on the next refresh like anyone else's.
        cache.refresh(&guard, &self.path)?;
        debug!(key = %index_key, "Recorded download");
        Ok(true)
    }

    fn with_shared<T>(
        &self,
        f: impl FnOnce(&IndexCache) -> ConsistencyResult<T>,
    ) -> ConsistencyResult<T> {
        let mut cache = self.lock_cache()?;
        let file = self.open_file()?;
        let lock = RwLock::new(file);
        let guard = lock
            .read()
            .map_err(|e| ConsistencyError::Lock(format!("index read lock: {e}")))?;
        cache.refresh(&guard, &self.path)?;
        f(&cache)
    }

    fn lock_cache(&self) -> ConsistencyResult<std::sync::MutexGuard<'_, IndexCache>> {
        self.cache
            .lock()
            .map_err(|_| ConsistencyError::Lock("index cache poisoned".to_string()))
    }

    fn open_file(&self) -> ConsistencyResult<File> {
        OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(&self.path)
            .map_err(|e| ConsistencyError::Io(format!("open {}: {e}", self.path.display())))
    }
}
