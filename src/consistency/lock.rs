//! Target lock records
//!
//! The right to mutate a target's storage tree is an explicit JSON record at
//! the target root carrying owner identity, acquisition time and heartbeat
//! time. Staleness is judged from the heartbeat, so it works the same for any
//! process sharing the storage root. Reads and rewrites of the record happen
//! under an advisory lock on a sibling guard file, and rewrites go through
//! temp-file-then-rename.
//!
//! Releasing stamps `released_at` instead of deleting the record.

use super::{ConsistencyError, ConsistencyResult};
use crate::output::write_atomic;
use crate::shutdown::ShutdownCoordinator;
use chrono::{DateTime, Utc};
use fd_lock::RwLock;
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Lock record file name at the target root
pub const LOCK_FILE_NAME: &str = "archive.lock";

/// Guard file serializing access to the lock record
pub const LOCK_GUARD_FILE_NAME: &str = "archive.lock.guard";

/// What to do when the target is already locked
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    /// Return a conflict immediately
    FailFast,
    /// Poll until the lock frees up
    Block {
        /// Delay between attempts
        poll_interval: Duration,
        /// Give up after this long, `None` to wait indefinitely
        timeout: Option<Duration>,
    },
}

impl Default for LockMode {
    fn default() -> Self {
        LockMode::FailFast
    }
}

/// Lock acquisition settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockOptions {
    /// Behavior on conflict
    pub mode: LockMode,
    /// Heartbeat age after which a held lock may be reclaimed
    pub stale_after: Duration,
    /// Interval of the background heartbeat
    pub heartbeat_interval: Duration,
}

/// Identity of a lock holder
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockOwner {
    /// Unique per orchestrator run
    pub owner_id: String,
    /// Process id
    pub pid: u32,
    /// Host name
    pub host: String,
}

impl LockOwner {
    /// Identity for a new run in this process
    pub fn current() -> Self {
        let host = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "unknown-host".to_string());
        let pid = std::process::id();
        Self {
            owner_id: format!("{host}-{pid}-{:08x}", rand::random::<u32>()),
            pid,
            host,
        }
    }
}

/// Persisted lock record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockRecord {
    /// Holder identity
    pub owner: LockOwner,
    /// Locked target storage key
    pub target: String,
    /// When the lock was taken
    pub acquired_at: DateTime<Utc>,
    /// Last sign of life from the holder
    pub heartbeat_at: DateTime<Utc>,
    /// When the holder let go; `None` while held
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub released_at: Option<DateTime<Utc>>,
}

impl LockRecord {
    fn new(owner: LockOwner, target: &str) -> Self {
        let now = Utc::now();
        Self {
            owner,
            target: target.to_string(),
            acquired_at: now,
            heartbeat_at: now,
            released_at: None,
        }
    }

    /// Whether the record denotes a live holder
    pub fn is_held(&self) -> bool {
        self.released_at.is_none()
    }

    /// Seconds since the last heartbeat
    pub fn heartbeat_age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.heartbeat_at).to_std().unwrap_or(Duration::ZERO)
    }

    /// Whether a held record is old enough to reclaim
    pub fn is_stale(&self, now: DateTime<Utc>, stale_after: Duration) -> bool {
        self.is_held() && self.heartbeat_age(now) > stale_after
    }
}

#[derive(Debug, Clone)]
struct LockPaths {
    record: PathBuf,
    guard: PathBuf,
}

impl LockPaths {
    fn new(root: &Path) -> Self {
        Self {
            record: root.join(LOCK_FILE_NAME),
            guard: root.join(LOCK_GUARD_FILE_NAME),
        }
    }

    /// Run `f` on the current record while holding the guard exclusively
    fn with_guard<T>(
        &self,
        f: impl FnOnce(Option<LockRecord>) -> ConsistencyResult<T>,
    ) -> ConsistencyResult<T> {
        let guard_file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&self.guard)
            .map_err(|e| ConsistencyError::Lock(format!("open {}: {e}", self.guard.display())))?;
        let mut lock = RwLock::new(guard_file);
        let _guard = lock
            .write()
            .map_err(|e| ConsistencyError::Lock(format!("lock {}: {e}", self.guard.display())))?;
        f(self.read()?)
    }

    fn read(&self) -> ConsistencyResult<Option<LockRecord>> {
        let contents = match std::fs::read_to_string(&self.record) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(ConsistencyError::Io(format!(
                    "read {}: {e}",
                    self.record.display()
                )))
            }
        };
        match serde_json::from_str(&contents) {
            Ok(record) => Ok(Some(record)),
            Err(e) => {
                warn!(
                    path = %self.record.display(),
                    error = %e,
                    "Unreadable lock record, treating target as unlocked"
                );
                Ok(None)
            }
        }
    }

    fn write(&self, record: &LockRecord) -> ConsistencyResult<()> {
        let json = serde_json::to_vec_pretty(record)
            .map_err(|e| ConsistencyError::Serialization(e.to_string()))?;
        write_atomic(&self.record, &json).map_err(|e| ConsistencyError::Io(e.to_string()))
    }
}

/// Current lock record under `root`, read without taking the guard
pub fn inspect(root: &Path) -> ConsistencyResult<Option<LockRecord>> {
    LockPaths::new(root).read()
}

enum Attempt {
    Acquired,
    Held(LockRecord),
}

/// Held target lock
///
/// A background task refreshes the heartbeat until [`TargetLock::release`]
/// is called. Dropping an unreleased lock releases it as well.
#[derive(Debug)]
pub struct TargetLock {
    paths: LockPaths,
    owner: LockOwner,
    target: String,
    heartbeat: Option<JoinHandle<()>>,
    released: bool,
}

impl TargetLock {
    /// Acquire the lock for `target` under `root`
    pub async fn acquire(
        root: &Path,
        target: &str,
        owner: LockOwner,
        options: &LockOptions,
        shutdown: Option<&ShutdownCoordinator>,
    ) -> ConsistencyResult<Self> {
        std::fs::create_dir_all(root)
            .map_err(|e| ConsistencyError::Io(format!("create {}: {e}", root.display())))?;
        let paths = LockPaths::new(root);
        let started = Instant::now();

        loop {
            match try_acquire(&paths, target, &owner, options.stale_after)? {
                Attempt::Acquired => {
                    info!(target_key = target, owner = %owner.owner_id, "Acquired target lock");
                    let heartbeat =
                        spawn_heartbeat(paths.clone(), owner.clone(), options.heartbeat_interval);
                    return Ok(Self {
                        paths,
                        owner,
                        target: target.to_string(),
                        heartbeat: Some(heartbeat),
                        released: false,
                    });
                }
                Attempt::Held(holder) => {
                    let conflict = || {
                        crate::metrics::record_lock_conflict();
                        ConsistencyError::Conflict {
                            target: target.to_string(),
                            owner: holder.owner.owner_id.clone(),
                            heartbeat_age_secs: holder.heartbeat_age(Utc::now()).as_secs(),
                        }
                    };
                    let LockMode::Block {
                        poll_interval,
                        timeout,
                    } = options.mode
                    else {
                        return Err(conflict());
                    };
                    if timeout.is_some_and(|t| started.elapsed() >= t) {
                        return Err(conflict());
                    }

                    debug!(
                        target_key = target,
                        holder = %holder.owner.owner_id,
                        poll_ms = poll_interval.as_millis() as u64,
                        "Target locked, waiting"
                    );
                    match shutdown {
                        Some(shutdown) => {
                            tokio::select! {
                                _ = tokio::time::sleep(poll_interval) => {},
                                _ = shutdown.wait_for_shutdown() => return Err(ConsistencyError::Cancelled),
                            }
                        }
                        None => tokio::time::sleep(poll_interval).await,
                    }
                }
            }
        }
    }

    /// Holder identity
    pub fn owner(&self) -> &LockOwner {
        &self.owner
    }

    /// Locked target storage key
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Refresh the heartbeat now
    pub fn heartbeat(&self) -> ConsistencyResult<()> {
        if refresh_heartbeat(&self.paths, &self.owner)? {
            Ok(())
        } else {
            Err(ConsistencyError::Lost {
                target: self.target.clone(),
            })
        }
    }

    /// Release the lock
    pub fn release(mut self) -> ConsistencyResult<()> {
        self.release_inner()
    }

    fn release_inner(&mut self) -> ConsistencyResult<()> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        if let Some(heartbeat) = self.heartbeat.take() {
            heartbeat.abort();
        }

        let owner = &self.owner;
        let paths = &self.paths;
        paths.with_guard(|current| match current {
            Some(mut record) if record.owner == *owner && record.is_held() => {
                record.released_at = Some(Utc::now());
                paths.write(&record)?;
                info!(target_key = %record.target, owner = %owner.owner_id, "Released target lock");
                Ok(())
            }
            other => {
                warn!(
                    target_key = %self.target,
                    owner = %owner.owner_id,
                    current_holder = ?other.map(|r| r.owner.owner_id),
                    "Lock was no longer ours at release"
                );
                Ok(())
            }
        })
    }
}

impl Drop for TargetLock {
    fn drop(&mut self) {
        if let Err(e) = self.release_inner() {
            warn!(target_key = %self.target, error = %e, "Failed to release target lock on drop");
        }
    }
}

fn try_acquire(
    paths: &LockPaths,
    target: &str,
    owner: &LockOwner,
    stale_after: Duration,
) -> ConsistencyResult<Attempt> {
    paths.with_guard(|current| {
        if let Some(existing) = current {
            let now = Utc::now();
            if existing.is_held() {
                if !existing.is_stale(now, stale_after) {
                    return Ok(Attempt::Held(existing));
                }
                warn!(
                    target_key = target,
                    previous_owner = %existing.owner.owner_id,
                    previous_host = %existing.owner.host,
                    previous_pid = existing.owner.pid,
                    heartbeat_age_secs = existing.heartbeat_age(now).as_secs(),
                    stale_after_secs = stale_after.as_secs(),
                    "Reclaiming stale target lock"
                );
                crate::metrics::record_stale_lock_reclaimed();
            }
        }
        paths.write(&LockRecord::new(owner.clone(), target))?;
        Ok(Attempt::Acquired)
    })
}

/// Stamp a new heartbeat; `false` when the record no longer belongs to `owner`
fn refresh_heartbeat(paths: &LockPaths, owner: &LockOwner) -> ConsistencyResult<bool> {
    paths.with_guard(|current| match current {
        Some(mut record) if record.owner == *owner && record.is_held() => {
            record.heartbeat_at = Utc::now();
            paths.write(&record)?;
            Ok(true)
        }
        _ => Ok(false),
    })
}

fn spawn_heartbeat(paths: LockPaths, owner: LockOwner, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            match refresh_heartbeat(&paths, &owner) {
                Ok(true) => debug!(owner = %owner.owner_id, "Lock heartbeat"),
                Ok(false) => {
                    warn!(owner = %owner.owner_id, "Target lock taken over, stopping heartbeat");
                    return;
                }
                Err(e) => warn!(owner = %owner.owner_id, error = %e, "Lock heartbeat failed"),
            }
        }
    })
}
