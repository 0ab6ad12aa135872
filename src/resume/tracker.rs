//! Shared resume state for one run

use super::state::{ResumeError, ResumeState};
use crate::fetcher::Cursor;
use crate::ContentKind;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Mutex;
use tracing::{info, warn};

/// How a run treats previously persisted cursors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResumeMode {
    /// Continue from persisted cursors; unreadable state aborts the run
    #[default]
    On,
    /// Start every stream from the beginning, still persisting progress;
    /// an unreadable state file is replaced
    Off,
    /// Discard any existing state, readable or not, and start over
    Reset,
}

impl fmt::Display for ResumeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ResumeMode::On => "on",
            ResumeMode::Off => "off",
            ResumeMode::Reset => "reset",
        })
    }
}

impl FromStr for ResumeMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "on" | "true" | "yes" => Ok(ResumeMode::On),
            "off" | "false" | "no" => Ok(ResumeMode::Off),
            "reset" => Ok(ResumeMode::Reset),
            _ => Err(format!(
                "Invalid resume mode: {s}. Valid options: on, off, reset"
            )),
        }
    }
}

/// Resume state guarded for concurrent tasks, saved after every page
#[derive(Debug)]
pub struct ResumeTracker {
    path: PathBuf,
    mode: ResumeMode,
    state: Mutex<ResumeState>,
}

impl ResumeTracker {
    /// Load or create the state at `path` for the target `target`
    pub fn open(path: &Path, target: &str, mode: ResumeMode) -> Result<Self, ResumeError> {
        let state = match mode {
            ResumeMode::Reset => {
                if path.exists() {
                    warn!(path = %path.display(), "Discarding existing resume state on request");
                }
                ResumeState::new(target)
            }
            ResumeMode::On | ResumeMode::Off if !path.exists() => ResumeState::new(target),
            ResumeMode::On => {
                let state = ResumeState::load(path)?;
                if state.target() != target {
                    return Err(ResumeError::TargetMismatch {
                        expected: target.to_string(),
                        found: state.target().to_string(),
                    });
                }
                state
            }
            ResumeMode::Off => match ResumeState::load(path) {
                Ok(state) if state.target() == target => state,
                Ok(_) => ResumeState::new(target),
                Err(e) if e.is_corrupt() => {
                    warn!(path = %path.display(), error = %e, "Ignoring unreadable resume state");
                    ResumeState::new(target)
                }
                Err(e) => return Err(e),
            },
        };

        info!(
            path = %path.display(),
            mode = %mode,
            streams = state.streams().len(),
            "Resume tracker ready"
        );
        Ok(Self {
            path: path.to_path_buf(),
            mode,
            state: Mutex::new(state),
        })
    }

    /// Resume mode of this run
    pub fn mode(&self) -> ResumeMode {
        self.mode
    }

    /// State file path
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, ResumeState>, ResumeError> {
        self.state
            .lock()
            .map_err(|_| ResumeError::LockError("resume state mutex poisoned".to_string()))
    }

    /// Cursor the stream of `kind` starts from in this run
    pub fn start_cursor(&self, kind: ContentKind) -> Result<Option<Cursor>, ResumeError> {
        if self.mode != ResumeMode::On {
            return Ok(None);
        }
        Ok(self.lock()?.start_cursor(kind))
    }

    /// Persist progress after a page of `kind` was durably handled
    pub fn advance(
        &self,
        kind: ContentKind,
        cursor: Option<Cursor>,
        items: u64,
        completed: bool,
    ) -> Result<(), ResumeError> {
        let mut state = self.lock()?;
        state.record_page(kind, cursor, items, completed);
        state.save(&self.path)
    }

    /// Copy of the current state
    pub fn snapshot(&self) -> Result<ResumeState, ResumeError> {
        Ok(self.lock()?.clone())
    }

    /// Save the current state
    pub fn flush(&self) -> Result<(), ResumeError> {
        self.lock()?.save(&self.path)
    }
}
