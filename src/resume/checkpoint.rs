//! Per-stream checkpoint

use crate::fetcher::Cursor;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Persisted progress of one (target, content kind) stream
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct StreamCheckpoint {
    /// Position to resume from; `None` is the beginning
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<Cursor>,
    /// Items handled across all runs
    #[serde(default)]
    pub items_seen: u64,
    /// Whether the last run reached the end of the stream
    #[serde(default)]
    pub completed: bool,
    /// When this stream last made progress
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run_at: Option<DateTime<Utc>>,
}

impl StreamCheckpoint {
    /// Cursor a new run should start from
    ///
    /// A completed stream starts over from the beginning so new remote items
    /// are picked up; already recorded items are skipped by the dedup index.
    pub fn start_cursor(&self) -> Option<Cursor> {
        if self.completed {
            None
        } else {
            self.cursor.clone()
        }
    }

    /// Fold in one durably handled page
    pub fn advance(&mut self, cursor: Option<Cursor>, items: u64, completed: bool) {
        self.cursor = cursor;
        self.items_seen += items;
        self.completed = completed;
        self.last_run_at = Some(Utc::now());
    }
}
