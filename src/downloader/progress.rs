//! Progress tracking for long-running tasks.
//!
//! Each downloader task keeps a [`ProgressState`] and emits a progress log
//! line whenever enough time has passed or the completion percentage moved
//! by a full step. Totals come from the remote's reported collection size
//! when available.

use crate::ContentKind;
use std::time::{Duration, Instant};

const DEFAULT_UPDATE_INTERVAL: Duration = Duration::from_secs(30);
const MIN_DOWNLOAD_DURATION: Duration = Duration::from_secs(10);
const DEFAULT_PERCENTAGE_STEP: f64 = 10.0;

/// Progress tracking state for one task.
#[derive(Debug, Clone)]
pub struct ProgressState {
    /// Content kind being archived.
    pub kind: ContentKind,
    /// Items handled so far (written, skipped or failed).
    pub items_handled: u64,
    /// Total expected items (if known).
    pub total_expected: Option<u64>,
    /// Timestamp when the task started.
    pub start_time: Instant,
    /// Last time progress was reported.
    pub last_update: Instant,
    /// Minimum interval between progress updates.
    pub update_interval: Duration,
    /// Current rate (items per second).
    pub current_rate: f64,
    /// Current phase, e.g. the album being fetched.
    pub current_phase: Option<String>,
    /// Last reported completion percentage.
    pub last_reported_percentage: f64,
    /// Minimum percentage delta required to emit a new update.
    pub min_percentage_step: f64,
}

impl ProgressState {
    /// Create a tracker with default intervals.
    pub fn new(kind: ContentKind) -> Self {
        let now = Instant::now();
        Self {
            kind,
            items_handled: 0,
            total_expected: None,
            start_time: now,
            last_update: now,
            update_interval: DEFAULT_UPDATE_INTERVAL,
            current_rate: 0.0,
            current_phase: None,
            last_reported_percentage: 0.0,
            min_percentage_step: DEFAULT_PERCENTAGE_STEP,
        }
    }

    /// Record newly handled items.
    pub fn update(&mut self, new_items: u64) {
        let elapsed = self.start_time.elapsed().as_secs_f64();
        self.items_handled = self.items_handled.saturating_add(new_items);
        if elapsed > 0.0 {
            self.current_rate = self.items_handled as f64 / elapsed;
        }
    }

    /// Adopt the remote's reported total when none is known yet.
    pub fn observe_total(&mut self, total: Option<u64>) {
        if self.total_expected.is_none() {
            self.total_expected = total;
        }
    }

    /// Set descriptive phase label.
    pub fn set_phase<S: Into<String>>(&mut self, phase: Option<S>) {
        self.current_phase = phase.map(|s| s.into());
    }

    /// Whether a progress update should be emitted based on time or percentage.
    pub fn should_emit_update(&self) -> bool {
        if self.items_handled == 0 {
            return false;
        }

        let percentage_jump = self
            .percentage()
            .map(|pct| pct - self.last_reported_percentage >= self.min_percentage_step)
            .unwrap_or(false);
        if percentage_jump {
            return true;
        }

        self.start_time.elapsed() >= MIN_DOWNLOAD_DURATION
            && self.last_update.elapsed() >= self.update_interval
    }

    /// Call after emitting a progress log.
    pub fn mark_emitted(&mut self) {
        self.last_update = Instant::now();
        if let Some(pct) = self.percentage() {
            self.last_reported_percentage = pct;
        }
    }

    /// Completion percentage (0-100), when the total is known.
    pub fn percentage(&self) -> Option<f64> {
        self.total_expected.map(|total| {
            if total == 0 {
                100.0
            } else {
                ((self.items_handled as f64 / total as f64) * 100.0).min(100.0)
            }
        })
    }

    /// Estimate remaining time from the current rate.
    pub fn estimate_remaining(&self) -> Option<Duration> {
        if self.current_rate <= 0.0 {
            return None;
        }
        let remaining = self.total_expected?.saturating_sub(self.items_handled);
        (remaining > 0).then(|| Duration::from_secs_f64(remaining as f64 / self.current_rate))
    }

    /// Human-readable progress string for logging.
    pub fn format_progress(&self) -> String {
        let mut parts = vec![format!(
            "[PROGRESS] {} {}",
            self.items_handled,
            self.kind.as_str()
        )];

        if let Some(pct) = self.percentage() {
            parts.push(format!("- {pct:.1}% complete"));
        }
        if let Some(phase) = &self.current_phase {
            parts.push(format!("({phase})"));
        }
        if self.current_rate > 0.0 {
            parts.push(format!("at {:.1} items/sec", self.current_rate));
        }
        if let Some(remaining) = self.estimate_remaining() {
            parts.push(format!("- ~{} remaining", format_duration(remaining)));
        }

        parts.join(" ")
    }
}

fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    if secs < 60 {
        format!("{secs}s")
    } else if secs < 3600 {
        format!("{}m", secs / 60)
    } else {
        format!("{:.1}h", secs as f64 / 3600.0)
    }
}
