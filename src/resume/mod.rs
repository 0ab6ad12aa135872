//! Resume capability for archive runs
//!
//! Persists one cursor per content kind with atomic writes and file locking.

pub mod checkpoint;
pub mod state;
pub mod tracker;

pub use checkpoint::StreamCheckpoint;
pub use state::{ResumeError, ResumeState, MAX_STATE_FILE_SIZE};
pub use tracker::{ResumeMode, ResumeTracker};
