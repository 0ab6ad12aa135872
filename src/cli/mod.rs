//! CLI command implementations
//!
//! The command line is a thin adapter: it parses arguments and environment
//! into an [`crate::downloader::ArchiveJob`] and renders the run summary.

pub mod archive;
pub mod error;
pub mod status;

pub use archive::{exit_code, ArchiveArgs, Cli, Commands, OutputFormat};
pub use error::CliError;
pub use status::{StatusArgs, TargetStatus};
