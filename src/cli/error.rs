//! CLI error types and conversions

use crate::consistency::ConsistencyError;
use crate::downloader::DownloadError;
use crate::fetcher::FetcherError;
use crate::resume::ResumeError;

/// CLI errors
#[derive(Debug, thiserror::Error)]
pub enum CliError {
    /// Archive run error
    #[error("archive error: {0}")]
    Download(#[from] DownloadError),

    /// Remote client setup error
    #[error("fetcher error: {0}")]
    Fetcher(#[from] FetcherError),

    /// Resume state error
    #[error("resume error: {0}")]
    Resume(#[from] ResumeError),

    /// Dedup index error
    #[error("consistency error: {0}")]
    Consistency(#[from] ConsistencyError),

    /// Summary could not be encoded
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid argument
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Configuration(String),
}
