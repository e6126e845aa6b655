//! Error types for the update client.

use thiserror::Error;

use relup_core::PatchError;

/// Errors that can occur while fetching or installing an update.
#[derive(Debug, Error)]
pub enum UpdateError {
    /// HTTP request error
    #[error("HTTP error: {0}")]
    HttpError(String),

    /// Download failed with HTTP status
    #[error("download failed with status {status}")]
    DownloadFailed { status: u16 },

    /// Network error while streaming a body
    #[error("network error: {0}")]
    NetworkError(String),

    /// No update URL served the requested file
    #[error("{0} is not available from any update URL")]
    Unavailable(String),

    /// Downloaded or installed bytes do not match the manifest hash
    #[error("hash mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: String, actual: String },

    /// A patch could not be fetched or applied
    #[error("patch chain failed: {0}")]
    PatchChainFailed(String),

    /// A transfer is already running for this update
    #[error("an update transfer is already in progress")]
    AlreadyInProgress,

    /// A blocking transfer was requested from inside an async runtime
    #[error("blocking download called from inside an async runtime, use download() instead")]
    BlockingInRuntime,

    /// The manifest has no entry for the requested release
    #[error("no update data for {name} {version} on {platform}")]
    NoUpdateData {
        name: String,
        version: String,
        platform: String,
    },

    /// Configuration error
    #[error("configuration error: {0}")]
    ConfigError(String),

    /// IO error
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl From<reqwest::Error> for UpdateError {
    fn from(err: reqwest::Error) -> Self {
        UpdateError::HttpError(err.to_string())
    }
}

impl From<PatchError> for UpdateError {
    fn from(err: PatchError) -> Self {
        UpdateError::PatchChainFailed(err.to_string())
    }
}
