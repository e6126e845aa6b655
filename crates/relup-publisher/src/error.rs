//! Error types for the publisher.

use thiserror::Error;

use relup_core::{ConfigError, KeyError, ManifestError, PatchError, StoreError};

/// Errors raised while processing packages or managing the repository.
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("key error: {0}")]
    Key(#[from] KeyError),

    #[error("manifest error: {0}")]
    Manifest(#[from] ManifestError),

    #[error("patch error: {0}")]
    Patch(#[from] PatchError),

    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    /// The patch worker pool could not be started
    #[error("worker pool error: {0}")]
    Worker(String),

    /// The repository has not been initialized
    #[error("repository not initialized at {0}, run `relup init`")]
    NotInitialized(String),
}
