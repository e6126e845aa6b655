//! Error types shared by the publisher and the client.

use thiserror::Error;

/// A version string could not be parsed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VersionError {
    /// Wrong number of dots after stripping the archive extension
    #[error("incorrect version format: expected 1, 2 or 4 dots, found {0}")]
    DotCount(usize),

    /// The dot count was fine but the fields did not match
    #[error("cannot parse version from {0:?}")]
    Malformed(String),
}

/// Errors raised by a [`ManifestStore`](crate::store::ManifestStore).
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("store lock poisoned")]
    Poisoned,
}

/// Errors raised while managing signing keys.
#[derive(Debug, Error)]
pub enum KeyError {
    #[error("invalid key encoding: {0}")]
    Encoding(String),

    #[error("invalid key material: {0}")]
    InvalidKey(String),

    #[error("invalid key count {0}")]
    InvalidCount(usize),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("manifest error: {0}")]
    Manifest(#[from] ManifestError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised while handling manifest documents.
#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("manifest root must be a JSON object")]
    NotAnObject,

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised by the binary patch codec.
#[derive(Debug, Error)]
pub enum PatchError {
    #[error("patch is truncated: {0}")]
    Truncated(&'static str),

    #[error("corrupt patch: {0}")]
    Corrupt(String),

    /// Stream (de)compression or file access failed
    #[error("patch IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration could not be loaded or saved.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}
