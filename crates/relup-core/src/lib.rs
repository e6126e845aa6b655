//! # relup-core
//!
//! Shared building blocks of the relup self-update system.
//!
//! This crate handles:
//! - Version parsing and ordering
//! - Signing key creation, rotation, and revocation
//! - The version manifest, its canonical signing payload, and verification
//! - BSDIFF40 binary patches (diff and apply)
//! - SHA-256 content hashes
//! - Typed configuration and the key/value store both sides persist into
//!
//! ## Security
//!
//! - Manifests are signed by every active key and accepted when any
//!   trusted key verifies any signature
//! - Archives and patches are identified by SHA-256 and compared in
//!   constant time

pub mod config;
pub mod error;
pub mod hash;
pub mod keys;
pub mod manifest;
pub mod patch;
pub mod platform;
#[cfg(test)]
mod proptests;
pub mod store;
pub mod version;

// Re-export main types for convenience
pub use config::{AppConfig, RepoConfig};
pub use error::{ConfigError, KeyError, ManifestError, PatchError, StoreError, VersionError};
pub use keys::{KeyManager, KeyRecord, KeyStatus};
pub use manifest::{Manifest, ManifestVerifier, ReleaseEntry, VERSION_FILE};
pub use platform::{current_platform, parse_platform};
pub use store::{FileStore, ManifestStore, MemoryStore};
pub use version::{ReleaseStage, Version};
