//! Release archive inspection.
//!
//! Archive names follow `<name>-<platform>-<version>.<ext>`, for example
//! `jms-mac-0.1.0.tar.gz`. Anything that does not fit is rejected with a
//! reason instead of failing the batch.

use std::fmt;
use std::path::{Path, PathBuf};

use relup_core::hash::file_sha256_hex;
use relup_core::manifest::ReleaseEntry;
use relup_core::version::strip_archive_extension;
use relup_core::{parse_platform, Version};

/// Extensions accepted as release archives (`.gz` covers `.tar.gz`).
pub const SUPPORTED_EXTENSIONS: &[&str] = &["zip", "gz"];

/// An accepted release archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageArtifact {
    pub name: String,
    pub version: Version,
    pub platform: String,
    pub filename: String,
    pub path: PathBuf,
    pub file_hash: String,
    pub patch_name: Option<String>,
    pub patch_hash: Option<String>,
}

/// A file that was skipped, and why.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedArtifact {
    pub filename: String,
    pub reason: String,
}

impl RejectedArtifact {
    fn new(filename: &str, reason: impl Into<String>) -> Self {
        let reason = reason.into();
        tracing::warn!(filename, reason = %reason, "rejected package");
        Self {
            filename: filename.to_string(),
            reason,
        }
    }
}

impl fmt::Display for RejectedArtifact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.filename, self.reason)
    }
}

impl PackageArtifact {
    /// Extract name, version, platform and hash from an archive on disk.
    pub fn inspect(path: &Path) -> Result<Self, RejectedArtifact> {
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        if !path.is_file() {
            return Err(RejectedArtifact::new(&filename, "Package does not exist"));
        }
        if filename.starts_with('.') {
            return Err(RejectedArtifact::new(
                &filename,
                format!("Ignored file: {filename}"),
            ));
        }

        let extension = path
            .extension()
            .map(|e| e.to_string_lossy().to_lowercase())
            .unwrap_or_default();
        if !SUPPORTED_EXTENSIONS.contains(&extension.as_str()) {
            return Err(RejectedArtifact::new(
                &filename,
                format!("Not a supported archive format: {filename}"),
            ));
        }

        tracing::info!(filename = %filename, "extracting update archive info");
        let version = Version::parse(&filename).map_err(|e| {
            tracing::debug!(error = %e, "version parse failed");
            RejectedArtifact::new(&filename, "Package version not formatted correctly")
        })?;

        let platform = parse_platform(&filename).ok_or_else(|| {
            RejectedArtifact::new(&filename, "Package platform not formatted correctly")
        })?;

        let name = package_name(&filename);
        if name.is_empty() {
            return Err(RejectedArtifact::new(&filename, "Package name is empty"));
        }

        let file_hash = file_sha256_hex(path)
            .map_err(|e| RejectedArtifact::new(&filename, format!("Cannot hash package: {e}")))?;

        Ok(Self {
            name,
            version,
            platform: platform.to_string(),
            filename,
            path: path.to_path_buf(),
            file_hash,
            patch_name: None,
            patch_hash: None,
        })
    }

    /// The manifest entry for this archive.
    pub fn to_entry(&self) -> ReleaseEntry {
        let mut entry = ReleaseEntry::new(&self.filename, &self.file_hash);
        if let (Some(name), Some(hash)) = (&self.patch_name, &self.patch_hash) {
            entry.patch_name = Some(name.clone());
            entry.patch_hash = Some(hash.clone());
        }
        entry
    }
}

/// `jms-mac-0.1.0.tar.gz` → `jms`.
// App names containing '-' are not supported.
fn package_name(filename: &str) -> String {
    strip_archive_extension(filename)
        .split('-')
        .next()
        .unwrap_or_default()
        .to_string()
}
