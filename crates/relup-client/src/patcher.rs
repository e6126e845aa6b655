//! Patch-chain updates.
//!
//! A chain turns the installed archive into the latest one by applying,
//! in ascending version order, the patch recorded for every version in
//! between. The chain runs in memory; nothing is written unless the
//! final bytes hash to the manifest's value for the target version.

use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use relup_core::hash::{sha256_hex, verify_bytes};
use relup_core::{patch, Manifest, Version};

use crate::download::Downloader;
use crate::error::UpdateError;
use crate::progress::{Progress, ProgressHooks, ProgressStatus};

/// One hop of a chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchStep {
    /// Version this patch produces
    pub version: Version,
    pub patch_name: String,
    pub patch_hash: String,
}

/// Everything needed to patch from the installed archive to a target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchPlan {
    /// Installed archive the chain starts from
    pub base_path: PathBuf,
    pub base_hash: String,
    pub steps: Vec<PatchStep>,
    pub target_hash: String,
}

impl PatchPlan {
    /// Plan a chain from `current` to `target` for `platform`.
    ///
    /// Returns `None` when the installed archive is missing from
    /// `update_dir` or any hop lacks patch metadata.
    pub fn build(
        manifest: &Manifest,
        name: &str,
        current: &Version,
        target: &Version,
        platform: &str,
        update_dir: &Path,
    ) -> Option<Self> {
        let Some(installed) = manifest.release(name, current, platform) else {
            debug!(name, version = %current, platform, "installed version not in manifest");
            return None;
        };
        let base_path = update_dir.join(&installed.filename);
        if !base_path.is_file() {
            debug!(path = %base_path.display(), "cannot find archive to patch");
            return None;
        }

        let mut steps = Vec::new();
        for version in manifest.versions(name) {
            if version <= *current || version > *target {
                continue;
            }
            // Versions published only for other platforms are not hops.
            let Some(entry) = manifest.release(name, &version, platform) else {
                continue;
            };
            let Some((patch_name, patch_hash)) = entry.patch() else {
                warn!(name, version = %version, platform, "missing required patch meta-data");
                return None;
            };
            steps.push(PatchStep {
                version,
                patch_name: patch_name.to_string(),
                patch_hash: patch_hash.to_string(),
            });
        }

        let target_entry = manifest.release(name, target, platform)?;
        if steps.last().map(|step| &step.version) != Some(target) {
            debug!(name, version = %target, "no patch chain reaches the target version");
            return None;
        }

        Some(Self {
            base_path,
            base_hash: installed.file_hash.clone(),
            steps,
            target_hash: target_entry.file_hash.clone(),
        })
    }

    /// Verify the installed archive, download every patch, apply the
    /// chain, and return the verified target bytes.
    pub async fn run(
        &self,
        downloader: &Downloader,
        hooks: &ProgressHooks,
    ) -> Result<Vec<u8>, UpdateError> {
        let base = tokio::fs::read(&self.base_path).await?;
        if !verify_bytes(&base, &self.base_hash) {
            warn!(path = %self.base_path.display(), "installed archive hash mismatch");
            return Err(UpdateError::HashMismatch {
                expected: self.base_hash.clone(),
                actual: sha256_hex(&base),
            });
        }
        debug!(path = %self.base_path.display(), "installed archive verified");

        let total = self.steps.len() as u64;
        let mut patches = Vec::with_capacity(self.steps.len());
        for step in &self.steps {
            match downloader.fetch_verified(&step.patch_name, &step.patch_hash).await {
                Ok(data) => {
                    patches.push(data);
                    hooks.emit(Progress::new(ProgressStatus::Downloading, patches.len() as u64, total));
                }
                Err(e) => {
                    hooks.emit(Progress::new(ProgressStatus::Failed, patches.len() as u64, total));
                    return Err(UpdateError::PatchChainFailed(format!(
                        "cannot download {}: {e}",
                        step.patch_name
                    )));
                }
            }
        }

        let updated = patch::apply_chain(&base, patches.iter().map(Vec::as_slice))?;
        if !verify_bytes(&updated, &self.target_hash) {
            warn!("patched archive hash mismatch");
            return Err(UpdateError::HashMismatch {
                expected: self.target_hash.clone(),
                actual: sha256_hex(&updated),
            });
        }

        hooks.emit(Progress::new(ProgressStatus::PatchApplied, total, total));
        info!(patches = total, "patch chain applied");
        Ok(updated)
    }
}
