//! Progress reporting.
//!
//! Hooks are plain callbacks shared by the client and every update handle
//! it creates. A hook that panics is logged and skipped; it never aborts
//! the transfer that reported the progress.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, PoisonError, RwLock};

/// What a progress event describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressStatus {
    /// Bytes of an archive, or patches of a chain, are arriving
    Downloading,
    /// The patch chain was applied to the installed archive
    PatchApplied,
    /// The update archive is verified and written
    Finished,
    /// The transfer failed
    Failed,
}

/// A single progress event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    pub status: ProgressStatus,
    /// Units done so far (bytes, or patches for a chain)
    pub downloaded: u64,
    /// Total units, 0 when unknown
    pub total: u64,
}

impl Progress {
    pub fn new(status: ProgressStatus, downloaded: u64, total: u64) -> Self {
        Self {
            status,
            downloaded,
            total,
        }
    }

    /// Progress as a percentage (0.0 to 100.0).
    pub fn percentage(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            (self.downloaded as f64 / self.total as f64) * 100.0
        }
    }
}

/// Progress callback type.
pub type ProgressCallback = Arc<dyn Fn(Progress) + Send + Sync>;

/// A shared list of progress callbacks.
#[derive(Clone, Default)]
pub struct ProgressHooks {
    hooks: Arc<RwLock<Vec<ProgressCallback>>>,
}

impl ProgressHooks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register another callback. Clones of this list see it too.
    pub fn add<F>(&self, hook: F)
    where
        F: Fn(Progress) + Send + Sync + 'static,
    {
        self.hooks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(hook));
    }

    pub fn len(&self) -> usize {
        self.hooks.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Invoke every callback with `progress`.
    pub fn emit(&self, progress: Progress) {
        let hooks: Vec<ProgressCallback> = self
            .hooks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        for (index, hook) in hooks.iter().enumerate() {
            if catch_unwind(AssertUnwindSafe(|| hook(progress))).is_err() {
                tracing::error!(hook = index, status = ?progress.status, "exception in progress callback");
            }
        }
    }
}

impl std::fmt::Debug for ProgressHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressHooks").field("hooks", &self.len()).finish()
    }
}
