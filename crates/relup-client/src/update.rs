//! Update handles.
//!
//! An [`UpdateHandle`] is returned by
//! [`UpdateClient::check`](crate::UpdateClient::check) when a newer
//! version is published. It downloads that version into the client's
//! update folder, through a patch chain when possible and as a full
//! archive otherwise.
//!
//! At most one transfer runs per handle (clones included). A transfer is
//! either awaited with [`UpdateHandle::download`], run to completion on
//! the calling thread with [`UpdateHandle::download_blocking`], or run on
//! a background worker with [`UpdateHandle::start`] and polled with
//! [`UpdateHandle::is_complete`] / [`UpdateHandle::result`].

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tracing::{debug, error, info, warn};

use relup_core::{Manifest, ReleaseEntry, Version};

use crate::download::Downloader;
use crate::error::UpdateError;
use crate::patcher::PatchPlan;
use crate::progress::{Progress, ProgressHooks, ProgressStatus};

/// What a handle needs to know about the update it drives.
#[derive(Debug, Clone)]
pub(crate) struct UpdateTarget {
    pub name: String,
    pub current_version: Version,
    pub version: Version,
    pub platform: String,
    /// Manifest restricted to this application
    pub manifest: Manifest,
    pub update_dir: PathBuf,
    pub patch_support: bool,
}

/// A pending update to a newer version.
#[derive(Clone)]
pub struct UpdateHandle {
    inner: Arc<HandleInner>,
}

struct HandleInner {
    target: UpdateTarget,
    downloader: Downloader,
    hooks: ProgressHooks,
    in_flight: AtomicBool,
    completed: AtomicBool,
    outcome: Mutex<Option<Result<PathBuf, UpdateError>>>,
}

impl UpdateHandle {
    pub(crate) fn new(target: UpdateTarget, downloader: Downloader) -> Self {
        let hooks = downloader.hooks().clone();
        Self {
            inner: Arc::new(HandleInner {
                target,
                downloader,
                hooks,
                in_flight: AtomicBool::new(false),
                completed: AtomicBool::new(false),
                outcome: Mutex::new(None),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.target.name
    }

    /// Version being updated to.
    pub fn version(&self) -> &Version {
        &self.inner.target.version
    }

    /// Version installed when the update was found.
    pub fn current_version(&self) -> &Version {
        &self.inner.target.current_version
    }

    pub fn platform(&self) -> &str {
        &self.inner.target.platform
    }

    /// Base URLs the update is downloaded from.
    pub fn update_urls(&self) -> &[String] {
        self.inner.downloader.urls()
    }

    /// Manifest data for this application.
    pub fn manifest(&self) -> &Manifest {
        &self.inner.target.manifest
    }

    /// Folder the verified archive is written to.
    pub fn update_dir(&self) -> &Path {
        &self.inner.target.update_dir
    }

    /// Manifest entry of the target archive.
    pub fn release(&self) -> Option<&ReleaseEntry> {
        let target = &self.inner.target;
        target
            .manifest
            .release(&target.name, &target.version, &target.platform)
    }

    /// Path the archive is written to once downloaded.
    pub fn archive_path(&self) -> Option<PathBuf> {
        self.release()
            .map(|entry| self.inner.target.update_dir.join(&entry.filename))
    }

    /// The patch chain this update would use, if one is possible.
    pub fn patch_plan(&self) -> Option<PatchPlan> {
        let target = &self.inner.target;
        if !target.patch_support {
            return None;
        }
        PatchPlan::build(
            &target.manifest,
            &target.name,
            &target.current_version,
            &target.version,
            &target.platform,
            &target.update_dir,
        )
    }

    /// Whether a transfer is running right now.
    pub fn is_downloading(&self) -> bool {
        self.inner.in_flight.load(Ordering::Acquire)
    }

    /// Download and verify the update, returning the archive path.
    ///
    /// Fails with [`UpdateError::AlreadyInProgress`] while another
    /// transfer of this handle is running.
    pub async fn download(&self) -> Result<PathBuf, UpdateError> {
        if !self.inner.claim() {
            return Err(UpdateError::AlreadyInProgress);
        }
        let result = self.inner.transfer().await;
        self.inner.in_flight.store(false, Ordering::Release);
        result
    }

    /// Like [`download`](Self::download), blocking the calling thread.
    ///
    /// Fails with [`UpdateError::BlockingInRuntime`] when called from
    /// inside an async runtime.
    pub fn download_blocking(&self) -> Result<PathBuf, UpdateError> {
        if tokio::runtime::Handle::try_current().is_ok() {
            warn!(name = %self.name(), "blocking download requested inside an async runtime");
            return Err(UpdateError::BlockingInRuntime);
        }
        if !self.inner.claim() {
            return Err(UpdateError::AlreadyInProgress);
        }
        let result = block_on_transfer(&self.inner);
        self.inner.in_flight.store(false, Ordering::Release);
        result
    }

    /// Start the transfer on a background worker.
    ///
    /// Returns `false`, without starting anything, while a transfer is
    /// already running or when no worker thread can be spawned.
    pub fn start(&self) -> bool {
        self.start_with(spawn_worker)
    }

    fn start_with<S>(&self, spawn: S) -> bool
    where
        S: FnOnce(Arc<HandleInner>) -> std::io::Result<()>,
    {
        if !self.inner.claim() {
            warn!(name = %self.name(), "update transfer already in progress");
            return false;
        }
        self.inner.completed.store(false, Ordering::Release);
        *self.inner.lock_outcome() = None;

        if let Err(e) = spawn(self.inner.clone()) {
            error!(error = %e, "cannot start update worker");
            self.inner.in_flight.store(false, Ordering::Release);
            return false;
        }
        true
    }

    /// Whether the background transfer has finished.
    pub fn is_complete(&self) -> bool {
        self.inner.completed.load(Ordering::Acquire)
    }

    /// Take the outcome of the finished background transfer.
    ///
    /// `None` while it is still running, before [`start`](Self::start),
    /// or once the outcome has been taken.
    pub fn result(&self) -> Option<Result<PathBuf, UpdateError>> {
        if !self.is_complete() {
            return None;
        }
        self.inner.lock_outcome().take()
    }
}

impl std::fmt::Debug for UpdateHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpdateHandle")
            .field("name", &self.inner.target.name)
            .field("current_version", &self.inner.target.current_version)
            .field("version", &self.inner.target.version)
            .field("platform", &self.inner.target.platform)
            .finish()
    }
}

fn spawn_worker(inner: Arc<HandleInner>) -> std::io::Result<()> {
    std::thread::Builder::new()
        .name(format!("relup-update-{}", inner.target.name))
        .spawn(move || {
            let result = block_on_transfer(&inner);
            inner.finish(result);
        })
        .map(drop)
}

fn block_on_transfer(inner: &HandleInner) -> Result<PathBuf, UpdateError> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    runtime.block_on(inner.transfer())
}

impl HandleInner {
    fn claim(&self) -> bool {
        self.in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn lock_outcome(&self) -> std::sync::MutexGuard<'_, Option<Result<PathBuf, UpdateError>>> {
        self.outcome.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn finish(&self, result: Result<PathBuf, UpdateError>) {
        *self.lock_outcome() = Some(result);
        self.in_flight.store(false, Ordering::Release);
        self.completed.store(true, Ordering::Release);
    }

    async fn transfer(&self) -> Result<PathBuf, UpdateError> {
        let result = self.fetch_archive().await;
        match &result {
            Ok(path) => info!(path = %path.display(), version = %self.target.version, "update downloaded"),
            Err(e) => {
                error!(version = %self.target.version, error = %e, "update failed");
                self.hooks.emit(Progress::new(ProgressStatus::Failed, 0, 0));
            }
        }
        result
    }

    async fn fetch_archive(&self) -> Result<PathBuf, UpdateError> {
        let target = &self.target;
        let entry = target
            .manifest
            .release(&target.name, &target.version, &target.platform)
            .ok_or_else(|| UpdateError::NoUpdateData {
                name: target.name.clone(),
                version: target.version.to_string(),
                platform: target.platform.clone(),
            })?;

        let data = match self.patch_update().await {
            Some(data) => data,
            None => {
                info!(filename = %entry.filename, "starting full update");
                self.downloader
                    .fetch_verified(&entry.filename, &entry.file_hash)
                    .await?
            }
        };

        let path = write_verified(&target.update_dir, &entry.filename, &data).await?;
        let size = data.len() as u64;
        self.hooks
            .emit(Progress::new(ProgressStatus::Finished, size, size));
        Ok(path)
    }

    /// Bytes of the target archive through the patch chain, or `None`
    /// when a full download is needed.
    async fn patch_update(&self) -> Option<Vec<u8>> {
        let target = &self.target;
        if !target.patch_support {
            debug!("patch updates disabled");
            return None;
        }
        let plan = PatchPlan::build(
            &target.manifest,
            &target.name,
            &target.current_version,
            &target.version,
            &target.platform,
            &target.update_dir,
        )?;

        info!(patches = plan.steps.len(), "starting patch update");
        match plan.run(&self.downloader, &self.hooks).await {
            Ok(data) => Some(data),
            Err(e) => {
                warn!(error = %e, "patch update failed, falling back to full update");
                None
            }
        }
    }
}

/// Write `data` to `dir/filename` through a temporary file.
async fn write_verified(dir: &Path, filename: &str, data: &[u8]) -> Result<PathBuf, UpdateError> {
    tokio::fs::create_dir_all(dir).await?;
    let path = dir.join(filename);
    let partial = dir.join(format!(".{filename}.part"));

    if let Err(e) = tokio::fs::write(&partial, data).await {
        let _ = tokio::fs::remove_file(&partial).await;
        return Err(e.into());
    }
    tokio::fs::rename(&partial, &path).await?;
    debug!(path = %path.display(), bytes = data.len(), "wrote update archive");
    Ok(path)
}
