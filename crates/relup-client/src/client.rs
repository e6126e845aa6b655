//! The update client embedded in a shipped application.
//!
//! ```text
//! Uninitialized --refresh--> ManifestLoaded { verified }
//! ManifestLoaded --check--> UpdateAvailable | NoUpdate
//! any failure to obtain a manifest --> Error
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use directories::ProjectDirs;
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use relup_core::manifest::decompress;
use relup_core::{current_platform, AppConfig, Manifest, ManifestVerifier, Version, VERSION_FILE};

use crate::download::Downloader;
use crate::error::UpdateError;
use crate::fetch::{Fetcher, HttpFetcher};
use crate::progress::{Progress, ProgressHooks};
use crate::update::{UpdateHandle, UpdateTarget};

/// Folder below the data directory that receives update archives.
pub const UPDATE_FOLDER: &str = "update";

/// Current state of the update client.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ClientState {
    /// No manifest has been loaded yet
    #[default]
    Uninitialized,
    /// A manifest is loaded; only a verified one is trusted
    ManifestLoaded { verified: bool },
    /// The last check found a newer version
    UpdateAvailable,
    /// The last check found nothing newer
    NoUpdate,
    /// No usable manifest could be obtained
    Error(String),
}

#[derive(Debug, Clone)]
struct LoadedManifest {
    manifest: Manifest,
    verified: bool,
}

/// Finds and downloads updates for one application.
pub struct UpdateClient {
    config: AppConfig,
    data_dir: PathBuf,
    update_dir: PathBuf,
    platform: String,
    fetcher: Arc<dyn Fetcher>,
    verifier: ManifestVerifier,
    hooks: ProgressHooks,
    state: RwLock<ClientState>,
    loaded: RwLock<Option<LoadedManifest>>,
}

impl UpdateClient {
    /// Create a client that downloads over HTTP(S).
    pub fn new(config: AppConfig) -> Result<Self, UpdateError> {
        let fetcher = Arc::new(HttpFetcher::new(config.verify_tls)?);
        Self::with_fetcher(config, fetcher)
    }

    /// Create a client with a custom transport.
    ///
    /// Creates the data directory and its update folder.
    pub fn with_fetcher(config: AppConfig, fetcher: Arc<dyn Fetcher>) -> Result<Self, UpdateError> {
        let data_dir = match &config.data_dir {
            Some(dir) => dir.clone(),
            None => default_data_dir(&config)?,
        };
        let update_dir = data_dir.join(UPDATE_FOLDER);
        std::fs::create_dir_all(&update_dir)?;

        let urls = config.sanitized_update_urls();
        if urls.is_empty() {
            warn!(app = %config.app_name, "no update urls configured");
        }
        let verifier = ManifestVerifier::new(config.trusted_public_keys());
        debug!(data_dir = %data_dir.display(), urls = urls.len(), "update client ready");

        Ok(Self {
            config,
            data_dir,
            update_dir,
            platform: current_platform().to_string(),
            fetcher,
            verifier,
            hooks: ProgressHooks::new(),
            state: RwLock::new(ClientState::Uninitialized),
            loaded: RwLock::new(None),
        })
    }

    /// Look up updates for `platform` instead of the running one.
    pub fn with_platform(mut self, platform: impl Into<String>) -> Self {
        self.platform = platform.into();
        self
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn update_dir(&self) -> &Path {
        &self.update_dir
    }

    pub fn platform(&self) -> &str {
        &self.platform
    }

    /// Register a progress callback for every update this client creates.
    pub fn add_progress_hook<F>(&self, hook: F)
    where
        F: Fn(Progress) + Send + Sync + 'static,
    {
        self.hooks.add(hook);
    }

    /// Get the current state of the client.
    pub async fn state(&self) -> ClientState {
        self.state.read().await.clone()
    }

    /// Whether a manifest is loaded and carries a trusted signature.
    pub async fn is_verified(&self) -> bool {
        self.loaded
            .read()
            .await
            .as_ref()
            .is_some_and(|loaded| loaded.verified)
    }

    async fn set_state(&self, state: ClientState) {
        *self.state.write().await = state;
    }

    fn downloader(&self) -> Downloader {
        Downloader::new(self.fetcher.clone(), self.config.sanitized_update_urls())
    }

    fn cache_path(&self) -> PathBuf {
        self.data_dir.join(VERSION_FILE)
    }

    /// Load the manifest and verify its signatures.
    ///
    /// Falls back to the cached copy when the download fails. Returns
    /// whether a verified manifest is now loaded; failures never raise.
    pub async fn refresh(&self) -> bool {
        let json = match self.download_manifest().await {
            Some(json) => json,
            None => match self.cached_manifest().await {
                Some(json) => json,
                None => {
                    error!("no manifest available from update urls or cache");
                    *self.loaded.write().await = None;
                    self.set_state(ClientState::Error("no manifest available".to_string()))
                        .await;
                    return false;
                }
            },
        };

        let document: Value = match serde_json::from_slice(&json) {
            Ok(document) => document,
            Err(e) => {
                error!(error = %e, "manifest is not valid JSON");
                self.load_empty(format!("malformed manifest: {e}")).await;
                return false;
            }
        };

        let verified = self.verifier.verify(&document);
        let manifest = match Manifest::from_value(document) {
            Ok(manifest) => manifest,
            Err(e) => {
                error!(error = %e, "manifest has an unexpected structure");
                self.load_empty(format!("malformed manifest: {e}")).await;
                return false;
            }
        };

        if verified {
            info!("manifest loaded and verified");
        } else {
            warn!("manifest loaded but not verified, updates are disabled");
        }
        *self.loaded.write().await = Some(LoadedManifest { manifest, verified });
        self.set_state(ClientState::ManifestLoaded { verified }).await;
        verified
    }

    /// Look for a version of `name` newer than `current_version`.
    ///
    /// Returns `None` when no verified manifest is loaded, the manifest
    /// has nothing for this platform, or nothing newer is published.
    pub async fn check(&self, name: &str, current_version: &str) -> Option<UpdateHandle> {
        let current = match Version::parse(current_version) {
            Ok(version) => version,
            Err(e) => {
                error!(version = current_version, error = %e, "cannot parse current version");
                return None;
            }
        };

        let manifest = {
            let loaded = self.loaded.read().await;
            let Some(loaded) = loaded.as_ref() else {
                debug!("no update data, call refresh first");
                return None;
            };
            if !loaded.verified {
                warn!("manifest not verified, refusing to update");
                return None;
            }
            app_slice(&loaded.manifest, name)
        };

        let Some(latest) = manifest.latest_version(name, &self.platform) else {
            info!(name, platform = %self.platform, "no published versions");
            self.set_state(ClientState::NoUpdate).await;
            return None;
        };

        if latest <= current {
            info!(name, current = %current, latest = %latest, "already up to date");
            self.set_state(ClientState::NoUpdate).await;
            return None;
        }

        info!(name, current = %current, latest = %latest, "update available");
        self.set_state(ClientState::UpdateAvailable).await;
        let target = UpdateTarget {
            name: name.to_string(),
            current_version: current,
            version: latest,
            platform: self.platform.clone(),
            manifest,
            update_dir: self.update_dir.clone(),
            patch_support: self.config.patch_support,
        };
        Some(UpdateHandle::new(
            target,
            self.downloader().with_hooks(self.hooks.clone()),
        ))
    }

    /// Download and inflate `versions.gz`, caching the compressed bytes.
    async fn download_manifest(&self) -> Option<Vec<u8>> {
        let compressed = match self.downloader().fetch(VERSION_FILE).await {
            Ok(data) => data,
            Err(e) => {
                warn!(error = %e, "cannot download manifest, trying cache");
                return None;
            }
        };
        let json = match decompress(&compressed) {
            Ok(json) => json,
            Err(e) => {
                warn!(error = %e, "cannot decompress downloaded manifest, trying cache");
                return None;
            }
        };

        if let Err(e) = tokio::fs::write(self.cache_path(), &compressed).await {
            warn!(path = %self.cache_path().display(), error = %e, "cannot cache manifest");
        }
        Some(json)
    }

    async fn cached_manifest(&self) -> Option<Vec<u8>> {
        let path = self.cache_path();
        let compressed = match tokio::fs::read(&path).await {
            Ok(data) => data,
            Err(e) => {
                debug!(path = %path.display(), error = %e, "no cached manifest");
                return None;
            }
        };
        match decompress(&compressed) {
            Ok(json) => {
                info!(path = %path.display(), "using cached manifest");
                Some(json)
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "cached manifest is corrupt");
                None
            }
        }
    }

    async fn load_empty(&self, reason: String) {
        *self.loaded.write().await = Some(LoadedManifest {
            manifest: Manifest::new(),
            verified: false,
        });
        self.set_state(ClientState::Error(reason)).await;
    }
}

/// The part of `manifest` describing `name`.
fn app_slice(manifest: &Manifest, name: &str) -> Manifest {
    let mut slice = Manifest::new();
    if let Some(latest) = manifest.latest.get(name) {
        slice.latest.insert(name.to_string(), latest.clone());
    }
    if let Some(updates) = manifest.updates.get(name) {
        slice.updates.insert(name.to_string(), updates.clone());
    }
    slice
}

/// Per-user data directory for the application.
fn default_data_dir(config: &AppConfig) -> Result<PathBuf, UpdateError> {
    if config.app_name.is_empty() {
        return Err(UpdateError::ConfigError(
            "app_name is required without an explicit data_dir".to_string(),
        ));
    }
    ProjectDirs::from("", &config.company_name, &config.app_name)
        .map(|dirs| dirs.data_dir().to_path_buf())
        .ok_or_else(|| UpdateError::ConfigError("cannot determine user data directory".to_string()))
}
