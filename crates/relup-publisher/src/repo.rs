//! A publishing repository on disk: store, working directories, and the
//! client configuration exported for the shipped application.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use relup_core::keys::DEFAULT_KEY_BATCH;
use relup_core::store::{load_typed, save_typed, KEY_APP_CONFIG};
use relup_core::{AppConfig, FileStore, KeyManager, ManifestStore};

use crate::builder::{ManifestBuilder, ProcessReport, RepoDirs};
use crate::error::PublishError;

/// Client configuration written next to the repository store.
pub const CLIENT_CONFIG_FILE: &str = "client_config.toml";

/// An opened repository.
pub struct Repository {
    store: Arc<FileStore>,
    dirs: RepoDirs,
}

impl Repository {
    /// Open the repository rooted at `root`. Nothing is created except
    /// the store directory.
    pub fn open(root: &Path) -> Result<Self, PublishError> {
        let store = Arc::new(FileStore::open(root)?);
        Ok(Self {
            store,
            dirs: RepoDirs::new(root),
        })
    }

    pub fn dirs(&self) -> &RepoDirs {
        &self.dirs
    }

    pub fn store(&self) -> Arc<dyn ManifestStore> {
        self.store.clone()
    }

    /// Path of the exported client configuration.
    pub fn client_config_path(&self) -> PathBuf {
        self.dirs.root.join(CLIENT_CONFIG_FILE)
    }

    /// The stored application config, if the repository is initialized.
    pub fn app_config(&self) -> Option<AppConfig> {
        load_typed(self.store.as_ref(), KEY_APP_CONFIG)
    }

    fn require_config(&self) -> Result<AppConfig, PublishError> {
        self.app_config()
            .ok_or_else(|| PublishError::NotInitialized(self.dirs.root.display().to_string()))
    }

    pub fn key_manager(&self) -> KeyManager {
        KeyManager::new(self.store(), self.dirs.deploy_dir.clone())
    }

    /// Create directories, the first key batch, and the configuration.
    /// Returns `false` when the repository was already initialized.
    pub fn init(&self, mut config: AppConfig) -> Result<bool, PublishError> {
        self.store.reload()?;
        if self.app_config().is_some() {
            tracing::warn!(root = %self.dirs.root.display(), "repository already initialized");
            return Ok(false);
        }

        self.dirs.create()?;
        let keys = self.key_manager();
        if keys.public_keys().is_empty() {
            keys.create_keys(DEFAULT_KEY_BATCH)?;
        }
        config.public_keys = keys.public_keys();
        self.save_config(&config)?;
        tracing::info!(app = %config.app_name, "initialized repository");
        Ok(true)
    }

    /// Create `count` keys and re-export the trusted key list.
    pub fn make_keys(&self, count: usize) -> Result<Vec<u32>, PublishError> {
        self.store.reload()?;
        self.require_config()?;
        let ids = self.key_manager().create_keys(count)?;
        self.sync_public_keys()?;
        Ok(ids)
    }

    /// Revoke the `count` oldest keys and re-export the trusted key list.
    pub fn revoke_keys(&self, count: usize) -> Result<Vec<u32>, PublishError> {
        self.store.reload()?;
        self.require_config()?;
        let revoked = self.key_manager().revoke(count)?;
        self.sync_public_keys()?;
        Ok(revoked)
    }

    /// Process the `new` directory into the manifest.
    pub fn process_packages(&self) -> Result<ProcessReport, PublishError> {
        let config = self.require_config()?;
        let builder = ManifestBuilder::new(self.store(), self.dirs.clone(), config.patch_support)?;
        builder.process(&self.dirs.new_dir)
    }

    /// Sign the manifest and publish `versions.gz`. Returns the number of
    /// signatures.
    pub fn sign(&self) -> Result<usize, PublishError> {
        self.store.reload()?;
        self.require_config()?;
        let keys = self.key_manager();
        let before = keys.public_keys();
        let signed = keys.sign()?;
        if keys.public_keys() != before {
            self.sync_public_keys()?;
        }
        Ok(signed
            .get(relup_core::manifest::SIGS_KEY)
            .and_then(|sigs| sigs.as_array())
            .map_or(0, Vec::len))
    }

    fn sync_public_keys(&self) -> Result<(), PublishError> {
        let mut config = self.require_config()?;
        config.public_keys = self.key_manager().public_keys();
        self.save_config(&config)
    }

    fn save_config(&self, config: &AppConfig) -> Result<(), PublishError> {
        save_typed(self.store.as_ref(), KEY_APP_CONFIG, config)?;
        config.save_to_file(&self.client_config_path())?;
        tracing::debug!(path = %self.client_config_path().display(), "wrote client config");
        Ok(())
    }
}
