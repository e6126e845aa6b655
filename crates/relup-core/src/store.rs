//! Key/value persistence for keys, manifests, and repository config.
//!
//! Both the key manager and the package builder depend only on the
//! [`ManifestStore`] contract: `load` returns `None` for anything that is
//! not there, and `save` replaces the value under a key. Components get
//! the store handed in explicitly; there is no process-wide instance.
//!
//! Two implementations are provided:
//! - [`MemoryStore`] for tests and embedding
//! - [`FileStore`] which keeps one JSON document on disk

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::error::StoreError;

/// Store key of the publisher's [`AppConfig`](crate::config::AppConfig).
pub const KEY_APP_CONFIG: &str = "app_config";
/// Store key of the numbered signing key mapping.
pub const KEY_SIGNING_KEYS: &str = "signing_keys";
/// Store key of the version manifest.
pub const KEY_VERSION_META: &str = "version_meta";
/// Store key of the publisher's [`RepoConfig`](crate::config::RepoConfig).
pub const KEY_REPO_CONFIG: &str = "repo_config";

/// Directory (relative to the repository root) holding the store file.
pub const CONFIG_DIR: &str = ".relup";
/// Filename of the [`FileStore`] document.
pub const STORE_FILE: &str = "config.db";

/// String-keyed blob store.
pub trait ManifestStore: Send + Sync {
    /// Load the value stored under `key`. Missing keys are `None`, never an error.
    fn load(&self, key: &str) -> Option<Value>;

    /// Store `value` under `key`, replacing any previous value.
    fn save(&self, key: &str, value: Value) -> Result<(), StoreError>;

    /// Refresh from the backing medium before a read-modify-write.
    fn reload(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

/// Load and deserialize a value.
///
/// A value that exists but does not match `T` is treated as corrupt: it
/// is logged and reported as missing so the caller starts from an empty
/// structure.
pub fn load_typed<T: DeserializeOwned>(store: &dyn ManifestStore, key: &str) -> Option<T> {
    let value = store.load(key)?;
    match serde_json::from_value(value) {
        Ok(typed) => Some(typed),
        Err(e) => {
            tracing::error!(key, error = %e, "stored value is malformed, resetting");
            None
        }
    }
}

/// Serialize and save a value.
pub fn save_typed<T: Serialize>(
    store: &dyn ManifestStore,
    key: &str,
    value: &T,
) -> Result<(), StoreError> {
    store.save(key, serde_json::to_value(value)?)
}

/// In-memory store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    data: RwLock<BTreeMap<String, Value>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ManifestStore for MemoryStore {
    fn load(&self, key: &str) -> Option<Value> {
        self.data.read().ok()?.get(key).cloned()
    }

    fn save(&self, key: &str, value: Value) -> Result<(), StoreError> {
        self.data
            .write()
            .map_err(|_| StoreError::Poisoned)?
            .insert(key.to_string(), value);
        Ok(())
    }
}

/// Store backed by a single JSON document at `<root>/.relup/config.db`.
///
/// The whole document is read on [`open`](Self::open) and rewritten on
/// every save. Separate processes are not coordinated; callers that
/// mutate should [`reload`](ManifestStore::reload) first.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    data: RwLock<BTreeMap<String, Value>>,
}

impl FileStore {
    /// Open (or create) the store under `root`.
    pub fn open(root: &Path) -> Result<Self, StoreError> {
        let config_dir = root.join(CONFIG_DIR);
        if !config_dir.exists() {
            tracing::info!(dir = %config_dir.display(), "creating config dir");
            std::fs::create_dir_all(&config_dir)?;
        }

        let path = config_dir.join(STORE_FILE);
        let data = read_document(&path)?;
        tracing::debug!(path = %path.display(), keys = data.len(), "opened store");

        Ok(Self {
            path,
            data: RwLock::new(data),
        })
    }

    /// Path of the backing document.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, data: &BTreeMap<String, Value>) -> Result<(), StoreError> {
        let content = serde_json::to_vec_pretty(data)?;
        let tmp = self.path.with_extension("db.tmp");
        std::fs::write(&tmp, content)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl ManifestStore for FileStore {
    fn load(&self, key: &str) -> Option<Value> {
        self.data.read().ok()?.get(key).cloned()
    }

    fn save(&self, key: &str, value: Value) -> Result<(), StoreError> {
        let mut data = self.data.write().map_err(|_| StoreError::Poisoned)?;
        data.insert(key.to_string(), value);
        self.persist(&data)?;
        tracing::debug!(key, "saved store value");
        Ok(())
    }

    /// Re-read the document from disk, discarding the in-memory copy.
    fn reload(&self) -> Result<(), StoreError> {
        let fresh = read_document(&self.path)?;
        *self.data.write().map_err(|_| StoreError::Poisoned)? = fresh;
        Ok(())
    }
}

fn read_document(path: &Path) -> Result<BTreeMap<String, Value>, StoreError> {
    if !path.exists() {
        return Ok(BTreeMap::new());
    }
    let content = std::fs::read(path)?;
    match serde_json::from_slice(&content) {
        Ok(data) => Ok(data),
        Err(e) => {
            tracing::error!(path = %path.display(), error = %e, "store file is corrupt, starting empty");
            Ok(BTreeMap::new())
        }
    }
}
