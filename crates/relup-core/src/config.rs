//! Typed configuration for publishers and clients.
//!
//! [`AppConfig`] is shared by both sides: the publisher records it in its
//! store, the client embeds the same values (update URLs and trusted
//! public keys) in the shipped application. [`RepoConfig`] is publisher
//! state: the per-app patch sequence counters.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Application update settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppConfig {
    /// Name of the application, matching archive name prefixes
    #[serde(default)]
    pub app_name: String,

    /// Publisher name, used for per-user data directories
    #[serde(default)]
    pub company_name: String,

    /// Base URLs serving the deploy directory, tried in order
    #[serde(default)]
    pub update_urls: Vec<String>,

    /// Trusted manifest signing keys (base64 Ed25519)
    #[serde(default)]
    pub public_keys: Vec<String>,

    /// Whether to verify TLS certificates when downloading
    #[serde(default = "default_true")]
    pub verify_tls: bool,

    /// Whether clients may update through binary patches
    #[serde(default = "default_true")]
    pub patch_support: bool,

    /// Override for the local data directory
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            app_name: String::new(),
            company_name: String::new(),
            update_urls: Vec::new(),
            public_keys: Vec::new(),
            verify_tls: true,
            patch_support: true,
            data_dir: None,
        }
    }
}

impl AppConfig {
    /// Load configuration from a TOML file.
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| ConfigError::Invalid(e.to_string()))
    }

    /// Save configuration to a TOML file.
    pub fn save_to_file(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self).map_err(|e| ConfigError::Invalid(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Update URLs with a trailing `/`, duplicates removed, order kept.
    pub fn sanitized_update_urls(&self) -> Vec<String> {
        let mut urls: Vec<String> = Vec::with_capacity(self.update_urls.len());
        for url in &self.update_urls {
            let url = url.trim();
            if url.is_empty() {
                continue;
            }
            let url = if url.ends_with('/') {
                url.to_string()
            } else {
                format!("{url}/")
            };
            if !urls.contains(&url) {
                urls.push(url);
            }
        }
        urls
    }

    /// Public keys with duplicates removed, order kept.
    pub fn trusted_public_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = Vec::with_capacity(self.public_keys.len());
        for key in &self.public_keys {
            if !keys.contains(key) {
                keys.push(key.clone());
            }
        }
        keys
    }
}

/// Publisher-side package processing state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoConfig {
    /// Seed for patch numbering; the first patch of an app is `patch_start + 1`
    #[serde(default = "default_patch_start")]
    pub patch_start: u64,

    /// app → last issued patch number
    #[serde(default)]
    pub patches: BTreeMap<String, u64>,
}

impl Default for RepoConfig {
    fn default() -> Self {
        Self {
            patch_start: default_patch_start(),
            patches: BTreeMap::new(),
        }
    }
}

impl RepoConfig {
    /// Issue the next patch number for `name`.
    pub fn next_patch_number(&mut self, name: &str) -> u64 {
        let next = self
            .patches
            .get(name)
            .copied()
            .unwrap_or(self.patch_start)
            + 1;
        self.patches.insert(name.to_string(), next);
        next
    }
}

fn default_true() -> bool {
    true
}

fn default_patch_start() -> u64 {
    100
}
