//! Mirror-aware downloads with hash verification.

use std::sync::Arc;

use tracing::{info, warn};

use relup_core::hash::{sha256_hex, verify_bytes};

use crate::error::UpdateError;
use crate::fetch::Fetcher;
use crate::progress::ProgressHooks;

/// Downloads files from a list of update URLs, trying each in order.
#[derive(Clone)]
pub struct Downloader {
    fetcher: Arc<dyn Fetcher>,
    /// Base URLs, each ending in `/`
    urls: Vec<String>,
    hooks: ProgressHooks,
}

impl Downloader {
    /// `urls` must already be sanitized (trailing `/`, no duplicates).
    pub fn new(fetcher: Arc<dyn Fetcher>, urls: Vec<String>) -> Self {
        Self {
            fetcher,
            urls,
            hooks: ProgressHooks::new(),
        }
    }

    /// The same downloader, reporting byte progress to `hooks`.
    pub fn with_hooks(mut self, hooks: ProgressHooks) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn urls(&self) -> &[String] {
        &self.urls
    }

    pub fn hooks(&self) -> &ProgressHooks {
        &self.hooks
    }

    /// Fetch `filename` from the first URL that serves it.
    pub async fn fetch(&self, filename: &str) -> Result<Vec<u8>, UpdateError> {
        self.fetch_from_mirrors(filename, None).await
    }

    /// Fetch `filename` from the first URL whose bytes hash to
    /// `expected_hash`.
    pub async fn fetch_verified(
        &self,
        filename: &str,
        expected_hash: &str,
    ) -> Result<Vec<u8>, UpdateError> {
        self.fetch_from_mirrors(filename, Some(expected_hash)).await
    }

    async fn fetch_from_mirrors(
        &self,
        filename: &str,
        expected_hash: Option<&str>,
    ) -> Result<Vec<u8>, UpdateError> {
        let mut last_error = None;

        for base in &self.urls {
            let url = format!("{base}{filename}");
            match self.fetcher.fetch(&url, &self.hooks).await {
                Ok(data) => {
                    if let Some(expected) = expected_hash {
                        if !verify_bytes(&data, expected) {
                            let actual = sha256_hex(&data);
                            warn!(url = %url, expected, actual = %actual, "hash mismatch, trying next url");
                            last_error = Some(UpdateError::HashMismatch {
                                expected: expected.to_string(),
                                actual,
                            });
                            continue;
                        }
                    }
                    info!(url = %url, bytes = data.len(), "download complete");
                    return Ok(data);
                }
                Err(e) => {
                    warn!(url = %url, error = %e, "download failed, trying next url");
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| UpdateError::Unavailable(filename.to_string())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::DirectoryFetcher;
    use tempfile::TempDir;

    fn mirrors(dir: &TempDir) -> (Arc<DirectoryFetcher>, Downloader) {
        let fetcher = Arc::new(DirectoryFetcher::new("https://b.example.com/", dir.path()));
        let downloader = Downloader::new(
            fetcher.clone(),
            vec![
                "https://a.example.com/".to_string(),
                "https://b.example.com/".to_string(),
            ],
        );
        (fetcher, downloader)
    }

    #[tokio::test]
    async fn test_falls_through_to_next_url() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("app.zip"), b"archive").unwrap();
        let (fetcher, downloader) = mirrors(&dir);

        let data = downloader.fetch_verified("app.zip", &sha256_hex(b"archive")).await.unwrap();
        assert_eq!(data, b"archive");
        assert_eq!(
            fetcher.requests(),
            vec!["https://a.example.com/app.zip", "https://b.example.com/app.zip"]
        );
    }

    #[tokio::test]
    async fn test_hash_mismatch_is_reported() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("app.zip"), b"tampered").unwrap();
        let (_, downloader) = mirrors(&dir);

        let err = downloader
            .fetch_verified("app.zip", &sha256_hex(b"archive"))
            .await
            .unwrap_err();
        assert!(matches!(err, UpdateError::HashMismatch { .. }));
    }

    #[tokio::test]
    async fn test_no_urls() {
        let dir = TempDir::new().unwrap();
        let fetcher = Arc::new(DirectoryFetcher::new("https://a.example.com/", dir.path()));
        let downloader = Downloader::new(fetcher, Vec::new());
        let err = downloader.fetch("versions.gz").await.unwrap_err();
        assert!(matches!(err, UpdateError::Unavailable(name) if name == "versions.gz"));
    }
}
