//! Transports that turn a URL into bytes.
//!
//! [`HttpFetcher`] is the production transport. [`DirectoryFetcher`]
//! serves a local directory under a base URL, for mirrors on a shared
//! filesystem and for tests.

use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use tracing::{debug, warn};

use crate::error::UpdateError;
use crate::progress::{Progress, ProgressHooks, ProgressStatus};

/// Default timeout for establishing a connection in seconds.
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Default read timeout for streaming downloads in seconds.
const DEFAULT_READ_TIMEOUT_SECS: u64 = 60;

/// Fetches the body of a URL.
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Fetch `url` into memory, reporting byte progress to `hooks`.
    async fn fetch(&self, url: &str, hooks: &ProgressHooks) -> Result<Vec<u8>, UpdateError>;
}

/// Configuration for [`HttpFetcher`]. Timeouts apply per request.
#[derive(Debug, Clone)]
pub struct DownloaderConfig {
    /// Connection timeout in seconds.
    pub timeout_secs: u64,
    /// Read timeout for streaming in seconds.
    pub read_timeout_secs: u64,
    /// User agent string.
    pub user_agent: String,
}

impl Default for DownloaderConfig {
    fn default() -> Self {
        Self {
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            read_timeout_secs: DEFAULT_READ_TIMEOUT_SECS,
            user_agent: format!("relup-client/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

/// HTTP(S) transport backed by reqwest.
pub struct HttpFetcher {
    client: reqwest::Client,
    config: DownloaderConfig,
}

impl HttpFetcher {
    /// Create a fetcher with default timeouts.
    pub fn new(verify_tls: bool) -> Result<Self, UpdateError> {
        Self::with_config(DownloaderConfig::default(), verify_tls)
    }

    pub fn with_config(config: DownloaderConfig, verify_tls: bool) -> Result<Self, UpdateError> {
        if !verify_tls {
            warn!("TLS certificate verification is disabled");
        }
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.timeout_secs))
            .read_timeout(Duration::from_secs(config.read_timeout_secs))
            .user_agent(&config.user_agent)
            .danger_accept_invalid_certs(!verify_tls)
            .build()?;
        Ok(Self { client, config })
    }

    pub fn config(&self) -> &DownloaderConfig {
        &self.config
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, url: &str, hooks: &ProgressHooks) -> Result<Vec<u8>, UpdateError> {
        debug!(url, "fetching");

        let response = self.client.get(url).send().await?;
        if !response.status().is_success() {
            return Err(UpdateError::DownloadFailed {
                status: response.status().as_u16(),
            });
        }

        let total = response.content_length().unwrap_or(0);
        let mut data = Vec::with_capacity(usize::try_from(total).unwrap_or(0));
        let mut stream = response.bytes_stream();

        hooks.emit(Progress::new(ProgressStatus::Downloading, 0, total));
        while let Some(chunk_result) = stream.next().await {
            let chunk = chunk_result.map_err(|e| UpdateError::NetworkError(e.to_string()))?;
            data.extend_from_slice(&chunk);
            hooks.emit(Progress::new(ProgressStatus::Downloading, data.len() as u64, total));
        }

        debug!(url, bytes = data.len(), "fetched");
        Ok(data)
    }
}

/// Serves files below `root` for URLs starting with `base_url`.
pub struct DirectoryFetcher {
    base_url: String,
    root: PathBuf,
    requests: Mutex<Vec<String>>,
}

impl DirectoryFetcher {
    pub fn new(base_url: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        let mut base_url = base_url.into();
        if !base_url.ends_with('/') {
            base_url.push('/');
        }
        Self {
            base_url,
            root: root.into(),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Every URL requested so far, in order.
    pub fn requests(&self) -> Vec<String> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl Fetcher for DirectoryFetcher {
    async fn fetch(&self, url: &str, hooks: &ProgressHooks) -> Result<Vec<u8>, UpdateError> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(url.to_string());

        let relative = url
            .strip_prefix(&self.base_url)
            .filter(|rel| !rel.is_empty() && !rel.split('/').any(|part| part == ".."))
            .ok_or(UpdateError::DownloadFailed { status: 404 })?;

        let data = match tokio::fs::read(self.root.join(relative)).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(UpdateError::DownloadFailed { status: 404 });
            }
            Err(e) => return Err(e.into()),
        };
        let size = data.len() as u64;
        hooks.emit(Progress::new(ProgressStatus::Downloading, size, size));
        Ok(data)
    }
}
