//! k3s installation script cache.
//!
//! The script is downloaded at most once per engine and shared by every
//! node installation, including concurrently running worker tasks.

use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Location of the official k3s installation script.
pub const INSTALLER_URL: &str = "https://get.k3s.io";

/// Default timeout for the download.
const DEFAULT_TIMEOUT_SECS: u64 = 60;

/// Errors that can occur while fetching the installation script.
#[derive(Error, Debug)]
pub enum FetchError {
    /// HTTP request failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The server answered with a non-success status.
    #[error("failed to download installer from {url}: status {status}")]
    Status { url: String, status: u16 },

    /// The server answered with an empty body.
    #[error("installer downloaded from {url} is empty")]
    Empty { url: String },
}

/// Memoized installation script.
#[derive(Debug)]
pub struct InstallerCache {
    client: Client,
    url: String,
    script: Mutex<Option<Arc<[u8]>>>,
}

impl InstallerCache {
    /// Cache backed by the official script URL.
    ///
    /// # Errors
    /// Returns error if HTTP client cannot be created.
    pub fn new() -> Result<Self, FetchError> {
        Self::with_url(INSTALLER_URL)
    }

    /// Cache backed by a custom URL (mirrors, tests).
    ///
    /// # Errors
    /// Returns error if HTTP client cannot be created.
    pub fn with_url(url: impl Into<String>) -> Result<Self, FetchError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .build()?;

        Ok(Self {
            client,
            url: url.into(),
            script: Mutex::new(None),
        })
    }

    /// Cache seeded with a local copy of the script; never hits the network.
    #[must_use]
    pub fn preloaded(script: impl Into<Vec<u8>>) -> Self {
        let script: Vec<u8> = script.into();
        Self {
            client: Client::new(),
            url: INSTALLER_URL.to_string(),
            script: Mutex::new(Some(Arc::from(script))),
        }
    }

    /// Return the script, downloading it on first use.
    ///
    /// The lock is held across the download so concurrent callers wait for
    /// the first fetch instead of starting their own. Failures are not
    /// cached.
    ///
    /// # Errors
    /// Returns an error if the download fails or returns a non-success status.
    pub async fn fetch(&self) -> Result<Arc<[u8]>, FetchError> {
        let mut script = self.script.lock().await;
        if let Some(cached) = script.as_ref() {
            return Ok(Arc::clone(cached));
        }

        info!(url = %self.url, "Downloading k3s installer");
        let response = self.client.get(&self.url).send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                url: self.url.clone(),
                status: status.as_u16(),
            });
        }

        let body = response.bytes().await?;
        if body.is_empty() {
            return Err(FetchError::Empty {
                url: self.url.clone(),
            });
        }
        debug!(bytes = body.len(), "Installer downloaded");

        let fetched: Arc<[u8]> = Arc::from(&body[..]);
        *script = Some(Arc::clone(&fetched));
        Ok(fetched)
    }
}
