//! Where partition payloads come from.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::PartitionLoadError;

/// Fetches raw partition payloads by locator.
///
/// Payloads may be gzip compressed; decoding happens in the loader.
#[async_trait]
pub trait ChunkSource: Send + Sync {
    async fn fetch(&self, locator: &str) -> Result<Vec<u8>, PartitionLoadError>;
}

/// Reads partitions from a directory.
pub struct FileChunkSource {
    root: PathBuf,
}

impl FileChunkSource {
    /// Locators are resolved relative to `root`.
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    fn resolve(&self, locator: &str) -> PathBuf {
        self.root.join(locator)
    }
}

#[async_trait]
impl ChunkSource for FileChunkSource {
    async fn fetch(&self, locator: &str) -> Result<Vec<u8>, PartitionLoadError> {
        tokio::fs::read(self.resolve(locator))
            .await
            .map_err(|e| PartitionLoadError::Fetch {
                locator: locator.to_string(),
                reason: e.to_string(),
            })
    }
}

/// Downloads partitions over HTTP.
pub struct HttpChunkSource {
    base_url: String,
    client: reqwest::Client,
}

impl HttpChunkSource {
    /// Locators are appended to `base_url` unless already absolute.
    pub fn new(base_url: &str) -> Result<Self, PartitionLoadError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("siteindex/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| PartitionLoadError::Fetch {
                locator: base_url.to_string(),
                reason: e.to_string(),
            })?;
        Ok(Self::with_client(base_url, client))
    }

    pub fn with_client(base_url: &str, client: reqwest::Client) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        }
    }

    fn url_for(&self, locator: &str) -> String {
        if locator.starts_with("http://") || locator.starts_with("https://") {
            locator.to_string()
        } else {
            format!("{}/{}", self.base_url, locator.trim_start_matches('/'))
        }
    }
}

#[async_trait]
impl ChunkSource for HttpChunkSource {
    async fn fetch(&self, locator: &str) -> Result<Vec<u8>, PartitionLoadError> {
        let url = self.url_for(locator);
        let fetch_err = |e: reqwest::Error| PartitionLoadError::Fetch {
            locator: url.clone(),
            reason: e.to_string(),
        };

        let response = self.client.get(&url).send().await.map_err(fetch_err)?;
        if !response.status().is_success() {
            return Err(PartitionLoadError::Status {
                locator: url.clone(),
                status: response.status().as_u16(),
            });
        }
        let body = response.bytes().await.map_err(fetch_err)?;
        Ok(body.to_vec())
    }
}
