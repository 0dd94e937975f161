//! Byte-fetching collaborator
//!
//! The image cache downloads through this seam; tests inject counting or
//! failing fetchers, production uses [`HttpFetcher`].

use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;
use tracing::debug;

use crate::config::CacheConfig;
use crate::error::FetchError;

/// Fetches the raw bytes behind a URL
#[async_trait]
pub trait ByteFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, FetchError>;
}

/// HTTP byte fetcher
pub struct HttpFetcher {
    http: Client,
    user_agent: String,
}

impl HttpFetcher {
    /// Create a fetcher with the configured timeout and user agent
    pub fn new(config: &CacheConfig) -> Self {
        let http = Client::builder()
            .timeout(Duration::from_millis(config.fetch_timeout_ms))
            .build()
            .expect("Failed to create HTTP client");

        Self {
            http,
            user_agent: config.user_agent.clone(),
        }
    }
}

#[async_trait]
impl ByteFetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        debug!("Fetching {}", url);

        let response = self
            .http
            .get(url)
            .header("User-Agent", &self.user_agent)
            .send()
            .await
            .map_err(|e| FetchError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Http(status.as_u16()));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| FetchError::Network(e.to_string()))?;

        Ok(bytes.to_vec())
    }
}
