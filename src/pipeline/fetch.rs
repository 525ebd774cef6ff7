//! Network access for the image resolver.
//!
//! [`ImageFetcher`] is the seam between the resolver and the network: the
//! default [`HttpFetcher`] uses reqwest, tests and embedders inject their own
//! through [`crate::config::SanitizeConfigBuilder::fetcher`]. A fetcher only
//! moves bytes; validation happens in [`crate::pipeline::encode`].

use crate::config::SanitizeConfig;
use crate::error::{ImageError, SanitizeError};
use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use std::time::Duration;
use tracing::debug;

/// Raw response body of a successful (2xx) fetch.
#[derive(Debug, Clone, Default)]
pub struct FetchedBody {
    pub bytes: Vec<u8>,
    pub content_type: Option<String>,
}

/// Fetches one URL with a per-attempt timeout.
///
/// Implementations must return `Err` for non-2xx statuses, and should honour
/// `timeout` themselves; the resolver also enforces it from outside.
#[async_trait]
pub trait ImageFetcher: Send + Sync {
    async fn fetch(&self, url: &str, timeout: Duration) -> Result<FetchedBody, ImageError>;
}

/// reqwest-backed fetcher with a body size cap.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    max_bytes: usize,
}

impl HttpFetcher {
    /// Build a client from the config's user agent and size limit.
    pub fn new(config: &SanitizeConfig) -> Result<Self, SanitizeError> {
        let client = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .redirect(reqwest::redirect::Policy::limited(5))
            .connect_timeout(Duration::from_millis(
                config.probe_timeout_ms.max(config.proxy_timeout_ms),
            ))
            .build()
            .map_err(|e| SanitizeError::Internal(format!("HTTP client: {e}")))?;
        Ok(Self::with_client(client, config.max_image_bytes))
    }

    /// Wrap a pre-built client.
    pub fn with_client(client: reqwest::Client, max_bytes: usize) -> Self {
        Self { client, max_bytes }
    }
}

#[async_trait]
impl ImageFetcher for HttpFetcher {
    async fn fetch(&self, url: &str, timeout: Duration) -> Result<FetchedBody, ImageError> {
        debug!(url, timeout_ms = timeout.as_millis() as u64, "Fetching image");

        let mut response = self
            .client
            .get(url)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| transport_error(url, timeout, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ImageError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        if let Some(len) = response.content_length() {
            let len = usize::try_from(len).unwrap_or(usize::MAX);
            if len > self.max_bytes {
                return Err(ImageError::TooLarge {
                    url: url.to_string(),
                    size: len,
                    limit: self.max_bytes,
                });
            }
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let mut bytes = Vec::new();
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| transport_error(url, timeout, e))?
        {
            if bytes.len() + chunk.len() > self.max_bytes {
                return Err(ImageError::TooLarge {
                    url: url.to_string(),
                    size: bytes.len() + chunk.len(),
                    limit: self.max_bytes,
                });
            }
            bytes.extend_from_slice(&chunk);
        }

        Ok(FetchedBody {
            bytes,
            content_type,
        })
    }
}

fn transport_error(url: &str, timeout: Duration, e: reqwest::Error) -> ImageError {
    if e.is_timeout() {
        ImageError::Timeout {
            url: url.to_string(),
            ms: timeout.as_millis() as u64,
        }
    } else {
        ImageError::Transport {
            url: url.to_string(),
            detail: e.to_string(),
        }
    }
}
