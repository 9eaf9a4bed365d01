//! HTTP backend: the only place that interprets status codes.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT as USER_AGENT_HEADER};
use tracing::debug;

use super::Fetcher;
use crate::error::{LoaderError, LoaderResult};

/// User agent sent with every request.
pub const USER_AGENT: &str = concat!("modload/", env!("CARGO_PKG_VERSION"));

/// Fetches locators over HTTP(S).
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    /// Create a fetcher whose requests time out after `timeout`.
    pub fn new(timeout: Duration) -> LoaderResult<Self> {
        let mut default_headers = HeaderMap::new();
        default_headers.insert(USER_AGENT_HEADER, HeaderValue::from_static(USER_AGENT));

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .default_headers(default_headers)
            .build()
            .map_err(|e| LoaderError::Config {
                message: format!("failed to create HTTP client: {}", e),
            })?;

        Ok(Self { client })
    }

    /// Wrap an existing client.
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn get(&self, locator: &str) -> LoaderResult<Bytes> {
        let response = self
            .client
            .get(locator)
            .send()
            .await
            .map_err(|e| transient(locator, e))?;
        let status = response.status();

        match status.as_u16() {
            200..=299 => {
                let bytes = response.bytes().await.map_err(|e| transient(locator, e))?;
                debug!(locator = %locator, size = bytes.len(), "fetched");
                Ok(bytes)
            }

            408 | 429 | 500..=599 => Err(LoaderError::TransientFetch {
                locator: locator.to_string(),
                message: format!("HTTP {}", status.as_u16()),
            }),

            _ => {
                let message = response.text().await.unwrap_or_default();
                let message = if message.is_empty() {
                    format!("HTTP {}", status.as_u16())
                } else {
                    format!("HTTP {}: {}", status.as_u16(), message)
                };
                Err(LoaderError::FetchFailed {
                    locator: locator.to_string(),
                    attempts: 1,
                    message,
                })
            }
        }
    }
}

fn transient(locator: &str, err: reqwest::Error) -> LoaderError {
    LoaderError::TransientFetch {
        locator: locator.to_string(),
        message: err.to_string(),
    }
}
