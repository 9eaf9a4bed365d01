//! Bundled-module backend.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::debug;

use super::Fetcher;
use crate::error::{LoaderError, LoaderResult};

/// Serves modules shipped with the host application.
///
/// A locator maps to the file in `dir` named by its last path segment, so
/// `https://cdn.example.com/gym/app.bin` is served from `dir/app.bin`.
/// Absent files go to the fallback fetcher when one is configured.
#[derive(Clone)]
pub struct EmbeddedFetcher {
    dir: PathBuf,
    fallback: Option<Arc<dyn Fetcher>>,
}

impl std::fmt::Debug for EmbeddedFetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmbeddedFetcher")
            .field("dir", &self.dir)
            .field("fallback", &self.fallback.is_some())
            .finish()
    }
}

impl EmbeddedFetcher {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            fallback: None,
        }
    }

    /// Fetch through `fallback` when a locator is not bundled.
    pub fn with_fallback(mut self, fallback: Arc<dyn Fetcher>) -> Self {
        self.fallback = Some(fallback);
        self
    }

    fn file_name(locator: &str) -> Option<&str> {
        let path = locator.split(['?', '#']).next().unwrap_or(locator);
        let name = path.rsplit('/').next()?;
        if name.is_empty() || name == "." || name == ".." || name.contains('\\') {
            None
        } else {
            Some(name)
        }
    }
}

#[async_trait]
impl Fetcher for EmbeddedFetcher {
    async fn get(&self, locator: &str) -> LoaderResult<Bytes> {
        if let Some(name) = Self::file_name(locator) {
            let path = self.dir.join(name);
            match tokio::fs::read(&path).await {
                Ok(bytes) => {
                    debug!(locator = %locator, path = %path.display(), "served embedded module");
                    return Ok(Bytes::from(bytes));
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(LoaderError::FetchFailed {
                        locator: locator.to_string(),
                        attempts: 1,
                        message: format!("failed to read {}: {}", path.display(), e),
                    });
                }
            }
        }

        match &self.fallback {
            Some(fallback) => fallback.get(locator).await,
            None => Err(LoaderError::FetchFailed {
                locator: locator.to_string(),
                attempts: 1,
                message: "not bundled".to_string(),
            }),
        }
    }
}
