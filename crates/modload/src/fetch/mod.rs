//! Fetch backends.
//!
//! The loader fetches manifests and modules through the same abstract
//! `GET(locator)` operation. Backends report retryable transport problems as
//! [`LoaderError::TransientFetch`](crate::LoaderError::TransientFetch) and
//! everything else as a permanent failure; retrying is the caller's job.

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::LoaderResult;

mod embedded;
mod http;

pub use embedded::EmbeddedFetcher;
pub use http::{HttpFetcher, USER_AGENT};

/// A source of manifest and module bytes.
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Fetch the full payload behind `locator`.
    async fn get(&self, locator: &str) -> LoaderResult<Bytes>;
}

/// Resolve a module url against the manifest locator.
///
/// Absolute urls are returned as-is. Relative urls are joined onto the
/// manifest locator when it is itself a url; otherwise they pass through.
pub(crate) fn resolve_locator(base: Option<&str>, url: &str) -> String {
    if url::Url::parse(url).is_ok() {
        return url.to_string();
    }
    base.and_then(|b| url::Url::parse(b).ok())
        .and_then(|b| b.join(url).ok())
        .map(|u| u.to_string())
        .unwrap_or_else(|| url.to_string())
}
