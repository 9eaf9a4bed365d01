//! Shared fixtures: an in-memory counting fetcher and manifest builders.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use modload::{
    compute_digest, unsigned_manifest, Fetcher, LoaderError, LoaderResult, ManifestBody,
    ModuleRef,
};
use parking_lot::Mutex;

pub const MANIFEST_URL: &str = "https://cdn.example.com/{app}/manifest.json";

pub fn manifest_locator(app: &str) -> String {
    MANIFEST_URL.replace("{app}", app)
}

pub fn module_locator(app: &str, name: &str) -> String {
    format!("https://cdn.example.com/{}/{}.bin", app, name)
}

/// Serves registered locators, counting calls and concurrent requests.
///
/// The optional delay applies to module requests only.
#[derive(Default)]
pub struct CountingFetcher {
    files: Mutex<HashMap<String, Bytes>>,
    calls: Mutex<HashMap<String, usize>>,
    delay: Mutex<Option<Duration>>,
    current: AtomicUsize,
    max_concurrent: AtomicUsize,
}

impl CountingFetcher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_delay(delay: Duration) -> Arc<Self> {
        let fetcher = Self::default();
        *fetcher.delay.lock() = Some(delay);
        Arc::new(fetcher)
    }

    pub fn serve(&self, locator: impl Into<String>, bytes: impl Into<Bytes>) {
        self.files.lock().insert(locator.into(), bytes.into());
    }

    pub fn serve_manifest(&self, body: &ManifestBody) {
        self.serve(
            manifest_locator(&body.application_id),
            unsigned_manifest(body).expect("encode manifest"),
        );
    }

    pub fn calls(&self, locator: &str) -> usize {
        self.calls.lock().get(locator).copied().unwrap_or(0)
    }

    /// Calls for everything except manifests.
    pub fn module_calls(&self) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|(locator, _)| !locator.ends_with("manifest.json"))
            .map(|(_, n)| n)
            .sum()
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Fetcher for CountingFetcher {
    async fn get(&self, locator: &str) -> LoaderResult<Bytes> {
        *self.calls.lock().entry(locator.to_string()).or_insert(0) += 1;

        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_concurrent.fetch_max(now, Ordering::SeqCst);

        let delay = *self.delay.lock();
        if let Some(delay) = delay.filter(|_| !locator.ends_with("manifest.json")) {
            tokio::time::sleep(delay).await;
        }
        let result = self
            .files
            .lock()
            .get(locator)
            .cloned()
            .ok_or_else(|| LoaderError::FetchFailed {
                locator: locator.to_string(),
                attempts: 1,
                message: "HTTP 404".to_string(),
            });

        self.current.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

pub fn module_ref(name: &str, payload: &[u8]) -> ModuleRef {
    ModuleRef {
        name: name.to_string(),
        url: format!("{}.bin", name),
        size: payload.len() as u64,
        digest: compute_digest(payload),
    }
}

pub fn manifest(app: &str, freshness: u64, modules: &[(&str, &[u8])]) -> ManifestBody {
    ManifestBody {
        application_id: app.to_string(),
        id: format!("{}-build-{}", app, freshness),
        freshness,
        modules: modules
            .iter()
            .map(|(name, payload)| module_ref(name, payload))
            .collect(),
    }
}

/// Register a manifest and all of its module payloads.
pub fn publish(fetcher: &CountingFetcher, app: &str, freshness: u64, modules: &[(&str, &[u8])]) {
    let body = manifest(app, freshness, modules);
    fetcher.serve_manifest(&body);
    for (name, payload) in modules {
        fetcher.serve(module_locator(app, name), Bytes::copy_from_slice(payload));
    }
}
