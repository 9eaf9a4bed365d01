//! Top-level loader.
//!
//! `load(app)`:
//! 1. Fetch the manifest through the scheduler (bounded, retried)
//! 2. Verify it (structure, signature, freshness, application id)
//! 3. Resolve every module concurrently: pin, cache lookup, download on miss
//! 4. All modules resolved: accept the manifest and record app state under
//!    the application's state lock, so concurrent loads persist in freshness
//!    order
//!
//! A load is atomic: one failed module fails the whole load, but siblings
//! that did resolve stay cached. Every outcome is reported to the listener.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use chrono::Utc;
use futures::stream::{FuturesUnordered, StreamExt};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::cache::{ContentCache, PinGuard};
use crate::config::LoaderConfig;
use crate::error::{LoaderError, LoaderResult};
use crate::events::{EventDispatcher, LoaderEvent, LoaderEventListener, NoopEventListener};
use crate::fetch::{resolve_locator, HttpFetcher};
use crate::leak::{LeakDetector, NoopLeakDetector};
use crate::scheduler::DownloadScheduler;
use crate::state::{AppState, AppStateStore, FileStateStore, MemoryStateStore};
use crate::trust::TrustPolicy;
use crate::types::{LoadedModule, Manifest, ModuleRef, ModuleSet};
use crate::verify::ManifestVerifier;

#[derive(Default)]
struct LoadProgress {
    total: AtomicUsize,
    resolved: AtomicUsize,
}

impl LoadProgress {
    fn unresolved(&self) -> usize {
        self.total
            .load(Ordering::Relaxed)
            .saturating_sub(self.resolved.load(Ordering::Relaxed))
    }
}

/// Composes verification, caching, scheduling and state persistence.
///
/// One cache and one scheduler are meant to be shared by every orchestrator
/// of an embedding application.
pub struct LoaderOrchestrator {
    config: LoaderConfig,
    policy: TrustPolicy,
    verifier: ManifestVerifier,
    cache: Arc<ContentCache>,
    scheduler: Arc<DownloadScheduler>,
    events: EventDispatcher,
    state_store: Arc<dyn AppStateStore>,
    leak_detector: Arc<dyn LeakDetector>,
    state_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl std::fmt::Debug for LoaderOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoaderOrchestrator")
            .field("config", &self.config)
            .field("cache", &self.cache)
            .field("scheduler", &self.scheduler)
            .finish()
    }
}

impl LoaderOrchestrator {
    /// Assemble an orchestrator from shared services.
    ///
    /// Defaults: no-op listener, in-memory state, no leak detection.
    pub fn new(
        config: LoaderConfig,
        cache: Arc<ContentCache>,
        scheduler: Arc<DownloadScheduler>,
        policy: TrustPolicy,
    ) -> Self {
        Self {
            config,
            policy,
            verifier: ManifestVerifier::new(),
            cache,
            scheduler,
            events: EventDispatcher::new(Arc::new(NoopEventListener)),
            state_store: Arc::new(MemoryStateStore::new()),
            leak_detector: Arc::new(NoopLeakDetector),
            state_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Open a standalone orchestrator from configuration: HTTP fetching,
    /// an on-disk cache under `cache_root()` and file-backed state under
    /// `state_root()`.
    pub async fn open(config: LoaderConfig, policy: TrustPolicy) -> LoaderResult<Self> {
        config.validate()?;

        let fetcher = Arc::new(HttpFetcher::new(config.attempt_timeout())?);
        let cache = ContentCache::open(config.cache_root(), config.cache_max_size_bytes).await?;
        let scheduler = DownloadScheduler::from_config(&config, fetcher)?;
        let state_store = FileStateStore::new(config.state_root());
        let allow_unsigned = policy.allow_unsigned || config.allow_unsigned;
        if allow_unsigned {
            warn!("manifest signature checks are disabled");
        }

        Ok(Self::new(
            config,
            Arc::new(cache),
            Arc::new(scheduler),
            policy.with_allow_unsigned(allow_unsigned),
        )
        .with_state_store(Arc::new(state_store)))
    }

    pub fn with_listener(mut self, listener: Arc<dyn LoaderEventListener>) -> Self {
        self.events = EventDispatcher::new(listener);
        self
    }

    pub fn with_state_store(mut self, store: Arc<dyn AppStateStore>) -> Self {
        self.state_store = store;
        self
    }

    pub fn with_leak_detector(mut self, detector: Arc<dyn LeakDetector>) -> Self {
        self.leak_detector = detector;
        self
    }

    pub fn config(&self) -> &LoaderConfig {
        &self.config
    }

    pub fn cache(&self) -> &Arc<ContentCache> {
        &self.cache
    }

    pub fn scheduler(&self) -> &Arc<DownloadScheduler> {
        &self.scheduler
    }

    pub fn verifier(&self) -> &ManifestVerifier {
        &self.verifier
    }

    /// Load the current module set of an application.
    pub async fn load(&self, application_id: &str) -> LoaderResult<ModuleSet> {
        let progress = LoadProgress::default();

        let result = match self.config.load_timeout() {
            Some(limit) => {
                match tokio::time::timeout(limit, self.load_inner(application_id, &progress)).await
                {
                    Ok(result) => result,
                    Err(_) => Err(LoaderError::LoadTimedOut {
                        application_id: application_id.to_string(),
                        unresolved: progress.unresolved(),
                    }),
                }
            }
            None => self.load_inner(application_id, &progress).await,
        };

        match &result {
            Ok(set) => {
                info!(
                    application_id,
                    manifest_id = %set.manifest_id,
                    modules = set.len(),
                    "load succeeded"
                );
                self.events.emit(LoaderEvent::LoadSucceeded {
                    application_id: application_id.to_string(),
                    manifest_id: set.manifest_id.clone(),
                    modules: set.len(),
                });
            }
            Err(e) => {
                warn!(application_id, error = %e, "load failed");
                self.events.emit(LoaderEvent::LoadFailed {
                    application_id: application_id.to_string(),
                    reason: e.clone(),
                });
            }
        }
        result
    }

    async fn load_inner(
        &self,
        application_id: &str,
        progress: &LoadProgress,
    ) -> LoaderResult<ModuleSet> {
        if let Some(state) = self.read_state(application_id).await {
            self.verifier
                .seed(application_id, state.freshness, &state.manifest_digest);
        }

        let locator = self.config.manifest_locator(application_id);
        self.events.emit(LoaderEvent::ManifestFetchStarted {
            application_id: application_id.to_string(),
            locator: locator.clone(),
        });
        let raw = self.scheduler.fetch_raw(&locator).await?;

        let mut manifest = match self
            .verifier
            .verify_for(application_id, &raw, &self.policy)
            .await
        {
            Ok(manifest) => manifest,
            Err(e) => {
                self.events.emit(LoaderEvent::ManifestRejected {
                    application_id: application_id.to_string(),
                    reason: e.clone(),
                });
                return Err(e);
            }
        };
        manifest.locator = Some(locator);
        self.events.emit(LoaderEvent::ManifestVerified {
            application_id: application_id.to_string(),
            manifest_id: manifest.id().to_string(),
            freshness: manifest.freshness(),
        });

        let modules = self.resolve_all(&manifest, progress).await?;
        let (modules, pins) = modules.into_iter().unzip();
        let set = ModuleSet::new(&manifest, modules, pins);

        let lock = self.state_lock(application_id);
        let _guard = lock.lock().await;
        if let Err(e) = self.verifier.accept(&manifest) {
            self.events.emit(LoaderEvent::ManifestRejected {
                application_id: application_id.to_string(),
                reason: e.clone(),
            });
            return Err(e);
        }
        self.record_state(application_id, &manifest).await;
        Ok(set)
    }

    /// Resolve every module, draining all of them even after a failure so
    /// resolved siblings still reach the cache. Returns the first error by
    /// completion order.
    async fn resolve_all(
        &self,
        manifest: &Manifest,
        progress: &LoadProgress,
    ) -> LoaderResult<Vec<(Arc<LoadedModule>, PinGuard)>> {
        let count = manifest.modules().len();
        progress.total.store(count, Ordering::Relaxed);
        let base = manifest.locator.as_deref();

        let mut pending: FuturesUnordered<_> = manifest
            .modules()
            .iter()
            .enumerate()
            .map(|(index, module)| async move { (index, self.resolve_module(base, module).await) })
            .collect();

        let mut slots: Vec<Option<(Arc<LoadedModule>, PinGuard)>> =
            (0..count).map(|_| None).collect();
        let mut first_error = None;

        while let Some((index, result)) = pending.next().await {
            progress.resolved.fetch_add(1, Ordering::Relaxed);
            match result {
                Ok(resolved) => slots[index] = Some(resolved),
                Err(e) => {
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }

        if let Some(e) = first_error {
            return Err(e);
        }
        Ok(slots.into_iter().flatten().collect())
    }

    async fn resolve_module(
        &self,
        base: Option<&str>,
        module: &ModuleRef,
    ) -> LoaderResult<(Arc<LoadedModule>, PinGuard)> {
        let id = module.content_id();
        // Pin before the lookup so a concurrent eviction cannot race us.
        let pin = self.cache.pin(id);

        let cached = match self.cache.lookup(id).await {
            Ok(cached) => cached,
            Err(e) => {
                warn!(id = %id, error = %e, "cache lookup failed, downloading");
                None
            }
        };

        let bytes = match cached {
            Some(bytes) if bytes.len() as u64 == module.size => {
                self.events.emit(LoaderEvent::ModuleCacheHit { id: id.to_string() });
                bytes
            }
            Some(bytes) => {
                return Err(LoaderError::IntegrityMismatch {
                    id: id.to_string(),
                    expected: format!("{} bytes", module.size),
                    actual: format!("{} bytes", bytes.len()),
                });
            }
            None => {
                self.events.emit(LoaderEvent::ModuleCacheMiss { id: id.to_string() });
                self.download(base, module).await?
            }
        };

        let loaded = Arc::new(LoadedModule {
            name: module.name.clone(),
            id: id.to_string(),
            bytes,
        });
        Ok((loaded, pin))
    }

    async fn download(&self, base: Option<&str>, module: &ModuleRef) -> LoaderResult<Bytes> {
        let id = module.content_id();
        let locator = resolve_locator(base, &module.url);
        self.events.emit(LoaderEvent::ModuleDownloadStarted { id: id.to_string() });

        let bytes = match self.scheduler.fetch_from(module, &locator).await {
            Ok(bytes) => bytes,
            Err(e) => {
                self.events.emit(LoaderEvent::ModuleDownloadFailed {
                    id: id.to_string(),
                    reason: e.clone(),
                });
                return Err(e);
            }
        };
        self.events.emit(LoaderEvent::ModuleDownloadCompleted {
            id: id.to_string(),
            size: bytes.len() as u64,
        });

        match self.cache.store(id, &bytes).await {
            Ok(()) => {}
            Err(e @ LoaderError::CacheCorruption { .. }) => {
                warn!(id = %id, error = %e, "purging conflicting cache entry");
                if let Err(purge) = self.cache.purge(id).await {
                    warn!(id = %id, error = %purge, "failed to purge cache entry");
                }
                self.events.emit(LoaderEvent::CacheStorageFailed {
                    id: id.to_string(),
                    reason: e.clone(),
                });
                return Err(e);
            }
            Err(e) => {
                warn!(id = %id, error = %e, "failed to cache module, continuing");
                self.events.emit(LoaderEvent::CacheStorageFailed {
                    id: id.to_string(),
                    reason: e,
                });
            }
        }
        Ok(bytes)
    }

    fn state_lock(&self, application_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        Arc::clone(
            self.state_locks
                .lock()
                .entry(application_id.to_string())
                .or_default(),
        )
    }

    /// Best-effort state read; failures are reported, not returned.
    async fn read_state(&self, application_id: &str) -> Option<AppState> {
        match self.state_store.load(application_id).await {
            Ok(state) => state,
            Err(e) => {
                warn!(application_id, error = %e, "failed to read app state");
                self.events.emit(LoaderEvent::StateStoreFailed {
                    application_id: application_id.to_string(),
                    reason: e,
                });
                None
            }
        }
    }

    /// Caller holds the application's state lock.
    async fn record_state(&self, application_id: &str, manifest: &Manifest) {
        let ui_snapshot = self
            .read_state(application_id)
            .await
            .and_then(|s| s.ui_snapshot);
        let state = AppState {
            manifest_id: manifest.id().to_string(),
            freshness: manifest.freshness(),
            manifest_digest: manifest.digest.clone(),
            ui_snapshot,
            written_at: Utc::now(),
        };

        match self.state_store.save(application_id, &state).await {
            Ok(()) => debug!(application_id, manifest_id = %state.manifest_id, "recorded app state"),
            Err(e) => {
                warn!(application_id, error = %e, "failed to record app state");
                self.events.emit(LoaderEvent::StateStoreFailed {
                    application_id: application_id.to_string(),
                    reason: e,
                });
            }
        }
    }

    /// Read the persisted state of an application after a restart.
    ///
    /// Also restores downgrade protection for that application.
    pub async fn resume(&self, application_id: &str) -> LoaderResult<Option<AppState>> {
        let state = self.state_store.load(application_id).await?;
        if let Some(state) = &state {
            self.verifier
                .seed(application_id, state.freshness, &state.manifest_digest);
            debug!(application_id, manifest_id = %state.manifest_id, "resumed app state");
        }
        Ok(state)
    }

    /// Replace the UI snapshot of an application, keeping its manifest fields.
    ///
    /// Fails with `StateStoreUnavailable` if the application was never loaded.
    pub async fn save_ui_snapshot(&self, application_id: &str, snapshot: Vec<u8>) -> LoaderResult<()> {
        let lock = self.state_lock(application_id);
        let _guard = lock.lock().await;

        let mut state = self.state_store.load(application_id).await?.ok_or_else(|| {
            LoaderError::StateStoreUnavailable {
                message: format!("no state recorded for {}", application_id),
            }
        })?;
        state.ui_snapshot = Some(snapshot);
        state.written_at = Utc::now();
        self.state_store.save(application_id, &state).await
    }

    /// Release a module set: unpin its entries, hand its modules to the leak
    /// detector and re-apply the cache budget.
    pub async fn release(&self, set: ModuleSet) {
        let note = format!("{}/{}", set.application_id, set.manifest_id);
        let modules = set.into_modules();
        for module in &modules {
            self.leak_detector.watch(Arc::downgrade(module), &note);
        }
        drop(modules);

        if let Err(e) = self.cache.evict_if_needed().await {
            warn!(error = %e, "eviction after release failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::compute_digest;
    use crate::fetch::Fetcher;
    use crate::types::ManifestBody;
    use crate::verify::unsigned_manifest;
    use async_trait::async_trait;
    use tempfile::TempDir;

    const MANIFEST_URL: &str = "https://cdn.example.com/{app}/manifest.json";

    struct Served(Mutex<HashMap<String, Bytes>>);

    #[async_trait]
    impl Fetcher for Served {
        async fn get(&self, locator: &str) -> LoaderResult<Bytes> {
            self.0
                .lock()
                .get(locator)
                .cloned()
                .ok_or_else(|| LoaderError::FetchFailed {
                    locator: locator.to_string(),
                    attempts: 1,
                    message: "HTTP 404".to_string(),
                })
        }
    }

    fn body(freshness: u64, payloads: &[(&str, &[u8])]) -> ManifestBody {
        ManifestBody {
            application_id: "gym".to_string(),
            id: format!("build-{}", freshness),
            freshness,
            modules: payloads
                .iter()
                .map(|(name, bytes)| ModuleRef {
                    name: name.to_string(),
                    url: format!("{}.bin", name),
                    size: bytes.len() as u64,
                    digest: compute_digest(bytes),
                })
                .collect(),
        }
    }

    fn served(body: &ManifestBody, payloads: &[(&str, &[u8])]) -> Arc<Served> {
        let mut files = HashMap::new();
        files.insert(
            "https://cdn.example.com/gym/manifest.json".to_string(),
            Bytes::from(unsigned_manifest(body).unwrap()),
        );
        for (name, bytes) in payloads {
            files.insert(
                format!("https://cdn.example.com/gym/{}.bin", name),
                Bytes::copy_from_slice(bytes),
            );
        }
        Arc::new(Served(Mutex::new(files)))
    }

    async fn orchestrator(dir: &TempDir, fetcher: Arc<Served>) -> LoaderOrchestrator {
        let config = LoaderConfig::default()
            .with_cache_dir(dir.path())
            .with_manifest_url(MANIFEST_URL);
        let cache = ContentCache::open(config.cache_root(), config.cache_max_size_bytes)
            .await
            .unwrap();
        let scheduler = DownloadScheduler::new(fetcher, 4);
        LoaderOrchestrator::new(
            config,
            Arc::new(cache),
            Arc::new(scheduler),
            TrustPolicy::no_signature_checks(),
        )
    }

    #[tokio::test]
    async fn test_load_resolves_modules_in_manifest_order() {
        let dir = TempDir::new().unwrap();
        let payloads: &[(&str, &[u8])] = &[("base", b"base-code"), ("app", b"app-code")];
        let b = body(1, payloads);
        let loader = orchestrator(&dir, served(&b, payloads)).await;

        let set = loader.load("gym").await.unwrap();
        let names: Vec<_> = set.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, vec!["base", "app"]);
        assert_eq!(&set.get("app").unwrap().bytes[..], b"app-code");
        assert_eq!(loader.verifier().accepted_freshness("gym"), Some(1));
    }

    #[tokio::test]
    async fn test_loaded_modules_are_pinned_until_dropped() {
        let dir = TempDir::new().unwrap();
        let payloads: &[(&str, &[u8])] = &[("app", b"app-code")];
        let b = body(1, payloads);
        let loader = orchestrator(&dir, served(&b, payloads)).await;
        let id = compute_digest(b"app-code");

        let set = loader.load("gym").await.unwrap();
        assert!(loader.cache().is_pinned(&id));
        loader.release(set).await;
        assert!(!loader.cache().is_pinned(&id));
    }

    #[tokio::test]
    async fn test_manifest_for_other_application_rejected() {
        let dir = TempDir::new().unwrap();
        let payloads: &[(&str, &[u8])] = &[("app", b"app-code")];
        let mut b = body(1, payloads);
        b.application_id = "other".to_string();
        let loader = orchestrator(&dir, served(&b, payloads)).await;

        let err = loader.load("gym").await.unwrap_err();
        assert!(matches!(err, LoaderError::MalformedManifest { .. }));
    }

    #[tokio::test]
    async fn test_missing_module_fails_load_without_state() {
        let dir = TempDir::new().unwrap();
        let payloads: &[(&str, &[u8])] = &[("app", b"app-code")];
        let b = body(1, payloads);
        let loader = orchestrator(&dir, served(&b, &[])).await;

        let err = loader.load("gym").await.unwrap_err();
        assert!(matches!(err, LoaderError::FetchFailed { .. }));
        assert!(loader.resume("gym").await.unwrap().is_none());
        assert_eq!(loader.verifier().accepted_freshness("gym"), None);
    }

    #[tokio::test]
    async fn test_ui_snapshot_carried_across_loads() {
        let dir = TempDir::new().unwrap();
        let payloads: &[(&str, &[u8])] = &[("app", b"app-code")];
        let fetcher = served(&body(1, payloads), payloads);
        let loader = orchestrator(&dir, fetcher.clone()).await;

        assert!(matches!(
            loader.save_ui_snapshot("gym", b"early".to_vec()).await,
            Err(LoaderError::StateStoreUnavailable { .. })
        ));

        loader.load("gym").await.unwrap();
        loader
            .save_ui_snapshot("gym", b"screen=home".to_vec())
            .await
            .unwrap();

        fetcher.0.lock().insert(
            "https://cdn.example.com/gym/manifest.json".to_string(),
            Bytes::from(unsigned_manifest(&body(2, payloads)).unwrap()),
        );
        loader.load("gym").await.unwrap();

        let state = loader.resume("gym").await.unwrap().unwrap();
        assert_eq!(state.manifest_id, "build-2");
        assert_eq!(state.ui_snapshot.as_deref(), Some(&b"screen=home"[..]));
    }
}
