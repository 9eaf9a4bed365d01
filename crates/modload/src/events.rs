//! Loader lifecycle events.
//!
//! Listeners observe; they never influence control flow. Dispatch is
//! synchronous and a panicking listener is logged and ignored.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use tracing::{info, warn};

use crate::error::LoaderError;

/// A lifecycle milestone of a load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoaderEvent {
    ManifestFetchStarted {
        application_id: String,
        locator: String,
    },
    ManifestVerified {
        application_id: String,
        manifest_id: String,
        freshness: u64,
    },
    ManifestRejected {
        application_id: String,
        reason: LoaderError,
    },
    ModuleCacheHit {
        id: String,
    },
    ModuleCacheMiss {
        id: String,
    },
    ModuleDownloadStarted {
        id: String,
    },
    ModuleDownloadCompleted {
        id: String,
        size: u64,
    },
    ModuleDownloadFailed {
        id: String,
        reason: LoaderError,
    },
    /// Verified bytes could not be written to the cache; the load goes on.
    CacheStorageFailed {
        id: String,
        reason: LoaderError,
    },
    /// Application state could not be persisted; the load still succeeds.
    StateStoreFailed {
        application_id: String,
        reason: LoaderError,
    },
    LoadSucceeded {
        application_id: String,
        manifest_id: String,
        modules: usize,
    },
    LoadFailed {
        application_id: String,
        reason: LoaderError,
    },
}

impl LoaderEvent {
    /// Stable event name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::ManifestFetchStarted { .. } => "manifest_fetch_started",
            Self::ManifestVerified { .. } => "manifest_verified",
            Self::ManifestRejected { .. } => "manifest_rejected",
            Self::ModuleCacheHit { .. } => "module_cache_hit",
            Self::ModuleCacheMiss { .. } => "module_cache_miss",
            Self::ModuleDownloadStarted { .. } => "module_download_started",
            Self::ModuleDownloadCompleted { .. } => "module_download_completed",
            Self::ModuleDownloadFailed { .. } => "module_download_failed",
            Self::CacheStorageFailed { .. } => "cache_storage_failed",
            Self::StateStoreFailed { .. } => "state_store_failed",
            Self::LoadSucceeded { .. } => "load_succeeded",
            Self::LoadFailed { .. } => "load_failed",
        }
    }

    /// Whether the event reports a failure.
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            Self::ManifestRejected { .. }
                | Self::ModuleDownloadFailed { .. }
                | Self::CacheStorageFailed { .. }
                | Self::StateStoreFailed { .. }
                | Self::LoadFailed { .. }
        )
    }
}

/// Observer of loader events.
pub trait LoaderEventListener: Send + Sync {
    /// Called synchronously on the loading task; keep it cheap.
    fn on_event(&self, event: &LoaderEvent);
}

/// Listener that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopEventListener;

impl LoaderEventListener for NoopEventListener {
    fn on_event(&self, _event: &LoaderEvent) {}
}

/// Listener that writes every event to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEventListener;

impl LoaderEventListener for TracingEventListener {
    fn on_event(&self, event: &LoaderEvent) {
        match event {
            LoaderEvent::ManifestFetchStarted {
                application_id,
                locator,
            } => info!(event = event.name(), application_id = %application_id, locator = %locator),
            LoaderEvent::ManifestVerified {
                application_id,
                manifest_id,
                freshness,
            } => info!(
                event = event.name(),
                application_id = %application_id,
                manifest_id = %manifest_id,
                freshness
            ),
            LoaderEvent::ModuleCacheHit { id }
            | LoaderEvent::ModuleCacheMiss { id }
            | LoaderEvent::ModuleDownloadStarted { id } => info!(event = event.name(), id = %id),
            LoaderEvent::ModuleDownloadCompleted { id, size } => {
                info!(event = event.name(), id = %id, size)
            }
            LoaderEvent::ModuleDownloadFailed { id, reason }
            | LoaderEvent::CacheStorageFailed { id, reason } => {
                warn!(event = event.name(), id = %id, reason = %reason)
            }
            LoaderEvent::ManifestRejected {
                application_id,
                reason,
            }
            | LoaderEvent::StateStoreFailed {
                application_id,
                reason,
            }
            | LoaderEvent::LoadFailed {
                application_id,
                reason,
            } => warn!(event = event.name(), application_id = %application_id, reason = %reason),
            LoaderEvent::LoadSucceeded {
                application_id,
                manifest_id,
                modules,
            } => info!(
                event = event.name(),
                application_id = %application_id,
                manifest_id = %manifest_id,
                modules
            ),
        }
    }
}

/// Panic-isolating wrapper around the configured listener.
#[derive(Clone)]
pub(crate) struct EventDispatcher {
    listener: Arc<dyn LoaderEventListener>,
}

impl EventDispatcher {
    pub(crate) fn new(listener: Arc<dyn LoaderEventListener>) -> Self {
        Self { listener }
    }

    pub(crate) fn emit(&self, event: LoaderEvent) {
        let listener = &self.listener;
        if catch_unwind(AssertUnwindSafe(|| listener.on_event(&event))).is_err() {
            warn!(event = event.name(), "event listener panicked, ignoring");
        }
    }
}
