//! Signed-manifest module loader.
//!
//! This crate fetches a signed manifest describing remotely hosted code
//! modules, verifies it, downloads missing module bytes under a global
//! concurrency bound and keeps them in a size-bounded, durable LRU cache:
//!
//! - Manifest verification (DSSE envelope, Ed25519 signatures, freshness)
//! - Content-addressed local cache with pinning and LRU eviction
//! - Deduplicating download scheduler with retry and backoff
//! - Per-application state persistence for resume after restart
//! - Lifecycle events for external telemetry
//!
//! # Quick Start
//!
//! ```no_run
//! use modload::{LoaderConfig, LoaderOrchestrator, TrustPolicy, TrustStore};
//!
//! # async fn example() -> modload::LoaderResult<()> {
//! let config = LoaderConfig::from_env()
//!     .with_manifest_url("https://modules.example.com/{app}/manifest.json");
//! let policy = TrustPolicy::new(TrustStore::new());
//!
//! let loader = LoaderOrchestrator::open(config, policy).await?;
//! let modules = loader.load("checkout").await?;
//! for module in modules.iter() {
//!     println!("{} ({} bytes)", module.name, module.bytes.len());
//! }
//! # Ok(())
//! # }
//! ```
//!
//! # Configuration
//!
//! | Environment Variable | Description |
//! |---------------------|-------------|
//! | `MODLOAD_CACHE_DIR` | Cache root (default: platform cache dir + `modload`) |
//! | `MODLOAD_CACHE_MAX_BYTES` | Eviction budget in bytes (default: 50 MiB) |
//! | `MODLOAD_CONCURRENT_DOWNLOADS` | Global in-flight download bound (default: 8) |
//! | `MODLOAD_MAX_RETRIES` | Retries for transient failures (default: 3) |
//! | `MODLOAD_ATTEMPT_TIMEOUT` | Per-attempt timeout in seconds (default: 30) |
//! | `MODLOAD_LOAD_TIMEOUT` | Whole-load timeout in seconds (default: none) |
//! | `MODLOAD_MANIFEST_URL` | Manifest locator template containing `{app}` |
//! | `MODLOAD_ALLOW_UNSIGNED` | Skip signature checks (dev only) |

pub mod cache;
pub mod config;
mod digest;
pub mod error;
pub mod events;
pub mod fetch;
pub mod leak;
pub mod orchestrator;
pub mod scheduler;
pub mod state;
pub mod trust;
pub mod types;
pub mod verify;

// Re-export main types
pub use cache::{CacheStats, ContentCache, PinGuard};
pub use config::LoaderConfig;
pub use digest::{compute_digest, compute_key_id};
pub use error::{LoaderError, LoaderResult};
pub use events::{LoaderEvent, LoaderEventListener, NoopEventListener, TracingEventListener};
pub use fetch::{EmbeddedFetcher, Fetcher, HttpFetcher, USER_AGENT};
pub use leak::{Leak, LeakDetector, NoopLeakDetector, TrackingLeakDetector};
pub use orchestrator::LoaderOrchestrator;
pub use scheduler::{DownloadScheduler, RetryPolicy, SchedulerStats};
pub use state::{AppState, AppStateStore, FileStateStore, MemoryStateStore};
pub use trust::{pin_ed25519, KeyMetadata, TrustPolicy, TrustStore};
pub use types::{
    DsseEnvelope, DsseSignature, LoadedModule, Manifest, ManifestBody, ModuleRef, ModuleSet,
    TrustedKey,
};
pub use verify::{
    compute_key_id_from_key, sign_manifest, unsigned_manifest, ManifestVerifier,
    PAYLOAD_TYPE_MANIFEST_V1,
};
