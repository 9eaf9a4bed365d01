//! Bounded, deduplicating download scheduler.
//!
//! - At most `limit` fetch attempts hold a permit at any time; waiting
//!   requests queue in FIFO order on a fair semaphore.
//! - Concurrent requests for one content identifier share a single
//!   download task and all receive its result.
//! - Transient failures are retried with jittered exponential backoff.
//!   Permits are released between attempts.
//! - A shared download is aborted only when every caller awaiting it has
//!   gone away.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{watch, Semaphore};
use tokio::task::AbortHandle;
use tracing::{debug, warn};

use crate::config::LoaderConfig;
use crate::digest::compute_digest;
use crate::error::{LoaderError, LoaderResult};
use crate::fetch::Fetcher;
use crate::types::ModuleRef;

/// Retry policy for transient fetch failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,

    /// Backoff before the first retry; doubles per retry.
    pub base_backoff: Duration,

    /// Upper bound for a single backoff.
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Self::default()
        }
    }

    /// Fail on the first error.
    pub fn no_retries() -> Self {
        Self::new(0)
    }

    pub fn with_backoff(mut self, base: Duration, max: Duration) -> Self {
        self.base_backoff = base;
        self.max_backoff = max;
        self
    }

    /// Jittered backoff before retry number `retry` (1-based).
    pub(crate) fn backoff(&self, retry: u32) -> Duration {
        use rand::Rng;

        let factor = 1u32 << retry.saturating_sub(1).min(16);
        let base = self.base_backoff.saturating_mul(factor).min(self.max_backoff);
        let base_ms = base.as_millis() as u64;
        let jittered_ms = rand::thread_rng().gen_range(0..=base_ms);
        Duration::from_millis(jittered_ms.max(1))
    }

    /// Run `attempt` until it succeeds, fails permanently or retries run out.
    ///
    /// Exhausted or permanent fetch failures become `FetchFailed` carrying the
    /// number of attempts made; other errors pass through untouched.
    pub(crate) async fn run<T, F, Fut>(&self, locator: &str, mut attempt: F) -> LoaderResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = LoaderResult<T>>,
    {
        let mut attempts: u32 = 0;

        loop {
            attempts += 1;

            match attempt().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempts <= self.max_retries => {
                    let backoff = self.backoff(attempts);
                    warn!(
                        error = %e,
                        retry = attempts,
                        max_retries = self.max_retries,
                        backoff_ms = backoff.as_millis() as u64,
                        "retrying fetch"
                    );
                    tokio::time::sleep(backoff).await;
                }
                Err(LoaderError::TransientFetch { message, .. })
                | Err(LoaderError::FetchFailed { message, .. }) => {
                    return Err(LoaderError::FetchFailed {
                        locator: locator.to_string(),
                        attempts,
                        message,
                    });
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Scheduler counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    /// Underlying downloads started.
    pub started: u64,
    pub succeeded: u64,
    pub failed: u64,
    /// Requests that joined an existing download.
    pub deduplicated: u64,
    /// Attempts currently holding a permit.
    pub in_flight: usize,
    pub peak_in_flight: usize,
}

#[derive(Debug, Default)]
struct Counters {
    started: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    deduplicated: AtomicU64,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

struct InFlightSlot<'a>(&'a Counters);

impl Counters {
    fn enter(&self) -> InFlightSlot<'_> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        InFlightSlot(self)
    }
}

impl Drop for InFlightSlot<'_> {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

type SharedResult = Option<LoaderResult<Bytes>>;

struct InFlight {
    result: watch::Receiver<SharedResult>,
    waiters: usize,
    generation: u64,
    abort: AbortHandle,
}

#[derive(Default)]
struct InFlightMap {
    entries: HashMap<String, InFlight>,
    next_generation: u64,
}

/// Everything a download task needs, detached from the scheduler.
#[derive(Clone)]
struct DownloadContext {
    fetcher: Arc<dyn Fetcher>,
    permits: Arc<Semaphore>,
    retry: RetryPolicy,
    attempt_timeout: Option<Duration>,
    counters: Arc<Counters>,
}

impl DownloadContext {
    async fn download(&self, module: &ModuleRef, locator: &str) -> LoaderResult<Bytes> {
        self.counters.started.fetch_add(1, Ordering::Relaxed);
        debug!(id = %module.content_id(), locator = %locator, "download started");

        let result = self
            .retry
            .run(locator, || self.attempt(locator))
            .await
            .and_then(|bytes| check_integrity(module, bytes));

        match &result {
            Ok(bytes) => {
                self.counters.succeeded.fetch_add(1, Ordering::Relaxed);
                debug!(id = %module.content_id(), size = bytes.len(), "download completed");
            }
            Err(e) => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                warn!(id = %module.content_id(), error = %e, "download failed");
            }
        }
        result
    }

    async fn attempt(&self, locator: &str) -> LoaderResult<Bytes> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| LoaderError::FetchFailed {
                locator: locator.to_string(),
                attempts: 0,
                message: "scheduler closed".to_string(),
            })?;
        let _slot = self.counters.enter();

        match self.attempt_timeout {
            Some(limit) => tokio::time::timeout(limit, self.fetcher.get(locator))
                .await
                .map_err(|_| LoaderError::TransientFetch {
                    locator: locator.to_string(),
                    message: format!("attempt timed out after {:?}", limit),
                })?,
            None => self.fetcher.get(locator).await,
        }
    }
}

fn check_integrity(module: &ModuleRef, bytes: Bytes) -> LoaderResult<Bytes> {
    if bytes.len() as u64 != module.size {
        return Err(LoaderError::IntegrityMismatch {
            id: module.content_id().to_string(),
            expected: format!("{} bytes", module.size),
            actual: format!("{} bytes", bytes.len()),
        });
    }
    let actual = compute_digest(&bytes);
    if actual != module.digest {
        return Err(LoaderError::IntegrityMismatch {
            id: module.content_id().to_string(),
            expected: module.digest.clone(),
            actual,
        });
    }
    Ok(bytes)
}

/// Removes the task's in-flight entry when the task ends, however it ends.
struct TaskCleanup {
    in_flight: Arc<Mutex<InFlightMap>>,
    id: String,
    generation: u64,
}

impl Drop for TaskCleanup {
    fn drop(&mut self) {
        let mut map = self.in_flight.lock();
        if map
            .entries
            .get(&self.id)
            .is_some_and(|e| e.generation == self.generation)
        {
            map.entries.remove(&self.id);
        }
    }
}

/// One caller's interest in a shared download.
struct Waiter<'a> {
    in_flight: &'a Mutex<InFlightMap>,
    id: &'a str,
    generation: u64,
    finished: bool,
}

impl Drop for Waiter<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let abort = {
            let mut map = self.in_flight.lock();
            match map.entries.get_mut(self.id) {
                Some(entry) if entry.generation == self.generation => {
                    entry.waiters -= 1;
                    if entry.waiters == 0 {
                        map.entries.remove(self.id).map(|e| e.abort)
                    } else {
                        None
                    }
                }
                _ => None,
            }
        };
        if let Some(abort) = abort {
            debug!(id = %self.id, "no callers left, cancelling download");
            abort.abort();
        }
    }
}

/// Shared download gate for every load in the process.
pub struct DownloadScheduler {
    context: DownloadContext,
    limit: usize,
    in_flight: Arc<Mutex<InFlightMap>>,
}

impl std::fmt::Debug for DownloadScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadScheduler")
            .field("limit", &self.limit)
            .field("retry", &self.context.retry)
            .field("attempt_timeout", &self.context.attempt_timeout)
            .finish()
    }
}

impl DownloadScheduler {
    /// Create a scheduler allowing `limit` simultaneous attempts (at least one).
    pub fn new(fetcher: Arc<dyn Fetcher>, limit: usize) -> Self {
        let limit = limit.max(1);
        Self {
            context: DownloadContext {
                fetcher,
                permits: Arc::new(Semaphore::new(limit)),
                retry: RetryPolicy::default(),
                attempt_timeout: None,
                counters: Arc::new(Counters::default()),
            },
            limit,
            in_flight: Arc::new(Mutex::new(InFlightMap::default())),
        }
    }

    /// Create a scheduler from loader configuration.
    pub fn from_config(config: &LoaderConfig, fetcher: Arc<dyn Fetcher>) -> LoaderResult<Self> {
        config.validate()?;
        Ok(Self::new(fetcher, config.concurrent_downloads)
            .with_retry_policy(RetryPolicy::new(config.max_retries))
            .with_attempt_timeout(config.attempt_timeout()))
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.context.retry = retry;
        self
    }

    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.context.attempt_timeout = Some(timeout);
        self
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn stats(&self) -> SchedulerStats {
        let c = &self.context.counters;
        SchedulerStats {
            started: c.started.load(Ordering::Relaxed),
            succeeded: c.succeeded.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
            deduplicated: c.deduplicated.load(Ordering::Relaxed),
            in_flight: c.in_flight.load(Ordering::SeqCst),
            peak_in_flight: c.peak_in_flight.load(Ordering::SeqCst),
        }
    }

    /// Fetch and verify a module from its own `url`.
    pub async fn fetch(&self, module: &ModuleRef) -> LoaderResult<Bytes> {
        self.fetch_from(module, &module.url).await
    }

    /// Fetch and verify a module from an already resolved locator.
    ///
    /// Callers requesting the same content identifier while a download is
    /// in flight share it, whatever locator they pass.
    pub async fn fetch_from(&self, module: &ModuleRef, locator: &str) -> LoaderResult<Bytes> {
        let id = module.content_id();
        let (mut result, generation) = self.join_or_start(module, locator);

        let mut waiter = Waiter {
            in_flight: &self.in_flight,
            id,
            generation,
            finished: false,
        };

        let outcome = loop {
            let current = result.borrow_and_update().clone();
            if let Some(outcome) = current {
                break outcome;
            }
            if result.changed().await.is_err() {
                let last = result.borrow().clone();
                break last.unwrap_or_else(|| {
                    Err(LoaderError::FetchFailed {
                        locator: locator.to_string(),
                        attempts: 0,
                        message: "download task ended without a result".to_string(),
                    })
                });
            }
        };

        waiter.finished = true;
        outcome
    }

    fn join_or_start(
        &self,
        module: &ModuleRef,
        locator: &str,
    ) -> (watch::Receiver<SharedResult>, u64) {
        let id = module.content_id();
        let mut map = self.in_flight.lock();

        if let Some(entry) = map.entries.get_mut(id) {
            entry.waiters += 1;
            self.context
                .counters
                .deduplicated
                .fetch_add(1, Ordering::Relaxed);
            debug!(id = %id, waiters = entry.waiters, "joined in-flight download");
            return (entry.result.clone(), entry.generation);
        }

        let generation = map.next_generation;
        map.next_generation += 1;

        let (tx, rx) = watch::channel(None);
        let cleanup = TaskCleanup {
            in_flight: Arc::clone(&self.in_flight),
            id: id.to_string(),
            generation,
        };
        let context = self.context.clone();
        let module = module.clone();
        let locator = locator.to_string();

        let task = tokio::spawn(async move {
            let _cleanup = cleanup;
            let result = context.download(&module, &locator).await;
            tx.send_replace(Some(result));
        });

        map.entries.insert(
            id.to_string(),
            InFlight {
                result: rx.clone(),
                waiters: 1,
                generation,
                abort: task.abort_handle(),
            },
        );
        (rx, generation)
    }

    /// Fetch raw bytes (e.g., a manifest) under the same bound and retry
    /// policy, without deduplication or integrity checks.
    pub async fn fetch_raw(&self, locator: &str) -> LoaderResult<Bytes> {
        self.context
            .retry
            .run(locator, || self.context.attempt(locator))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicU32;

    fn module(payload: &[u8]) -> ModuleRef {
        ModuleRef {
            name: "m".to_string(),
            url: "https://cdn.example.com/m.bin".to_string(),
            size: payload.len() as u64,
            digest: compute_digest(payload),
        }
    }

    fn fast_retry(max_retries: u32) -> RetryPolicy {
        RetryPolicy::new(max_retries)
            .with_backoff(Duration::from_millis(1), Duration::from_millis(2))
    }

    /// Fails transiently `failures` times, then serves `payload`.
    struct Flaky {
        payload: &'static [u8],
        failures: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl Fetcher for Flaky {
        async fn get(&self, locator: &str) -> LoaderResult<Bytes> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                return Err(LoaderError::TransientFetch {
                    locator: locator.to_string(),
                    message: "connection reset".to_string(),
                });
            }
            Ok(Bytes::from_static(self.payload))
        }
    }

    struct Permanent;

    #[async_trait]
    impl Fetcher for Permanent {
        async fn get(&self, locator: &str) -> LoaderResult<Bytes> {
            Err(LoaderError::FetchFailed {
                locator: locator.to_string(),
                attempts: 1,
                message: "HTTP 404".to_string(),
            })
        }
    }

    struct Slow;

    #[async_trait]
    impl Fetcher for Slow {
        async fn get(&self, _locator: &str) -> LoaderResult<Bytes> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(Bytes::new())
        }
    }

    #[tokio::test]
    async fn test_retries_transient_then_succeeds() {
        let fetcher = Arc::new(Flaky {
            payload: b"abc",
            failures: 2,
            calls: AtomicU32::new(0),
        });
        let scheduler =
            DownloadScheduler::new(fetcher.clone(), 2).with_retry_policy(fast_retry(3));

        let bytes = scheduler.fetch(&module(b"abc")).await.unwrap();
        assert_eq!(&bytes[..], b"abc");
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 3);
        assert_eq!(scheduler.stats().succeeded, 1);
    }

    #[tokio::test]
    async fn test_exhausted_retries_escalate_to_fetch_failed() {
        let fetcher = Arc::new(Flaky {
            payload: b"abc",
            failures: 10,
            calls: AtomicU32::new(0),
        });
        let scheduler =
            DownloadScheduler::new(fetcher.clone(), 2).with_retry_policy(fast_retry(2));

        let err = scheduler.fetch(&module(b"abc")).await.unwrap_err();
        assert!(matches!(err, LoaderError::FetchFailed { attempts: 3, .. }));
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 3);
        assert_eq!(scheduler.stats().failed, 1);
    }

    #[tokio::test]
    async fn test_permanent_failure_not_retried() {
        let scheduler = DownloadScheduler::new(Arc::new(Permanent), 2).with_retry_policy(fast_retry(5));
        let err = scheduler.fetch(&module(b"abc")).await.unwrap_err();
        assert!(matches!(err, LoaderError::FetchFailed { attempts: 1, .. }));
    }

    #[tokio::test]
    async fn test_integrity_mismatch_not_retried() {
        let fetcher = Arc::new(Flaky {
            payload: b"abd",
            failures: 0,
            calls: AtomicU32::new(0),
        });
        let scheduler =
            DownloadScheduler::new(fetcher.clone(), 2).with_retry_policy(fast_retry(3));

        let err = scheduler.fetch(&module(b"abc")).await.unwrap_err();
        assert!(matches!(err, LoaderError::IntegrityMismatch { .. }));
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_size_mismatch_reported() {
        let fetcher = Arc::new(Flaky {
            payload: b"abcd",
            failures: 0,
            calls: AtomicU32::new(0),
        });
        let scheduler = DownloadScheduler::new(fetcher, 1);
        match scheduler.fetch(&module(b"abc")).await.unwrap_err() {
            LoaderError::IntegrityMismatch { expected, actual, .. } => {
                assert_eq!(expected, "3 bytes");
                assert_eq!(actual, "4 bytes");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempt_timeout_is_transient() {
        let scheduler = DownloadScheduler::new(Arc::new(Slow), 1)
            .with_retry_policy(fast_retry(1))
            .with_attempt_timeout(Duration::from_millis(50));

        let err = scheduler.fetch(&module(b"")).await.unwrap_err();
        match err {
            LoaderError::FetchFailed {
                attempts, message, ..
            } => {
                assert_eq!(attempts, 2);
                assert!(message.contains("timed out"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_last_waiter_cancels_download() {
        let scheduler = DownloadScheduler::new(Arc::new(Slow), 1);
        let m = module(b"");

        let fetch = scheduler.fetch(&m);
        let timed_out = tokio::time::timeout(Duration::from_millis(10), fetch).await;
        assert!(timed_out.is_err());

        // Let the aborted task unwind.
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert!(scheduler.in_flight.lock().entries.is_empty());
        assert_eq!(scheduler.stats().in_flight, 0);
    }

    #[tokio::test]
    async fn test_backoff_bounded() {
        let policy = RetryPolicy::new(10)
            .with_backoff(Duration::from_millis(100), Duration::from_millis(400));
        for retry in 1..=10 {
            assert!(policy.backoff(retry) <= Duration::from_millis(400));
        }
    }
}
