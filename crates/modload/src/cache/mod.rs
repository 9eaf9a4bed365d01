//! Durable content-addressed module cache.
//!
//! Entries are keyed by content identifier (the module digest) and survive
//! restarts. The sum of unpinned entry sizes is kept within the configured
//! budget by evicting the least recently used unpinned entry after every
//! store; pinned entries are never evicted, even if that leaves the cache
//! over budget.
//!
//! Stores, evictions and purges are serialized through one write gate.
//! Lookups only take the index lock briefly and read files outside of it;
//! a hit persists its access time without taking the gate.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use chrono::Utc;
use parking_lot::Mutex;
use tokio::fs;
use tracing::{debug, info, warn};

use crate::digest::{compute_digest, digest_hex};
use crate::error::{LoaderError, LoaderResult};

mod index;
mod io;

use index::CacheIndex;
use io::{EntryMeta, MODULE_FILE};

/// Point-in-time cache statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: usize,
    pub pinned_entries: usize,
    pub total_bytes: u64,
    pub unpinned_bytes: u64,
    pub max_bytes: u64,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

/// Durable LRU cache of verified module bytes.
#[derive(Debug)]
pub struct ContentCache {
    root: PathBuf,
    max_bytes: u64,
    index: Arc<Mutex<CacheIndex>>,
    write_gate: tokio::sync::Mutex<()>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

/// Keeps a content identifier pinned until dropped.
#[derive(Debug)]
pub struct PinGuard {
    index: Arc<Mutex<CacheIndex>>,
    id: String,
}

impl PinGuard {
    pub fn id(&self) -> &str {
        &self.id
    }
}

impl Drop for PinGuard {
    fn drop(&mut self) {
        self.index.lock().unpin(&self.id);
    }
}

impl ContentCache {
    /// Open (or create) a cache rooted at `root`, restoring entries from disk.
    ///
    /// Entries whose metadata is unreadable or disagrees with the stored
    /// file are removed.
    pub async fn open(root: impl Into<PathBuf>, max_bytes: u64) -> LoaderResult<Self> {
        let root = root.into();
        let entries_dir = io::entries_dir(&root);
        fs::create_dir_all(&entries_dir)
            .await
            .map_err(|e| io::cache_error("failed to create", &entries_dir, e))?;

        let mut restored = Vec::new();
        let mut dir = fs::read_dir(&entries_dir)
            .await
            .map_err(|e| io::cache_error("failed to list", &entries_dir, e))?;
        while let Some(entry) = dir
            .next_entry()
            .await
            .map_err(|e| io::cache_error("failed to list", &entries_dir, e))?
        {
            let path = entry.path();
            match restore_entry(&path).await {
                Some(meta) => restored.push(meta),
                None => {
                    warn!(path = %path.display(), "removing unreadable cache entry");
                    if let Err(e) = io::remove_entry_dir(&path).await {
                        warn!(error = %e, "failed to remove unreadable cache entry");
                    }
                }
            }
        }

        restored.sort_by_key(|meta| meta.last_access);
        let mut index = CacheIndex::default();
        for meta in &restored {
            index.insert(&meta.id, meta.size, meta.last_access);
        }

        let cache = Self {
            root,
            max_bytes,
            index: Arc::new(Mutex::new(index)),
            write_gate: tokio::sync::Mutex::new(()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        };
        info!(
            root = %cache.root.display(),
            entries = restored.len(),
            max_bytes,
            "opened content cache"
        );

        cache.evict_if_needed().await?;
        Ok(cache)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn max_bytes(&self) -> u64 {
        self.max_bytes
    }

    fn entry_dir(&self, id: &str) -> LoaderResult<PathBuf> {
        let hex = digest_hex(id).ok_or_else(|| LoaderError::Cache {
            message: format!("invalid content id: {}", id),
        })?;
        Ok(io::entries_dir(&self.root).join(hex))
    }

    /// Look up cached bytes, marking the entry as most recently used.
    ///
    /// Entries that fail integrity checks on read are purged and reported
    /// as a miss.
    pub async fn lookup(&self, id: &str) -> LoaderResult<Option<Bytes>> {
        let Some(expected_size) = self.index.lock().get(id).map(|e| e.size) else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return Ok(None);
        };
        let entry_dir = self.entry_dir(id)?;

        let bytes = match fs::read(entry_dir.join(MODULE_FILE)).await {
            Ok(bytes) => Bytes::from(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // Either evicted since the index check, or removed behind
                // our back. Only the latter leaves an index entry.
                self.forget_missing(id, &entry_dir).await?;
                self.misses.fetch_add(1, Ordering::Relaxed);
                return Ok(None);
            }
            Err(e) => {
                warn!(id = %id, error = %e, "unreadable cache entry, purging");
                self.purge(id).await?;
                self.misses.fetch_add(1, Ordering::Relaxed);
                return Ok(None);
            }
        };

        if bytes.len() as u64 != expected_size || compute_digest(&bytes) != id {
            let err = LoaderError::CacheCorruption {
                id: id.to_string(),
                reason: "stored bytes do not match their identifier".to_string(),
            };
            warn!(error = %err, "purging corrupt cache entry");
            self.purge(id).await?;
            self.misses.fetch_add(1, Ordering::Relaxed);
            return Ok(None);
        }

        self.hits.fetch_add(1, Ordering::Relaxed);
        self.record_access(id, &entry_dir).await;
        debug!(id = %id, size = bytes.len(), "cache hit");
        Ok(Some(bytes))
    }

    /// Drop the index entry for `id` if its module file is gone.
    async fn forget_missing(&self, id: &str, entry_dir: &Path) -> LoaderResult<()> {
        let _gate = self.write_gate.lock().await;
        let indexed = self.index.lock().contains(id);
        if !indexed || module_file_exists(entry_dir).await {
            return Ok(());
        }
        warn!(id = %id, "cache entry lost its module file, dropping it");
        self.index.lock().remove(id);
        io::remove_entry_dir(entry_dir).await
    }

    /// Bump recency in memory, then persist the access time best-effort.
    ///
    /// Runs outside the write gate so hits never wait on a store.
    async fn record_access(&self, id: &str, entry_dir: &Path) {
        let now = Utc::now();
        if !self.index.lock().touch(id, now) {
            return;
        }
        match io::read_meta(entry_dir).await {
            Ok(mut meta) => {
                meta.last_access = now;
                if let Err(e) = io::write_meta(entry_dir, &meta).await {
                    debug!(id = %id, error = %e, "failed to persist access time");
                }
            }
            Err(e) => debug!(id = %id, error = %e, "failed to persist access time"),
        }
    }

    /// Store verified bytes under their content identifier.
    ///
    /// Storing identical bytes again is a no-op. Bytes that do not hash to
    /// `id` are rejected with `CacheCorruption` and any existing entry is
    /// left intact.
    pub async fn store(&self, id: &str, bytes: &[u8]) -> LoaderResult<()> {
        let entry_dir = self.entry_dir(id)?;
        let actual = compute_digest(bytes);
        if actual != id {
            return Err(LoaderError::CacheCorruption {
                id: id.to_string(),
                reason: format!("bytes hash to {}", actual),
            });
        }

        let _gate = self.write_gate.lock().await;

        let indexed_size = self.index.lock().get(id).map(|e| e.size);
        if indexed_size == Some(bytes.len() as u64) && module_file_exists(&entry_dir).await {
            debug!(id = %id, "already cached");
            return Ok(());
        }

        let now = Utc::now();
        let meta = EntryMeta {
            id: id.to_string(),
            size: bytes.len() as u64,
            stored_at: now,
            last_access: now,
        };

        if let Err(e) = write_entry(&entry_dir, bytes, &meta).await {
            if let Err(cleanup) = io::remove_entry_dir(&entry_dir).await {
                warn!(id = %id, error = %cleanup, "failed to clean up partial entry");
            }
            return Err(e);
        }

        self.index.lock().insert(id, meta.size, now);
        debug!(id = %id, size = meta.size, "stored in cache");

        self.evict_locked().await
    }

    /// Evict least recently used unpinned entries until within budget.
    pub async fn evict_if_needed(&self) -> LoaderResult<()> {
        let _gate = self.write_gate.lock().await;
        self.evict_locked().await
    }

    async fn evict_locked(&self) -> LoaderResult<()> {
        let victims = self.index.lock().take_victims(self.max_bytes);
        for (id, size) in victims {
            self.evictions.fetch_add(1, Ordering::Relaxed);
            let removed = match self.entry_dir(&id) {
                Ok(entry_dir) => io::remove_entry_dir(&entry_dir).await,
                Err(e) => Err(e),
            };
            // Leftovers are re-validated or removed by the next `open`.
            match removed {
                Ok(()) => debug!(id = %id, size, "evicted from cache"),
                Err(e) => warn!(id = %id, error = %e, "failed to remove evicted entry"),
            }
        }
        Ok(())
    }

    /// Remove one entry regardless of pins.
    pub async fn purge(&self, id: &str) -> LoaderResult<()> {
        let entry_dir = self.entry_dir(id)?;
        let _gate = self.write_gate.lock().await;
        self.index.lock().remove(id);
        io::remove_entry_dir(&entry_dir).await
    }

    /// Pin `id` until the returned guard is dropped.
    ///
    /// Pins are reference counted and may be taken before the entry exists.
    pub fn pin(&self, id: &str) -> PinGuard {
        self.index.lock().pin(id);
        PinGuard {
            index: Arc::clone(&self.index),
            id: id.to_string(),
        }
    }

    pub fn is_pinned(&self, id: &str) -> bool {
        self.index.lock().is_pinned(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.lock().contains(id)
    }

    /// Cached ids from least to most recently used.
    pub fn ids_by_recency(&self) -> Vec<String> {
        self.index.lock().ids_by_recency()
    }

    pub fn stats(&self) -> CacheStats {
        let index = self.index.lock();
        CacheStats {
            entries: index.len(),
            pinned_entries: index.pinned_entries(),
            total_bytes: index.total_bytes(),
            unpinned_bytes: index.unpinned_bytes(),
            max_bytes: self.max_bytes,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }
}

async fn write_entry(entry_dir: &Path, bytes: &[u8], meta: &EntryMeta) -> LoaderResult<()> {
    fs::create_dir_all(entry_dir)
        .await
        .map_err(|e| io::cache_error("failed to create", entry_dir, e))?;
    io::write_atomic(&entry_dir.join(MODULE_FILE), bytes).await?;
    io::write_meta(entry_dir, meta).await
}

async fn module_file_exists(entry_dir: &Path) -> bool {
    fs::try_exists(entry_dir.join(MODULE_FILE))
        .await
        .unwrap_or(false)
}

/// Read back an entry's metadata if the entry looks complete.
async fn restore_entry(entry_dir: &Path) -> Option<EntryMeta> {
    let meta = io::read_meta(entry_dir).await.ok()?;
    let name = entry_dir.file_name()?.to_str()?;
    if digest_hex(&meta.id) != Some(name) {
        return None;
    }
    let file_len = fs::metadata(entry_dir.join(MODULE_FILE)).await.ok()?.len();
    (file_len == meta.size).then_some(meta)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn id_of(bytes: &[u8]) -> String {
        compute_digest(bytes)
    }

    async fn cache(dir: &TempDir, max: u64) -> ContentCache {
        ContentCache::open(dir.path().join("cache"), max).await.unwrap()
    }

    #[tokio::test]
    async fn test_store_then_lookup() {
        let dir = TempDir::new().unwrap();
        let cache = cache(&dir, 1024).await;
        let id = id_of(b"module-a");

        cache.store(&id, b"module-a").await.unwrap();
        let bytes = cache.lookup(&id).await.unwrap().unwrap();
        assert_eq!(&bytes[..], b"module-a");

        let stats = cache.stats();
        assert_eq!(stats.entries, 1);
        assert_eq!(stats.total_bytes, 8);
        assert_eq!(stats.hits, 1);
    }

    #[tokio::test]
    async fn test_lookup_miss() {
        let dir = TempDir::new().unwrap();
        let cache = cache(&dir, 1024).await;
        assert!(cache.lookup(&id_of(b"nope")).await.unwrap().is_none());
        assert_eq!(cache.stats().misses, 1);
    }

    #[tokio::test]
    async fn test_store_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let cache = cache(&dir, 1024).await;
        let id = id_of(b"same");

        cache.store(&id, b"same").await.unwrap();
        let before = cache.stats();
        cache.store(&id, b"same").await.unwrap();
        assert_eq!(cache.stats(), before);
    }

    #[tokio::test]
    async fn test_conflicting_bytes_rejected_original_intact() {
        let dir = TempDir::new().unwrap();
        let cache = cache(&dir, 1024).await;
        let id = id_of(b"original");
        cache.store(&id, b"original").await.unwrap();

        let err = cache.store(&id, b"imposter").await.unwrap_err();
        assert!(matches!(err, LoaderError::CacheCorruption { .. }));

        let bytes = cache.lookup(&id).await.unwrap().unwrap();
        assert_eq!(&bytes[..], b"original");
    }

    #[tokio::test]
    async fn test_invalid_id_rejected() {
        let dir = TempDir::new().unwrap();
        let cache = cache(&dir, 1024).await;
        let err = cache.store("../escape", b"x").await.unwrap_err();
        assert!(matches!(err, LoaderError::Cache { .. }));
    }

    #[tokio::test]
    async fn test_evicts_least_recently_used() {
        let dir = TempDir::new().unwrap();
        let cache = cache(&dir, 20).await;
        let (a, b, c) = (id_of(b"aaaaaaaaaa"), id_of(b"bbbbbbbbbb"), id_of(b"cccccccccc"));

        cache.store(&a, b"aaaaaaaaaa").await.unwrap();
        cache.store(&b, b"bbbbbbbbbb").await.unwrap();
        // Touch a so b becomes the oldest.
        cache.lookup(&a).await.unwrap().unwrap();
        cache.store(&c, b"cccccccccc").await.unwrap();

        assert!(cache.contains(&a));
        assert!(!cache.contains(&b));
        assert!(cache.contains(&c));
        assert_eq!(cache.stats().evictions, 1);
        assert!(!dir
            .path()
            .join("cache/entries")
            .join(digest_hex(&b).unwrap())
            .exists());
    }

    #[tokio::test]
    async fn test_pinned_entries_survive_over_budget() {
        let dir = TempDir::new().unwrap();
        let cache = cache(&dir, 10).await;
        let (a, b) = (id_of(b"aaaaaaaaaa"), id_of(b"bbbbbbbbbb"));

        let _pin_a = cache.pin(&a);
        let _pin_b = cache.pin(&b);
        cache.store(&a, b"aaaaaaaaaa").await.unwrap();
        cache.store(&b, b"bbbbbbbbbb").await.unwrap();

        let stats = cache.stats();
        assert_eq!(stats.entries, 2);
        assert_eq!(stats.total_bytes, 20);
        assert_eq!(stats.unpinned_bytes, 0);
    }

    #[tokio::test]
    async fn test_pin_guard_releases_on_drop() {
        let dir = TempDir::new().unwrap();
        let cache = cache(&dir, 0).await;
        let a = id_of(b"a");

        let guard = cache.pin(&a);
        cache.store(&a, b"a").await.unwrap();
        assert!(cache.is_pinned(&a));
        assert!(cache.contains(&a));

        drop(guard);
        assert!(!cache.is_pinned(&a));
        cache.evict_if_needed().await.unwrap();
        assert!(!cache.contains(&a));
    }

    #[tokio::test]
    async fn test_entries_survive_reopen_in_lru_order() {
        let dir = TempDir::new().unwrap();
        let (a, b) = (id_of(b"first"), id_of(b"second"));
        {
            let cache = cache(&dir, 1024).await;
            cache.store(&a, b"first").await.unwrap();
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            cache.store(&b, b"second").await.unwrap();
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            cache.lookup(&a).await.unwrap().unwrap();
        }

        let cache = cache(&dir, 1024).await;
        assert_eq!(cache.ids_by_recency(), vec![b.clone(), a.clone()]);
        assert_eq!(&cache.lookup(&b).await.unwrap().unwrap()[..], b"second");
    }

    #[tokio::test]
    async fn test_reopen_with_smaller_budget_evicts() {
        let dir = TempDir::new().unwrap();
        let (a, b) = (id_of(b"aaaa"), id_of(b"bbbb"));
        {
            let cache = cache(&dir, 1024).await;
            cache.store(&a, b"aaaa").await.unwrap();
            cache.store(&b, b"bbbb").await.unwrap();
        }
        let cache = cache(&dir, 4).await;
        assert_eq!(cache.stats().entries, 1);
    }

    #[tokio::test]
    async fn test_corrupt_on_read_is_purged() {
        let dir = TempDir::new().unwrap();
        let cache = cache(&dir, 1024).await;
        let id = id_of(b"payload");
        cache.store(&id, b"payload").await.unwrap();

        let module_path = dir
            .path()
            .join("cache/entries")
            .join(digest_hex(&id).unwrap())
            .join(MODULE_FILE);
        std::fs::write(&module_path, b"paylOad").unwrap();

        assert!(cache.lookup(&id).await.unwrap().is_none());
        assert!(!cache.contains(&id));
        assert!(!module_path.exists());
    }

    #[tokio::test]
    async fn test_truncated_entry_dropped_on_open() {
        let dir = TempDir::new().unwrap();
        let id = id_of(b"payload");
        {
            let cache = cache(&dir, 1024).await;
            cache.store(&id, b"payload").await.unwrap();
        }
        let entry_dir = dir
            .path()
            .join("cache/entries")
            .join(digest_hex(&id).unwrap());
        std::fs::write(entry_dir.join(MODULE_FILE), b"pay").unwrap();

        let cache = cache(&dir, 1024).await;
        assert!(!cache.contains(&id));
        assert!(!entry_dir.exists());
    }

    fn entry_path(dir: &TempDir, id: &str) -> PathBuf {
        dir.path()
            .join("cache/entries")
            .join(digest_hex(id).unwrap())
    }

    #[tokio::test]
    async fn test_entry_without_module_file_is_dropped() {
        let dir = TempDir::new().unwrap();
        let cache = cache(&dir, 1024).await;
        let id = id_of(b"payload");
        cache.store(&id, b"payload").await.unwrap();

        std::fs::remove_file(entry_path(&dir, &id).join(MODULE_FILE)).unwrap();

        assert!(cache.lookup(&id).await.unwrap().is_none());
        assert!(!cache.contains(&id));
        assert_eq!(cache.stats().entries, 0);
        assert_eq!(cache.stats().total_bytes, 0);

        // Storing again rewrites the entry instead of trusting the index.
        cache.store(&id, b"payload").await.unwrap();
        assert_eq!(&cache.lookup(&id).await.unwrap().unwrap()[..], b"payload");
    }

    #[tokio::test]
    async fn test_store_rewrites_entry_missing_on_disk() {
        let dir = TempDir::new().unwrap();
        let cache = cache(&dir, 1024).await;
        let id = id_of(b"payload");
        cache.store(&id, b"payload").await.unwrap();

        std::fs::remove_dir_all(entry_path(&dir, &id)).unwrap();
        cache.store(&id, b"payload").await.unwrap();

        assert!(entry_path(&dir, &id).join(MODULE_FILE).exists());
        assert_eq!(cache.stats().entries, 1);
        assert_eq!(cache.stats().total_bytes, 7);
    }

    #[tokio::test]
    async fn test_hit_does_not_wait_for_write_gate() {
        let dir = TempDir::new().unwrap();
        let cache = cache(&dir, 1024).await;
        let id = id_of(b"payload");
        cache.store(&id, b"payload").await.unwrap();

        let _held = cache.write_gate.lock().await;
        let hit = tokio::time::timeout(std::time::Duration::from_secs(5), cache.lookup(&id))
            .await
            .expect("lookup blocked on the write gate")
            .unwrap();
        assert_eq!(&hit.unwrap()[..], b"payload");
        assert_eq!(cache.stats().hits, 1);
    }

    #[tokio::test]
    async fn test_failed_eviction_does_not_fail_store() {
        let dir = TempDir::new().unwrap();
        let cache = cache(&dir, 10).await;
        let (a, b) = (id_of(b"aaaaaaaaaa"), id_of(b"bbbbbbbbbb"));
        cache.store(&a, b"aaaaaaaaaa").await.unwrap();

        // A plain file where the entry directory was cannot be removed as one.
        let blocked = entry_path(&dir, &a);
        std::fs::remove_dir_all(&blocked).unwrap();
        std::fs::write(&blocked, b"not a directory").unwrap();

        cache.store(&b, b"bbbbbbbbbb").await.unwrap();
        assert!(!cache.contains(&a));
        assert!(cache.contains(&b));
        assert_eq!(cache.stats().evictions, 1);
        assert_eq!(cache.stats().unpinned_bytes, 10);

        // The leftover is not restored on reopen.
        drop(cache);
        let cache = super::ContentCache::open(dir.path().join("cache"), 10)
            .await
            .unwrap();
        assert_eq!(cache.ids_by_recency(), vec![b]);
    }

    #[tokio::test]
    async fn test_concurrent_stores_of_same_id() {
        let dir = TempDir::new().unwrap();
        let cache = Arc::new(cache(&dir, 1024).await);
        let id = id_of(b"shared");

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = Arc::clone(&cache);
            let id = id.clone();
            handles.push(tokio::spawn(async move {
                cache.store(&id, b"shared").await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let stats = cache.stats();
        assert_eq!(stats.entries, 1);
        assert_eq!(stats.total_bytes, 6);
    }
}
