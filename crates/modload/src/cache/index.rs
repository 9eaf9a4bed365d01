//! In-memory entry index: sizes, recency order and pin counts.
//!
//! Pin counts are process-local and kept apart from entries, so an id may
//! be pinned before its bytes are stored.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};

#[derive(Debug, Clone)]
pub(crate) struct IndexEntry {
    pub(crate) size: u64,
    pub(crate) last_access: DateTime<Utc>,
    tick: u64,
}

#[derive(Debug, Default)]
pub(crate) struct CacheIndex {
    entries: HashMap<String, IndexEntry>,
    /// Access tick -> id, oldest first.
    recency: BTreeMap<u64, String>,
    pins: HashMap<String, u32>,
    next_tick: u64,
    total_bytes: u64,
    unpinned_bytes: u64,
}

impl CacheIndex {
    pub(crate) fn get(&self, id: &str) -> Option<&IndexEntry> {
        self.entries.get(id)
    }

    pub(crate) fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    pub(crate) fn unpinned_bytes(&self) -> u64 {
        self.unpinned_bytes
    }

    pub(crate) fn is_pinned(&self, id: &str) -> bool {
        self.pins.get(id).is_some_and(|&n| n > 0)
    }

    pub(crate) fn pin_count(&self, id: &str) -> u32 {
        self.pins.get(id).copied().unwrap_or(0)
    }

    pub(crate) fn pinned_entries(&self) -> usize {
        self.entries.keys().filter(|id| self.is_pinned(id)).count()
    }

    fn bump_tick(&mut self) -> u64 {
        let tick = self.next_tick;
        self.next_tick += 1;
        tick
    }

    /// Insert an entry as most recently used. Replaces any previous entry.
    pub(crate) fn insert(&mut self, id: &str, size: u64, last_access: DateTime<Utc>) {
        self.remove(id);
        let tick = self.bump_tick();
        self.recency.insert(tick, id.to_string());
        self.entries.insert(
            id.to_string(),
            IndexEntry {
                size,
                last_access,
                tick,
            },
        );
        self.total_bytes += size;
        if !self.is_pinned(id) {
            self.unpinned_bytes += size;
        }
    }

    pub(crate) fn remove(&mut self, id: &str) -> Option<IndexEntry> {
        let entry = self.entries.remove(id)?;
        self.recency.remove(&entry.tick);
        self.total_bytes -= entry.size;
        if !self.is_pinned(id) {
            self.unpinned_bytes -= entry.size;
        }
        Some(entry)
    }

    /// Mark an entry as most recently used. Returns `false` if absent.
    pub(crate) fn touch(&mut self, id: &str, now: DateTime<Utc>) -> bool {
        let tick = self.bump_tick();
        let Some(entry) = self.entries.get_mut(id) else {
            return false;
        };
        self.recency.remove(&entry.tick);
        entry.tick = tick;
        entry.last_access = now;
        self.recency.insert(tick, id.to_string());
        true
    }

    pub(crate) fn pin(&mut self, id: &str) {
        let count = self.pins.entry(id.to_string()).or_insert(0);
        *count += 1;
        if *count == 1 {
            if let Some(entry) = self.entries.get(id) {
                self.unpinned_bytes -= entry.size;
            }
        }
    }

    pub(crate) fn unpin(&mut self, id: &str) {
        let Some(count) = self.pins.get_mut(id) else {
            return;
        };
        *count -= 1;
        if *count == 0 {
            self.pins.remove(id);
            if let Some(entry) = self.entries.get(id) {
                self.unpinned_bytes += entry.size;
            }
        }
    }

    /// Remove least recently used unpinned entries until unpinned bytes fit
    /// in `max_bytes` or nothing unpinned remains. Returns the removed ids.
    pub(crate) fn take_victims(&mut self, max_bytes: u64) -> Vec<(String, u64)> {
        let mut victims = Vec::new();
        if self.unpinned_bytes <= max_bytes {
            return victims;
        }

        let candidates: Vec<String> = self
            .recency
            .values()
            .filter(|id| !self.is_pinned(id))
            .cloned()
            .collect();

        for id in candidates {
            if self.unpinned_bytes <= max_bytes {
                break;
            }
            if let Some(entry) = self.remove(&id) {
                victims.push((id, entry.size));
            }
        }
        victims
    }

    /// Ids from least to most recently used.
    pub(crate) fn ids_by_recency(&self) -> Vec<String> {
        self.recency.values().cloned().collect()
    }
}
