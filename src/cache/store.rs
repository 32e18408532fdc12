//! Cache Store Module
//!
//! One TTL/size-bounded registration: HashMap storage with write-order
//! tracking for FIFO eviction and lazy expiry on read.

use std::collections::HashMap;

use crate::cache::{CacheCounters, CacheEntry, RegistrationStats, WriteOrder};

// == Cache Store ==
/// Storage for a single named cache registration.
#[derive(Debug)]
pub struct CacheStore<T> {
    name: String,
    entries: HashMap<String, CacheEntry<T>>,
    order: WriteOrder,
    counters: CacheCounters,
    max_entries: usize,
    ttl_ms: u64,
    last_cleanup_at: Option<u64>,
}

impl<T: Clone> CacheStore<T> {
    // == Constructor ==
    /// Creates a new store.
    ///
    /// # Arguments
    /// * `name` - Registration name, used in logs and stats
    /// * `ttl_ms` - Lifetime applied to every entry written through `set`
    /// * `max_entries` - Size bound enforced oldest-write-first
    pub fn new(name: impl Into<String>, ttl_ms: u64, max_entries: usize) -> Self {
        Self {
            name: name.into(),
            entries: HashMap::new(),
            order: WriteOrder::new(),
            counters: CacheCounters::new(),
            max_entries,
            ttl_ms,
            last_cleanup_at: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ttl_ms(&self) -> u64 {
        self.ttl_ms
    }

    // == Set ==
    /// Writes a new entry for `key`, replacing any previous one, then
    /// enforces the size bound. Returns the number of entries evicted.
    pub fn set(&mut self, key: &str, data: T, now_ms: u64) -> usize {
        let entry = CacheEntry::new(key, data, now_ms, self.ttl_ms);
        self.insert_entry(entry)
    }

    // == Insert Entry ==
    /// Stores a pre-built entry as-is, keeping its write time and TTL.
    pub fn insert_entry(&mut self, entry: CacheEntry<T>) -> usize {
        let key = entry.key.clone();
        self.order.record_write(&key, entry.written_at);
        self.entries.insert(key, entry);
        self.enforce_size_limit()
    }

    // == Get ==
    /// Returns a snapshot of the entry if present and valid.
    ///
    /// Expired entries are removed on the spot and counted as misses.
    pub fn get(&mut self, key: &str, now_ms: u64) -> Option<CacheEntry<T>> {
        match self.entries.get(key) {
            Some(entry) if entry.is_valid_at(now_ms) => {
                let snapshot = entry.clone();
                self.counters.record_hit();
                Some(snapshot)
            }
            Some(_) => {
                self.entries.remove(key);
                self.order.remove(key);
                self.counters.record_expirations(1);
                self.counters.record_miss();
                None
            }
            None => {
                self.counters.record_miss();
                None
            }
        }
    }

    // == Peek ==
    /// Like `get` but leaves counters and storage untouched.
    pub fn peek(&self, key: &str, now_ms: u64) -> Option<&CacheEntry<T>> {
        self.entries.get(key).filter(|e| e.is_valid_at(now_ms))
    }

    // == Remove ==
    pub fn remove(&mut self, key: &str) -> Option<CacheEntry<T>> {
        let removed = self.entries.remove(key);
        if removed.is_some() {
            self.order.remove(key);
        }
        removed
    }

    // == Clean Expired ==
    /// Removes every expired entry. Returns the number removed.
    pub fn clean_expired(&mut self, now_ms: u64) -> usize {
        let expired_keys: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.is_expired_at(now_ms))
            .map(|(key, _)| key.clone())
            .collect();

        for key in &expired_keys {
            self.entries.remove(key);
            self.order.remove(key);
        }

        self.counters.record_expirations(expired_keys.len());
        self.last_cleanup_at = Some(now_ms);
        expired_keys.len()
    }

    // == Enforce Size Limit ==
    /// Evicts oldest writes until `len <= max_entries`. Returns the number evicted.
    pub fn enforce_size_limit(&mut self) -> usize {
        let mut evicted = 0;
        while self.entries.len() > self.max_entries {
            match self.order.evict_oldest() {
                Some(key) => {
                    self.entries.remove(&key);
                    evicted += 1;
                }
                None => break,
            }
        }
        self.counters.record_evictions(evicted);
        evicted
    }

    // == Oldest Writes ==
    /// `(written_at, key)` for every entry, for cross-registration eviction.
    pub fn write_times(&self) -> Vec<(u64, String)> {
        self.entries
            .values()
            .map(|e| (e.written_at, e.key.clone()))
            .collect()
    }

    /// Removes `key` as part of an emergency clear.
    pub fn evict(&mut self, key: &str) -> bool {
        let removed = self.remove(key).is_some();
        if removed {
            self.counters.record_evictions(1);
        }
        removed
    }

    // == Stats ==
    pub fn stats(&self) -> RegistrationStats {
        RegistrationStats {
            name: self.name.clone(),
            size: self.entries.len(),
            max_size: self.max_entries,
            ttl_ms: self.ttl_ms,
            last_cleanup_at: self.last_cleanup_at,
            hit_rate: self.counters.hit_rate(),
            counters: self.counters.clone(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
