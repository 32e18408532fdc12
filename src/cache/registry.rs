//! Cache Registry Module
//!
//! Named TTL/size-bounded caches registered once at startup. A read against
//! an unknown registration is a miss, never an error, so callers fall through
//! to the network.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::cache::{CacheEntry, CacheStore, CleanupStats, RegistrationStats};
use crate::clock::SharedClock;

/// Registry shared between the layered cache and the cleanup task.
pub type SharedRegistry<T> = Arc<RwLock<CacheRegistry<T>>>;

// == Cache Registry ==
#[derive(Debug)]
pub struct CacheRegistry<T> {
    stores: HashMap<String, CacheStore<T>>,
    clock: SharedClock,
}

impl<T: Clone> CacheRegistry<T> {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            stores: HashMap::new(),
            clock,
        }
    }

    /// Wraps a fresh registry for sharing.
    pub fn shared(clock: SharedClock) -> SharedRegistry<T> {
        Arc::new(RwLock::new(Self::new(clock)))
    }

    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    // == Register ==
    /// Registers a named cache. Returns false if the name is already taken;
    /// the existing registration is kept.
    pub fn register(&mut self, name: &str, ttl_ms: u64, max_entries: usize) -> bool {
        if self.stores.contains_key(name) {
            warn!(cache = name, "Cache already registered, keeping existing");
            return false;
        }
        self.stores
            .insert(name.to_string(), CacheStore::new(name, ttl_ms, max_entries));
        info!(cache = name, ttl_ms, max_entries, "Cache registered");
        true
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.stores.contains_key(name)
    }

    // == Get ==
    pub fn get(&mut self, name: &str, key: &str) -> Option<CacheEntry<T>> {
        let now = self.clock.now_ms();
        match self.stores.get_mut(name) {
            Some(store) => store.get(key, now),
            None => {
                debug!(cache = name, "Read against unregistered cache");
                None
            }
        }
    }

    // == Set ==
    /// Writes `data` under `key`. Returns false if `name` is not registered.
    pub fn set(&mut self, name: &str, key: &str, data: T) -> bool {
        let now = self.clock.now_ms();
        match self.stores.get_mut(name) {
            Some(store) => {
                let evicted = store.set(key, data, now);
                if evicted > 0 {
                    debug!(cache = name, evicted, "Size limit enforced on write");
                }
                true
            }
            None => {
                debug!(cache = name, "Write against unregistered cache dropped");
                false
            }
        }
    }

    /// Stores a pre-built entry, keeping its original write time.
    pub fn insert_entry(&mut self, name: &str, entry: CacheEntry<T>) -> bool {
        match self.stores.get_mut(name) {
            Some(store) => {
                store.insert_entry(entry);
                true
            }
            None => false,
        }
    }

    /// True if `key` holds a valid entry. Leaves counters untouched.
    pub fn contains_valid(&self, name: &str, key: &str) -> bool {
        let now = self.clock.now_ms();
        self.stores
            .get(name)
            .is_some_and(|store| store.peek(key, now).is_some())
    }

    /// Registration TTL, None if not registered.
    pub fn ttl_ms(&self, name: &str) -> Option<u64> {
        self.stores.get(name).map(|s| s.ttl_ms())
    }

    // == Clean Expired ==
    pub fn clean_expired(&mut self, name: &str) -> usize {
        let now = self.clock.now_ms();
        self.stores
            .get_mut(name)
            .map(|store| store.clean_expired(now))
            .unwrap_or(0)
    }

    // == Enforce Size Limit ==
    pub fn enforce_size_limit(&mut self, name: &str) -> usize {
        self.stores
            .get_mut(name)
            .map(|store| store.enforce_size_limit())
            .unwrap_or(0)
    }

    // == Global Cleanup ==
    /// Sweeps expired entries and re-applies size bounds on every registration.
    pub fn global_cleanup(&mut self) -> CleanupStats {
        let now = self.clock.now_ms();
        let mut stats = CleanupStats {
            registrations: self.stores.len(),
            ..CleanupStats::default()
        };

        for store in self.stores.values_mut() {
            stats.expired_removed += store.clean_expired(now);
            stats.evicted += store.enforce_size_limit();
            stats.remaining_entries += store.len();
        }

        stats
    }

    // == Emergency Clear ==
    /// Removes `target_reduction_percent` of all entries across every
    /// registration, oldest writes first. Returns the number removed.
    pub fn emergency_clear(&mut self, target_reduction_percent: u8) -> usize {
        let percent = target_reduction_percent.min(100) as usize;
        let total = self.total_entries();
        let target = (total * percent).div_ceil(100);
        if target == 0 {
            return 0;
        }

        let mut candidates: Vec<(u64, String, String)> = self
            .stores
            .iter()
            .flat_map(|(name, store)| {
                store
                    .write_times()
                    .into_iter()
                    .map(move |(written_at, key)| (written_at, name.clone(), key))
            })
            .collect();
        candidates.sort();

        let mut removed = 0;
        for (_, name, key) in candidates.into_iter().take(target) {
            if let Some(store) = self.stores.get_mut(&name) {
                if store.evict(&key) {
                    removed += 1;
                }
            }
        }

        warn!(
            removed,
            total, target_reduction_percent, "Emergency cache clear"
        );
        removed
    }

    // == Stats ==
    /// One snapshot per registration, sorted by name.
    pub fn stats(&self) -> Vec<RegistrationStats> {
        let mut stats: Vec<RegistrationStats> =
            self.stores.values().map(|s| s.stats()).collect();
        stats.sort_by(|a, b| a.name.cmp(&b.name));
        stats
    }

    pub fn total_entries(&self) -> usize {
        self.stores.values().map(|s| s.len()).sum()
    }
}
