//! Multi-Layer Cache Module
//!
//! Read-through / write-back composition of the in-memory registry (layer 1)
//! and the persistent layer (layer 2), partitioned per entity so that a
//! multi-site request can be partly served from cache.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::cache::{CacheEntry, PersistentLayer, PersistentStats, SharedRegistry};
use crate::clock::SharedClock;
use crate::models::EntityData;

/// Cached per-entity payload. Shared, never mutated after write.
pub type CachedDataset = Arc<EntityData>;

// == Layer ==
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Layer {
    Memory,
    Persistent,
}

// == Write Origin ==
/// Who produced a cached value; prefetched values are tracked until first use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOrigin {
    Foreground,
    Prefetch,
}

// == Hit Policy ==
/// When a set of entity hits counts as a complete hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "kebab-case")]
pub enum HitPolicy {
    /// Any unexpired entries, however far apart their write times
    #[default]
    BestEffort,
    /// Entries must have been written within `max_skew_ms` of each other
    Strict { max_skew_ms: u64 },
}

impl HitPolicy {
    /// Parses `best-effort` or `strict:<ms>`.
    pub fn parse(value: &str) -> Option<Self> {
        let value = value.trim().to_ascii_lowercase();
        if value == "best-effort" || value == "besteffort" {
            return Some(HitPolicy::BestEffort);
        }
        let skew = value.strip_prefix("strict")?.trim_start_matches(':');
        let max_skew_ms = if skew.is_empty() { 0 } else { skew.parse().ok()? };
        Some(HitPolicy::Strict { max_skew_ms })
    }
}

// == Layer Hit ==
#[derive(Debug, Clone)]
pub struct LayerHit {
    pub data: CachedDataset,
    pub layer: Layer,
    pub written_at: u64,
    /// First foreground read of a prefetched value
    pub prefetched: bool,
}

// == Lookup ==
/// Per-entity split of a multi-entity request.
#[derive(Debug, Default)]
pub struct CacheLookup {
    pub hits: BTreeMap<String, LayerHit>,
    pub missing: Vec<String>,
}

impl CacheLookup {
    pub fn is_complete(&self) -> bool {
        self.missing.is_empty() && !self.hits.is_empty()
    }
}

// == Multi-Layer Cache ==
pub struct MultiLayerCache {
    registry: SharedRegistry<CachedDataset>,
    registration: String,
    persistent: Option<PersistentLayer>,
    hit_policy: HitPolicy,
    prefetched: Mutex<HashSet<String>>,
    clock: SharedClock,
}

impl MultiLayerCache {
    /// Builds the cache over an existing registration.
    pub fn new(
        registry: SharedRegistry<CachedDataset>,
        registration: impl Into<String>,
        persistent: Option<PersistentLayer>,
        hit_policy: HitPolicy,
        clock: SharedClock,
    ) -> Self {
        Self {
            registry,
            registration: registration.into(),
            persistent,
            hit_policy,
            prefetched: Mutex::new(HashSet::new()),
            clock,
        }
    }

    pub fn registry(&self) -> &SharedRegistry<CachedDataset> {
        &self.registry
    }

    /// Slot key for one entity over one canonical range.
    pub fn slot_key(entity: &str, range_key: &str) -> String {
        format!("{}#{}", range_key, entity)
    }

    // == Read ==
    /// Layer 1, then layer 2 with promotion on hit.
    pub async fn read(&self, entity: &str, range_key: &str) -> Option<LayerHit> {
        self.read_as(entity, range_key, WriteOrigin::Foreground).await
    }

    /// Background readers leave the prefetched marker in place.
    async fn read_as(&self, entity: &str, range_key: &str, reader: WriteOrigin) -> Option<LayerHit> {
        let key = Self::slot_key(entity, range_key);

        let memory = self.registry.write().await.get(&self.registration, &key);
        let (entry, layer) = match memory {
            Some(entry) => (entry, Layer::Memory),
            None => {
                let entry = self.read_persistent(&key)?;
                self.registry
                    .write()
                    .await
                    .insert_entry(&self.registration, entry.clone());
                debug!(key = %key, "Promoted persistent hit to memory");
                (entry, Layer::Persistent)
            }
        };

        let prefetched = match reader {
            WriteOrigin::Foreground => self.prefetched.lock().remove(&key),
            WriteOrigin::Prefetch => false,
        };
        Some(LayerHit {
            data: entry.data,
            layer,
            written_at: entry.written_at,
            prefetched,
        })
    }

    fn read_persistent(&self, key: &str) -> Option<CacheEntry<CachedDataset>> {
        let entry: CacheEntry<EntityData> = self.persistent.as_ref()?.read(key)?;
        Some(CacheEntry {
            key: entry.key,
            data: Arc::new(entry.data),
            written_at: entry.written_at,
            ttl_ms: entry.ttl_ms,
        })
    }

    // == Write ==
    /// Writes through both layers.
    pub async fn write(&self, entity: &str, range_key: &str, data: CachedDataset, origin: WriteOrigin) {
        let key = Self::slot_key(entity, range_key);
        let now = self.clock.now_ms();

        let ttl_ms = {
            let mut registry = self.registry.write().await;
            registry.set(&self.registration, &key, Arc::clone(&data));
            registry.ttl_ms(&self.registration)
        };

        if let (Some(persistent), Some(ttl_ms)) = (&self.persistent, ttl_ms) {
            persistent.write(&key, data.as_ref(), now, ttl_ms);
        }

        let mut prefetched = self.prefetched.lock();
        match origin {
            WriteOrigin::Prefetch => {
                prefetched.insert(key);
            }
            WriteOrigin::Foreground => {
                prefetched.remove(&key);
            }
        }
    }

    // == Promote ==
    /// Copies a layer-2 value into layer 1. Returns true if anything was promoted.
    pub async fn promote(&self, entity: &str, range_key: &str) -> bool {
        let key = Self::slot_key(entity, range_key);
        if self.registry.read().await.contains_valid(&self.registration, &key) {
            return false;
        }
        match self.read_persistent(&key) {
            Some(entry) => self
                .registry
                .write()
                .await
                .insert_entry(&self.registration, entry),
            None => false,
        }
    }

    // == Lookup ==
    /// Splits `entities` into cache hits and misses under the hit policy.
    pub async fn lookup(&self, entities: &[String], range_key: &str, reader: WriteOrigin) -> CacheLookup {
        let mut lookup = CacheLookup::default();
        for entity in entities {
            match self.read_as(entity, range_key, reader).await {
                Some(hit) => {
                    lookup.hits.insert(entity.clone(), hit);
                }
                None => lookup.missing.push(entity.clone()),
            }
        }

        if let HitPolicy::Strict { max_skew_ms } = self.hit_policy {
            if lookup.is_complete() && lookup.hits.len() > 1 {
                let oldest = lookup.hits.values().map(|h| h.written_at).min().unwrap_or(0);
                let newest = lookup.hits.values().map(|h| h.written_at).max().unwrap_or(0);
                if newest - oldest > max_skew_ms {
                    debug!(
                        skew_ms = newest - oldest,
                        max_skew_ms, "Cached snapshots too far apart, refetching all"
                    );
                    lookup.missing = entities.to_vec();
                    lookup.hits.clear();
                }
            }
        }
        lookup
    }

    pub fn persistent_stats(&self) -> Option<PersistentStats> {
        self.persistent.as_ref().map(|p| p.stats())
    }
}

// == Unit Tests ==
#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheRegistry, MemoryStorage};
    use crate::clock::ManualClock;

    const RANGE: &str = "readings|range=30d|res=auto|fid=std";

    fn data(entity: &str) -> CachedDataset {
        Arc::new(EntityData {
            entity: entity.to_string(),
            rows: Vec::new(),
            total_records: Some(0),
        })
    }

    fn cache(policy: HitPolicy) -> (Arc<ManualClock>, MultiLayerCache) {
        let clock = Arc::new(ManualClock::new(0));
        let registry = CacheRegistry::shared(clock.clone());
        registry.try_write().unwrap().register("entity-data", 10_000, 100);
        let persistent = PersistentLayer::open(Box::new(MemoryStorage::new()), "sc:", 1 << 20, clock.clone());
        let cache = MultiLayerCache::new(registry, "entity-data", Some(persistent), policy, clock.clone());
        (clock, cache)
    }

    #[tokio::test]
    async fn test_write_reaches_both_layers() {
        let (_, cache) = cache(HitPolicy::BestEffort);
        cache.write("S1", RANGE, data("S1"), WriteOrigin::Foreground).await;

        let hit = cache.read("S1", RANGE).await.unwrap();
        assert_eq!(hit.layer, Layer::Memory);
        assert_eq!(cache.persistent_stats().unwrap().entries, 1);
    }

    #[tokio::test]
    async fn test_persistent_hit_is_promoted() {
        let (_, cache) = cache(HitPolicy::BestEffort);
        cache.write("S1", RANGE, data("S1"), WriteOrigin::Foreground).await;
        cache.registry().write().await.emergency_clear(100);

        let first = cache.read("S1", RANGE).await.unwrap();
        assert_eq!(first.layer, Layer::Persistent);

        let second = cache.read("S1", RANGE).await.unwrap();
        assert_eq!(second.layer, Layer::Memory);
        assert_eq!(second.written_at, first.written_at);
    }

    #[tokio::test]
    async fn test_promote_explicitly() {
        let (_, cache) = cache(HitPolicy::BestEffort);
        cache.write("S1", RANGE, data("S1"), WriteOrigin::Foreground).await;

        // Already in memory
        assert!(!cache.promote("S1", RANGE).await);

        cache.registry().write().await.emergency_clear(100);
        assert!(cache.promote("S1", RANGE).await);
        assert!(!cache.promote("S9", RANGE).await);
        assert_eq!(cache.read("S1", RANGE).await.unwrap().layer, Layer::Memory);
    }

    #[tokio::test]
    async fn test_promoted_entry_keeps_its_eviction_rank() {
        let clock = Arc::new(ManualClock::new(0));
        let registry = CacheRegistry::shared(clock.clone());
        registry.try_write().unwrap().register("entity-data", 10_000, 2);
        let persistent = PersistentLayer::open(Box::new(MemoryStorage::new()), "sc:", 1 << 20, clock.clone());
        let cache = MultiLayerCache::new(
            registry.clone(),
            "entity-data",
            Some(persistent),
            HitPolicy::BestEffort,
            clock.clone(),
        );

        cache.write("OLD", RANGE, data("OLD"), WriteOrigin::Foreground).await;
        registry.write().await.emergency_clear(100);

        clock.set(100);
        cache.write("MID", RANGE, data("MID"), WriteOrigin::Foreground).await;
        assert!(cache.promote("OLD", RANGE).await);

        clock.set(300);
        cache.write("NEW", RANGE, data("NEW"), WriteOrigin::Foreground).await;

        let mut guard = registry.write().await;
        let in_memory = |guard: &mut CacheRegistry<CachedDataset>, entity: &str| {
            guard
                .get("entity-data", &MultiLayerCache::slot_key(entity, RANGE))
                .is_some()
        };
        assert!(!in_memory(&mut guard, "OLD"));
        assert!(in_memory(&mut guard, "MID"));
        assert!(in_memory(&mut guard, "NEW"));
    }

    #[tokio::test]
    async fn test_lookup_partial_hit() {
        let (_, cache) = cache(HitPolicy::BestEffort);
        cache.write("S1", RANGE, data("S1"), WriteOrigin::Foreground).await;

        let entities = vec!["S1".to_string(), "S2".to_string()];
        let lookup = cache.lookup(&entities, RANGE, WriteOrigin::Foreground).await;

        assert!(!lookup.is_complete());
        assert!(lookup.hits.contains_key("S1"));
        assert_eq!(lookup.missing, vec!["S2".to_string()]);
    }

    #[tokio::test]
    async fn test_ttl_expiry_reaches_both_layers() {
        let (clock, cache) = cache(HitPolicy::BestEffort);
        cache.write("S1", RANGE, data("S1"), WriteOrigin::Foreground).await;

        clock.advance(9_999);
        assert!(cache.read("S1", RANGE).await.is_some());
        clock.advance(2);
        assert!(cache.read("S1", RANGE).await.is_none());
    }

    #[tokio::test]
    async fn test_strict_policy_rejects_staggered_snapshots() {
        let (clock, cache) = cache(HitPolicy::Strict { max_skew_ms: 1_000 });
        let entities = vec!["S1".to_string(), "S2".to_string()];

        cache.write("S1", RANGE, data("S1"), WriteOrigin::Foreground).await;
        clock.advance(500);
        cache.write("S2", RANGE, data("S2"), WriteOrigin::Foreground).await;
        assert!(cache.lookup(&entities, RANGE, WriteOrigin::Foreground).await.is_complete());

        clock.advance(2_000);
        cache.write("S2", RANGE, data("S2"), WriteOrigin::Foreground).await;
        let lookup = cache.lookup(&entities, RANGE, WriteOrigin::Foreground).await;
        assert!(!lookup.is_complete());
        assert_eq!(lookup.missing.len(), 2);
    }

    #[tokio::test]
    async fn test_prefetched_flag_reported_once() {
        let (_, cache) = cache(HitPolicy::BestEffort);
        cache.write("S1", RANGE, data("S1"), WriteOrigin::Prefetch).await;

        let entities = vec!["S1".to_string()];
        let background = cache.lookup(&entities, RANGE, WriteOrigin::Prefetch).await;
        assert!(!background.hits["S1"].prefetched);

        assert!(cache.read("S1", RANGE).await.unwrap().prefetched);
        assert!(!cache.read("S1", RANGE).await.unwrap().prefetched);
    }

    #[test]
    fn test_hit_policy_parse() {
        assert_eq!(HitPolicy::parse("best-effort"), Some(HitPolicy::BestEffort));
        assert_eq!(
            HitPolicy::parse("strict:250"),
            Some(HitPolicy::Strict { max_skew_ms: 250 })
        );
        assert_eq!(HitPolicy::parse("strict"), Some(HitPolicy::Strict { max_skew_ms: 0 }));
        assert_eq!(HitPolicy::parse("loose"), None);
    }
}
