//! Cache Module
//!
//! TTL/size-bounded registry, persistent layer, and the multi-layer cache
//! composed from them.

mod entry;
mod layered;
mod order;
mod persistent;
mod registry;
mod stats;
mod store;


// Re-export public types
pub use entry::CacheEntry;
pub use layered::{
    CacheLookup, CachedDataset, HitPolicy, Layer, LayerHit, MultiLayerCache, WriteOrigin,
};
pub use order::WriteOrder;
pub use persistent::{
    DirectoryStorage, MemoryStorage, PersistentLayer, PersistentStats, StorageBackend,
};
pub use registry::{CacheRegistry, SharedRegistry};
pub use stats::{CacheCounters, CleanupStats, RegistrationStats};
pub use store::CacheStore;

// == Public Constants ==
/// Registration holding per-entity datasets.
pub const ENTITY_CACHE: &str = "entity-data";

/// Key prefix for entries in the persistent layer.
pub const PERSISTENT_PREFIX: &str = "sensor-cache:";
