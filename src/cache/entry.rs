//! Cache Entry Module
//!
//! Defines the structure for individual cache entries with TTL support.

// == Cache Entry ==
/// A single immutable cache entry. A logical update writes a new entry.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry<T> {
    /// Key the entry was written under
    pub key: String,
    /// The stored value
    pub data: T,
    /// Write timestamp (Unix milliseconds)
    pub written_at: u64,
    /// Lifetime in milliseconds
    pub ttl_ms: u64,
}

impl<T> CacheEntry<T> {
    // == Constructor ==
    /// Creates a new cache entry written at `now_ms`.
    pub fn new(key: impl Into<String>, data: T, now_ms: u64, ttl_ms: u64) -> Self {
        Self {
            key: key.into(),
            data,
            written_at: now_ms,
            ttl_ms,
        }
    }

    // == Validity ==
    /// An entry is valid iff `now - written_at < ttl_ms`.
    ///
    /// A clock that reads earlier than the write time counts as zero age.
    pub fn is_valid_at(&self, now_ms: u64) -> bool {
        now_ms.saturating_sub(self.written_at) < self.ttl_ms
    }

    pub fn is_expired_at(&self, now_ms: u64) -> bool {
        !self.is_valid_at(now_ms)
    }

    /// Returns remaining lifetime in milliseconds, 0 once expired.
    pub fn ttl_remaining_ms(&self, now_ms: u64) -> u64 {
        (self.written_at + self.ttl_ms).saturating_sub(now_ms)
    }
}
