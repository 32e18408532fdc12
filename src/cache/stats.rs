//! Cache Statistics Module
//!
//! Per-registration counters and the diagnostics snapshot built from them.

use serde::Serialize;

// == Counters ==
/// Running counters for one registration.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct CacheCounters {
    /// Number of reads that found a valid entry
    pub hits: u64,
    /// Number of reads that found nothing or an expired entry
    pub misses: u64,
    /// Entries removed by the size bound or an emergency clear
    pub evictions: u64,
    /// Entries removed because their TTL elapsed
    pub expirations: u64,
}

impl CacheCounters {
    pub fn new() -> Self {
        Self::default()
    }

    // == Hit Rate ==
    /// Returns hits / (hits + misses), or 0.0 if no reads have been made.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }

    pub fn record_hit(&mut self) {
        self.hits += 1;
    }

    pub fn record_miss(&mut self) {
        self.misses += 1;
    }

    pub fn record_evictions(&mut self, count: usize) {
        self.evictions += count as u64;
    }

    pub fn record_expirations(&mut self, count: usize) {
        self.expirations += count as u64;
    }
}

// == Registration Snapshot ==
/// Diagnostics view of one registration.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct RegistrationStats {
    pub name: String,
    pub size: usize,
    pub max_size: usize,
    pub ttl_ms: u64,
    /// Unix milliseconds of the last sweep, None if never swept
    pub last_cleanup_at: Option<u64>,
    pub hit_rate: f64,
    #[serde(flatten)]
    pub counters: CacheCounters,
}

// == Cleanup Report ==
/// Result of a sweep across every registration.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct CleanupStats {
    pub registrations: usize,
    pub expired_removed: usize,
    pub evicted: usize,
    pub remaining_entries: usize,
}

// == Unit Tests ==
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_new() {
        let counters = CacheCounters::new();
        assert_eq!(counters.hits, 0);
        assert_eq!(counters.misses, 0);
        assert_eq!(counters.evictions, 0);
        assert_eq!(counters.expirations, 0);
    }

    #[test]
    fn test_hit_rate_no_requests() {
        assert_eq!(CacheCounters::new().hit_rate(), 0.0);
    }

    #[test]
    fn test_hit_rate_mixed() {
        let mut counters = CacheCounters::new();
        counters.record_hit();
        counters.record_hit();
        counters.record_hit();
        counters.record_miss();
        assert_eq!(counters.hit_rate(), 0.75);
    }

    #[test]
    fn test_record_removals() {
        let mut counters = CacheCounters::new();
        counters.record_evictions(2);
        counters.record_expirations(3);
        assert_eq!(counters.evictions, 2);
        assert_eq!(counters.expirations, 3);
    }

    #[test]
    fn test_registration_stats_serialize_flat() {
        let stats = RegistrationStats {
            name: "readings".into(),
            size: 1,
            max_size: 10,
            ttl_ms: 1_000,
            last_cleanup_at: None,
            hit_rate: 0.0,
            counters: CacheCounters::new(),
        };
        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(json["name"], "readings");
        assert_eq!(json["hits"], 0);
        assert!(json["last_cleanup_at"].is_null());
    }
}
