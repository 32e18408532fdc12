//! Write Order Module
//!
//! Tracks keys by their write time for oldest-write-first eviction.

use std::collections::{BTreeMap, HashMap};

/// Position of a key: write time, then arrival order among equal times.
type Slot = (u64, u64);

// == Write Order ==
/// Tracks write times for FIFO eviction.
///
/// Keys are ordered by the `written_at` they were recorded with, not by when
/// they were recorded, so an entry restored with its original write time
/// sits among its peers rather than at the young end.
///
/// Reads never reorder keys; only a write does.
#[derive(Debug, Default)]
pub struct WriteOrder {
    by_time: BTreeMap<Slot, String>,
    slots: HashMap<String, Slot>,
    next_seq: u64,
}

impl WriteOrder {
    // == Constructor ==
    /// Creates a new empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    // == Record Write ==
    /// Places `key` at `written_at`, replacing any earlier position.
    pub fn record_write(&mut self, key: &str, written_at: u64) {
        self.remove(key);
        let slot = (written_at, self.next_seq);
        self.next_seq += 1;
        self.by_time.insert(slot, key.to_string());
        self.slots.insert(key.to_string(), slot);
    }

    // == Remove ==
    /// Removes a key from the tracker.
    pub fn remove(&mut self, key: &str) {
        if let Some(slot) = self.slots.remove(key) {
            self.by_time.remove(&slot);
        }
    }

    // == Evict Oldest ==
    /// Returns and removes the key with the oldest write time.
    pub fn evict_oldest(&mut self) -> Option<String> {
        let (_, key) = self.by_time.pop_first()?;
        self.slots.remove(&key);
        Some(key)
    }

    // == Peek Oldest ==
    pub fn peek_oldest(&self) -> Option<&String> {
        self.by_time.values().next()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.slots.contains_key(key)
    }
}
