//! Chunk descriptors and planning.

use chrono::{DateTime, Utc};
use serde::Serialize;

/// One bounded slice of an entity's dataset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChunkDescriptor {
    pub site_id: String,
    pub offset: u64,
    pub chunk_size: u64,
    pub range_start: Option<DateTime<Utc>>,
    pub range_end: Option<DateTime<Utc>>,
}

impl ChunkDescriptor {
    /// End of the slice, exclusive.
    pub fn end(&self) -> u64 {
        self.offset + self.chunk_size
    }
}

/// `(offset, size)` pairs tiling `[0, total)`; the last chunk is clipped.
pub fn plan_chunks(total: u64, chunk_size: u64) -> Vec<(u64, u64)> {
    if total == 0 || chunk_size == 0 {
        return Vec::new();
    }
    (0..total.div_ceil(chunk_size))
        .map(|i| {
            let offset = i * chunk_size;
            (offset, chunk_size.min(total - offset))
        })
        .collect()
}

/// Size of the chunk at `offset` once `total` is known.
pub fn clipped_size(offset: u64, chunk_size: u64, total: Option<u64>) -> u64 {
    match total {
        Some(total) => chunk_size.min(total.saturating_sub(offset)),
        None => chunk_size,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_plan_250k_in_25k_chunks() {
        let plan = plan_chunks(250_000, 25_000);
        assert_eq!(plan.len(), 10);
        assert_eq!(plan[9], (225_000, 25_000));
    }

    #[test]
    fn test_plan_clips_last_chunk() {
        assert_eq!(plan_chunks(25, 10), vec![(0, 10), (10, 10), (20, 5)]);
        assert!(plan_chunks(0, 10).is_empty());
        assert_eq!(clipped_size(20, 10, Some(25)), 5);
        assert_eq!(clipped_size(20, 10, None), 10);
    }

    proptest! {
        // Chunks cover [0, total) with no gaps or overlaps.
        #[test]
        fn prop_chunks_tile_range(total in 0u64..2_000_000, chunk_size in 1u64..100_000) {
            let plan = plan_chunks(total, chunk_size);
            let mut cursor = 0;
            for (offset, size) in &plan {
                prop_assert_eq!(*offset, cursor);
                prop_assert!(*size > 0 && *size <= chunk_size);
                cursor = offset + size;
            }
            prop_assert_eq!(cursor, total);
        }
    }
}
