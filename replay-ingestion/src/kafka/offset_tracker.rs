//! Offset Tracker - Tracks the latest committable offset per partition
//!
//! Offsets are merged in as messages are accepted and handed to the broker
//! only once the work they cover is durable. The tracker is owned by a single
//! driver task, so it needs no internal locking.

use std::collections::HashMap;

use tracing::debug;

use crate::kafka::types::{Partition, PartitionOffset};

/// Committable offsets keyed by partition.
pub type Offsets = HashMap<Partition, i64>;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct OffsetTracker {
    offsets: Offsets,
}

impl OffsetTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge the position of an accepted message. Last write wins per
    /// partition; the stored value is the next offset to consume.
    pub fn merge(&mut self, position: &PartitionOffset) {
        let next_offset = position.committable_offset();
        if let Some(previous) = self
            .offsets
            .insert(position.partition().clone(), next_offset)
        {
            if previous > next_offset {
                debug!(
                    topic = position.topic(),
                    partition = position.partition_number(),
                    previous_offset = previous,
                    new_offset = next_offset,
                    "Partition offset moved backwards"
                );
            }
        }
    }

    /// Merge a whole map of committable offsets (last write wins).
    pub fn extend(&mut self, offsets: Offsets) {
        self.offsets.extend(offsets);
    }

    pub fn get(&self, partition: &Partition) -> Option<i64> {
        self.offsets.get(partition).copied()
    }

    /// Take every tracked offset, leaving the tracker empty.
    pub fn take(&mut self) -> Offsets {
        std::mem::take(&mut self.offsets)
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

}

#[cfg(test)]
mod tests {
    use super::*;

    fn position(partition: i32, offset: i64) -> PartitionOffset {
        PartitionOffset::new(Partition::new("test-topic".to_string(), partition), offset)
    }

    #[test]
    fn test_merge_stores_next_offset() {
        let mut tracker = OffsetTracker::new();
        tracker.merge(&position(0, 99));

        assert_eq!(
            tracker.get(&Partition::new("test-topic".to_string(), 0)),
            Some(100)
        );
    }

    #[test]
    fn test_last_write_wins_per_partition() {
        let mut tracker = OffsetTracker::new();
        tracker.merge(&position(0, 10));
        tracker.merge(&position(1, 20));
        tracker.merge(&position(0, 11));

        assert_eq!(
            tracker.get(&Partition::new("test-topic".to_string(), 0)),
            Some(12)
        );
        assert_eq!(
            tracker.get(&Partition::new("test-topic".to_string(), 1)),
            Some(21)
        );
    }

    #[test]
    fn test_take_empties_tracker() {
        let mut tracker = OffsetTracker::new();
        tracker.merge(&position(0, 1));
        tracker.merge(&position(2, 5));

        let offsets = tracker.take();

        assert_eq!(offsets.len(), 2);
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_extend_overwrites_merged_offsets() {
        let mut tracker = OffsetTracker::new();
        tracker.merge(&position(0, 1));
        tracker.merge(&position(1, 1));

        let partition = Partition::new("test-topic".to_string(), 0);
        tracker.extend(Offsets::from([(partition.clone(), 40)]));

        assert_eq!(tracker.get(&partition), Some(40));
        assert_eq!(tracker.take().len(), 2);
    }
}
