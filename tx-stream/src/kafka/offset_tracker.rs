//! Offset Tracker - the mark store behind deferred commits
//!
//! Partition workers mark a partition once a batch reaches a terminal outcome
//! (processed, or handed to the dead letter sink). Commits only ever read marks
//! from here, so an offset can never be committed ahead of its batch.

use std::collections::HashMap;

use dashmap::DashMap;
use tracing::{debug, warn};

use crate::kafka::types::Partition;

#[derive(Debug, Clone, Copy)]
struct MarkState {
    /// The next offset to consume (highest finished offset + 1)
    marked: i64,
    /// The last offset successfully committed for this partition
    committed: Option<i64>,
}

/// Thread-safe store of marked and committed offsets per partition
#[derive(Debug, Default)]
pub struct OffsetTracker {
    marks: DashMap<Partition, MarkState>,
}

impl OffsetTracker {
    pub fn new() -> Self {
        Self {
            marks: DashMap::new(),
        }
    }

    /// Mark `partition` as finished up to (but excluding) `next_offset`.
    ///
    /// Marks only advance: an attempt to move a mark backwards is logged and ignored.
    pub fn mark(&self, partition: &Partition, next_offset: i64) {
        self.marks
            .entry(partition.clone())
            .and_modify(|state| {
                if next_offset > state.marked {
                    state.marked = next_offset;
                } else if next_offset < state.marked {
                    warn!(
                        topic = partition.topic(),
                        partition = partition.partition_number(),
                        current = state.marked,
                        attempted = next_offset,
                        "Ignoring mark that would move the offset backwards"
                    );
                }
            })
            .or_insert_with(|| {
                debug!(
                    topic = partition.topic(),
                    partition = partition.partition_number(),
                    offset = next_offset,
                    "First mark for partition"
                );
                MarkState {
                    marked: next_offset,
                    committed: None,
                }
            });
    }

    /// Current mark for a partition
    pub fn marked_offset(&self, partition: &Partition) -> Option<i64> {
        self.marks.get(partition).map(|state| state.marked)
    }

    /// Last committed offset for a partition
    pub fn committed_offset(&self, partition: &Partition) -> Option<i64> {
        self.marks.get(partition).and_then(|state| state.committed)
    }

    /// Snapshot of marks that have not been committed yet
    pub fn pending_commits(&self) -> HashMap<Partition, i64> {
        self.marks
            .iter()
            .filter(|entry| entry.committed != Some(entry.marked))
            .map(|entry| (entry.key().clone(), entry.marked))
            .collect()
    }

    /// Record a successful commit of `offsets`
    pub fn mark_committed(&self, offsets: &HashMap<Partition, i64>) {
        for (partition, offset) in offsets {
            if let Some(mut state) = self.marks.get_mut(partition) {
                state.committed = Some(*offset);
            }
        }
    }

    /// Forget a partition this process no longer owns
    pub fn clear_partition(&self, partition: &Partition) {
        if self.marks.remove(partition).is_some() {
            debug!(
                topic = partition.topic(),
                partition = partition.partition_number(),
                "Cleared offset marks for partition"
            );
        }
    }

    pub fn partition_count(&self) -> usize {
        self.marks.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_partition(num: i32) -> Partition {
        Partition::new("test-topic".to_string(), num)
    }

    #[test]
    fn test_mark_initializes_and_advances() {
        let tracker = OffsetTracker::new();
        let partition = test_partition(0);

        tracker.mark(&partition, 100);
        assert_eq!(tracker.marked_offset(&partition), Some(100));

        tracker.mark(&partition, 150);
        assert_eq!(tracker.marked_offset(&partition), Some(150));
    }

    #[test]
    fn test_mark_never_goes_backwards() {
        let tracker = OffsetTracker::new();
        let partition = test_partition(0);

        tracker.mark(&partition, 100);
        tracker.mark(&partition, 50);

        assert_eq!(tracker.marked_offset(&partition), Some(100));
    }

    #[test]
    fn test_pending_commits_excludes_committed_marks() {
        let tracker = OffsetTracker::new();
        let p0 = test_partition(0);
        let p1 = test_partition(1);

        tracker.mark(&p0, 10);
        tracker.mark(&p1, 20);

        let pending = tracker.pending_commits();
        assert_eq!(pending.len(), 2);

        tracker.mark_committed(&pending);
        assert!(tracker.pending_commits().is_empty());
        assert_eq!(tracker.committed_offset(&p0), Some(10));
        assert_eq!(tracker.committed_offset(&p1), Some(20));

        // A new mark makes the partition pending again
        tracker.mark(&p1, 25);
        let pending = tracker.pending_commits();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending.get(&p1), Some(&25));
    }

    #[test]
    fn test_clear_partition() {
        let tracker = OffsetTracker::new();
        let p0 = test_partition(0);
        let p1 = test_partition(1);

        tracker.mark(&p0, 10);
        tracker.mark(&p1, 20);
        tracker.clear_partition(&p0);

        assert_eq!(tracker.partition_count(), 1);
        assert_eq!(tracker.marked_offset(&p0), None);
        assert_eq!(tracker.marked_offset(&p1), Some(20));
    }
}
