//! In-memory storage engine state shared by every operation
//!
//! Tracks the oldest retained timestamp watermark and hosts the write-conflict
//! fail point used to exercise conflict retry paths.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use tracing::{debug, trace};

use crate::storage::timestamp::Timestamp;

#[derive(Debug, Default)]
pub struct StorageEngine {
    /// Packed oldest retained timestamp; commits may not be timestamped below it
    oldest_timestamp: AtomicU64,
    /// Remaining commits that will fail with a write conflict
    injected_write_conflicts: AtomicU32,
}

impl StorageEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn oldest_timestamp(&self) -> Timestamp {
        Timestamp::from_u64(self.oldest_timestamp.load(Ordering::Acquire))
    }

    /// Advance the oldest retained timestamp. The watermark never moves backwards.
    pub fn set_oldest_timestamp(&self, ts: Timestamp) {
        let previous = self.oldest_timestamp.fetch_max(ts.as_u64(), Ordering::AcqRel);
        if ts.as_u64() > previous {
            debug!("Oldest timestamp advanced to {}", ts);
        }
    }

    /// Make the next `count` unit-of-work commits fail with a write conflict
    pub fn inject_write_conflicts(&self, count: u32) {
        self.injected_write_conflicts.fetch_add(count, Ordering::AcqRel);
    }

    /// Consume one injected write conflict if any are pending
    pub(crate) fn take_injected_write_conflict(&self) -> bool {
        let taken = self
            .injected_write_conflicts
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok();
        if taken {
            trace!("StorageEngine: raising injected write conflict");
        }
        taken
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_oldest_timestamp_is_monotonic() {
        let engine = StorageEngine::new();
        engine.set_oldest_timestamp(Timestamp::new(10, 0));
        engine.set_oldest_timestamp(Timestamp::new(5, 0));
        assert_eq!(engine.oldest_timestamp(), Timestamp::new(10, 0));
    }

    #[test]
    fn test_injected_conflicts_are_consumed() {
        let engine = StorageEngine::new();
        engine.inject_write_conflicts(2);
        assert!(engine.take_injected_write_conflict());
        assert!(engine.take_injected_write_conflict());
        assert!(!engine.take_injected_write_conflict());
    }
}
