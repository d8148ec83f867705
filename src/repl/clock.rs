//! Cluster-wide logical clock
//!
//! The clock is the only source of ghost commit timestamps. Reads may race the
//! storage engine's oldest-timestamp watermark, which is why callers retry.

use std::sync::atomic::{AtomicU64, Ordering};
use tracing::trace;

use crate::storage::timestamp::Timestamp;

/// Source of the current cluster time
#[cfg_attr(test, mockall::automock)]
pub trait LogicalClock: Send + Sync {
    /// Latest cluster time observed by this node
    fn cluster_time(&self) -> Timestamp;
}

/// Hybrid logical clock
///
/// Time only moves forward: `advance` ignores older values and `tick`
/// reserves a fresh time strictly after the current one.
#[derive(Debug, Default)]
pub struct HybridLogicalClock {
    time: AtomicU64,
}

impl HybridLogicalClock {
    pub fn new(initial: Timestamp) -> Self {
        Self {
            time: AtomicU64::new(initial.as_u64()),
        }
    }

    /// Merge a time observed elsewhere
    pub fn advance(&self, observed: Timestamp) {
        self.time.fetch_max(observed.as_u64(), Ordering::AcqRel);
    }

    /// Reserve the next time
    pub fn tick(&self) -> Timestamp {
        let next = Timestamp::from_u64(self.time.fetch_add(1, Ordering::AcqRel) + 1);
        trace!("HybridLogicalClock: ticked to {}", next);
        next
    }
}

impl LogicalClock for HybridLogicalClock {
    fn cluster_time(&self) -> Timestamp {
        Timestamp::from_u64(self.time.load(Ordering::Acquire))
    }
}
