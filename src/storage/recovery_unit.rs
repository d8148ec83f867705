//! Recovery units and write units of work
//!
//! A `RecoveryUnit` belongs to one operation and holds its timestamping state.
//! A `WriteUnitOfWork` stages catalog changes and applies them, together with
//! the chosen commit timestamp, only when `commit` succeeds. Dropping an
//! uncommitted unit discards both the staged changes and any timestamp set
//! for it, so a failed attempt leaves nothing behind for the retry.

use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, trace};

use crate::error::{StorageError, TimestampError};
use crate::storage::engine::StorageEngine;
use crate::storage::timestamp::Timestamp;

type StagedChange = Box<dyn FnOnce(Option<Timestamp>) + Send>;

#[derive(Debug, Default)]
struct TimestampState {
    /// Timestamp supplied by an enclosing operation for all of its writes
    commit_timestamp: Option<Timestamp>,
    /// Timestamp chosen for the current unit of work only
    unit_timestamp: Option<Timestamp>,
}

/// Per-operation storage transaction state
#[derive(Debug)]
pub struct RecoveryUnit {
    engine: Arc<StorageEngine>,
    state: Mutex<TimestampState>,
}

impl RecoveryUnit {
    pub fn new(engine: Arc<StorageEngine>) -> Self {
        Self {
            engine,
            state: Mutex::new(TimestampState::default()),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, TimestampState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Commit timestamp supplied by an enclosing operation, if any
    pub fn commit_timestamp(&self) -> Option<Timestamp> {
        self.state().commit_timestamp
    }

    /// Set (or with a null timestamp, clear) the operation-wide commit timestamp
    pub fn set_commit_timestamp(&self, ts: Timestamp) {
        self.state().commit_timestamp = ts.non_null();
    }

    /// Timestamp the current unit of work
    ///
    /// Rejected with `TooOld` when `ts` falls behind the engine's oldest
    /// retained timestamp, which can move between reading a clock and
    /// calling this method.
    pub fn set_timestamp(&self, ts: Timestamp) -> Result<(), TimestampError> {
        if ts.is_null() {
            return Err(TimestampError::Null);
        }

        let mut state = self.state();
        if let Some(existing) = state.commit_timestamp.or(state.unit_timestamp) {
            return Err(TimestampError::AlreadyAssigned {
                existing,
                requested: ts,
            });
        }

        let oldest = self.engine.oldest_timestamp();
        if ts < oldest {
            return Err(TimestampError::TooOld { ts, oldest });
        }

        state.unit_timestamp = Some(ts);
        trace!("RecoveryUnit: unit of work timestamped at {}", ts);
        Ok(())
    }

    pub fn unit_timestamp(&self) -> Option<Timestamp> {
        self.state().unit_timestamp
    }

    fn take_effective_timestamp(&self) -> Option<Timestamp> {
        let mut state = self.state();
        state.unit_timestamp.take().or(state.commit_timestamp)
    }

    fn clear_unit_timestamp(&self) {
        self.state().unit_timestamp = None;
    }
}

/// Scoped commit timestamp for every write made while the block is alive
///
/// A null timestamp makes the block a no-op. The previous commit timestamp
/// is restored on drop.
pub struct TimestampBlock<'a> {
    recovery_unit: &'a RecoveryUnit,
    previous: Option<Option<Timestamp>>,
}

impl<'a> TimestampBlock<'a> {
    pub fn new(recovery_unit: &'a RecoveryUnit, ts: Timestamp) -> Self {
        let previous = if ts.is_null() {
            None
        } else {
            let previous = recovery_unit.commit_timestamp();
            recovery_unit.set_commit_timestamp(ts);
            Some(previous)
        };
        Self {
            recovery_unit,
            previous,
        }
    }
}

impl Drop for TimestampBlock<'_> {
    fn drop(&mut self) {
        if let Some(previous) = self.previous.take() {
            self.recovery_unit
                .set_commit_timestamp(previous.unwrap_or(Timestamp::NULL));
        }
    }
}

/// Atomic batch of staged catalog changes
pub struct WriteUnitOfWork {
    recovery_unit: Arc<RecoveryUnit>,
    changes: Mutex<Vec<StagedChange>>,
    committed: bool,
}

impl WriteUnitOfWork {
    pub fn begin(recovery_unit: &Arc<RecoveryUnit>) -> Self {
        Self {
            recovery_unit: Arc::clone(recovery_unit),
            changes: Mutex::new(Vec::new()),
            committed: false,
        }
    }

    pub fn recovery_unit(&self) -> &RecoveryUnit {
        &self.recovery_unit
    }

    /// Stage a change; it runs with the commit timestamp once `commit` succeeds
    pub fn on_commit<F>(&self, change: F)
    where
        F: FnOnce(Option<Timestamp>) + Send + 'static,
    {
        self.changes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Box::new(change));
    }

    pub fn set_timestamp(&self, ts: Timestamp) -> Result<(), TimestampError> {
        self.recovery_unit.set_timestamp(ts)
    }

    /// Apply every staged change with the unit's timestamp
    ///
    /// Returns the timestamp the changes were applied with.
    pub fn commit(mut self) -> Result<Option<Timestamp>, StorageError> {
        if self.recovery_unit.engine.take_injected_write_conflict() {
            return Err(StorageError::write_conflict("conflict while committing unit of work"));
        }

        let ts = self.recovery_unit.take_effective_timestamp();
        let changes = std::mem::take(
            &mut *self.changes.lock().unwrap_or_else(PoisonError::into_inner),
        );
        let count = changes.len();
        for change in changes {
            change(ts);
        }
        self.committed = true;

        match ts {
            Some(ts) => debug!("Committed {} staged change(s) at {}", count, ts),
            None => debug!("Committed {} staged change(s) without a timestamp", count),
        }
        Ok(ts)
    }
}

impl Drop for WriteUnitOfWork {
    fn drop(&mut self) {
        if !self.committed {
            let discarded = self
                .changes
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .len();
            self.recovery_unit.clear_unit_timestamp();
            trace!("Rolled back unit of work, discarded {} change(s)", discarded);
        }
    }
}
