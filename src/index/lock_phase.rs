//! Database lock phases of an index build
//!
//! A background build moves its database lock through
//! `Init (X) -> ScanExclusiveDowngraded (IX) -> RecommitExclusive (X)`; a
//! foreground build keeps the exclusive lock it was given and goes straight
//! from `Init` to `RecommitExclusive`. Phases are never revisited.

use serde::Serialize;
use std::ops::Deref;
use std::sync::{Mutex, PoisonError};
use tracing::{debug, trace};

use crate::error::{IndexBuildError, StorageError};
use crate::operation::OperationContext;
use crate::storage::lock::{LockGuard, LockMode};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BuildMode {
    /// Runs on the caller's context under the caller's exclusive lock
    Foreground,
    /// Runs detached and lets writers in while scanning
    Background,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LockPhase {
    Init,
    ScanExclusiveDowngraded,
    RecommitExclusive,
}

impl LockPhase {
    pub fn is_valid_transition(mode: BuildMode, from: LockPhase, to: LockPhase) -> bool {
        use LockPhase::*;
        matches!(
            (mode, from, to),
            (BuildMode::Background, Init, ScanExclusiveDowngraded)
                | (BuildMode::Background, ScanExclusiveDowngraded, RecommitExclusive)
                | (BuildMode::Foreground, Init, RecommitExclusive)
        )
    }
}

/// Database lock used by a build: acquired by the build itself, or lent by its caller
pub enum HeldLock<'a> {
    Owned(LockGuard),
    Borrowed(&'a LockGuard),
}

impl Deref for HeldLock<'_> {
    type Target = LockGuard;

    fn deref(&self) -> &LockGuard {
        match self {
            HeldLock::Owned(guard) => guard,
            HeldLock::Borrowed(guard) => guard,
        }
    }
}

pub struct LockPhaseController<'a> {
    mode: BuildMode,
    lock: HeldLock<'a>,
    phase: Mutex<LockPhase>,
}

impl<'a> LockPhaseController<'a> {
    /// Start in `Init`; the lock must be held exclusively
    pub fn new(mode: BuildMode, lock: HeldLock<'a>) -> Result<Self, IndexBuildError> {
        if !lock.holds(LockMode::Exclusive) {
            return Err(IndexBuildError::LockNotHeld {
                resource: lock.resource().to_string(),
                expected: LockMode::Exclusive,
            });
        }
        Ok(Self {
            mode,
            lock,
            phase: Mutex::new(LockPhase::Init),
        })
    }

    pub fn phase(&self) -> LockPhase {
        *self.phase.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn lock(&self) -> &LockGuard {
        &self.lock
    }

    fn check(&self, to: LockPhase) -> Result<LockPhase, IndexBuildError> {
        let from = self.phase();
        if LockPhase::is_valid_transition(self.mode, from, to) {
            return Ok(from);
        }
        debug_assert!(
            false,
            "invalid lock phase transition {from:?} -> {to:?} for {:?} build",
            self.mode
        );
        Err(IndexBuildError::InvalidLockTransition { from, to })
    }

    fn set(&self, from: LockPhase, to: LockPhase) {
        *self.phase.lock().unwrap_or_else(PoisonError::into_inner) = to;
        debug!(
            "Lock phase {:?} -> {:?} on {} (now {:?})",
            from,
            to,
            self.lock.resource(),
            self.lock.mode()
        );
    }

    /// Downgrade to intent-exclusive so writers can run during the scan
    pub fn enter_scan(&self) -> Result<(), IndexBuildError> {
        let from = self.check(LockPhase::ScanExclusiveDowngraded)?;
        if !self.lock.downgrade(LockMode::IntentExclusive) {
            return Err(IndexBuildError::LockNotHeld {
                resource: self.lock.resource().to_string(),
                expected: LockMode::Exclusive,
            });
        }
        self.set(from, LockPhase::ScanExclusiveDowngraded);
        Ok(())
    }

    /// Re-escalate to exclusive before commit
    ///
    /// A relock that times out is reported as a write conflict and leaves the
    /// phase unchanged, so the caller may simply retry.
    pub async fn enter_recommit(&self, op: &OperationContext) -> Result<(), StorageError> {
        let from = self.check(LockPhase::RecommitExclusive)?;
        if self.mode == BuildMode::Background {
            trace!("Relocking {} exclusively for commit", self.lock.resource());
            self.lock.relock(op, LockMode::Exclusive).await?;
        } else if !self.lock.holds(LockMode::Exclusive) {
            return Err(IndexBuildError::LockNotHeld {
                resource: self.lock.resource().to_string(),
                expected: LockMode::Exclusive,
            }
            .into());
        }
        self.set(from, LockPhase::RecommitExclusive);
        Ok(())
    }
}
