//! Operation contexts
//!
//! An `OperationContext` is the execution state of one logical operation: its
//! name, its recovery unit, its current-operation description and its
//! cooperative interruption flag. Interruption is never preemptive; code
//! observes it at `check_for_interrupt` calls and interruptible waits.

use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::info;

use crate::error::IndexBuildError;
use crate::storage::engine::StorageEngine;
use crate::storage::recovery_unit::RecoveryUnit;

/// Why an operation was killed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillReason {
    /// Explicit kill of this operation
    Killed,
    /// Server shutdown; in-progress work is left for restart recovery
    Shutdown,
}

pub struct OperationContext {
    name: String,
    recovery_unit: Arc<RecoveryUnit>,
    interrupt: CancellationToken,
    kill_reason: OnceLock<KillReason>,
    description: Mutex<Option<Value>>,
    write_conflicts: AtomicU64,
}

impl OperationContext {
    pub fn new(name: impl Into<String>, engine: Arc<StorageEngine>) -> Self {
        Self {
            name: name.into(),
            recovery_unit: Arc::new(RecoveryUnit::new(engine)),
            interrupt: CancellationToken::new(),
            kill_reason: OnceLock::new(),
            description: Mutex::new(None),
            write_conflicts: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn recovery_unit(&self) -> &Arc<RecoveryUnit> {
        &self.recovery_unit
    }

    /// Request interruption. The first reason recorded wins.
    pub fn kill(&self, reason: KillReason) {
        if self.kill_reason.set(reason).is_ok() {
            info!("Killing operation '{}' ({:?})", self.name, reason);
        }
        self.interrupt.cancel();
    }

    pub fn is_killed(&self) -> bool {
        self.interrupt.is_cancelled()
    }

    pub fn check_for_interrupt(&self) -> Result<(), IndexBuildError> {
        if !self.interrupt.is_cancelled() {
            return Ok(());
        }
        match self.kill_reason.get() {
            Some(KillReason::Shutdown) => Err(IndexBuildError::InterruptedAtShutdown),
            _ => Err(IndexBuildError::Interrupted),
        }
    }

    /// Resolves once the operation has been killed
    pub fn interrupted(&self) -> WaitForCancellationFuture<'_> {
        self.interrupt.cancelled()
    }

    /// Publish what this operation is doing
    pub fn set_description(&self, description: Value) {
        *self
            .description
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(description);
    }

    pub fn description(&self) -> Option<Value> {
        self.description
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Count a write conflict observed by this operation; returns the new total
    pub fn record_write_conflict(&self) -> u64 {
        self.write_conflicts.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn write_conflicts(&self) -> u64 {
        self.write_conflicts.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for OperationContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationContext")
            .field("name", &self.name)
            .field("killed", &self.is_killed())
            .finish()
    }
}
