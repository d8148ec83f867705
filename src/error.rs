//! Error types for index build orchestration
//!
//! Conflicts are kept out of `IndexBuildError` on purpose: the only type that
//! can carry a write conflict is `StorageError`, and the retry wrapper is the
//! only place that turns a `StorageError` back into an `IndexBuildError`.

use std::time::Duration;

use crate::index::builder::BuildState;
use crate::index::lock_phase::LockPhase;
use crate::storage::lock::{LockMode, ResourceId};
use crate::storage::timestamp::Timestamp;

// ============================================================================
// Index Build Errors
// ============================================================================

/// Non-transient failures surfaced by an index build
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IndexBuildError {
    /// An index with the same name, key and options is already registered
    #[error("Index already exists: {name}")]
    IndexAlreadyExists { name: String },

    /// An index with the same name or key exists with different options
    #[error("Index options conflict: {reason}")]
    IndexOptionsConflict { reason: String },

    /// The index specification is malformed
    #[error("Cannot create index: {reason}")]
    CannotCreateIndex { reason: String },

    #[error("Invalid namespace '{ns}': {reason}")]
    InvalidNamespace { ns: String, reason: String },

    /// Database or collection does not exist; builds never create collections
    #[error("Namespace not found: {ns}")]
    NamespaceNotFound { ns: String },

    #[error("Duplicate key for unique index {index}: {key}")]
    DuplicateKey { index: String, key: String },

    /// Operation was killed
    #[error("Operation interrupted")]
    Interrupted,

    /// Operation was killed because the server is shutting down
    #[error("Operation interrupted at shutdown")]
    InterruptedAtShutdown,

    #[error("Timed out acquiring {mode:?} lock on {resource}")]
    LockTimeout { resource: String, mode: LockMode },

    /// Caller does not hold the lock the operation requires
    #[error("Lock not held: {resource} requires {expected:?}")]
    LockNotHeld { resource: String, expected: LockMode },

    #[error("Invalid lock phase transition: {from:?} -> {to:?}")]
    InvalidLockTransition { from: LockPhase, to: LockPhase },

    #[error("Invalid build state transition: {from:?} -> {to:?}")]
    InvalidStateTransition { from: BuildState, to: BuildState },

    #[error("Failed to timestamp index build commit: {0}")]
    CommitTimestamp(#[from] TimestampError),

    #[error("Database {db} disappeared while building an index")]
    DatabaseDropped { db: String },

    #[error("Collection {ns} disappeared while building an index")]
    CollectionDropped { ns: String },
}

impl IndexBuildError {
    pub fn already_exists(name: impl Into<String>) -> Self {
        Self::IndexAlreadyExists { name: name.into() }
    }

    pub fn options_conflict(reason: impl Into<String>) -> Self {
        Self::IndexOptionsConflict {
            reason: reason.into(),
        }
    }

    pub fn cannot_create_index(reason: impl Into<String>) -> Self {
        Self::CannotCreateIndex {
            reason: reason.into(),
        }
    }

    pub fn invalid_namespace(ns: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidNamespace {
            ns: ns.into(),
            reason: reason.into(),
        }
    }

    pub fn namespace_not_found(ns: impl Into<String>) -> Self {
        Self::NamespaceNotFound { ns: ns.into() }
    }

    /// Killed for any reason, including shutdown
    pub fn is_interruption(&self) -> bool {
        matches!(self, Self::Interrupted | Self::InterruptedAtShutdown)
    }

    pub fn is_shutdown_interruption(&self) -> bool {
        matches!(self, Self::InterruptedAtShutdown)
    }

    /// Whether this init failure means the requested index is already satisfied
    pub fn is_ignorable(&self, relax_constraints: bool) -> bool {
        match self {
            Self::IndexAlreadyExists { .. } => true,
            Self::IndexOptionsConflict { .. } => relax_constraints,
            _ => false,
        }
    }
}

// ============================================================================
// Storage Errors
// ============================================================================

/// Result of a storage mutation that may race a concurrent writer
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Transient conflict; the unit of work must be retried from a clean state
    #[error("Write conflict: {0}")]
    WriteConflict(String),

    #[error(transparent)]
    Failed(#[from] IndexBuildError),
}

impl StorageError {
    pub fn write_conflict(context: impl Into<String>) -> Self {
        Self::WriteConflict(context.into())
    }

    pub fn is_write_conflict(&self) -> bool {
        matches!(self, Self::WriteConflict(_))
    }
}

impl From<TimestampError> for StorageError {
    fn from(error: TimestampError) -> Self {
        Self::Failed(error.into())
    }
}

// ============================================================================
// Timestamp Errors
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TimestampError {
    /// The chosen time raced the oldest-timestamp watermark; retry with a fresh read
    #[error("Timestamp {ts} is older than the oldest available timestamp {oldest}")]
    TooOld { ts: Timestamp, oldest: Timestamp },

    #[error("Cannot timestamp a write with the null timestamp")]
    Null,

    #[error("Write is already timestamped at {existing}; refusing {requested}")]
    AlreadyAssigned {
        existing: Timestamp,
        requested: Timestamp,
    },
}

impl TimestampError {
    pub fn is_too_old(&self) -> bool {
        matches!(self, Self::TooOld { .. })
    }
}

// ============================================================================
// Lock Errors
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("Timed out after {waited:?} acquiring {mode:?} lock on {resource}")]
    Timeout {
        resource: ResourceId,
        mode: LockMode,
        waited: Duration,
    },

    #[error("Lock wait interrupted: {0}")]
    Interrupted(IndexBuildError),
}

impl From<LockError> for IndexBuildError {
    fn from(error: LockError) -> Self {
        match error {
            LockError::Timeout { resource, mode, .. } => Self::LockTimeout {
                resource: resource.to_string(),
                mode,
            },
            LockError::Interrupted(error) => error,
        }
    }
}

/// Lock timeouts on a relock are treated as transient conflicts
impl From<LockError> for StorageError {
    fn from(error: LockError) -> Self {
        match error {
            timeout @ LockError::Timeout { .. } => Self::WriteConflict(timeout.to_string()),
            LockError::Interrupted(error) => Self::Failed(error),
        }
    }
}

// ============================================================================
// Handshake Errors
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandshakeError {
    #[error("Timed out after {waited:?} waiting for background index build to start")]
    Timeout { waited: Duration },

    /// A start signal is already pending and has not been consumed
    #[error("Background start signal already pending - only one background build may be starting at a time")]
    SlotOccupied,
}

// ============================================================================
// Configuration Errors
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid timeout: {timeout:?} - {reason}")]
    InvalidTimeout { timeout: Duration, reason: String },

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },
}

impl ConfigError {
    pub fn invalid_timeout(timeout: Duration, reason: impl Into<String>) -> Self {
        Self::InvalidTimeout {
            timeout,
            reason: reason.into(),
        }
    }

    pub fn invalid_value(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
