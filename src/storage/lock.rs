//! Hierarchical resource locks
//!
//! Database and collection locks with intent modes. Waiting is cooperative
//! (tasks park on a `Notify`), interruptible through the operation context,
//! and optionally bounded by a timeout. Pending exclusive requests block new
//! non-exclusive grants so schema changes cannot be starved by a stream of
//! writers.

use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::error::LockError;
use crate::operation::OperationContext;

// ============================================================================
// Modes and Resources
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum LockMode {
    IntentShared,
    IntentExclusive,
    Shared,
    Exclusive,
}

const ALL_MODES: [LockMode; 4] = [
    LockMode::IntentShared,
    LockMode::IntentExclusive,
    LockMode::Shared,
    LockMode::Exclusive,
];

impl LockMode {
    fn slot(self) -> usize {
        match self {
            LockMode::IntentShared => 0,
            LockMode::IntentExclusive => 1,
            LockMode::Shared => 2,
            LockMode::Exclusive => 3,
        }
    }

    /// Standard multi-granularity compatibility matrix
    pub fn is_compatible_with(self, other: LockMode) -> bool {
        use LockMode::*;
        match (self, other) {
            (Exclusive, _) | (_, Exclusive) => false,
            (IntentShared, _) | (_, IntentShared) => true,
            (IntentExclusive, IntentExclusive) => true,
            (Shared, Shared) => true,
            (IntentExclusive, Shared) | (Shared, IntentExclusive) => false,
        }
    }

    /// Whether holding `self` implies the rights of `other`
    pub fn covers(self, other: LockMode) -> bool {
        use LockMode::*;
        match self {
            Exclusive => true,
            Shared => matches!(other, Shared | IntentShared),
            IntentExclusive => matches!(other, IntentExclusive | IntentShared),
            IntentShared => other == IntentShared,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ResourceId {
    Database(String),
    Collection(String),
}

impl ResourceId {
    pub fn database(name: impl Into<String>) -> Self {
        Self::Database(name.into())
    }

    pub fn collection(ns: impl Into<String>) -> Self {
        Self::Collection(ns.into())
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceId::Database(name) => write!(f, "database '{}'", name),
            ResourceId::Collection(ns) => write!(f, "collection '{}'", ns),
        }
    }
}

// ============================================================================
// Lock Head
// ============================================================================

#[derive(Debug, Default)]
struct Grants {
    held: [u32; 4],
    exclusive_waiters: u32,
}

impl Grants {
    fn can_grant(&self, mode: LockMode) -> bool {
        if mode != LockMode::Exclusive && self.exclusive_waiters > 0 {
            return false;
        }
        ALL_MODES
            .iter()
            .all(|held| self.held[held.slot()] == 0 || mode.is_compatible_with(*held))
    }

    fn grant(&mut self, mode: LockMode) {
        self.held[mode.slot()] += 1;
    }

    fn release(&mut self, mode: LockMode) {
        let slot = &mut self.held[mode.slot()];
        debug_assert!(*slot > 0, "releasing {:?} that is not held", mode);
        *slot = slot.saturating_sub(1);
    }
}

/// Grant state for one resource
#[derive(Debug, Default)]
struct LockHead {
    grants: Mutex<Grants>,
    notify: Notify,
}

/// Keeps a pending exclusive request visible to other requesters
struct ExclusiveWaiter<'a> {
    head: &'a LockHead,
}

impl Drop for ExclusiveWaiter<'_> {
    fn drop(&mut self) {
        self.head.grants().exclusive_waiters -= 1;
        self.head.notify.notify_waiters();
    }
}

impl LockHead {
    fn grants(&self) -> MutexGuard<'_, Grants> {
        self.grants.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn acquire(
        &self,
        op: &OperationContext,
        resource: &ResourceId,
        mode: LockMode,
        timeout: Option<Duration>,
    ) -> Result<(), LockError> {
        let started = Instant::now();
        let deadline = timeout.map(|timeout| started + timeout);
        let mut waiter: Option<ExclusiveWaiter<'_>> = None;

        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut grants = self.grants();
                if grants.can_grant(mode) {
                    grants.grant(mode);
                    drop(grants);
                    if waiter.is_some() {
                        trace!("Granted {:?} on {} after {:?}", mode, resource, started.elapsed());
                    }
                    return Ok(());
                }
                if mode == LockMode::Exclusive && waiter.is_none() {
                    grants.exclusive_waiters += 1;
                    waiter = Some(ExclusiveWaiter { head: self });
                }
            }

            op.check_for_interrupt().map_err(LockError::Interrupted)?;
            trace!("Waiting for {:?} on {}", mode, resource);

            let woke = match deadline {
                Some(deadline) => tokio::select! {
                    result = tokio::time::timeout_at(deadline, notified.as_mut()) => result.is_ok(),
                    _ = op.interrupted() => true,
                },
                None => tokio::select! {
                    _ = notified.as_mut() => true,
                    _ = op.interrupted() => true,
                },
            };

            if !woke {
                return Err(LockError::Timeout {
                    resource: resource.clone(),
                    mode,
                    waited: started.elapsed(),
                });
            }
        }
    }

    fn release(&self, mode: LockMode) {
        self.grants().release(mode);
        self.notify.notify_waiters();
    }

    /// Swap a held mode for a weaker one without letting anyone in between
    fn downgrade(&self, from: LockMode, to: LockMode) {
        {
            let mut grants = self.grants();
            grants.release(from);
            grants.grant(to);
        }
        self.notify.notify_waiters();
    }
}

// ============================================================================
// Lock Guard
// ============================================================================

/// RAII ownership of a granted lock
///
/// The held mode can change in place through `downgrade` and `relock`.
pub struct LockGuard {
    head: Arc<LockHead>,
    resource: ResourceId,
    mode: Mutex<Option<LockMode>>,
    timeout: Option<Duration>,
}

impl LockGuard {
    pub fn resource(&self) -> &ResourceId {
        &self.resource
    }

    /// Currently held mode; `None` after a failed relock
    pub fn mode(&self) -> Option<LockMode> {
        *self.mode.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn holds(&self, mode: LockMode) -> bool {
        self.mode().is_some_and(|held| held.covers(mode))
    }

    /// Atomically weaken the held mode. Never blocks.
    pub fn downgrade(&self, to: LockMode) -> bool {
        let mut held = self.mode.lock().unwrap_or_else(PoisonError::into_inner);
        match *held {
            Some(current) if current != to && current.covers(to) => {
                self.head.downgrade(current, to);
                debug!("Downgraded {} from {:?} to {:?}", self.resource, current, to);
                *held = Some(to);
                true
            }
            _ => false,
        }
    }

    /// Release the held mode and wait for `mode`
    ///
    /// On failure nothing is held; the caller may retry the relock.
    pub async fn relock(&self, op: &OperationContext, mode: LockMode) -> Result<(), LockError> {
        let previous = self
            .mode
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(previous) = previous {
            self.head.release(previous);
        }

        self.head
            .acquire(op, &self.resource, mode, self.timeout)
            .await?;
        *self.mode.lock().unwrap_or_else(PoisonError::into_inner) = Some(mode);
        debug!("Relocked {} from {:?} to {:?}", self.resource, previous, mode);
        Ok(())
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Some(mode) = self
            .mode
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            self.head.release(mode);
            trace!("Released {:?} on {}", mode, self.resource);
        }
    }
}

impl fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockGuard")
            .field("resource", &self.resource)
            .field("mode", &self.mode())
            .finish()
    }
}

// ============================================================================
// Lock Manager
// ============================================================================

/// Process-wide table of resource locks
#[derive(Debug, Default)]
pub struct LockManager {
    heads: Mutex<HashMap<ResourceId, Arc<LockHead>>>,
    timeout: Option<Duration>,
}

impl LockManager {
    pub fn new(timeout: Option<Duration>) -> Self {
        Self {
            heads: Mutex::new(HashMap::new()),
            timeout,
        }
    }

    fn head(&self, resource: &ResourceId) -> Arc<LockHead> {
        let mut heads = self.heads.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(heads.entry(resource.clone()).or_default())
    }

    /// Acquire `mode` on `resource` using the manager's default timeout
    pub async fn lock(
        &self,
        op: &OperationContext,
        resource: ResourceId,
        mode: LockMode,
    ) -> Result<LockGuard, LockError> {
        self.lock_with_timeout(op, resource, mode, self.timeout).await
    }

    pub async fn lock_with_timeout(
        &self,
        op: &OperationContext,
        resource: ResourceId,
        mode: LockMode,
        timeout: Option<Duration>,
    ) -> Result<LockGuard, LockError> {
        let head = self.head(&resource);
        head.acquire(op, &resource, mode, timeout).await?;
        trace!("Acquired {:?} on {}", mode, resource);
        Ok(LockGuard {
            head,
            resource,
            mode: Mutex::new(Some(mode)),
            timeout,
        })
    }

    pub async fn lock_database(
        &self,
        op: &OperationContext,
        db: &str,
        mode: LockMode,
    ) -> Result<LockGuard, LockError> {
        self.lock(op, ResourceId::database(db), mode).await
    }
}
