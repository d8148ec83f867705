//! Ghost commit timestamps
//!
//! An index build commit has no oplog entry of its own. On a replica set
//! member its catalog write still needs a commit timestamp, which is taken
//! from the cluster clock when no enclosing operation supplied one.

use tracing::{debug, trace};

use crate::catalog::namespace::NamespaceString;
use crate::error::IndexBuildError;
use crate::operation::OperationContext;
use crate::repl::clock::LogicalClock;
use crate::repl::coordinator::ReplicationCoordinator;
use crate::storage::recovery_unit::WriteUnitOfWork;
use crate::storage::timestamp::Timestamp;

/// Whether the commit of a build on `ns` must be timestamped from the cluster clock
pub fn requires_ghost_commit_timestamp(
    op: &OperationContext,
    ns: &NamespaceString,
    repl: &dyn ReplicationCoordinator,
) -> bool {
    if !ns.is_replicated() || ns.is_temporary_map_reduce() {
        return false;
    }
    if !repl.uses_replica_sets() {
        return false;
    }
    // Already timestamped by an enclosing operation
    if op.recovery_unit().commit_timestamp().is_some() {
        return false;
    }
    // The clock is not safe to read until the node has finished starting up
    !repl.member_state().is_starting()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GhostTimestamp {
    pub ts: Timestamp,
    /// Attempts rejected because the oldest timestamp moved past the clock read
    pub retries: u32,
}

/// Timestamp `wuow` with the current cluster time
///
/// A read that lost the race with the oldest-timestamp watermark is retried
/// with a fresh read after an interruption check. Any other rejection fails.
pub async fn assign_ghost_commit_timestamp(
    op: &OperationContext,
    clock: &dyn LogicalClock,
    wuow: &WriteUnitOfWork,
) -> Result<GhostTimestamp, IndexBuildError> {
    let mut retries = 0u32;
    loop {
        let ts = clock.cluster_time();
        match wuow.set_timestamp(ts) {
            Ok(()) => {
                trace!("Ghost commit timestamp {} after {} retries", ts, retries);
                return Ok(GhostTimestamp { ts, retries });
            }
            Err(e) if e.is_too_old() => {
                debug!("Temporarily could not timestamp the index build commit: {}", e);
                retries += 1;
                op.check_for_interrupt()?;
                tokio::task::yield_now().await;
            }
            Err(e) => return Err(e.into()),
        }
    }
}
