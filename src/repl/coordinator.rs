//! Replication state of this node

use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use tracing::info;

/// Replica set member state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MemberState {
    /// Loading configuration
    Startup,
    /// Initial sync in progress
    Startup2,
    Primary,
    Secondary,
    Recovering,
    Rollback,
    Arbiter,
    Down,
    Unknown,
    Removed,
}

impl MemberState {
    const ALL: [MemberState; 10] = [
        MemberState::Startup,
        MemberState::Startup2,
        MemberState::Primary,
        MemberState::Secondary,
        MemberState::Recovering,
        MemberState::Rollback,
        MemberState::Arbiter,
        MemberState::Down,
        MemberState::Unknown,
        MemberState::Removed,
    ];

    /// Whether the node is still starting up or in initial sync
    pub fn is_starting(self) -> bool {
        matches!(self, MemberState::Startup | MemberState::Startup2)
    }

    fn as_u8(self) -> u8 {
        Self::ALL.iter().position(|s| *s == self).unwrap_or(0) as u8
    }

    fn from_u8(value: u8) -> Self {
        Self::ALL
            .get(value as usize)
            .copied()
            .unwrap_or(MemberState::Unknown)
    }
}

#[cfg_attr(test, mockall::automock)]
pub trait ReplicationCoordinator: Send + Sync {
    /// Whether the node runs as a replica set member
    fn uses_replica_sets(&self) -> bool;

    fn member_state(&self) -> MemberState;
}

/// Replication state held in memory and changed by the host
#[derive(Debug)]
pub struct InMemoryReplicationCoordinator {
    replica_set: AtomicBool,
    state: AtomicU8,
}

impl InMemoryReplicationCoordinator {
    pub fn new(replica_set: bool, state: MemberState) -> Self {
        Self {
            replica_set: AtomicBool::new(replica_set),
            state: AtomicU8::new(state.as_u8()),
        }
    }

    /// A node that is not part of a replica set
    pub fn standalone() -> Self {
        Self::new(false, MemberState::Primary)
    }

    pub fn set_member_state(&self, state: MemberState) {
        let previous = MemberState::from_u8(self.state.swap(state.as_u8(), Ordering::AcqRel));
        if previous != state {
            info!("Member state transition: {:?} -> {:?}", previous, state);
        }
    }
}

impl ReplicationCoordinator for InMemoryReplicationCoordinator {
    fn uses_replica_sets(&self) -> bool {
        self.replica_set.load(Ordering::Acquire)
    }

    fn member_state(&self) -> MemberState {
        MemberState::from_u8(self.state.load(Ordering::Acquire))
    }
}
