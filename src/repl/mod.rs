//! Replication collaborators: cluster time and member state

pub mod clock;
pub mod coordinator;

pub use clock::HybridLogicalClock;
pub use coordinator::{InMemoryReplicationCoordinator, MemberState, ReplicationCoordinator};
