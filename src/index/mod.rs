//! Index builds
//!
//! - `spec`: index specifications and build requests
//! - `builder`: drives one request through init, scan and commit
//! - `coordinator`: background launches, the active-build registry and fatal escalation
//! - `indexer` / `multi_index_block`: the physical index build behind a trait seam
//! - `lock_phase`: database lock phases of foreground and background builds
//! - `handshake`: the start signal a background build sends its launcher
//! - `write_conflict`: retry wrapper for conflicting units of work
//! - `ghost_timestamp`: commit timestamps taken from the cluster clock

pub mod builder;
pub mod coordinator;
pub mod ghost_timestamp;
pub mod handshake;
pub mod indexer;
pub mod lock_phase;
pub mod multi_index_block;
pub mod outcome;
pub mod spec;
pub mod write_conflict;

pub use builder::IndexBuilder;
pub use coordinator::{AbortProcess, IndexBuildCoordinator};
pub use outcome::BuildOutcome;
pub use spec::{IndexBuildRequest, IndexSpec};
