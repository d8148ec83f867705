//! Storage-side collaborators of the index builder
//!
//! - `timestamp`: replication timestamps
//! - `engine`: oldest-timestamp watermark and write-conflict fail point
//! - `recovery_unit`: per-operation timestamps and atomic units of work
//! - `lock`: database and collection locks with intent modes

pub mod engine;
pub mod lock;
pub mod recovery_unit;
pub mod timestamp;

pub use lock::LockMode;
pub use timestamp::Timestamp;
