//! Result of one index build attempt

use serde::{Serialize, Serializer};

use crate::error::IndexBuildError;

fn serialize_error<S: Serializer>(error: &IndexBuildError, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_str(error)
}

/// How a build ended
///
/// Write conflicts have no variant here; they are retried inside the build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "camelCase")]
pub enum BuildOutcome {
    /// Index committed and ready
    Succeeded { keys_inserted: u64 },
    /// An equivalent index already existed (or an option conflict was tolerated)
    IgnoredExisting { reason: String },
    /// Interrupted at shutdown; the unfinished index is left for recovery
    Interrupted {
        #[serde(serialize_with = "serialize_error")]
        error: IndexBuildError,
    },
    Failed {
        #[serde(serialize_with = "serialize_error")]
        error: IndexBuildError,
    },
}

impl BuildOutcome {
    /// Whether the requested index now exists
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded { .. } | Self::IgnoredExisting { .. })
    }

    pub fn error(&self) -> Option<&IndexBuildError> {
        match self {
            Self::Interrupted { error } | Self::Failed { error } => Some(error),
            _ => None,
        }
    }
}
