//! Write-conflict retry
//!
//! Runs a unit of work until it either succeeds or fails with something other
//! than a write conflict. Each attempt must start from a clean state; units of
//! work roll themselves back when dropped, so a conflicted attempt leaves
//! nothing behind. There is no attempt limit and no backoff beyond yielding to
//! the scheduler.

use std::future::Future;
use tracing::{debug, warn};

use crate::error::{IndexBuildError, StorageError};
use crate::operation::OperationContext;

/// Attempts after which every further conflict is logged at warn level
const WARN_AFTER_ATTEMPTS: u64 = 100;

/// Retry `unit_of_work` on write conflicts
///
/// Conflicts never escape: the result type has no conflict variant.
pub async fn write_conflict_retry<T, F, Fut>(
    op: &OperationContext,
    op_name: &str,
    ns: &str,
    mut unit_of_work: F,
) -> Result<T, IndexBuildError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StorageError>>,
{
    let mut attempts: u64 = 0;
    loop {
        match unit_of_work().await {
            Ok(value) => {
                if attempts > 0 {
                    debug!(
                        "{} on {} succeeded after {} write conflict(s)",
                        op_name, ns, attempts
                    );
                }
                return Ok(value);
            }
            Err(StorageError::WriteConflict(context)) => {
                attempts += 1;
                op.record_write_conflict();
                if attempts >= WARN_AFTER_ATTEMPTS {
                    warn!(
                        "Caught write conflict during {} on {} (attempt {}): {}",
                        op_name, ns, attempts, context
                    );
                } else {
                    debug!(
                        "Caught write conflict during {} on {} (attempt {}): {}",
                        op_name, ns, attempts, context
                    );
                }
                tokio::task::yield_now().await;
            }
            Err(StorageError::Failed(error)) => return Err(error),
        }
    }
}
