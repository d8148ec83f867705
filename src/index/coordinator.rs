//! Process-wide index build coordination
//!
//! The `IndexBuildCoordinator` owns everything index builds share outside the
//! database lock: the build identity counter, the background start signal,
//! the registry of builds in progress, build counters and the handler for
//! failures that must stop the process. It is created once and injected into
//! every `IndexBuilder`.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::IndexBuildConfig;
use crate::error::{HandshakeError, IndexBuildError};
use crate::index::builder::{BuildState, IndexBuilder};
use crate::index::handshake::{BackgroundStartSignal, StartSignal};
use crate::index::lock_phase::BuildMode;
use crate::index::outcome::BuildOutcome;
use crate::operation::{KillReason, OperationContext};

// ============================================================================
// Fatal Failures
// ============================================================================

/// Why the process must stop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FatalCode {
    /// A background build failed for a reason other than shutdown
    BackgroundBuildFailed,
    /// The database vanished while a background build released its lock
    DatabaseDropped,
    /// The collection vanished while a background build released its lock
    CollectionDropped,
}

impl FatalCode {
    pub fn for_error(error: &IndexBuildError) -> Self {
        match error {
            IndexBuildError::DatabaseDropped { .. } => FatalCode::DatabaseDropped,
            IndexBuildError::CollectionDropped { .. } => FatalCode::CollectionDropped,
            _ => FatalCode::BackgroundBuildFailed,
        }
    }
}

/// Receives failures that leave the catalog in an unknown state
pub trait FatalErrorHandler: Send + Sync {
    fn fatal(&self, code: FatalCode, error: &IndexBuildError);
}

/// Logs and aborts the process
#[derive(Debug, Default, Clone, Copy)]
pub struct AbortProcess;

impl FatalErrorHandler for AbortProcess {
    fn fatal(&self, code: FatalCode, error: &IndexBuildError) {
        error!("Fatal index build failure ({:?}): {}", code, error);
        std::process::abort();
    }
}

/// Records fatal failures instead of stopping the process
#[cfg(test)]
#[derive(Debug, Default)]
pub struct RecordingFatalHandler {
    events: Mutex<Vec<(FatalCode, IndexBuildError)>>,
}

#[cfg(test)]
impl RecordingFatalHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<(FatalCode, IndexBuildError)> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[cfg(test)]
impl FatalErrorHandler for RecordingFatalHandler {
    fn fatal(&self, code: FatalCode, error: &IndexBuildError) {
        error!("Fatal index build failure ({:?}): {}", code, error);
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((code, error.clone()));
    }
}

// ============================================================================
// Registry and Counters
// ============================================================================

/// Snapshot of one build in progress
#[derive(Debug, Clone, Serialize)]
pub struct BuildStatus {
    pub name: String,
    pub ns: String,
    pub mode: BuildMode,
    pub spec: Value,
    pub state: BuildState,
    pub started_at: DateTime<Utc>,
}

struct ActiveBuild {
    status: BuildStatus,
    op: Arc<OperationContext>,
}

#[derive(Debug, Default)]
struct BuildCounters {
    started: AtomicU64,
    succeeded: AtomicU64,
    ignored: AtomicU64,
    failed: AtomicU64,
    interrupted: AtomicU64,
    write_conflict_retries: AtomicU64,
    timestamp_retries: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BuildStats {
    pub started: u64,
    pub succeeded: u64,
    pub ignored: u64,
    pub failed: u64,
    pub interrupted: u64,
    pub write_conflict_retries: u64,
    pub timestamp_retries: u64,
}

/// A launched background build
#[derive(Debug)]
pub struct BackgroundBuild {
    pub name: String,
    /// What the build reported once it released (or gave up on) the exclusive lock
    pub start: Result<StartSignal, HandshakeError>,
    pub handle: JoinHandle<BuildOutcome>,
}

// ============================================================================
// Coordinator
// ============================================================================

pub struct IndexBuildCoordinator {
    config: IndexBuildConfig,
    build_counter: AtomicU32,
    start_signal: Arc<BackgroundStartSignal>,
    /// Serialises launch + handshake so at most one start signal is pending
    launch_lock: Arc<AsyncMutex<()>>,
    active: Mutex<HashMap<String, ActiveBuild>>,
    counters: BuildCounters,
    fatal: Arc<dyn FatalErrorHandler>,
}

impl IndexBuildCoordinator {
    pub fn new(config: IndexBuildConfig, fatal: Arc<dyn FatalErrorHandler>) -> Self {
        Self {
            config,
            build_counter: AtomicU32::new(0),
            start_signal: Arc::new(BackgroundStartSignal::new()),
            launch_lock: Arc::new(AsyncMutex::new(())),
            active: Mutex::new(HashMap::new()),
            counters: BuildCounters::default(),
            fatal,
        }
    }

    pub fn config(&self) -> &IndexBuildConfig {
        &self.config
    }

    /// Next build identity; the counter wraps
    pub fn next_build_name(&self) -> String {
        let n = self.build_counter.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        format!("{} {}", self.config.build_name_prefix, n)
    }

    pub fn start_signal(&self) -> &Arc<BackgroundStartSignal> {
        &self.start_signal
    }

    /// Spawn a background build and wait for it to release the exclusive lock
    ///
    /// Launches are serialised. If the wait times out, the late signal is
    /// drained before the next launch may proceed.
    pub async fn start_background(&self, builder: IndexBuilder) -> BackgroundBuild {
        let launch = Arc::clone(&self.launch_lock).lock_owned().await;
        let name = builder.name().to_string();
        debug!("Launching background index build '{}'", name);

        let handle = tokio::spawn(builder.run_background());
        let start = self.start_signal.wait(self.config.handshake_timeout).await;

        match &start {
            Ok(signal) => {
                debug!("Background index build '{}' reported {:?}", name, signal);
                drop(launch);
            }
            Err(e) => {
                warn!("Background index build '{}': {}", name, e);
                let signal = Arc::clone(&self.start_signal);
                let timeout = self.config.handshake_timeout;
                let late = name.clone();
                tokio::spawn(async move {
                    let _launch = launch;
                    while signal.wait(timeout).await.is_err() {}
                    debug!("Drained late start signal of '{}'", late);
                });
            }
        }

        BackgroundBuild {
            name,
            start,
            handle,
        }
    }

    // ------------------------------------------------------------------------
    // Registry
    // ------------------------------------------------------------------------

    pub(crate) fn register(
        &self,
        name: &str,
        ns: &str,
        mode: BuildMode,
        spec: Value,
        op: &Arc<OperationContext>,
    ) {
        let status = BuildStatus {
            name: name.to_string(),
            ns: ns.to_string(),
            mode,
            spec,
            state: BuildState::Created,
            started_at: Utc::now(),
        };
        self.counters.started.fetch_add(1, Ordering::Relaxed);
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                name.to_string(),
                ActiveBuild {
                    status,
                    op: Arc::clone(op),
                },
            );
    }

    pub(crate) fn update_state(&self, name: &str, state: BuildState) {
        if let Some(build) = self
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_mut(name)
        {
            build.status.state = state;
        }
    }

    pub(crate) fn unregister(&self, name: &str) {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name);
    }

    /// Builds in progress, oldest first
    #[allow(dead_code)]
    pub fn active_builds(&self) -> Vec<BuildStatus> {
        let mut builds: Vec<_> = self
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(|build| build.status.clone())
            .collect();
        builds.sort_by(|a, b| a.started_at.cmp(&b.started_at).then(a.name.cmp(&b.name)));
        builds
    }

    /// Interrupt every build in progress; returns how many were signalled
    pub fn shutdown(&self) -> usize {
        let active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        for build in active.values() {
            build.op.kill(KillReason::Shutdown);
        }
        if !active.is_empty() {
            info!("Interrupting {} index build(s) for shutdown", active.len());
        }
        active.len()
    }

    // ------------------------------------------------------------------------
    // Counters
    // ------------------------------------------------------------------------

    pub(crate) fn record_outcome(&self, outcome: &BuildOutcome) {
        let counter = match outcome {
            BuildOutcome::Succeeded { .. } => &self.counters.succeeded,
            BuildOutcome::IgnoredExisting { .. } => &self.counters.ignored,
            BuildOutcome::Interrupted { .. } => &self.counters.interrupted,
            BuildOutcome::Failed { .. } => &self.counters.failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a foreground failure handed back to the caller
    pub(crate) fn record_error(&self, error: &IndexBuildError) {
        let counter = if error.is_interruption() {
            &self.counters.interrupted
        } else {
            &self.counters.failed
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add_write_conflict_retries(&self, retries: u64) {
        self.counters
            .write_conflict_retries
            .fetch_add(retries, Ordering::Relaxed);
    }

    pub(crate) fn add_timestamp_retries(&self, retries: u32) {
        self.counters
            .timestamp_retries
            .fetch_add(u64::from(retries), Ordering::Relaxed);
    }

    pub fn stats(&self) -> BuildStats {
        let c = &self.counters;
        BuildStats {
            started: c.started.load(Ordering::Relaxed),
            succeeded: c.succeeded.load(Ordering::Relaxed),
            ignored: c.ignored.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
            interrupted: c.interrupted.load(Ordering::Relaxed),
            write_conflict_retries: c.write_conflict_retries.load(Ordering::Relaxed),
            timestamp_retries: c.timestamp_retries.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn fatal(&self, code: FatalCode, error: &IndexBuildError) {
        self.fatal.fatal(code, error);
    }
}

impl std::fmt::Debug for IndexBuildCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexBuildCoordinator")
            .field("config", &self.config)
            .field("builds_launched", &self.build_counter.load(Ordering::Relaxed))
            .field("stats", &self.stats())
            .finish()
    }
}
