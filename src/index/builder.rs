//! Index build orchestration
//!
//! An `IndexBuilder` carries one `IndexBuildRequest` through
//! `Created -> Initializing -> Scanning -> Committing` and classifies how it
//! ended. Foreground builds run on the caller's operation under the caller's
//! exclusive database lock and hand failures back. Background builds run as
//! their own task, take their own locks, let writers in while scanning and
//! escalate failures they cannot hand to anyone.

use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tracing::{Instrument, Level, debug, error, info, info_span, warn};

use crate::catalog::database::Database;
use crate::catalog::namespace::NamespaceString;
use crate::error::{IndexBuildError, StorageError};
use crate::index::coordinator::{FatalCode, IndexBuildCoordinator};
use crate::index::ghost_timestamp::{assign_ghost_commit_timestamp, requires_ghost_commit_timestamp};
use crate::index::handshake::{StartSignal, StartSignalGuard};
use crate::index::indexer::Indexer;
use crate::index::lock_phase::{BuildMode, HeldLock, LockPhaseController};
use crate::index::outcome::BuildOutcome;
use crate::index::spec::IndexBuildRequest;
use crate::index::write_conflict::write_conflict_retry;
use crate::operation::OperationContext;
use crate::service::ServiceContext;
use crate::storage::lock::{LockGuard, LockMode, ResourceId};
use crate::storage::recovery_unit::{TimestampBlock, WriteUnitOfWork};
use crate::{log_build_event, log_timing};

// ============================================================================
// Build State
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BuildState {
    Created,
    Initializing,
    ScanningForeground,
    ScanningBackground,
    Committing,
    Succeeded,
    IgnoredExisting,
    Failed,
}

impl BuildState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            BuildState::Succeeded | BuildState::IgnoredExisting | BuildState::Failed
        )
    }

    pub fn can_transition_to(self, to: BuildState) -> bool {
        use BuildState::*;
        match (self, to) {
            (from, Failed) => !from.is_terminal(),
            (Created, Initializing) => true,
            (Initializing, ScanningForeground | ScanningBackground | IgnoredExisting) => true,
            (ScanningForeground | ScanningBackground, Committing) => true,
            (Committing, Succeeded) => true,
            _ => false,
        }
    }
}

// ============================================================================
// Index Builder
// ============================================================================

pub struct IndexBuilder {
    request: IndexBuildRequest,
    name: String,
    state: BuildState,
    service: Arc<ServiceContext>,
    coordinator: Arc<IndexBuildCoordinator>,
}

impl IndexBuilder {
    pub fn new(
        service: Arc<ServiceContext>,
        coordinator: Arc<IndexBuildCoordinator>,
        request: IndexBuildRequest,
    ) -> Self {
        let name = coordinator.next_build_name();
        Self {
            request,
            name,
            state: BuildState::Created,
            service,
            coordinator,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    #[allow(dead_code)]
    pub fn state(&self) -> BuildState {
        self.state
    }

    fn transition(&mut self, to: BuildState) -> Result<(), IndexBuildError> {
        let from = self.state;
        if !from.can_transition_to(to) {
            return Err(IndexBuildError::InvalidStateTransition { from, to });
        }
        self.state = to;
        self.coordinator.update_state(&self.name, to);
        log_build_event!(Level::DEBUG, self.name, "state", format!("{from:?} -> {to:?}"));
        Ok(())
    }

    fn mark_failed(&mut self) {
        if self.state.can_transition_to(BuildState::Failed) {
            let _ = self.transition(BuildState::Failed);
        }
    }

    fn register(&self, mode: BuildMode, op: &Arc<OperationContext>) {
        self.coordinator.register(
            &self.name,
            &self.request.spec.ns,
            mode,
            self.request.spec.to_value(),
            op,
        );
    }

    // ------------------------------------------------------------------------
    // Foreground
    // ------------------------------------------------------------------------

    /// Build on the caller's operation, which must hold `db` exclusively
    ///
    /// Every failure is returned; nothing is escalated.
    pub async fn build_in_foreground(
        &mut self,
        op: &Arc<OperationContext>,
        db: &Database,
        held: &LockGuard,
    ) -> Result<BuildOutcome, IndexBuildError> {
        if *held.resource() != ResourceId::database(db.name()) || !held.holds(LockMode::Exclusive) {
            return Err(IndexBuildError::LockNotHeld {
                resource: ResourceId::database(db.name()).to_string(),
                expected: LockMode::Exclusive,
            });
        }

        self.register(BuildMode::Foreground, op);
        let conflicts_before = op.write_conflicts();
        let span = info_span!("index_build", build = %self.name, mode = "foreground");
        let result = self
            .build(op, db, HeldLock::Borrowed(held), BuildMode::Foreground, None)
            .instrument(span)
            .await;
        self.coordinator
            .add_write_conflict_retries(op.write_conflicts() - conflicts_before);
        self.coordinator.unregister(&self.name);

        match result {
            Ok(outcome) => {
                self.coordinator.record_outcome(&outcome);
                Ok(outcome)
            }
            Err(e) => {
                self.mark_failed();
                self.coordinator.record_error(&e);
                warn!("Foreground index build '{}' failed: {}", self.name, e);
                Err(e)
            }
        }
    }

    // ------------------------------------------------------------------------
    // Background
    // ------------------------------------------------------------------------

    /// Run as a detached task; launched through `IndexBuildCoordinator::start_background`
    pub(crate) async fn run_background(mut self) -> BuildOutcome {
        let span = info_span!("index_build", build = %self.name, mode = "background");
        async move {
            let op = self.service.make_operation_context(&self.name);
            let mut start = StartSignalGuard::new(Arc::clone(self.coordinator.start_signal()));
            self.register(BuildMode::Background, &op);
            debug!("IndexBuilder building index {}", self.request.spec.to_value());

            let result = self.run_background_locked(&op, &mut start).await;
            if let Err(e) = &result {
                start.fire(StartSignal::Aborted(e.to_string()));
            }
            drop(start);
            self.coordinator.add_write_conflict_retries(op.write_conflicts());

            let outcome = match result {
                Ok(outcome) => outcome,
                Err(e) => {
                    self.mark_failed();
                    self.classify_background_failure(e)
                }
            };
            self.coordinator.unregister(&self.name);
            self.coordinator.record_outcome(&outcome);
            outcome
        }
        .instrument(span)
        .await
    }

    async fn run_background_locked(
        &mut self,
        op: &Arc<OperationContext>,
        start: &mut StartSignalGuard,
    ) -> Result<BuildOutcome, IndexBuildError> {
        let ns = self.request.spec.namespace()?;
        // Waits until granted or interrupted; the configured lock timeout does not apply
        let lock = self
            .service
            .locks
            .lock_with_timeout(op, ResourceId::database(ns.db()), LockMode::Exclusive, None)
            .await?;
        let db = self
            .service
            .databases
            .get(ns.db())
            .ok_or_else(|| IndexBuildError::namespace_not_found(ns.ns()))?;
        self.build(op, &db, HeldLock::Owned(lock), BuildMode::Background, Some(start))
            .await
    }

    /// Interruption leaves the build for restart recovery; anything else stops the process
    fn classify_background_failure(&self, error: IndexBuildError) -> BuildOutcome {
        if error.is_interruption() {
            info!(
                "Background index build '{}' interrupted ({}); unfinished index left for recovery",
                self.name, error
            );
            return BuildOutcome::Interrupted { error };
        }
        error!("Background index build '{}' failed: {}", self.name, error);
        self.coordinator.fatal(FatalCode::for_error(&error), &error);
        BuildOutcome::Failed { error }
    }

    // ------------------------------------------------------------------------
    // Shared build
    // ------------------------------------------------------------------------

    async fn build(
        &mut self,
        op: &Arc<OperationContext>,
        db: &Database,
        lock: HeldLock<'_>,
        mode: BuildMode,
        start: Option<&mut StartSignalGuard>,
    ) -> Result<BuildOutcome, IndexBuildError> {
        self.transition(BuildState::Initializing)?;

        let ns = self.request.spec.namespace()?;
        // Builds never create collections
        let collection = db
            .get_collection(&ns)
            .ok_or_else(|| IndexBuildError::namespace_not_found(ns.ns()))?;
        op.set_description(self.request.spec.to_value());

        let controller = LockPhaseController::new(mode, lock)?;
        let indexer = self
            .service
            .indexers
            .create(op, collection, self.coordinator.config());

        let result = self
            .run_phases(op, &ns, &controller, indexer.as_ref(), mode, start)
            .await;
        if let Err(e) = &result {
            if mode == BuildMode::Background && e.is_interruption() {
                indexer.abort_without_cleanup();
            }
        }
        result
    }

    async fn run_phases(
        &mut self,
        op: &Arc<OperationContext>,
        ns: &NamespaceString,
        controller: &LockPhaseController<'_>,
        indexer: &dyn Indexer,
        mode: BuildMode,
        start: Option<&mut StartSignalGuard>,
    ) -> Result<BuildOutcome, IndexBuildError> {
        let ns_name = ns.ns();
        let op: &OperationContext = op;

        // Init, timestamped with the request's init timestamp
        let spec = self.request.spec.clone();
        let init = {
            let _ts_block = TimestampBlock::new(op.recovery_unit(), self.request.init_index_ts);
            let spec = &spec;
            write_conflict_retry(op, "Init index build", &ns_name, move || indexer.init(spec)).await
        };

        match init {
            Ok(()) => {}
            Err(e) if e.is_ignorable(self.request.relax_constraints) => {
                debug!("Ignoring indexing error: {}", e);
                if let Some(start) = start {
                    start.fire(StartSignal::AlreadySatisfied);
                }
                self.transition(BuildState::IgnoredExisting)?;
                return Ok(BuildOutcome::IgnoredExisting {
                    reason: e.to_string(),
                });
            }
            Err(e) => return Err(e),
        }

        // Scan
        match mode {
            BuildMode::Background => {
                self.transition(BuildState::ScanningBackground)?;
                controller.enter_scan()?;
                if let Some(start) = start {
                    start.fire(StartSignal::Started);
                }
            }
            BuildMode::Foreground => self.transition(BuildState::ScanningForeground)?,
        }

        let scan_started = Instant::now();
        let keys_inserted = {
            let _collection_lock = self
                .service
                .locks
                .lock_with_timeout(
                    op,
                    ResourceId::collection(&ns_name),
                    LockMode::IntentExclusive,
                    None,
                )
                .await?;
            indexer.insert_all_documents_in_collection().await?
        };
        log_timing!(Level::INFO, "index build scan", scan_started.elapsed());

        // Commit under an exclusive lock
        self.transition(BuildState::Committing)?;
        write_conflict_retry(op, "Relock for index build commit", &ns_name, move || {
            controller.enter_recommit(op)
        })
        .await?;

        let requires_ghost = requires_ghost_commit_timestamp(op, ns, self.service.repl.as_ref());
        let clock = self.service.clock.as_ref();
        let coordinator = self.coordinator.as_ref();
        write_conflict_retry(op, "Commit index build", &ns_name, move || async move {
            let wuow = WriteUnitOfWork::begin(op.recovery_unit());
            indexer.commit(&wuow).await?;
            if requires_ghost {
                let ghost = assign_ghost_commit_timestamp(op, clock, &wuow).await?;
                coordinator.add_timestamp_retries(ghost.retries);
            }
            wuow.commit()?;
            Ok::<(), StorageError>(())
        })
        .await?;

        if mode == BuildMode::Background {
            // The lock was released during the scan; make sure nothing was dropped meanwhile
            let db = self.service.databases.get(ns.db()).ok_or_else(|| {
                IndexBuildError::DatabaseDropped {
                    db: ns.db().to_string(),
                }
            })?;
            if db.get_collection(ns).is_none() {
                return Err(IndexBuildError::CollectionDropped { ns: ns_name });
            }
        }

        self.transition(BuildState::Succeeded)?;
        info!("Index build '{}' on {} succeeded", self.name, ns_name);
        Ok(BuildOutcome::Succeeded { keys_inserted })
    }
}

impl std::fmt::Debug for IndexBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexBuilder")
            .field("name", &self.name)
            .field("state", &self.state)
            .field("request", &self.request)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::collection::{Collection, IndexEntry};
    use crate::config::IndexBuildConfig;
    use crate::index::coordinator::RecordingFatalHandler;
    use crate::index::indexer::{IndexerFactory, MockIndexer};
    use crate::index::multi_index_block::MultiIndexBlock;
    use crate::index::spec::IndexSpec;
    use crate::repl::clock::HybridLogicalClock;
    use crate::repl::coordinator::{
        InMemoryReplicationCoordinator, MemberState, ReplicationCoordinator,
    };
    use crate::storage::timestamp::Timestamp;
    use async_trait::async_trait;
    use serde_json::{Value, json};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;
    use tokio::sync::Notify;

    // Auto-initialize logging for all tests in this module
    #[cfg(feature = "test-logging")]
    #[ctor::ctor]
    fn init_test_logging() {
        crate::test_utils::logging::init();
    }

    struct Fixture {
        service: Arc<ServiceContext>,
        coordinator: Arc<IndexBuildCoordinator>,
        fatal: Arc<RecordingFatalHandler>,
        collection: Arc<Collection>,
    }

    fn ns() -> NamespaceString {
        NamespaceString::parse("db.coll").unwrap()
    }

    fn fixture_with(
        documents: usize,
        repl: Arc<dyn ReplicationCoordinator>,
        factory: Option<Arc<dyn IndexerFactory>>,
    ) -> Fixture {
        let config = IndexBuildConfig::builder()
            .handshake_timeout(Duration::from_secs(5))
            .build()
            .unwrap();
        fixture_with_config(documents, config, repl, factory)
    }

    fn fixture_with_config(
        documents: usize,
        config: IndexBuildConfig,
        repl: Arc<dyn ReplicationCoordinator>,
        factory: Option<Arc<dyn IndexerFactory>>,
    ) -> Fixture {
        let clock = Arc::new(HybridLogicalClock::new(Timestamp::new(100, 1)));
        let mut service = ServiceContext::new(&config, clock, repl);
        if let Some(factory) = factory {
            service = service.with_indexer_factory(factory);
        }

        let collection = service.databases.create_collection(&ns());
        for i in 0..documents {
            collection.insert_document(json!({"a": i, "b": i % 7})).unwrap();
        }

        let fatal = Arc::new(RecordingFatalHandler::new());
        let coordinator = Arc::new(IndexBuildCoordinator::new(config, Arc::clone(&fatal) as _));
        Fixture {
            service: Arc::new(service),
            coordinator,
            fatal,
            collection,
        }
    }

    fn fixture(documents: usize) -> Fixture {
        fixture_with(
            documents,
            Arc::new(InMemoryReplicationCoordinator::standalone()),
            None,
        )
    }

    fn request(spec: Value) -> IndexBuildRequest {
        IndexBuildRequest::new(IndexSpec::from_value(spec).unwrap(), false, Timestamp::NULL)
    }

    fn request_a() -> IndexBuildRequest {
        request(json!({"ns": "db.coll", "key": {"a": 1}}))
    }

    impl Fixture {
        fn builder(&self, request: IndexBuildRequest) -> IndexBuilder {
            IndexBuilder::new(
                Arc::clone(&self.service),
                Arc::clone(&self.coordinator),
                request,
            )
        }

        async fn build_foreground(
            &self,
            request: IndexBuildRequest,
        ) -> (IndexBuilder, Result<BuildOutcome, IndexBuildError>) {
            let op = self.service.make_operation_context("conn1");
            let db = self.service.databases.get("db").unwrap();
            let lock = self
                .service
                .locks
                .lock_database(&op, "db", LockMode::Exclusive)
                .await
                .unwrap();
            let mut builder = self.builder(request);
            let result = builder.build_in_foreground(&op, &db, &lock).await;
            assert!(lock.holds(LockMode::Exclusive));
            (builder, result)
        }
    }

    /// Real indexer that parks at the start of its scan until released
    struct GatedIndexer {
        inner: MultiIndexBlock,
        scanning: Arc<Notify>,
        release: Arc<Notify>,
    }

    #[async_trait]
    impl Indexer for GatedIndexer {
        async fn init(&self, spec: &IndexSpec) -> Result<(), StorageError> {
            self.inner.init(spec).await
        }

        async fn insert_all_documents_in_collection(&self) -> Result<u64, IndexBuildError> {
            self.scanning.notify_one();
            self.release.notified().await;
            self.inner.insert_all_documents_in_collection().await
        }

        async fn commit(&self, wuow: &WriteUnitOfWork) -> Result<(), StorageError> {
            self.inner.commit(wuow).await
        }

        fn abort_without_cleanup(&self) {
            self.inner.abort_without_cleanup()
        }
    }

    /// Real indexer whose first init loses a write conflict to a rival build
    /// that registers the same index in between
    struct RacedInitIndexer {
        inner: MultiIndexBlock,
        collection: Arc<Collection>,
        raced: AtomicBool,
    }

    #[async_trait]
    impl Indexer for RacedInitIndexer {
        async fn init(&self, spec: &IndexSpec) -> Result<(), StorageError> {
            let result = self.inner.init(spec).await;
            if matches!(result, Err(StorageError::WriteConflict(_)))
                && !self.raced.swap(true, Ordering::SeqCst)
            {
                self.collection
                    .register_index(IndexEntry::new(spec.clone(), None))?;
            }
            result
        }

        async fn insert_all_documents_in_collection(&self) -> Result<u64, IndexBuildError> {
            self.inner.insert_all_documents_in_collection().await
        }

        async fn commit(&self, wuow: &WriteUnitOfWork) -> Result<(), StorageError> {
            self.inner.commit(wuow).await
        }

        fn abort_without_cleanup(&self) {
            self.inner.abort_without_cleanup()
        }
    }

    fn gated_fixture(documents: usize) -> (Fixture, Arc<Notify>, Arc<Notify>) {
        let scanning = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        let (scan_tx, release_rx) = (Arc::clone(&scanning), Arc::clone(&release));
        let factory = move |op: &Arc<OperationContext>,
                            collection: Arc<Collection>,
                            config: &IndexBuildConfig|
              -> Box<dyn Indexer> {
            Box::new(GatedIndexer {
                inner: MultiIndexBlock::new(Arc::clone(op), collection, config.scan_yield_interval),
                scanning: Arc::clone(&scan_tx),
                release: Arc::clone(&release_rx),
            })
        };
        let f = fixture_with(
            documents,
            Arc::new(InMemoryReplicationCoordinator::standalone()),
            Some(Arc::new(factory)),
        );
        (f, scanning, release)
    }

    #[test]
    fn test_state_transitions() {
        use BuildState::*;
        assert!(Created.can_transition_to(Initializing));
        assert!(Initializing.can_transition_to(ScanningBackground));
        assert!(Initializing.can_transition_to(IgnoredExisting));
        assert!(ScanningForeground.can_transition_to(Committing));
        assert!(Committing.can_transition_to(Succeeded));
        assert!(Committing.can_transition_to(Failed));

        assert!(!Created.can_transition_to(Committing));
        assert!(!ScanningBackground.can_transition_to(Succeeded));
        assert!(!Succeeded.can_transition_to(Failed));
        assert!(!IgnoredExisting.can_transition_to(Initializing));
        assert!(Failed.is_terminal());
    }

    #[tokio::test]
    async fn test_foreground_build_indexes_every_document() {
        let f = fixture(10_000);
        let (builder, result) = f.build_foreground(request_a()).await;

        assert_eq!(result.unwrap(), BuildOutcome::Succeeded { keys_inserted: 10_000 });
        assert_eq!(builder.state(), BuildState::Succeeded);
        assert_eq!(f.collection.index_key_count("a_1"), Some(10_000));
        assert!(f.collection.find_index("a_1").unwrap().ready);

        assert!(f.service.databases.lookup_collection(&ns()).is_some());
        assert!(f.coordinator.active_builds().is_empty());
        assert_eq!(f.coordinator.stats().succeeded, 1);
        assert!(f.fatal.events().is_empty());
    }

    #[tokio::test]
    async fn test_background_build_indexes_every_document() {
        let f = fixture(10_000);
        let build = f.coordinator.start_background(f.builder(request_a())).await;

        assert_eq!(build.start, Ok(StartSignal::Started));
        assert_eq!(
            build.handle.await.unwrap(),
            BuildOutcome::Succeeded { keys_inserted: 10_000 }
        );
        assert_eq!(f.collection.index_key_count("a_1"), Some(10_000));
        assert!(f.service.databases.get("db").is_some());
        assert!(f.service.databases.lookup_collection(&ns()).is_some());
        assert!(!f.coordinator.start_signal().is_pending());
        assert!(f.fatal.events().is_empty());
    }

    #[tokio::test]
    async fn test_background_scan_admits_concurrent_writers() {
        let (f, scanning, release) = gated_fixture(100);
        let build = f.coordinator.start_background(f.builder(request_a())).await;
        assert_eq!(build.start, Ok(StartSignal::Started));
        scanning.notified().await;

        let active = f.coordinator.active_builds();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].state, BuildState::ScanningBackground);
        assert_eq!(active[0].mode, BuildMode::Background);

        let writer = f.service.make_operation_context("writer");
        let ix = f
            .service
            .locks
            .lock_with_timeout(
                &writer,
                ResourceId::database("db"),
                LockMode::IntentExclusive,
                Some(Duration::from_secs(1)),
            )
            .await
            .unwrap();
        f.collection.insert_document(json!({"a": 1000})).unwrap();
        drop(ix);
        release.notify_one();

        // The writer indexed its own document; the scan only counts what it wrote
        assert_eq!(
            build.handle.await.unwrap(),
            BuildOutcome::Succeeded { keys_inserted: 100 }
        );
        assert_eq!(f.collection.index_key_count("a_1"), Some(101));
    }

    #[tokio::test]
    async fn test_existing_index_is_ignored_without_scanning() {
        let factory = |_: &Arc<OperationContext>,
                       _: Arc<Collection>,
                       _: &IndexBuildConfig|
         -> Box<dyn Indexer> {
            let mut indexer = MockIndexer::new();
            indexer
                .expect_init()
                .times(1)
                .returning(|_| Err(IndexBuildError::already_exists("a_1").into()));
            indexer.expect_insert_all_documents_in_collection().times(0);
            indexer.expect_commit().times(0);
            indexer.expect_abort_without_cleanup().times(0);
            Box::new(indexer)
        };
        let f = fixture_with(
            10,
            Arc::new(InMemoryReplicationCoordinator::standalone()),
            Some(Arc::new(factory)),
        );

        let build = f.coordinator.start_background(f.builder(request_a())).await;
        assert_eq!(build.start, Ok(StartSignal::AlreadySatisfied));
        let outcome = build.handle.await.unwrap();
        assert!(matches!(outcome, BuildOutcome::IgnoredExisting { .. }));
        assert_eq!(f.coordinator.stats().ignored, 1);
    }

    #[tokio::test]
    async fn test_rebuilding_identical_index_is_ignored() {
        let f = fixture(50);
        f.build_foreground(request_a()).await.1.unwrap();

        let (builder, result) = f.build_foreground(request_a()).await;
        assert!(matches!(result, Ok(BuildOutcome::IgnoredExisting { .. })));
        assert_eq!(builder.state(), BuildState::IgnoredExisting);
        assert_eq!(f.collection.indexes().len(), 1);
    }

    #[tokio::test]
    async fn test_options_conflict_only_ignored_when_relaxed() {
        let f = fixture(20);
        f.build_foreground(request_a()).await.1.unwrap();

        let conflicting = json!({"ns": "db.coll", "key": {"a": 1}, "name": "a_1", "sparse": true});
        let (builder, result) = f.build_foreground(request(conflicting.clone())).await;
        assert!(matches!(
            result,
            Err(IndexBuildError::IndexOptionsConflict { .. })
        ));
        assert_eq!(builder.state(), BuildState::Failed);

        let mut relaxed = request(conflicting);
        relaxed.relax_constraints = true;
        let (_, result) = f.build_foreground(relaxed).await;
        assert!(matches!(result, Ok(BuildOutcome::IgnoredExisting { .. })));
        assert!(f.fatal.events().is_empty());
    }

    #[tokio::test]
    async fn test_foreground_failure_is_returned_and_cleaned_up() {
        let f = fixture(0);
        f.collection.insert_document(json!({"a": 1})).unwrap();
        f.collection.insert_document(json!({"a": 1})).unwrap();

        let unique = request(json!({"ns": "db.coll", "key": {"a": 1}, "unique": true}));
        let (builder, result) = f.build_foreground(unique).await;

        assert!(matches!(result, Err(IndexBuildError::DuplicateKey { .. })));
        assert_eq!(builder.state(), BuildState::Failed);
        assert!(f.collection.find_index("a_1").is_none());
        assert!(f.fatal.events().is_empty());
        assert_eq!(f.coordinator.stats().failed, 1);
    }

    #[tokio::test]
    async fn test_background_failure_is_fatal() {
        let f = fixture(0);
        f.collection.insert_document(json!({"a": 1})).unwrap();
        f.collection.insert_document(json!({"a": 1})).unwrap();

        let unique = request(json!({"ns": "db.coll", "key": {"a": 1}, "unique": true}));
        let build = f.coordinator.start_background(f.builder(unique)).await;
        assert_eq!(build.start, Ok(StartSignal::Started));

        let outcome = build.handle.await.unwrap();
        assert!(matches!(
            outcome,
            BuildOutcome::Failed {
                error: IndexBuildError::DuplicateKey { .. }
            }
        ));
        let events = f.fatal.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].0, FatalCode::BackgroundBuildFailed);
    }

    #[tokio::test]
    async fn test_background_init_failure_aborts_handshake() {
        let f = fixture(5);
        let missing = request(json!({"ns": "db.missing", "key": {"a": 1}}));
        let build = f.coordinator.start_background(f.builder(missing)).await;

        assert!(matches!(build.start, Ok(StartSignal::Aborted(_))));
        assert!(matches!(
            build.handle.await.unwrap(),
            BuildOutcome::Failed {
                error: IndexBuildError::NamespaceNotFound { .. }
            }
        ));
        assert!(!f.coordinator.start_signal().is_pending());
        assert!(f.service.databases.lookup_collection(&NamespaceString::parse("db.missing").unwrap()).is_none());
    }

    #[tokio::test]
    async fn test_foreground_missing_collection_is_not_created() {
        let f = fixture(5);
        let missing = request(json!({"ns": "db.missing", "key": {"a": 1}}));
        let (_, result) = f.build_foreground(missing).await;

        assert!(matches!(result, Err(IndexBuildError::NamespaceNotFound { .. })));
        let db = f.service.databases.get("db").unwrap();
        assert_eq!(db.collections().len(), 1);
    }

    #[tokio::test]
    async fn test_foreground_requires_exclusive_database_lock() {
        let f = fixture(5);
        let op = f.service.make_operation_context("conn1");
        let db = f.service.databases.get("db").unwrap();
        let ix = f
            .service
            .locks
            .lock_database(&op, "db", LockMode::IntentExclusive)
            .await
            .unwrap();

        let mut builder = f.builder(request_a());
        let result = builder.build_in_foreground(&op, &db, &ix).await;
        assert!(matches!(result, Err(IndexBuildError::LockNotHeld { .. })));
        assert_eq!(builder.state(), BuildState::Created);
        assert!(f.collection.find_index("a_1").is_none());
    }

    #[tokio::test]
    async fn test_shutdown_leaves_unfinished_index_for_recovery() {
        let (f, scanning, release) = gated_fixture(100);
        let build = f.coordinator.start_background(f.builder(request_a())).await;
        scanning.notified().await;

        assert_eq!(f.coordinator.shutdown(), 1);
        release.notify_one();

        let outcome = build.handle.await.unwrap();
        assert_eq!(
            outcome,
            BuildOutcome::Interrupted {
                error: IndexBuildError::InterruptedAtShutdown
            }
        );
        let entry = f.collection.find_index("a_1").unwrap();
        assert!(!entry.ready);
        assert!(f.fatal.events().is_empty());
        assert_eq!(f.coordinator.stats().interrupted, 1);
    }

    #[tokio::test]
    async fn test_write_conflicts_are_retried() {
        let f = fixture(30);
        f.service.engine.inject_write_conflicts(2);

        let (_, result) = f.build_foreground(request_a()).await;
        assert_eq!(result.unwrap(), BuildOutcome::Succeeded { keys_inserted: 30 });
        assert_eq!(f.coordinator.stats().write_conflict_retries, 2);
        assert_eq!(f.collection.indexes().len(), 1);
    }

    #[tokio::test]
    async fn test_init_uses_request_timestamp() {
        let f = fixture(3);
        let mut timestamped = request_a();
        timestamped.init_index_ts = Timestamp::new(50, 0);

        f.build_foreground(timestamped).await.1.unwrap();
        let entry = f.collection.find_index("a_1").unwrap();
        assert_eq!(entry.init_timestamp, Some(Timestamp::new(50, 0)));
        // Standalone commits are not timestamped
        assert_eq!(entry.ready_timestamp, None);
    }

    #[tokio::test]
    async fn test_replica_set_commit_gets_ghost_timestamp() {
        let f = fixture_with(
            10,
            Arc::new(InMemoryReplicationCoordinator::new(true, MemberState::Primary)),
            None,
        );
        f.build_foreground(request_a()).await.1.unwrap();

        let entry = f.collection.find_index("a_1").unwrap();
        assert_eq!(entry.ready_timestamp, Some(Timestamp::new(100, 1)));
    }

    #[tokio::test]
    async fn test_concurrent_background_builds_of_same_index() {
        let f = fixture(2_000);
        let first = f.coordinator.start_background(f.builder(request_a())).await;
        let second = f.coordinator.start_background(f.builder(request_a())).await;

        let outcomes = [first.handle.await.unwrap(), second.handle.await.unwrap()];
        let succeeded = outcomes
            .iter()
            .filter(|o| matches!(o, BuildOutcome::Succeeded { .. }))
            .count();
        let ignored = outcomes
            .iter()
            .filter(|o| matches!(o, BuildOutcome::IgnoredExisting { .. }))
            .count();
        assert_eq!((succeeded, ignored), (1, 1));
        assert_eq!(f.collection.indexes().len(), 1);
        assert_eq!(f.collection.index_key_count("a_1"), Some(2_000));
    }

    #[tokio::test]
    async fn test_collection_dropped_during_scan_is_fatal() {
        let (f, scanning, release) = gated_fixture(10);
        let build = f.coordinator.start_background(f.builder(request_a())).await;
        scanning.notified().await;

        let db = f.service.databases.get("db").unwrap();
        assert!(db.drop_collection(&ns()));
        release.notify_one();

        assert!(matches!(
            build.handle.await.unwrap(),
            BuildOutcome::Failed {
                error: IndexBuildError::CollectionDropped { .. }
            }
        ));
        let events = f.fatal.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].0, FatalCode::CollectionDropped);
    }

    #[tokio::test]
    async fn test_background_build_waits_out_contended_database_lock() {
        let config = IndexBuildConfig::builder()
            .handshake_timeout(Duration::from_secs(5))
            .lock_timeout(Duration::from_millis(50))
            .build()
            .unwrap();
        let f = fixture_with_config(
            20,
            config,
            Arc::new(InMemoryReplicationCoordinator::standalone()),
            None,
        );

        let holder = f.service.make_operation_context("holder");
        let exclusive = f
            .service
            .locks
            .lock_database(&holder, "db", LockMode::Exclusive)
            .await
            .unwrap();
        let release = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            drop(exclusive);
        });

        // Held well past the configured lock timeout
        let build = f.coordinator.start_background(f.builder(request_a())).await;
        assert_eq!(build.start, Ok(StartSignal::Started));
        assert_eq!(
            build.handle.await.unwrap(),
            BuildOutcome::Succeeded { keys_inserted: 20 }
        );
        release.await.unwrap();
        assert!(f.fatal.events().is_empty());
        assert_eq!(f.collection.index_key_count("a_1"), Some(20));
    }

    #[test]
    fn test_background_kill_is_not_fatal() {
        let f = fixture(1);
        let mut builder = f.builder(request_a());
        builder.mark_failed();

        let outcome = builder.classify_background_failure(IndexBuildError::Interrupted);
        assert_eq!(
            outcome,
            BuildOutcome::Interrupted {
                error: IndexBuildError::Interrupted
            }
        );
        assert!(f.fatal.events().is_empty());
    }

    #[tokio::test]
    async fn test_init_conflict_with_rival_registration_is_ignored() {
        let factory = |op: &Arc<OperationContext>,
                       collection: Arc<Collection>,
                       config: &IndexBuildConfig|
         -> Box<dyn Indexer> {
            Box::new(RacedInitIndexer {
                inner: MultiIndexBlock::new(
                    Arc::clone(op),
                    Arc::clone(&collection),
                    config.scan_yield_interval,
                ),
                collection,
                raced: AtomicBool::new(false),
            })
        };
        let f = fixture_with(
            10,
            Arc::new(InMemoryReplicationCoordinator::standalone()),
            Some(Arc::new(factory)),
        );
        f.service.engine.inject_write_conflicts(1);

        let (builder, result) = f.build_foreground(request_a()).await;
        assert!(matches!(result, Ok(BuildOutcome::IgnoredExisting { .. })));
        assert_eq!(builder.state(), BuildState::IgnoredExisting);
        assert_eq!(f.coordinator.stats().write_conflict_retries, 1);
        assert_eq!(f.coordinator.stats().ignored, 1);

        // Only the rival's entry; the ignored build scanned nothing
        let indexes = f.collection.indexes();
        assert_eq!(indexes.len(), 1);
        assert!(!indexes[0].ready);
        assert_eq!(f.collection.index_key_count("a_1"), Some(0));
    }
}
