//! Process-wide services an index build runs against

use std::sync::Arc;

use crate::catalog::database::DatabaseHolder;
use crate::config::IndexBuildConfig;
use crate::index::indexer::{IndexerFactory, MultiIndexBlockFactory};
use crate::operation::OperationContext;
use crate::repl::clock::LogicalClock;
use crate::repl::coordinator::ReplicationCoordinator;
use crate::storage::engine::StorageEngine;
use crate::storage::lock::LockManager;

pub struct ServiceContext {
    pub databases: DatabaseHolder,
    pub locks: LockManager,
    pub engine: Arc<StorageEngine>,
    pub clock: Arc<dyn LogicalClock>,
    pub repl: Arc<dyn ReplicationCoordinator>,
    pub indexers: Arc<dyn IndexerFactory>,
}

impl ServiceContext {
    /// Empty catalog with `MultiIndexBlock` indexers
    pub fn new(
        config: &IndexBuildConfig,
        clock: Arc<dyn LogicalClock>,
        repl: Arc<dyn ReplicationCoordinator>,
    ) -> Self {
        Self {
            databases: DatabaseHolder::new(),
            locks: LockManager::new(config.lock_timeout),
            engine: Arc::new(StorageEngine::new()),
            clock,
            repl,
            indexers: Arc::new(MultiIndexBlockFactory),
        }
    }

    #[allow(dead_code)]
    pub fn with_indexer_factory(mut self, factory: Arc<dyn IndexerFactory>) -> Self {
        self.indexers = factory;
        self
    }

    pub fn make_operation_context(&self, name: impl Into<String>) -> Arc<OperationContext> {
        Arc::new(OperationContext::new(name, Arc::clone(&self.engine)))
    }
}

impl std::fmt::Debug for ServiceContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceContext")
            .field("databases", &self.databases)
            .field("locks", &self.locks)
            .field("engine", &self.engine)
            .finish()
    }
}
