//! The indexer seam
//!
//! The builder drives an `Indexer` through init, scan and commit without
//! knowing how index keys are produced or stored.

use async_trait::async_trait;
use std::sync::Arc;

use crate::catalog::collection::Collection;
use crate::config::IndexBuildConfig;
use crate::error::{IndexBuildError, StorageError};
use crate::index::multi_index_block::MultiIndexBlock;
use crate::index::spec::IndexSpec;
use crate::operation::OperationContext;
use crate::storage::recovery_unit::WriteUnitOfWork;

/// Builds the physical index for one collection
///
/// `init` and `commit` may fail with a write conflict and must be safe to
/// retry. The scan resolves its own conflicts and only reports real failures.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Indexer: Send + Sync {
    /// Register the unfinished index in the catalog
    async fn init(&self, spec: &IndexSpec) -> Result<(), StorageError>;

    /// Insert keys for every document; returns the number of keys written
    async fn insert_all_documents_in_collection(&self) -> Result<u64, IndexBuildError>;

    /// Stage the index becoming ready into `wuow`
    async fn commit(&self, wuow: &WriteUnitOfWork) -> Result<(), StorageError>;

    /// Give up, leaving the unfinished index for restart recovery
    fn abort_without_cleanup(&self);
}

/// Creates the indexer a build will drive
pub trait IndexerFactory: Send + Sync {
    fn create(
        &self,
        op: &Arc<OperationContext>,
        collection: Arc<Collection>,
        config: &IndexBuildConfig,
    ) -> Box<dyn Indexer>;
}

impl<F> IndexerFactory for F
where
    F: Fn(&Arc<OperationContext>, Arc<Collection>, &IndexBuildConfig) -> Box<dyn Indexer>
        + Send
        + Sync,
{
    fn create(
        &self,
        op: &Arc<OperationContext>,
        collection: Arc<Collection>,
        config: &IndexBuildConfig,
    ) -> Box<dyn Indexer> {
        self(op, collection, config)
    }
}

/// Produces `MultiIndexBlock`s over the in-memory catalog
#[derive(Debug, Default, Clone, Copy)]
pub struct MultiIndexBlockFactory;

impl IndexerFactory for MultiIndexBlockFactory {
    fn create(
        &self,
        op: &Arc<OperationContext>,
        collection: Arc<Collection>,
        config: &IndexBuildConfig,
    ) -> Box<dyn Indexer> {
        Box::new(MultiIndexBlock::new(
            Arc::clone(op),
            collection,
            config.scan_yield_interval,
        ))
    }
}
