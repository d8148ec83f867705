//! Indexer over the in-memory catalog
//!
//! A `MultiIndexBlock` registers one unfinished index, fills it from a
//! snapshot of the collection's record ids and marks it ready on commit.
//! Writers maintain the registered index while the scan runs, so documents
//! written concurrently are indexed exactly once whichever side gets there
//! first.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::catalog::collection::{Collection, IndexEntry};
use crate::error::{IndexBuildError, StorageError};
use crate::index::indexer::Indexer;
use crate::index::spec::IndexSpec;
use crate::operation::OperationContext;
use crate::storage::recovery_unit::WriteUnitOfWork;

#[derive(Debug, Default)]
struct BlockState {
    ident: Option<Uuid>,
    name: Option<String>,
    abandoned: bool,
}

pub struct MultiIndexBlock {
    op: Arc<OperationContext>,
    collection: Arc<Collection>,
    scan_yield_interval: usize,
    state: Mutex<BlockState>,
    /// Set by the staged change once the caller's unit of work commits
    committed: Arc<AtomicBool>,
}

impl MultiIndexBlock {
    pub fn new(
        op: Arc<OperationContext>,
        collection: Arc<Collection>,
        scan_yield_interval: usize,
    ) -> Self {
        Self {
            op,
            collection,
            scan_yield_interval: scan_yield_interval.max(1),
            state: Mutex::new(BlockState::default()),
            committed: Arc::new(AtomicBool::new(false)),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, BlockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn registered(&self) -> Result<(Uuid, String), IndexBuildError> {
        let state = self.state();
        match (state.ident, &state.name) {
            (Some(ident), Some(name)) => Ok((ident, name.clone())),
            _ => Err(IndexBuildError::cannot_create_index(
                "index build block was not initialised",
            )),
        }
    }

    pub fn is_committed(&self) -> bool {
        self.committed.load(Ordering::Acquire)
    }
}

#[async_trait]
impl Indexer for MultiIndexBlock {
    async fn init(&self, spec: &IndexSpec) -> Result<(), StorageError> {
        if let Some(ident) = self.state().ident {
            debug!("Index build block already registered {}; init is a no-op", ident);
            return Ok(());
        }

        spec.validate()?;
        if spec.namespace()? != *self.collection.ns() {
            return Err(IndexBuildError::cannot_create_index(format!(
                "spec namespace {} does not match collection {}",
                spec.ns,
                self.collection.ns()
            ))
            .into());
        }
        self.collection.check_new_index(spec)?;

        // The unit of work decides the timestamp; registration follows its commit
        let wuow = WriteUnitOfWork::begin(self.op.recovery_unit());
        let init_ts = wuow.commit()?;

        let entry = IndexEntry::new(spec.clone(), init_ts);
        let (ident, name) = (entry.ident, entry.name.clone());
        self.collection.register_index(entry)?;

        let mut state = self.state();
        state.ident = Some(ident);
        state.name = Some(name.clone());
        info!(
            "Registered unfinished index {} on {} (ident {})",
            name,
            self.collection.ns(),
            ident
        );
        Ok(())
    }

    async fn insert_all_documents_in_collection(&self) -> Result<u64, IndexBuildError> {
        let (ident, name) = self.registered()?;
        let record_ids = self.collection.record_ids();
        debug!(
            "Scanning {} document(s) of {} for index {}",
            record_ids.len(),
            self.collection.ns(),
            name
        );

        let mut inserted = 0u64;
        for (scanned, record_id) in record_ids.into_iter().enumerate() {
            if scanned % self.scan_yield_interval == 0 {
                self.op.check_for_interrupt()?;
                if scanned > 0 {
                    tokio::task::yield_now().await;
                }
            }
            if self.collection.index_record(ident, record_id)? {
                inserted += 1;
            }
        }
        self.op.check_for_interrupt()?;

        debug!("Inserted {} key(s) into index {}", inserted, name);
        Ok(inserted)
    }

    async fn commit(&self, wuow: &WriteUnitOfWork) -> Result<(), StorageError> {
        let (ident, name) = self.registered()?;
        let collection = Arc::clone(&self.collection);
        let committed = Arc::clone(&self.committed);
        wuow.on_commit(move |ts| {
            if collection.mark_index_ready(ident, ts) {
                committed.store(true, Ordering::Release);
                match ts {
                    Some(ts) => info!("Index {} on {} is ready at {}", name, collection.ns(), ts),
                    None => info!("Index {} on {} is ready", name, collection.ns()),
                }
            } else {
                warn!("Index {} disappeared from {} before it became ready", name, collection.ns());
            }
        });
        Ok(())
    }

    fn abort_without_cleanup(&self) {
        let mut state = self.state();
        state.abandoned = true;
        if let Some(name) = &state.name {
            info!(
                "Abandoning index build for {} on {}; the unfinished index is left for recovery",
                name,
                self.collection.ns()
            );
        }
    }
}

impl Drop for MultiIndexBlock {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(ident) = state.ident {
            if !state.abandoned && !self.committed.load(Ordering::Acquire) {
                self.collection.remove_unfinished_index(ident);
            }
        }
    }
}
