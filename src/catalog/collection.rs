//! Collections and their index catalogs
//!
//! Documents are kept by record id. Every write maintains the keys of every
//! registered index, ready or still building, so a build that scans the
//! collection while writers run ends up with exactly one key per document.

use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard, PoisonError};
use tracing::{debug, trace};
use uuid::Uuid;

use crate::catalog::namespace::NamespaceString;
use crate::error::IndexBuildError;
use crate::index::spec::IndexSpec;
use crate::storage::timestamp::Timestamp;

pub type RecordId = u64;

// ============================================================================
// Index Catalog Entries
// ============================================================================

/// One registered index, finished or in progress
#[derive(Debug, Clone, Serialize)]
pub struct IndexEntry {
    pub name: String,
    pub spec: IndexSpec,
    /// Storage identity; distinguishes a rebuilt index from a dropped one of the same name
    pub ident: Uuid,
    pub ready: bool,
    pub init_timestamp: Option<Timestamp>,
    pub ready_timestamp: Option<Timestamp>,
    #[serde(skip)]
    keys: BTreeMap<RecordId, Vec<Value>>,
    #[serde(skip)]
    unique_owners: HashMap<String, RecordId>,
}

impl IndexEntry {
    pub fn new(spec: IndexSpec, init_timestamp: Option<Timestamp>) -> Self {
        Self {
            name: spec.index_name(),
            spec,
            ident: Uuid::new_v4(),
            ready: false,
            init_timestamp,
            ready_timestamp: None,
            keys: BTreeMap::new(),
            unique_owners: HashMap::new(),
        }
    }

    pub fn key_count(&self) -> usize {
        self.keys.len()
    }

    fn check_unique(&self, record_id: RecordId, key: &[Value]) -> Result<String, IndexBuildError> {
        let rendered = Value::Array(key.to_vec()).to_string();
        if self.spec.unique {
            if let Some(owner) = self.unique_owners.get(&rendered) {
                if *owner != record_id {
                    return Err(IndexBuildError::DuplicateKey {
                        index: self.name.clone(),
                        key: rendered,
                    });
                }
            }
        }
        Ok(rendered)
    }

    /// Insert a key for `record_id`; returns false when it was already present
    fn insert_key(&mut self, record_id: RecordId, key: Vec<Value>) -> Result<bool, IndexBuildError> {
        let rendered = self.check_unique(record_id, &key)?;
        if self.keys.get(&record_id) == Some(&key) {
            return Ok(false);
        }
        if self.spec.unique {
            self.unique_owners.insert(rendered, record_id);
        }
        self.keys.insert(record_id, key);
        Ok(true)
    }
}

// ============================================================================
// Collection
// ============================================================================

#[derive(Debug, Default)]
struct CollectionData {
    records: BTreeMap<RecordId, Value>,
    next_record_id: RecordId,
    indexes: Vec<IndexEntry>,
}

#[derive(Debug)]
pub struct Collection {
    ns: NamespaceString,
    data: RwLock<CollectionData>,
}

impl Collection {
    pub fn new(ns: NamespaceString) -> Self {
        Self {
            ns,
            data: RwLock::new(CollectionData {
                next_record_id: 1,
                ..Default::default()
            }),
        }
    }

    pub fn ns(&self) -> &NamespaceString {
        &self.ns
    }

    fn read(&self) -> RwLockReadGuard<'_, CollectionData> {
        self.data.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, CollectionData> {
        self.data.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert a document and its keys into every registered index
    ///
    /// A unique-key violation rejects the whole write.
    pub fn insert_document(&self, doc: Value) -> Result<RecordId, IndexBuildError> {
        let mut data = self.write();
        let record_id = data.next_record_id;

        let mut staged = Vec::with_capacity(data.indexes.len());
        for (slot, entry) in data.indexes.iter().enumerate() {
            if let Some(key) = entry.spec.extract_key(&doc) {
                entry.check_unique(record_id, &key)?;
                staged.push((slot, key));
            }
        }
        for (slot, key) in staged {
            data.indexes[slot].insert_key(record_id, key)?;
        }

        data.records.insert(record_id, doc);
        data.next_record_id += 1;
        trace!("Inserted record {} into {}", record_id, self.ns);
        Ok(record_id)
    }

    pub fn num_records(&self) -> usize {
        self.read().records.len()
    }

    /// Snapshot of the record ids currently present
    pub fn record_ids(&self) -> Vec<RecordId> {
        self.read().records.keys().copied().collect()
    }

    // ------------------------------------------------------------------------
    // Index catalog
    // ------------------------------------------------------------------------

    pub fn indexes(&self) -> Vec<IndexEntry> {
        self.read().indexes.clone()
    }

    pub fn find_index(&self, name: &str) -> Option<IndexEntry> {
        self.read().indexes.iter().find(|e| e.name == name).cloned()
    }

    pub fn index_key_count(&self, name: &str) -> Option<usize> {
        self.read()
            .indexes
            .iter()
            .find(|e| e.name == name)
            .map(IndexEntry::key_count)
    }

    /// Check `spec` against every registered index
    ///
    /// Same name, key and options is `IndexAlreadyExists`. Same name with a
    /// different key or options, or the same key under another name, is an
    /// options conflict.
    pub fn check_new_index(&self, spec: &IndexSpec) -> Result<(), IndexBuildError> {
        check_against(&self.read().indexes, spec)
    }

    /// Register an unfinished index; from now on writers maintain its keys
    pub fn register_index(&self, entry: IndexEntry) -> Result<(), IndexBuildError> {
        let mut data = self.write();
        check_against(&data.indexes, &entry.spec)?;
        debug!("Registered index {} on {} ({})", entry.name, self.ns, entry.ident);
        data.indexes.push(entry);
        Ok(())
    }

    /// Remove an index that never became ready
    pub fn remove_unfinished_index(&self, ident: Uuid) -> bool {
        let mut data = self.write();
        let before = data.indexes.len();
        data.indexes.retain(|e| e.ready || e.ident != ident);
        let removed = data.indexes.len() != before;
        if removed {
            debug!("Removed unfinished index {} from {}", ident, self.ns);
        }
        removed
    }

    pub fn mark_index_ready(&self, ident: Uuid, ts: Option<Timestamp>) -> bool {
        let mut data = self.write();
        match data.indexes.iter_mut().find(|e| e.ident == ident) {
            Some(entry) => {
                entry.ready = true;
                entry.ready_timestamp = ts;
                true
            }
            None => false,
        }
    }

    /// Index the document stored under `record_id`, if it still exists
    ///
    /// Returns whether a new key was written. Documents already indexed by a
    /// concurrent writer are skipped.
    pub fn index_record(&self, ident: Uuid, record_id: RecordId) -> Result<bool, IndexBuildError> {
        let mut data = self.write();
        let CollectionData {
            records, indexes, ..
        } = &mut *data;

        let Some(doc) = records.get(&record_id) else {
            return Ok(false);
        };
        let Some(entry) = indexes.iter_mut().find(|e| e.ident == ident) else {
            return Err(IndexBuildError::cannot_create_index(format!(
                "index {ident} is no longer registered on {}",
                self.ns
            )));
        };
        match entry.spec.extract_key(doc) {
            Some(key) => entry.insert_key(record_id, key),
            None => Ok(false),
        }
    }
}

fn check_against(indexes: &[IndexEntry], spec: &IndexSpec) -> Result<(), IndexBuildError> {
    let name = spec.index_name();
    for entry in indexes {
        let same_key = entry.spec.same_key_pattern(spec);

        if entry.name == name {
            if same_key && entry.spec.same_options(spec) {
                return Err(IndexBuildError::already_exists(name));
            }
            return Err(IndexBuildError::options_conflict(format!(
                "index with name {name} already exists with different options"
            )));
        }
        if same_key {
            return Err(IndexBuildError::options_conflict(format!(
                "index with the same key pattern already exists under the name {}",
                entry.name
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn collection() -> Collection {
        Collection::new(NamespaceString::parse("db.coll").unwrap())
    }

    fn spec(value: Value) -> IndexSpec {
        IndexSpec::from_value(value).unwrap()
    }

    #[test]
    fn test_check_new_index_conflicts() {
        let coll = collection();
        let a = spec(json!({"ns": "db.coll", "key": {"a": 1}, "name": "a_1"}));
        coll.register_index(IndexEntry::new(a.clone(), None)).unwrap();

        assert_eq!(
            coll.check_new_index(&a),
            Err(IndexBuildError::already_exists("a_1"))
        );

        let unique = spec(json!({"ns": "db.coll", "key": {"a": 1}, "name": "a_1", "unique": true}));
        assert!(matches!(
            coll.check_new_index(&unique),
            Err(IndexBuildError::IndexOptionsConflict { .. })
        ));

        let renamed = spec(json!({"ns": "db.coll", "key": {"a": 1}, "name": "other"}));
        assert!(matches!(
            coll.check_new_index(&renamed),
            Err(IndexBuildError::IndexOptionsConflict { .. })
        ));

        let b = spec(json!({"ns": "db.coll", "key": {"b": 1}}));
        assert!(coll.check_new_index(&b).is_ok());
    }

    #[test]
    fn test_writers_maintain_registered_indexes() {
        let coll = collection();
        let entry = IndexEntry::new(spec(json!({"ns": "db.coll", "key": {"a": 1}})), None);
        let ident = entry.ident;
        coll.register_index(entry).unwrap();

        let id = coll.insert_document(json!({"a": 1})).unwrap();
        assert_eq!(coll.index_key_count("a_1"), Some(1));

        // The scan finds the key already written
        assert!(!coll.index_record(ident, id).unwrap());
        assert_eq!(coll.index_key_count("a_1"), Some(1));
    }

    #[test]
    fn test_unique_violation_rejects_write() {
        let coll = collection();
        let entry = IndexEntry::new(
            spec(json!({"ns": "db.coll", "key": {"a": 1}, "unique": true})),
            None,
        );
        coll.register_index(entry).unwrap();

        coll.insert_document(json!({"a": 1})).unwrap();
        let result = coll.insert_document(json!({"a": 1}));
        assert!(matches!(result, Err(IndexBuildError::DuplicateKey { .. })));
        assert_eq!(coll.num_records(), 1);
    }

    #[test]
    fn test_ready_and_removed_indexes() {
        let coll = collection();
        let entry = IndexEntry::new(spec(json!({"ns": "db.coll", "key": {"a": 1}})), None);
        let ident = entry.ident;
        coll.register_index(entry).unwrap();

        assert!(coll.mark_index_ready(ident, Some(Timestamp::new(4, 0))));
        // Ready indexes are never removed as unfinished
        assert!(!coll.remove_unfinished_index(ident));

        let found = coll.find_index("a_1").unwrap();
        assert!(found.ready);
        assert_eq!(found.ready_timestamp, Some(Timestamp::new(4, 0)));
    }
}
