//! Databases and the process-wide database holder

use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::info;

use crate::catalog::collection::Collection;
use crate::catalog::namespace::NamespaceString;

#[derive(Debug)]
pub struct Database {
    name: String,
    collections: RwLock<BTreeMap<String, Arc<Collection>>>,
}

impl Database {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            collections: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn get_collection(&self, ns: &NamespaceString) -> Option<Arc<Collection>> {
        self.collections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(ns.coll())
            .cloned()
    }

    /// Create `ns`, or return the existing collection
    pub fn create_collection(&self, ns: &NamespaceString) -> Arc<Collection> {
        let mut collections = self
            .collections
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        Arc::clone(
            collections
                .entry(ns.coll().to_string())
                .or_insert_with(|| {
                    info!("Created collection {}", ns);
                    Arc::new(Collection::new(ns.clone()))
                }),
        )
    }

    pub fn drop_collection(&self, ns: &NamespaceString) -> bool {
        let dropped = self
            .collections
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(ns.coll())
            .is_some();
        if dropped {
            info!("Dropped collection {}", ns);
        }
        dropped
    }

    pub fn collections(&self) -> Vec<Arc<Collection>> {
        self.collections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }
}

/// Registry of open databases
#[derive(Debug, Default)]
pub struct DatabaseHolder {
    databases: RwLock<BTreeMap<String, Arc<Database>>>,
}

impl DatabaseHolder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, db: &str) -> Option<Arc<Database>> {
        self.databases
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(db)
            .cloned()
    }

    /// Open `db`, creating it when missing
    pub fn open_db(&self, db: &str) -> Arc<Database> {
        let mut databases = self.databases.write().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(
            databases
                .entry(db.to_string())
                .or_insert_with(|| Arc::new(Database::new(db))),
        )
    }

    pub fn drop_database(&self, db: &str) -> bool {
        let dropped = self
            .databases
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(db)
            .is_some();
        if dropped {
            info!("Dropped database {}", db);
        }
        dropped
    }

    /// Collection for `ns` if both its database and the collection exist
    pub fn lookup_collection(&self, ns: &NamespaceString) -> Option<Arc<Collection>> {
        self.get(ns.db())?.get_collection(ns)
    }

    pub fn create_collection(&self, ns: &NamespaceString) -> Arc<Collection> {
        self.open_db(ns.db()).create_collection(ns)
    }
}
