//! Namespace strings (`<database>.<collection>`)

use regex::Regex;
use serde::Serialize;
use std::fmt;
use std::sync::LazyLock;

use crate::error::IndexBuildError;

/// Collections created by map-reduce for intermediate output
pub const TEMP_MAP_REDUCE_PREFIX: &str = "tmp.mr.";

const LOCAL_DATABASE: &str = "local";
const SYSTEM_PREFIX: &str = "system.";
const SYSTEM_PROFILE: &str = "system.profile";

static DB_NAME_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"^[^/\\. "$*<>:|?\x00]{1,64}$"#).expect("database name pattern is valid")
});

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct NamespaceString {
    db: String,
    coll: String,
}

impl NamespaceString {
    /// Parse and validate a full namespace
    pub fn parse(ns: &str) -> Result<Self, IndexBuildError> {
        let Some((db, coll)) = ns.split_once('.') else {
            return Err(IndexBuildError::invalid_namespace(
                ns,
                "expected <database>.<collection>",
            ));
        };

        if !DB_NAME_PATTERN.is_match(db) {
            return Err(IndexBuildError::invalid_namespace(
                ns,
                "database name is empty, too long or contains an invalid character",
            ));
        }
        if coll.is_empty() {
            return Err(IndexBuildError::invalid_namespace(
                ns,
                "collection name is empty",
            ));
        }
        if coll.contains('\0') || coll.contains('$') {
            return Err(IndexBuildError::invalid_namespace(
                ns,
                "collection name contains an invalid character",
            ));
        }

        Ok(Self {
            db: db.to_string(),
            coll: coll.to_string(),
        })
    }

    pub fn db(&self) -> &str {
        &self.db
    }

    pub fn coll(&self) -> &str {
        &self.coll
    }

    pub fn ns(&self) -> String {
        format!("{}.{}", self.db, self.coll)
    }

    pub fn is_system(&self) -> bool {
        self.coll.starts_with(SYSTEM_PREFIX)
    }

    /// Whether writes to this namespace are replicated through the oplog
    pub fn is_replicated(&self) -> bool {
        if self.db == LOCAL_DATABASE {
            return false;
        }
        !(self.is_system() && self.coll == SYSTEM_PROFILE)
    }

    pub fn is_temporary_map_reduce(&self) -> bool {
        self.coll.starts_with(TEMP_MAP_REDUCE_PREFIX)
    }
}

impl fmt::Display for NamespaceString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.db, self.coll)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_splits_on_first_dot() {
        let ns = NamespaceString::parse("db.coll.with.dots").unwrap();
        assert_eq!(ns.db(), "db");
        assert_eq!(ns.coll(), "coll.with.dots");
        assert_eq!(ns.to_string(), "db.coll.with.dots");
    }

    #[test]
    fn test_parse_rejects_invalid_names() {
        assert!(NamespaceString::parse("nocollection").is_err());
        assert!(NamespaceString::parse(".coll").is_err());
        assert!(NamespaceString::parse("db.").is_err());
        assert!(NamespaceString::parse("bad db.coll").is_err());
        assert!(NamespaceString::parse("bad/db.coll").is_err());
        assert!(NamespaceString::parse("db.co$ll").is_err());
    }

    #[test]
    fn test_replication_rules() {
        assert!(NamespaceString::parse("db.coll").unwrap().is_replicated());
        assert!(!NamespaceString::parse("local.oplog.rs").unwrap().is_replicated());
        assert!(!NamespaceString::parse("db.system.profile").unwrap().is_replicated());
        assert!(NamespaceString::parse("admin.system.version").unwrap().is_replicated());
    }

    #[test]
    fn test_temporary_map_reduce_boundaries() {
        assert!(NamespaceString::parse("db.tmp.mr.").unwrap().is_temporary_map_reduce());
        assert!(NamespaceString::parse("db.tmp.mr.out_1").unwrap().is_temporary_map_reduce());
        assert!(!NamespaceString::parse("db.tmp.mr").unwrap().is_temporary_map_reduce());
        assert!(!NamespaceString::parse("db.tmp.mrx").unwrap().is_temporary_map_reduce());
        assert!(!NamespaceString::parse("db.xtmp.mr.a").unwrap().is_temporary_map_reduce());
    }
}
