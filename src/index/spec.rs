//! Index specifications and build requests

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::catalog::namespace::NamespaceString;
use crate::error::IndexBuildError;
use crate::storage::timestamp::Timestamp;

/// Option fields ignored when deciding whether two specs are equivalent
const NON_SEMANTIC_OPTIONS: &[&str] = &["v"];

fn is_false(value: &bool) -> bool {
    !*value
}

/// Description of one index: target namespace, key pattern and options
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexSpec {
    pub ns: String,
    pub key: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub unique: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub sparse: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub background: bool,
    /// Any other option, kept verbatim
    #[serde(flatten)]
    pub options: Map<String, Value>,
}

impl IndexSpec {
    /// Build a spec from its document form
    pub fn from_value(value: Value) -> Result<Self, IndexBuildError> {
        serde_json::from_value(value)
            .map_err(|e| IndexBuildError::cannot_create_index(format!("malformed index spec: {e}")))
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    pub fn namespace(&self) -> Result<NamespaceString, IndexBuildError> {
        NamespaceString::parse(&self.ns)
    }

    /// Explicit name, or one derived from the key pattern (`a_1_b_-1`)
    pub fn index_name(&self) -> String {
        if let Some(name) = &self.name {
            return name.clone();
        }
        self.key
            .iter()
            .map(|(field, direction)| match direction {
                Value::String(kind) => format!("{field}_{kind}"),
                other => format!("{field}_{other}"),
            })
            .collect::<Vec<_>>()
            .join("_")
    }

    pub fn validate(&self) -> Result<(), IndexBuildError> {
        if self.key.is_empty() {
            return Err(IndexBuildError::cannot_create_index("key pattern is empty"));
        }
        if matches!(&self.name, Some(name) if name.is_empty()) {
            return Err(IndexBuildError::cannot_create_index("index name is empty"));
        }

        for (field, direction) in &self.key {
            if field.is_empty() || field.split('.').any(str::is_empty) {
                return Err(IndexBuildError::cannot_create_index(format!(
                    "invalid key field '{field}'"
                )));
            }
            let valid = match direction {
                Value::Number(n) => n.as_f64().is_some_and(|v| v != 0.0),
                Value::String(kind) => !kind.is_empty(),
                _ => false,
            };
            if !valid {
                return Err(IndexBuildError::cannot_create_index(format!(
                    "invalid direction {direction} for key field '{field}'"
                )));
            }
        }
        Ok(())
    }

    /// Key patterns match field by field, in order
    pub fn same_key_pattern(&self, other: &IndexSpec) -> bool {
        self.key.len() == other.key.len() && self.key.iter().eq(other.key.iter())
    }

    pub fn same_options(&self, other: &IndexSpec) -> bool {
        let semantic = |spec: &IndexSpec| {
            spec.options
                .iter()
                .filter(|(k, _)| !NON_SEMANTIC_OPTIONS.contains(&k.as_str()))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect::<std::collections::BTreeMap<_, _>>()
        };
        self.unique == other.unique && self.sparse == other.sparse && semantic(self) == semantic(other)
    }

    /// Extract the key for `doc`; `None` when a sparse index skips the document
    pub fn extract_key(&self, doc: &Value) -> Option<Vec<Value>> {
        let mut any_present = false;
        let key = self
            .key
            .keys()
            .map(|path| {
                let value = path
                    .split('.')
                    .try_fold(doc, |current, part| current.get(part));
                any_present |= value.is_some();
                value.cloned().unwrap_or(Value::Null)
            })
            .collect();
        if self.sparse && !any_present {
            None
        } else {
            Some(key)
        }
    }
}

/// Request to build one index
///
/// Owned by the builder processing it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IndexBuildRequest {
    pub spec: IndexSpec,
    /// Treat an option conflict with an existing index as already satisfied
    pub relax_constraints: bool,
    /// Timestamp for catalog writes made while initialising the build
    pub init_index_ts: Timestamp,
}

impl IndexBuildRequest {
    pub fn new(spec: IndexSpec, relax_constraints: bool, init_index_ts: Timestamp) -> Self {
        Self {
            spec,
            relax_constraints,
            init_index_ts,
        }
    }
}
