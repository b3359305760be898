//! Index specifications.
//!
//! The coordinator treats specs as mostly opaque: it validates their shape,
//! derives names for conflict detection, and fills in collation defaults.
//! Key extraction itself belongs to the index builder.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Sort direction of one key field.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyOrder {
    /// Ascending
    #[serde(rename = "asc")]
    Asc,
    /// Descending
    #[serde(rename = "desc")]
    Desc,
}

/// A single secondary-index specification.
///
/// `keys` is ordered: `[("a", Asc), ("b", Desc)]` and `[("b", Desc), ("a", Asc)]`
/// are different indexes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexSpec {
    /// Index name, unique within a collection
    pub name: String,
    /// Ordered key fields
    pub keys: Vec<(String, KeyOrder)>,
    /// Whether the index enforces key uniqueness
    #[serde(default)]
    pub unique: bool,
    /// Collation options, opaque to the coordinator
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collation: Option<Value>,
}

impl IndexSpec {
    /// Build a plain ascending index spec over the given fields.
    pub fn ascending(name: impl Into<String>, fields: &[&str]) -> Self {
        IndexSpec {
            name: name.into(),
            keys: fields
                .iter()
                .map(|f| (f.to_string(), KeyOrder::Asc))
                .collect(),
            unique: false,
            collation: None,
        }
    }

    /// Mark this spec unique.
    pub fn with_unique(mut self) -> Self {
        self.unique = true;
        self
    }

    /// Set an explicit collation.
    pub fn with_collation(mut self, collation: Value) -> Self {
        self.collation = Some(collation);
        self
    }

    /// Shape-check the spec: a non-empty name and at least one key field.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::invalid_index_spec(
                "index spec requires a non-empty 'name'",
            ));
        }
        if self.keys.is_empty() {
            return Err(Error::invalid_index_spec(format!(
                "index spec '{}' requires at least one key field",
                self.name
            )));
        }
        Ok(())
    }

    /// The key field names, in index order.
    pub fn key_fields(&self) -> impl Iterator<Item = &str> {
        self.keys.iter().map(|(f, _)| f.as_str())
    }

    /// True when `fields` is a prefix of this spec's key fields.
    ///
    /// Used by the shard-key restriction on unique indexes: a unique index
    /// is only shard-compatible when the shard key is a prefix of its key.
    pub fn key_prefix_matches(&self, fields: &[String]) -> bool {
        if fields.len() > self.keys.len() {
            return false;
        }
        self.key_fields().zip(fields.iter()).all(|(k, f)| k == f)
    }

    /// Same key pattern and options (name aside).
    pub fn same_options(&self, other: &IndexSpec) -> bool {
        self.keys == other.keys && self.unique == other.unique && self.collation == other.collation
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn validate_rejects_empty_name_and_keys() {
        let mut spec = IndexSpec::ascending("a_1", &["a"]);
        spec.name.clear();
        assert!(spec.validate().is_err());

        let mut spec = IndexSpec::ascending("a_1", &["a"]);
        spec.keys.clear();
        assert!(spec.validate().is_err());
    }

    #[test]
    fn key_prefix_match() {
        let spec = IndexSpec::ascending("ab", &["a", "b"]);
        assert!(spec.key_prefix_matches(&["a".into()]));
        assert!(spec.key_prefix_matches(&["a".into(), "b".into()]));
        assert!(!spec.key_prefix_matches(&["b".into()]));
        assert!(!spec.key_prefix_matches(&["a".into(), "b".into(), "c".into()]));
    }

    #[test]
    fn same_options_ignores_name() {
        let a = IndexSpec::ascending("one", &["x"]).with_collation(json!({"locale": "fr"}));
        let b = IndexSpec::ascending("two", &["x"]).with_collation(json!({"locale": "fr"}));
        assert!(a.same_options(&b));
        assert!(!a.same_options(&b.clone().with_unique()));
    }
}
