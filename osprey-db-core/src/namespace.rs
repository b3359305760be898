//! Namespace strings: `db.collection` pairs.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Fully-qualified collection namespace (`db.collection`).
///
/// The database portion never contains a dot; the collection portion may.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NamespaceString {
    db: String,
    coll: String,
}

impl NamespaceString {
    /// Build a namespace from database and collection names.
    pub fn new(db: impl Into<String>, coll: impl Into<String>) -> Self {
        NamespaceString {
            db: db.into(),
            coll: coll.into(),
        }
    }

    /// The database name.
    pub fn db(&self) -> &str {
        &self.db
    }

    /// The collection name (without database prefix).
    pub fn coll(&self) -> &str {
        &self.coll
    }
}

impl fmt::Display for NamespaceString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.db, self.coll)
    }
}

impl FromStr for NamespaceString {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (db, coll) = s
            .split_once('.')
            .ok_or_else(|| Error::invalid_namespace(s))?;
        if db.is_empty() || coll.is_empty() {
            return Err(Error::invalid_namespace(s));
        }
        Ok(NamespaceString::new(db, coll))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_round_trips() {
        let nss: NamespaceString = "app.users".parse().unwrap();
        assert_eq!(nss.db(), "app");
        assert_eq!(nss.coll(), "users");
        assert_eq!(nss.to_string(), "app.users");
    }

    #[test]
    fn collection_may_contain_dots() {
        let nss: NamespaceString = "app.users.archive".parse().unwrap();
        assert_eq!(nss.db(), "app");
        assert_eq!(nss.coll(), "users.archive");
    }

    #[test]
    fn rejects_missing_parts() {
        assert!("app".parse::<NamespaceString>().is_err());
        assert!(".users".parse::<NamespaceString>().is_err());
        assert!("app.".parse::<NamespaceString>().is_err());
    }
}
