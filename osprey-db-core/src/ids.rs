//! Stable identifiers for builds, collections, and records.
//!
//! `BuildId` identifies one logical index build across every replica that
//! runs it; `CollectionId` identifies a collection independently of its
//! namespace, so lookups survive rename.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Globally unique identifier for a single index build.
///
/// Minted once when a build starts and carried unchanged through the
/// replication log, so all replicas agree on which build a commit or abort
/// record refers to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BuildId(Uuid);

impl BuildId {
    /// Mint a fresh build identifier.
    pub fn new() -> Self {
        BuildId(Uuid::new_v4())
    }

    /// Wrap an existing UUID (e.g. one read from a replication record).
    pub fn from_uuid(uuid: Uuid) -> Self {
        BuildId(uuid)
    }

    /// The underlying UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for BuildId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for BuildId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.as_hyphenated().fmt(f)
    }
}

/// Catalog identifier of a collection. Survives rename.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CollectionId(Uuid);

impl CollectionId {
    /// Mint a fresh collection identifier.
    pub fn new() -> Self {
        CollectionId(Uuid::new_v4())
    }

    /// Wrap an existing UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        CollectionId(uuid)
    }

    /// The underlying UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for CollectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CollectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.as_hyphenated().fmt(f)
    }
}

/// Identifier of a single document within a collection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(pub u64);

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "r{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_ids_are_unique() {
        assert_ne!(BuildId::new(), BuildId::new());
    }

    #[test]
    fn display_is_hyphenated_lowercase() {
        let id = BuildId::new();
        let s = id.to_string();
        assert_eq!(s.len(), 36);
        assert_eq!(s, s.to_lowercase());
    }

    #[test]
    fn serde_is_transparent() {
        let id = CollectionId::new();
        let json = serde_json::to_string(&id).unwrap();
        let back: CollectionId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, back);
    }
}
