//! Replication log records for index builds.
//!
//! Four record shapes matter to the index build coordinator. Two-phase
//! builds are bracketed by `StartIndexBuild` and either `CommitIndexBuild`
//! or `AbortIndexBuild`; single-phase builds emit one `CreateIndex` per
//! spec.

use crate::error::Result;
use async_trait::async_trait;
use osprey_db_core::{BuildId, CollectionId, IndexSpec, NamespaceString, OperationContext, Timestamp};
use serde::{Deserialize, Serialize};

/// One replication log record relevant to index builds.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum OplogRecord {
    /// Opens a two-phase build on every replica.
    #[serde(rename_all = "camelCase")]
    StartIndexBuild {
        /// Namespace at the time the build started
        ns: NamespaceString,
        /// Target collection
        collection_uuid: CollectionId,
        /// The build being opened
        build_uuid: BuildId,
        /// Normalized specs as registered on the primary
        specs: Vec<IndexSpec>,
    },

    /// Commits a two-phase build; its append timestamp is the catalog
    /// visibility point on every replica.
    #[serde(rename_all = "camelCase")]
    CommitIndexBuild {
        /// Namespace at commit time
        ns: NamespaceString,
        /// Target collection
        collection_uuid: CollectionId,
        /// The build being committed
        build_uuid: BuildId,
        /// Specs as committed
        specs: Vec<IndexSpec>,
    },

    /// Aborts a two-phase build on every replica.
    #[serde(rename_all = "camelCase")]
    AbortIndexBuild {
        /// Namespace at abort time
        ns: NamespaceString,
        /// Target collection
        collection_uuid: CollectionId,
        /// The build being aborted
        build_uuid: BuildId,
        /// Specs as registered
        specs: Vec<IndexSpec>,
        /// Why the primary gave up
        cause: String,
    },

    /// Single-phase index creation, one record per spec.
    #[serde(rename_all = "camelCase")]
    CreateIndex {
        /// Namespace at creation time
        ns: NamespaceString,
        /// Target collection
        collection_uuid: CollectionId,
        /// The created index
        spec: IndexSpec,
    },
}

impl OplogRecord {
    /// The build this record refers to, when it refers to one.
    pub fn build_uuid(&self) -> Option<BuildId> {
        match self {
            OplogRecord::StartIndexBuild { build_uuid, .. }
            | OplogRecord::CommitIndexBuild { build_uuid, .. }
            | OplogRecord::AbortIndexBuild { build_uuid, .. } => Some(*build_uuid),
            OplogRecord::CreateIndex { .. } => None,
        }
    }

    /// The target collection.
    pub fn collection_uuid(&self) -> CollectionId {
        match self {
            OplogRecord::StartIndexBuild {
                collection_uuid, ..
            }
            | OplogRecord::CommitIndexBuild {
                collection_uuid, ..
            }
            | OplogRecord::AbortIndexBuild {
                collection_uuid, ..
            }
            | OplogRecord::CreateIndex {
                collection_uuid, ..
            } => *collection_uuid,
        }
    }
}

/// Appender for replication log records.
#[async_trait]
pub trait Oplog: Send + Sync {
    /// Append one record, returning the timestamp the log assigned to it.
    ///
    /// The returned timestamp also lands in the operation's recovery unit
    /// so that catalog writes in the same unit are stamped consistently.
    async fn append(&self, opctx: &OperationContext, record: OplogRecord) -> Result<Timestamp>;
}
