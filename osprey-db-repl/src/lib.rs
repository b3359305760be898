//! # Osprey DB Replication
//!
//! Replication-facing traits consumed by the index build coordinator:
//!
//! - [`ReplCoordinator`]: the node's replication role as seen by one
//!   operation (can it accept writes, is it in a replica set, should index
//!   constraints be relaxed)
//! - [`Oplog`]: appender for the replication log records that drive
//!   two-phase and single-phase index builds
//!
//! In-memory implementations ([`MemoryReplCoord`], [`MemoryOplog`]) back
//! tests and embedded deployments.

mod error;
pub mod memory;
pub mod oplog;

pub use error::{ReplError, Result};
pub use memory::{MemoryOplog, MemoryReplCoord};
pub use oplog::{Oplog, OplogRecord};

use osprey_db_core::NamespaceString;
use serde::{Deserialize, Serialize};

/// Replication role of this node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MemberRole {
    /// Accepts writes; drives index build commits
    Primary,
    /// Applies the replication stream; waits for commit/abort decisions
    Secondary,
    /// Unwinding divergent history; active builds must abort
    Rollback,
}

/// The node's replication role, as consulted by the coordinator.
pub trait ReplCoordinator: Send + Sync {
    /// True when this node currently accepts writes for `nss`.
    fn accepts_writes_for(&self, nss: &NamespaceString) -> bool;

    /// True when this node is a replica-set member (as opposed to a
    /// standalone).
    fn using_replica_sets(&self) -> bool;

    /// True when index constraint enforcement should be relaxed for work
    /// on `nss` (replicated writes were already validated upstream).
    fn should_relax_constraints(&self, nss: &NamespaceString) -> bool;
}
