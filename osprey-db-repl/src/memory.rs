//! In-memory replication collaborators for testing and embedded use.

use crate::error::Result;
use crate::oplog::{Oplog, OplogRecord};
use crate::{MemberRole, ReplCoordinator};
use async_trait::async_trait;
use osprey_db_core::{NamespaceString, OperationContext, Timestamp};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// In-memory replication role coordinator.
///
/// Role transitions are driven by tests (or an embedding) through
/// `set_role`; the coordinator under test reads the role through the
/// `ReplCoordinator` trait.
pub struct MemoryReplCoord {
    role: RwLock<MemberRole>,
    replica_set: bool,
}

impl MemoryReplCoord {
    /// A standalone node: not in a replica set, accepts all writes.
    pub fn standalone() -> Arc<Self> {
        Arc::new(MemoryReplCoord {
            role: RwLock::new(MemberRole::Primary),
            replica_set: false,
        })
    }

    /// A replica-set member starting in the given role.
    pub fn replica_set_member(role: MemberRole) -> Arc<Self> {
        Arc::new(MemoryReplCoord {
            role: RwLock::new(role),
            replica_set: true,
        })
    }

    /// Change the member role (step-up, step-down, rollback entry).
    pub fn set_role(&self, role: MemberRole) {
        *self.role.write() = role;
    }

    /// The current member role.
    pub fn role(&self) -> MemberRole {
        *self.role.read()
    }
}

impl ReplCoordinator for MemoryReplCoord {
    fn accepts_writes_for(&self, _nss: &NamespaceString) -> bool {
        !self.replica_set || *self.role.read() == MemberRole::Primary
    }

    fn using_replica_sets(&self) -> bool {
        self.replica_set
    }

    fn should_relax_constraints(&self, nss: &NamespaceString) -> bool {
        // Constraints are relaxed when applying replicated writes: the
        // primary already enforced them at the original write time.
        self.replica_set && !self.accepts_writes_for(nss)
    }
}

impl std::fmt::Debug for MemoryReplCoord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryReplCoord")
            .field("role", &self.role())
            .field("replica_set", &self.replica_set)
            .finish()
    }
}

/// In-memory oplog assigning monotonically increasing timestamps.
pub struct MemoryOplog {
    entries: RwLock<Vec<(Timestamp, OplogRecord)>>,
    clock: AtomicU64,
}

impl MemoryOplog {
    /// Create an empty oplog.
    pub fn new() -> Arc<Self> {
        Arc::new(MemoryOplog {
            entries: RwLock::new(Vec::new()),
            clock: AtomicU64::new(0),
        })
    }

    /// All appended records with their timestamps, oldest first.
    pub fn entries(&self) -> Vec<(Timestamp, OplogRecord)> {
        self.entries.read().clone()
    }

    /// Number of appended records.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// True when nothing has been appended.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Records matching a predicate, for test assertions.
    pub fn find(
        &self,
        predicate: impl Fn(&OplogRecord) -> bool,
    ) -> Vec<(Timestamp, OplogRecord)> {
        self.entries
            .read()
            .iter()
            .filter(|(_, r)| predicate(r))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl Oplog for MemoryOplog {
    async fn append(&self, opctx: &OperationContext, record: OplogRecord) -> Result<Timestamp> {
        let ts = Timestamp::from_raw(self.clock.fetch_add(1, Ordering::SeqCst) + 1);
        tracing::debug!(timestamp = %ts, record = ?record, "oplog append");
        self.entries.write().push((ts, record));
        // Writes in the surrounding unit are stamped with this optime.
        opctx.recovery_unit().set_commit_timestamp(ts);
        Ok(ts)
    }
}

impl std::fmt::Debug for MemoryOplog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryOplog")
            .field("len", &self.len())
            .finish()
    }
}
