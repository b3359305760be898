//! Per-operation storage transaction state.
//!
//! A slim stand-in for the storage engine's recovery unit: it tracks the
//! commit timestamp applied to catalog writes, the prepare-conflict
//! behavior, and snapshot abandonment. Index builds abandon their snapshot
//! at every lock transition so later reads observe concurrent writes.

use crate::timestamp::Timestamp;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

/// How reads behave when they encounter a prepared-transaction conflict.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PrepareConflictBehavior {
    /// Block until the prepared transaction resolves
    #[default]
    Enforce,
    /// Ignore the conflict and keep both reads and writes flowing; index
    /// builds use this so side-table inserts proceed during the scan
    IgnoreConflictsAllowWrites,
}

/// Storage transaction state scoped to one operation context.
#[derive(Default)]
pub struct RecoveryUnit {
    commit_timestamp: Mutex<Timestamp>,
    prepare_conflict_behavior: Mutex<PrepareConflictBehavior>,
    snapshot_abandons: AtomicU64,
}

impl RecoveryUnit {
    /// Create a fresh recovery unit with no commit timestamp.
    pub fn new() -> Self {
        RecoveryUnit::default()
    }

    /// The commit timestamp for catalog writes; null when unset.
    pub fn commit_timestamp(&self) -> Timestamp {
        *self.commit_timestamp.lock()
    }

    /// Set the commit timestamp (oplog application does this before
    /// invoking coordinator hooks).
    pub fn set_commit_timestamp(&self, ts: Timestamp) {
        *self.commit_timestamp.lock() = ts;
    }

    /// Clear the commit timestamp.
    pub fn clear_commit_timestamp(&self) {
        *self.commit_timestamp.lock() = Timestamp::NULL;
    }

    /// Current prepare-conflict behavior.
    pub fn prepare_conflict_behavior(&self) -> PrepareConflictBehavior {
        *self.prepare_conflict_behavior.lock()
    }

    /// Change the prepare-conflict behavior for this operation.
    pub fn set_prepare_conflict_behavior(&self, behavior: PrepareConflictBehavior) {
        *self.prepare_conflict_behavior.lock() = behavior;
    }

    /// Abandon the current storage snapshot. The next read starts fresh.
    pub fn abandon_snapshot(&self) {
        self.snapshot_abandons.fetch_add(1, Ordering::Relaxed);
    }

    /// How many times the snapshot was abandoned (observability/tests).
    pub fn snapshot_abandons(&self) -> u64 {
        self.snapshot_abandons.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for RecoveryUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecoveryUnit")
            .field("commit_timestamp", &self.commit_timestamp())
            .field("prepare_conflict_behavior", &self.prepare_conflict_behavior())
            .finish()
    }
}

/// Scoped commit timestamp: sets the recovery unit's timestamp for the
/// duration of a write block and restores the previous value on drop.
///
/// A null timestamp makes the block a no-op, so callers can pass through
/// whatever the commit gate produced without branching.
pub struct TimestampBlock<'a> {
    unit: &'a RecoveryUnit,
    previous: Timestamp,
    active: bool,
}

impl<'a> TimestampBlock<'a> {
    /// Enter a timestamped block. No-op when `ts` is null.
    pub fn new(unit: &'a RecoveryUnit, ts: Timestamp) -> Self {
        let previous = unit.commit_timestamp();
        let active = !ts.is_null();
        if active {
            unit.set_commit_timestamp(ts);
        }
        TimestampBlock {
            unit,
            previous,
            active,
        }
    }
}

impl Drop for TimestampBlock<'_> {
    fn drop(&mut self) {
        if self.active {
            self.unit.set_commit_timestamp(self.previous);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamp_block_restores_previous_value() {
        let unit = RecoveryUnit::new();
        unit.set_commit_timestamp(Timestamp::from_raw(7));
        {
            let _block = TimestampBlock::new(&unit, Timestamp::from_raw(42));
            assert_eq!(unit.commit_timestamp(), Timestamp::from_raw(42));
        }
        assert_eq!(unit.commit_timestamp(), Timestamp::from_raw(7));
    }

    #[test]
    fn null_timestamp_block_is_noop() {
        let unit = RecoveryUnit::new();
        unit.set_commit_timestamp(Timestamp::from_raw(7));
        {
            let _block = TimestampBlock::new(&unit, Timestamp::NULL);
            assert_eq!(unit.commit_timestamp(), Timestamp::from_raw(7));
        }
        assert_eq!(unit.commit_timestamp(), Timestamp::from_raw(7));
    }
}
