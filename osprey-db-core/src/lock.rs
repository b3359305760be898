//! Multi-granularity lock manager.
//!
//! Resources form a fixed hierarchy: the replication-state lock, databases
//! by name, collections by UUID. Modes are the usual four (IS/IX/S/X) with
//! the standard compatibility matrix.
//!
//! Grants are FIFO-fair: a request that cannot be granted parks at the tail
//! of the resource's wait queue, and later requests — even compatible ones —
//! queue behind it. This is what keeps a stream of intent writers from
//! starving a shared-mode upgrade indefinitely.
//!
//! Acquisition is async; release happens synchronously when the guard drops.
//! Acquisition futures must be polled to completion (they are never dropped
//! mid-wait by the coordinator, which routes cancellation through operation
//! context interrupts instead).

use crate::ids::CollectionId;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::Notify;

/// Lock mode.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockMode {
    /// Intent shared (IS)
    IntentShared,
    /// Intent exclusive (IX)
    IntentExclusive,
    /// Shared (S)
    Shared,
    /// Exclusive (X)
    Exclusive,
}

impl LockMode {
    /// Standard multi-granularity compatibility.
    pub fn compatible_with(self, other: LockMode) -> bool {
        use LockMode::*;
        match (self, other) {
            (IntentShared, Exclusive) | (Exclusive, IntentShared) => false,
            (IntentShared, _) | (_, IntentShared) => true,
            (IntentExclusive, IntentExclusive) => true,
            (IntentExclusive, _) | (_, IntentExclusive) => false,
            (Shared, Shared) => true,
            _ => false,
        }
    }

    /// True for S and X: modes that block concurrent writers.
    pub fn blocks_writes(self) -> bool {
        matches!(self, LockMode::Shared | LockMode::Exclusive)
    }
}

/// A lockable resource.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum ResourceId {
    /// The global lock, taken exclusively by startup recovery
    Global,
    /// The process-wide replication-state lock
    ReplState,
    /// A database, by name
    Database(String),
    /// A collection, by UUID
    Collection(CollectionId),
}

struct Waiter {
    request: u64,
    mode: LockMode,
    notify: Arc<Notify>,
}

#[derive(Default)]
struct ResourceQueue {
    granted: Vec<(u64, LockMode)>,
    waiting: VecDeque<Waiter>,
}

impl ResourceQueue {
    fn can_grant(&self, mode: LockMode) -> bool {
        self.granted.iter().all(|(_, g)| mode.compatible_with(*g))
    }

    /// Grant as many waiters from the front of the queue as fit.
    fn promote(&mut self) {
        while let Some(front) = self.waiting.front() {
            if !self.can_grant(front.mode) {
                break;
            }
            let Some(waiter) = self.waiting.pop_front() else {
                break;
            };
            self.granted.push((waiter.request, waiter.mode));
            waiter.notify.notify_one();
        }
    }
}

#[derive(Default)]
struct LockTable {
    resources: HashMap<ResourceId, ResourceQueue>,
    next_request: u64,
}

impl LockTable {
    fn release(&mut self, resource: &ResourceId, request: u64) {
        let Some(queue) = self.resources.get_mut(resource) else {
            return;
        };
        queue.granted.retain(|(r, _)| *r != request);
        queue.promote();
        if queue.granted.is_empty() && queue.waiting.is_empty() {
            self.resources.remove(resource);
        }
    }
}

/// The process-wide lock manager.
///
/// The table is shared: guards keep it alive and release into it on drop.
#[derive(Default)]
pub struct LockManager {
    table: Arc<Mutex<LockTable>>,
}

impl LockManager {
    /// Create an empty lock manager.
    pub fn new() -> Self {
        LockManager::default()
    }

    /// Acquire `resource` in `mode`, waiting FIFO behind incompatible
    /// holders. The returned guard releases on drop.
    pub async fn lock(&self, resource: ResourceId, mode: LockMode) -> LockGuard {
        let (request, notify) = {
            let mut table = self.table.lock();
            table.next_request += 1;
            let request = table.next_request;
            let queue = table.resources.entry(resource.clone()).or_default();
            if queue.waiting.is_empty() && queue.can_grant(mode) {
                queue.granted.push((request, mode));
                return LockGuard {
                    table: self.table.clone(),
                    resource,
                    mode,
                    request,
                };
            }
            let notify = Arc::new(Notify::new());
            queue.waiting.push_back(Waiter {
                request,
                mode,
                notify: notify.clone(),
            });
            (request, notify)
        };

        // The releaser moves us to the granted set before notifying.
        notify.notified().await;
        LockGuard {
            table: self.table.clone(),
            resource,
            mode,
            request,
        }
    }

    /// Try to acquire without waiting. Returns `None` when the resource is
    /// held in an incompatible mode or has parked waiters.
    pub fn try_lock(&self, resource: ResourceId, mode: LockMode) -> Option<LockGuard> {
        let mut table = self.table.lock();
        table.next_request += 1;
        let request = table.next_request;
        let queue = table.resources.entry(resource.clone()).or_default();
        if queue.waiting.is_empty() && queue.can_grant(mode) {
            queue.granted.push((request, mode));
            return Some(LockGuard {
                table: self.table.clone(),
                resource,
                mode,
                request,
            });
        }
        None
    }

    /// True when `resource` is currently held in any mode.
    pub fn is_locked(&self, resource: &ResourceId) -> bool {
        let table = self.table.lock();
        table
            .resources
            .get(resource)
            .is_some_and(|q| !q.granted.is_empty())
    }

    /// True when `resource` is held in exactly `mode` by someone.
    pub fn is_locked_for(&self, resource: &ResourceId, mode: LockMode) -> bool {
        let table = self.table.lock();
        table
            .resources
            .get(resource)
            .is_some_and(|q| q.granted.iter().any(|(_, m)| *m == mode))
    }
}

impl std::fmt::Debug for LockManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let table = self.table.lock();
        f.debug_struct("LockManager")
            .field("num_resources", &table.resources.len())
            .finish()
    }
}

/// An acquired lock. Releases on drop.
pub struct LockGuard {
    table: Arc<Mutex<LockTable>>,
    resource: ResourceId,
    mode: LockMode,
    request: u64,
}

impl LockGuard {
    /// The resource this guard holds.
    pub fn resource(&self) -> &ResourceId {
        &self.resource
    }

    /// The granted mode.
    pub fn mode(&self) -> LockMode {
        self.mode
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.table.lock().release(&self.resource, self.request);
    }
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard")
            .field("resource", &self.resource)
            .field("mode", &self.mode)
            .finish()
    }
}
