//! Per-build shared state.
//!
//! An [`IndexBuildState`] is reference counted and shared between the
//! registry, the driver task, replication hooks, and joiners. The mutable
//! portion (commit/abort flags, timestamps, stats) sits behind its own
//! mutex; the commit gate blocks on `signal`; the final outcome fans out to
//! all joiners through a one-shot watch broadcast.
//!
//! Lock ordering: this mutex is a leaf. Code holding it must not take the
//! registry lock.

use crate::error::{CoordinatorError, Result};
use osprey_db_core::{BuildId, CollectionId, IndexSpec, OperationContext, Timestamp};
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{watch, Notify};

/// Protocol driving a build to completion.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BuildProtocol {
    /// Committed by one `createIndex` log record per spec; no cross-replica
    /// agreement step
    SinglePhase,
    /// Bracketed by `startIndexBuild` and `commitIndexBuild`/`abortIndexBuild`
    /// records; all replicas agree on the commit timestamp
    TwoPhase,
}

/// Index catalog counts taken at the start and end of a build.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CatalogStats {
    /// Total indexes (ready and building) before the build began
    pub num_indexes_before: usize,
    /// Total indexes after the build finished
    pub num_indexes_after: usize,
}

/// Terminal result of a build, broadcast to joiners.
#[derive(Clone, Debug)]
pub enum BuildOutcome {
    /// The build committed
    Succeeded(CatalogStats),
    /// The build failed or was aborted
    Failed(String),
}

/// Decision observed at the commit gate.
#[derive(Clone, Debug)]
pub(crate) enum CommitSignal {
    /// Commit with this timestamp (null when this node allocates its own)
    Commit(Timestamp),
    /// Abort, with the primary's (or rollback's) reason
    Abort {
        /// Why the build was aborted
        reason: String,
    },
}

/// How a build presents in registration-conflict diagnostics.
#[derive(Clone, Debug)]
pub(crate) enum BuildPhaseBrief {
    InProgress,
    CommitReady(Timestamp),
    Aborted(String),
}

#[derive(Default)]
struct BuildStateInner {
    commit_quorum: Option<Value>,
    commit_ready: bool,
    commit_timestamp: Timestamp,
    aborted: bool,
    abort_reason: String,
    abort_timestamp: Timestamp,
    stats: CatalogStats,
    published: bool,
    waiting_for_signal: bool,
}

/// Shared state of one registered index build.
pub struct IndexBuildState {
    /// The build's globally unique identifier
    pub build_uuid: BuildId,
    /// Target collection (stable across rename)
    pub collection_uuid: CollectionId,
    /// Parent database name
    pub db_name: String,
    /// Normalized index specifications
    pub specs: Vec<IndexSpec>,
    /// Names derived from `specs`, for conflict detection
    pub index_names: Vec<String>,
    /// The protocol this build runs under
    pub protocol: BuildProtocol,

    inner: Mutex<BuildStateInner>,
    signal: Notify,
    completion_tx: watch::Sender<Option<BuildOutcome>>,
    completion_rx: watch::Receiver<Option<BuildOutcome>>,
    driver_ctx: Mutex<Option<Arc<OperationContext>>>,
}

impl IndexBuildState {
    /// Create the state for a new registration.
    pub fn new(
        build_uuid: BuildId,
        collection_uuid: CollectionId,
        db_name: impl Into<String>,
        specs: Vec<IndexSpec>,
        protocol: BuildProtocol,
        commit_quorum: Option<Value>,
    ) -> Arc<Self> {
        let index_names = specs.iter().map(|s| s.name.clone()).collect();
        let (completion_tx, completion_rx) = watch::channel(None);
        Arc::new(IndexBuildState {
            build_uuid,
            collection_uuid,
            db_name: db_name.into(),
            specs,
            index_names,
            protocol,
            inner: Mutex::new(BuildStateInner {
                commit_quorum,
                ..BuildStateInner::default()
            }),
            signal: Notify::new(),
            completion_tx,
            completion_rx,
            driver_ctx: Mutex::new(None),
        })
    }

    /// The commit quorum policy, when one was supplied.
    pub fn commit_quorum(&self) -> Option<Value> {
        self.inner.lock().commit_quorum.clone()
    }

    /// Replace the commit quorum policy.
    pub fn set_commit_quorum(&self, quorum: Option<Value>) {
        self.inner.lock().commit_quorum = quorum;
    }

    /// Deliver the commit signal.
    ///
    /// The first writer to set either the commit or the abort flag is
    /// authoritative; a commit signal landing on an aborted (or already
    /// commit-ready) build is an invariant violation surfaced as an error.
    pub fn try_set_commit_ready(&self, commit_timestamp: Timestamp) -> Result<()> {
        {
            let mut inner = self.inner.lock();
            if inner.aborted {
                return Err(CoordinatorError::internal(format!(
                    "commit signal for aborted index build {} (abort reason: {})",
                    self.build_uuid, inner.abort_reason
                )));
            }
            if inner.commit_ready {
                return Err(CoordinatorError::internal(format!(
                    "duplicate commit signal for index build {}",
                    self.build_uuid
                )));
            }
            inner.commit_ready = true;
            inner.commit_timestamp = commit_timestamp;
        }
        self.signal.notify_waiters();
        Ok(())
    }

    /// Step-up variant of the commit signal: skips aborted builds and
    /// leaves the timestamp null, since the driver will allocate one from
    /// its own `commitIndexBuild` oplog write now that this node is
    /// primary. No build may already be commit-ready at step-up.
    pub fn set_commit_ready_at_step_up(&self) {
        {
            let mut inner = self.inner.lock();
            if inner.aborted {
                return;
            }
            assert!(
                !inner.commit_ready,
                "index build {} was commit-ready before step-up",
                self.build_uuid
            );
            assert!(
                inner.commit_timestamp.is_null(),
                "index build {} carried a commit timestamp before step-up",
                self.build_uuid
            );
            inner.commit_ready = true;
        }
        self.signal.notify_waiters();
    }

    /// Deliver the abort signal. Idempotent: returns false when the build
    /// was already aborted. An abort may land after `commit_ready` was set
    /// at step-up (the permitted rollback race); the abort then wins.
    pub fn set_aborted(&self, reason: impl Into<String>, abort_timestamp: Timestamp) -> bool {
        {
            let mut inner = self.inner.lock();
            if inner.aborted {
                return false;
            }
            inner.aborted = true;
            inner.abort_reason = reason.into();
            inner.abort_timestamp = abort_timestamp;
        }
        self.signal.notify_waiters();
        true
    }

    /// True once the abort signal has been delivered.
    pub fn is_aborted(&self) -> bool {
        self.inner.lock().aborted
    }

    /// True once the commit signal has been delivered.
    pub fn is_commit_ready(&self) -> bool {
        self.inner.lock().commit_ready
    }

    /// The abort timestamp (null unless supplied by an abort record).
    pub fn abort_timestamp(&self) -> Timestamp {
        self.inner.lock().abort_timestamp
    }

    /// The abort reason (empty unless aborted).
    pub fn abort_reason(&self) -> String {
        self.inner.lock().abort_reason.clone()
    }

    pub(crate) fn phase_brief(&self) -> BuildPhaseBrief {
        let inner = self.inner.lock();
        if inner.aborted {
            BuildPhaseBrief::Aborted(inner.abort_reason.clone())
        } else if inner.commit_ready {
            BuildPhaseBrief::CommitReady(inner.commit_timestamp)
        } else {
            BuildPhaseBrief::InProgress
        }
    }

    /// Block until the commit or abort signal arrives, honoring the
    /// operation context's interruption rules.
    pub(crate) async fn wait_for_signal(&self, opctx: &OperationContext) -> Result<CommitSignal> {
        self.inner.lock().waiting_for_signal = true;
        let result = self.wait_for_signal_inner(opctx).await;
        self.inner.lock().waiting_for_signal = false;
        result
    }

    async fn wait_for_signal_inner(&self, opctx: &OperationContext) -> Result<CommitSignal> {
        loop {
            // Create the notification future before checking the flags so a
            // signal landing between the check and the await is not lost.
            let notified = self.signal.notified();
            {
                let inner = self.inner.lock();
                if inner.aborted {
                    return Ok(CommitSignal::Abort {
                        reason: inner.abort_reason.clone(),
                    });
                }
                if inner.commit_ready {
                    return Ok(CommitSignal::Commit(inner.commit_timestamp));
                }
            }
            tokio::select! {
                _ = notified => {}
                err = opctx.interrupted() => return Err(err.into()),
            }
        }
    }

    /// True while the driver is parked at the commit gate with its locks
    /// released (diagnostics and test synchronization).
    pub fn is_waiting_for_commit_or_abort(&self) -> bool {
        self.inner.lock().waiting_for_signal
    }

    /// Record the catalog index count at build start.
    pub fn set_num_indexes_before(&self, n: usize) {
        self.inner.lock().stats.num_indexes_before = n;
    }

    /// Record the catalog index count at build end.
    pub fn set_num_indexes_after(&self, n: usize) {
        self.inner.lock().stats.num_indexes_after = n;
    }

    /// Snapshot of the catalog stats.
    pub fn stats(&self) -> CatalogStats {
        self.inner.lock().stats
    }

    /// Attach the driver's operation context, so shutdown can interrupt it.
    pub(crate) fn set_driver_ctx(&self, ctx: Arc<OperationContext>) {
        *self.driver_ctx.lock() = Some(ctx);
    }

    /// The driver's operation context, once the driver has started.
    pub(crate) fn driver_ctx(&self) -> Option<Arc<OperationContext>> {
        self.driver_ctx.lock().clone()
    }

    /// Broadcast the terminal outcome to all current and future joiners.
    ///
    /// Publishing twice is a programming error.
    pub fn publish(&self, outcome: BuildOutcome) {
        {
            let mut inner = self.inner.lock();
            assert!(
                !inner.published,
                "index build {} outcome published twice",
                self.build_uuid
            );
            inner.published = true;
        }
        // Joiners hold receiver clones; send only fails when none exist,
        // which is fine for a fire-and-forget build.
        let _ = self.completion_tx.send(Some(outcome));
    }

    /// A completion handle for joining this build.
    pub fn completion(&self) -> BuildCompletion {
        BuildCompletion {
            rx: self.completion_rx.clone(),
        }
    }
}

impl std::fmt::Debug for IndexBuildState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexBuildState")
            .field("build_uuid", &self.build_uuid)
            .field("collection_uuid", &self.collection_uuid)
            .field("db_name", &self.db_name)
            .field("index_names", &self.index_names)
            .field("protocol", &self.protocol)
            .field("phase", &self.phase_brief())
            .finish()
    }
}

/// Multi-consumer handle resolving with a build's terminal outcome.
#[derive(Clone)]
pub struct BuildCompletion {
    rx: watch::Receiver<Option<BuildOutcome>>,
}

impl BuildCompletion {
    /// A handle that is already resolved (empty registrations, spec-subsumed
    /// conversions).
    pub fn ready(outcome: BuildOutcome) -> Self {
        let (_tx, rx) = watch::channel(Some(outcome));
        BuildCompletion { rx }
    }

    /// Wait for the build to finish.
    pub async fn wait(mut self) -> BuildOutcome {
        loop {
            if let Some(outcome) = self.rx.borrow().clone() {
                return outcome;
            }
            if self.rx.changed().await.is_err() {
                return BuildOutcome::Failed("index build coordinator dropped".to_string());
            }
        }
    }

    /// Non-blocking check; `None` while the build is still running.
    pub fn try_get(&self) -> Option<BuildOutcome> {
        self.rx.borrow().clone()
    }
}

impl std::fmt::Debug for BuildCompletion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuildCompletion").finish_non_exhaustive()
    }
}
