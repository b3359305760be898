//! The per-build driver: three phases, the commit gate, and failure
//! cleanup.
//!
//! One driver runs per registered build, on its own task. The phases are:
//!
//! 1. **Scan** — collection scan into the builder's sorted key sets, under
//!    collection IS after downgrading from the registration-time X lock.
//!    Concurrent writers keep flowing; the interceptor buffers them in the
//!    side table.
//! 2. **Drain** — first drain under IS with yielding, second quiescent
//!    drain under S.
//! 3. **Commit** — final drain, constraint check, and catalog commit under
//!    collection X, inside a timestamped write unit.
//!
//! Two-phase builds pass through the commit gate between phases 2 and 3:
//! a node that does not accept writes for the namespace releases every
//! lock (including the replication-state lock) and blocks until the
//! primary's decision arrives. Holding the replication-state lock there
//! would deadlock against step-down, which acquires it exclusively.

use crate::build_state::{BuildOutcome, BuildProtocol, CommitSignal, IndexBuildState};
use crate::builder::{noop_on_cleanup, DrainYieldPolicy, OnCleanupFn, OnCommitFn, OnCreateEachFn};
use crate::coordinator::{BuildOptions, IndexBuildCoordinator};
use crate::error::{CoordinatorError, Result};
use osprey_db_core::{
    BuildId, LockGuard, LockMode, NamespaceString, OperationContext, PrepareConflictBehavior,
    ResourceId, Timestamp, TimestampBlock,
};
use futures::future::BoxFuture;
use osprey_db_repl::OplogRecord;
use std::sync::Arc;

/// The driver's lock positions. Phases move locks between slots; the gate
/// empties all of them.
#[derive(Default)]
struct LockSlots {
    repl_state: Option<LockGuard>,
    db: Option<LockGuard>,
    collection: Option<LockGuard>,
}

impl LockSlots {
    fn release_all(&mut self) {
        self.collection = None;
        self.db = None;
        self.repl_state = None;
    }

    fn holds_nothing(&self) -> bool {
        self.repl_state.is_none() && self.db.is_none() && self.collection.is_none()
    }
}

/// A replication-stream build failed for a reason the stream cannot
/// reconcile. Applying further records would diverge from the primary.
fn fatal_replication_build(build_uuid: BuildId, err: &CoordinatorError) -> ! {
    tracing::error!(build_id = %build_uuid, error = %err,
        "index build scheduled by the replication stream failed; this node cannot continue");
    std::process::abort();
}

impl IndexBuildCoordinator {
    /// Driver entry point: runs the build, unregisters it, and publishes
    /// the outcome. Never panics across the publish/unregister pair.
    pub(crate) async fn run_index_build(
        &self,
        opctx: Arc<OperationContext>,
        build_uuid: BuildId,
        options: BuildOptions,
    ) {
        let state = match self.registry.get(build_uuid) {
            Ok(state) => state,
            Err(_) => {
                tracing::error!(build_id = %build_uuid,
                    "driver scheduled for an unregistered index build");
                return;
            }
        };

        let result = self.run_index_build_inner(&opctx, &state, &options).await;

        // Unregister before publishing so callers never observe a
        // completed build still in the registry.
        self.registry.unregister(&state);
        match result {
            Ok(()) => state.publish(BuildOutcome::Succeeded(state.stats())),
            Err(err) => state.publish(BuildOutcome::Failed(err.to_string())),
        }
    }

    async fn run_index_build_inner(
        &self,
        opctx: &Arc<OperationContext>,
        state: &Arc<IndexBuildState>,
        options: &BuildOptions,
    ) -> Result<()> {
        let mut slots = LockSlots::default();

        let status: Result<()> = async {
            slots.repl_state = Some(
                self.lock_manager
                    .lock(ResourceId::ReplState, LockMode::IntentShared)
                    .await,
            );
            slots.db = Some(
                self.lock_manager
                    .lock(
                        ResourceId::Database(state.db_name.clone()),
                        LockMode::IntentExclusive,
                    )
                    .await,
            );
            // Lock the collection by UUID so a concurrent rename cannot
            // redirect the build.
            slots.collection = Some(
                self.lock_manager
                    .lock(
                        ResourceId::Collection(state.collection_uuid),
                        LockMode::Exclusive,
                    )
                    .await,
            );

            if options.repl_set_and_not_primary_at_start {
                // The replication stream mandated this build: kill signals
                // are suppressed for the body, shutdown still lands.
                let _suppress = opctx.run_without_interruption_except_shutdown();
                if !self.supports_two_phase() {
                    // A single-phase replicated build never synchronizes
                    // with step-up or step-down, and holding the
                    // replication-state lock can deadlock against prepared
                    // transactions.
                    slots.repl_state = None;
                }
                self.build_index(opctx, state, options, &mut slots).await?;
            } else {
                self.build_index(opctx, state, options, &mut slots).await?;
            }

            let collection = self
                .catalog
                .lookup_by_uuid(state.collection_uuid)
                .ok_or_else(|| {
                    CoordinatorError::internal(format!(
                        "collection {} disappeared under registered index build {}",
                        state.collection_uuid, state.build_uuid
                    ))
                })?;
            state.set_num_indexes_after(collection.num_indexes_total());
            Ok(())
        }
        .await;

        if let Err(err) = &status {
            if err.is_shutdown() {
                // Leave the catalog as-if the process died: the unfinished
                // indexes are completed or discarded by startup recovery.
                tracing::info!(build_id = %state.build_uuid,
                    "index build interrupted at shutdown; leaving unfinished catalog state");
                if options.repl_set_and_not_primary_at_start {
                    state.set_num_indexes_after(state.stats().num_indexes_before);
                    return Ok(());
                }
                return Err(CoordinatorError::Core(
                    osprey_db_core::Error::InterruptedAtShutdown,
                ));
            }
        }

        // The collection record outlives the registered build even across
        // rename; resolve the current namespace for cleanup and logging.
        let nss = self
            .catalog
            .lookup_nss_by_uuid(state.collection_uuid)
            .ok_or_else(|| {
                CoordinatorError::internal(format!(
                    "collection {} disappeared under registered index build {}",
                    state.collection_uuid, state.build_uuid
                ))
            })?;

        if let Err(err) = &status {
            self.cleanup_failed_build(opctx, state, options, &nss, err, &mut slots)
                .await;
            tracing::error!(build_id = %state.build_uuid, nss = %nss,
                collection = %state.collection_uuid, error = %err, "index build failed");

            if options.repl_set_and_not_primary_at_start {
                if err.is_build_aborted() {
                    // The abort was mandated by the primary (or rollback);
                    // swallow it so replication-stream application proceeds.
                    state.set_num_indexes_after(state.stats().num_indexes_before);
                    return Ok(());
                }
                fatal_replication_build(state.build_uuid, err);
            }
            return status;
        }

        tracing::info!(build_id = %state.build_uuid, nss = %nss,
            collection = %state.collection_uuid,
            num_specs = state.specs.len(),
            num_indexes_before = state.stats().num_indexes_before,
            num_indexes_after = state.stats().num_indexes_after,
            "index build completed successfully");
        Ok(())
    }

    async fn build_index(
        &self,
        opctx: &Arc<OperationContext>,
        state: &Arc<IndexBuildState>,
        options: &BuildOptions,
        slots: &mut LockSlots,
    ) -> Result<()> {
        match state.protocol {
            BuildProtocol::SinglePhase => {
                self.scan_collection_and_sort(opctx, state, slots).await?;
                self.drain_side_writes(opctx, state).await?;
                self.drain_and_commit(opctx, state, options, slots, Timestamp::NULL)
                    .await
            }
            BuildProtocol::TwoPhase => {
                self.build_index_two_phase(opctx, state, options, slots).await
            }
        }
    }

    async fn build_index_two_phase(
        &self,
        opctx: &Arc<OperationContext>,
        state: &Arc<IndexBuildState>,
        options: &BuildOptions,
        slots: &mut LockSlots,
    ) -> Result<()> {
        let mut nss = self
            .catalog
            .lookup_nss_by_uuid(state.collection_uuid)
            .ok_or_else(|| {
                CoordinatorError::internal(format!("collection {} not found", state.collection_uuid))
            })?;

        let mut pre_abort: Option<CoordinatorError> = None;
        let scan_result: Result<NamespaceString> = async {
            self.scan_collection_and_sort(opctx, state, slots).await?;
            self.drain_side_writes(opctx, state).await
        }
        .await;
        match scan_result {
            Ok(current_nss) => nss = current_nss,
            Err(err) => {
                let secondary_now =
                    self.repl.using_replica_sets() && !self.repl.accepts_writes_for(&nss);
                if !secondary_now || err.is_shutdown() {
                    return Err(err);
                }
                // A failure during oplog application is reconciled by the
                // primary: hold the error and wait for its decision.
                tracing::info!(build_id = %state.build_uuid, error = %err,
                    "index build failed before final phase during oplog application; \
                     waiting for abort");
                pre_abort = Some(err);
            }
        }

        let commit_timestamp = self
            .wait_for_commit_or_abort(opctx, &nss, state, pre_abort, slots)
            .await?;
        self.drain_and_commit(opctx, state, options, slots, commit_timestamp)
            .await
    }

    /// Phase 1: downgrade to IS and run the collection scan.
    async fn scan_collection_and_sort(
        &self,
        opctx: &Arc<OperationContext>,
        state: &Arc<IndexBuildState>,
        slots: &mut LockSlots,
    ) -> Result<()> {
        let collection = self
            .catalog
            .lookup_by_uuid(state.collection_uuid)
            .ok_or_else(|| {
                CoordinatorError::internal(format!("collection {} not found", state.collection_uuid))
            })?;
        debug_assert!(slots.db.is_some() && slots.collection.is_some());
        debug_assert!(self.builder.is_background(state.build_uuid));

        opctx.set_description(format!(
            "createIndexes {}: build {} ({} indexes)",
            collection.nss().coll(),
            state.build_uuid,
            state.specs.len()
        ));

        // Reads may run against an older snapshot while side-table inserts
        // proceed; prepared transactions must not block the scan.
        let recovery_unit = opctx.recovery_unit();
        recovery_unit.abandon_snapshot();
        recovery_unit
            .set_prepare_conflict_behavior(PrepareConflictBehavior::IgnoreConflictsAllowWrites);

        // Downgrade: writers proceed during the scan, funneled into the
        // side table by the interceptor.
        slots.collection = None;
        {
            let _is_lock = self
                .lock_manager
                .lock(
                    ResourceId::Collection(state.collection_uuid),
                    LockMode::IntentShared,
                )
                .await;
            self.builder
                .scan_and_sort(opctx, &collection, state.build_uuid)
                .await?;
        }
        Ok(())
    }

    /// Phase 2: two drains, the second quiescent under S. Returns the
    /// collection's current (possibly renamed) namespace.
    async fn drain_side_writes(
        &self,
        opctx: &Arc<OperationContext>,
        state: &Arc<IndexBuildState>,
    ) -> Result<NamespaceString> {
        let resource = ResourceId::Collection(state.collection_uuid);

        opctx.recovery_unit().abandon_snapshot();
        {
            let _is_lock = self
                .lock_manager
                .lock(resource.clone(), LockMode::IntentShared)
                .await;
            self.builder
                .drain(opctx, state.build_uuid, DrainYieldPolicy::Yield)
                .await?;
        }

        opctx.recovery_unit().abandon_snapshot();
        let nss = {
            let _s_lock = self.lock_manager.lock(resource, LockMode::Shared).await;
            self.builder
                .drain(opctx, state.build_uuid, DrainYieldPolicy::NoYield)
                .await?;
            self.catalog
                .lookup_nss_by_uuid(state.collection_uuid)
                .ok_or_else(|| {
                    CoordinatorError::internal(format!(
                        "collection {} not found",
                        state.collection_uuid
                    ))
                })?
        };
        Ok(nss)
    }

    /// The commit gate. A node that accepts writes for the namespace skips
    /// the wait: its driver emits the commit record itself.
    async fn wait_for_commit_or_abort(
        &self,
        opctx: &Arc<OperationContext>,
        nss: &NamespaceString,
        state: &Arc<IndexBuildState>,
        pre_abort: Option<CoordinatorError>,
        slots: &mut LockSlots,
    ) -> Result<Timestamp> {
        let should_wait = state.protocol == BuildProtocol::TwoPhase
            && self.repl.using_replica_sets()
            && !self.repl.accepts_writes_for(nss);
        if !should_wait {
            // A local failure with no primary to reconcile it cannot be
            // deferred any further.
            if let Some(err) = pre_abort {
                return Err(err);
            }
            return Ok(Timestamp::NULL);
        }

        tracing::info!(build_id = %state.build_uuid,
            "index build waiting for commit or abort before completing final phase");

        // Yield every lock and storage resource before blocking. Holding
        // the replication-state lock here deadlocks step-down.
        opctx.recovery_unit().abandon_snapshot();
        slots.release_all();
        debug_assert!(
            slots.holds_nothing(),
            "failed to yield locks for index build {} before the commit gate",
            state.build_uuid
        );

        match state.wait_for_signal(opctx).await? {
            CommitSignal::Commit(commit_timestamp) => {
                tracing::info!(build_id = %state.build_uuid,
                    commit_timestamp = %commit_timestamp,
                    collection = %state.collection_uuid, "committing index build");
                if let Some(err) = pre_abort {
                    // This node failed locally; it cannot honor a commit
                    // signal from the primary.
                    return Err(CoordinatorError::internal(format!(
                        "index build {} failed on this node but received a commitIndexBuild \
                         record with timestamp {commit_timestamp}: {err}",
                        state.build_uuid
                    )));
                }
                debug_assert!(!state.is_aborted());
                Ok(commit_timestamp)
            }
            CommitSignal::Abort { reason } => {
                tracing::info!(build_id = %state.build_uuid,
                    abort_timestamp = %state.abort_timestamp(), reason = %reason,
                    collection = %state.collection_uuid, "aborting index build");
                let message = match pre_abort {
                    Some(err) => err.to_string(),
                    None => reason,
                };
                Err(CoordinatorError::BuildAborted(message))
            }
        }
    }

    /// Phase 3: reacquire X, final drain, constraint check, and commit
    /// within a write unit keyed by `commit_timestamp`.
    async fn drain_and_commit(
        &self,
        opctx: &Arc<OperationContext>,
        state: &Arc<IndexBuildState>,
        options: &BuildOptions,
        slots: &mut LockSlots,
        commit_timestamp: Timestamp,
    ) -> Result<()> {
        opctx.recovery_unit().abandon_snapshot();
        slots.collection = Some(
            self.lock_manager
                .lock(
                    ResourceId::Collection(state.collection_uuid),
                    LockMode::Exclusive,
                )
                .await,
        );

        let collection = self
            .catalog
            .lookup_by_uuid(state.collection_uuid)
            .ok_or_else(|| {
                CoordinatorError::internal(format!(
                    "collection {} not found after relocking for commit of index build {}",
                    state.collection_uuid, state.build_uuid
                ))
            })?;
        let nss = collection.nss();

        self.builder
            .drain(opctx, state.build_uuid, DrainYieldPolicy::NoYield)
            .await?;
        self.builder
            .check_violations(opctx, state.build_uuid)
            .await?;

        let on_create_each: OnCreateEachFn<'static> = {
            let protocol = state.protocol;
            let secondary = options.repl_set_and_not_primary_at_start;
            let oplog = self.oplog.clone();
            let opctx = opctx.clone();
            let nss = nss.clone();
            let collection_uuid = state.collection_uuid;
            let build_uuid = state.build_uuid;
            Box::new(move |spec| {
                let oplog = oplog.clone();
                let opctx = opctx.clone();
                let nss = nss.clone();
                Box::pin(async move {
                    if protocol == BuildProtocol::TwoPhase {
                        // The commitIndexBuild record carries the decision.
                        return Ok(());
                    }
                    if secondary {
                        tracing::debug!(build_id = %build_uuid,
                            "skipping createIndex record during oplog application");
                        return Ok(());
                    }
                    oplog
                        .append(
                            &opctx,
                            OplogRecord::CreateIndex {
                                ns: nss,
                                collection_uuid,
                                spec,
                            },
                        )
                        .await?;
                    Ok(())
                }) as BoxFuture<'static, Result<()>>
            })
        };

        let on_commit: OnCommitFn<'static> = {
            let protocol = state.protocol;
            let secondary = options.repl_set_and_not_primary_at_start;
            let repl = self.repl.clone();
            let oplog = self.oplog.clone();
            let catalog = self.catalog.clone();
            let opctx = opctx.clone();
            let nss = nss.clone();
            let collection_uuid = state.collection_uuid;
            let build_uuid = state.build_uuid;
            let specs = state.specs.clone();
            Box::new(move || {
                Box::pin(async move {
                    match protocol {
                        BuildProtocol::TwoPhase => {
                            if repl.accepts_writes_for(&nss) {
                                oplog
                                    .append(
                                        &opctx,
                                        OplogRecord::CommitIndexBuild {
                                            ns: nss.clone(),
                                            collection_uuid,
                                            build_uuid,
                                            specs,
                                        },
                                    )
                                    .await?;
                            } else if opctx.recovery_unit().commit_timestamp().is_null() {
                                return Err(CoordinatorError::internal(format!(
                                    "secondary commit of index build {build_uuid} without a \
                                     commit timestamp"
                                )));
                            }
                        }
                        BuildProtocol::SinglePhase => {
                            if secondary {
                                // No record was replicated from this node;
                                // complete the catalog write with a ghost
                                // timestamp.
                                opctx
                                    .recovery_unit()
                                    .set_commit_timestamp(catalog.ghost_timestamp());
                            }
                        }
                    }
                    Ok(())
                }) as BoxFuture<'static, Result<()>>
            })
        };

        let _ts_block = TimestampBlock::new(opctx.recovery_unit(), commit_timestamp);
        self.builder
            .commit(
                opctx,
                &collection,
                &nss,
                state.build_uuid,
                on_create_each,
                on_commit,
            )
            .await?;
        Ok(())
    }

    /// Failure path: tear the build down under a write lock, emitting an
    /// `abortIndexBuild` record when this node is primary and using the
    /// primary-supplied abort timestamp when it is a secondary.
    async fn cleanup_failed_build(
        &self,
        opctx: &Arc<OperationContext>,
        state: &Arc<IndexBuildState>,
        options: &BuildOptions,
        nss: &NamespaceString,
        err: &CoordinatorError,
        slots: &mut LockSlots,
    ) {
        // Cleanup must run even on a killed context.
        let _suppress = opctx.run_without_interruption_except_shutdown();
        slots.release_all();

        let Some(collection) = self.catalog.lookup_by_uuid(state.collection_uuid) else {
            tracing::error!(build_id = %state.build_uuid,
                collection = %state.collection_uuid,
                "collection missing during index build cleanup");
            return;
        };

        let _db_lock = self
            .lock_manager
            .lock(
                ResourceId::Database(state.db_name.clone()),
                LockMode::IntentExclusive,
            )
            .await;
        let _coll_lock = self
            .lock_manager
            .lock(
                ResourceId::Collection(state.collection_uuid),
                LockMode::Exclusive,
            )
            .await;

        if !options.repl_set_and_not_primary_at_start {
            if state.protocol == BuildProtocol::TwoPhase
                && self.repl.using_replica_sets()
                && self.repl.accepts_writes_for(nss)
            {
                // Primary: replicate the abort decision to downstream nodes.
                let on_cleanup: OnCleanupFn<'static> = {
                    let oplog = self.oplog.clone();
                    let opctx = opctx.clone();
                    let record = OplogRecord::AbortIndexBuild {
                        ns: nss.clone(),
                        collection_uuid: state.collection_uuid,
                        build_uuid: state.build_uuid,
                        specs: state.specs.clone(),
                        cause: err.to_string(),
                    };
                    Box::new(move || {
                        Box::pin(async move {
                            if let Err(append_err) = oplog.append(&opctx, record).await {
                                tracing::error!(error = %append_err,
                                    "failed to write abortIndexBuild record");
                            }
                        }) as BoxFuture<'static, ()>
                    })
                };
                self.builder
                    .teardown(opctx, &collection, state.build_uuid, on_cleanup)
                    .await;
            } else {
                // Standalone, or aborted by step-down: nothing to replicate.
                self.builder
                    .teardown(opctx, &collection, state.build_uuid, noop_on_cleanup())
                    .await;
            }
        } else {
            // Oplog application. An abortIndexBuild record supplies the
            // teardown timestamp; anything else gets a ghost timestamp.
            let abort_timestamp = if state.is_aborted() && !state.abort_timestamp().is_null() {
                state.abort_timestamp()
            } else {
                self.catalog.ghost_timestamp()
            };
            let _ts_block = TimestampBlock::new(opctx.recovery_unit(), abort_timestamp);
            self.builder
                .teardown(opctx, &collection, state.build_uuid, noop_on_cleanup())
                .await;
        }
    }
}
