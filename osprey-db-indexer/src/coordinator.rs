//! The index build coordinator.
//!
//! Owns the registry, admits new builds, schedules one driver task per
//! build, and exposes the hooks the replication layer calls as log records
//! and role transitions arrive. Results flow back to callers through
//! [`BuildCompletion`] handles.

use crate::build_state::{
    BuildCompletion, BuildOutcome, BuildProtocol, CatalogStats, IndexBuildState,
};
use crate::builder::{noop_on_cleanup, noop_on_init, IndexBuilder, IndexConstraints, SetupOptions};
use crate::config::CoordinatorConfig;
use crate::error::{CoordinatorError, Result};
use crate::registry::BuildRegistry;
use osprey_db_core::{
    BuildId, CollectionCatalog, CollectionId, IndexSpec, LockManager, LockMode, NamespaceString,
    OperationContext, ResourceId, Timestamp,
};
use osprey_db_repl::{Oplog, OplogRecord, ReplCoordinator};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Additional information required by `start_index_build`.
#[derive(Clone, Debug, Default)]
pub struct BuildOptions {
    /// Commit quorum policy for two-phase builds (opaque to the coordinator)
    pub commit_quorum: Option<Value>,
    /// True when the build was scheduled by replication-stream application
    /// on a node that was not primary at the time. Auto-detected when left
    /// false.
    pub repl_set_and_not_primary_at_start: bool,
}

/// Diagnostic snapshot of coordinator activity.
#[derive(Clone, Debug, Default)]
pub struct CoordinatorSummary {
    /// Build count per database
    pub builds_per_database: BTreeMap<String, usize>,
    /// Collections carrying at least one active build
    pub active_collections: Vec<CollectionId>,
}

pub(crate) enum Registered {
    /// Registration resolved without scheduling a driver
    Ready(BuildCompletion),
    /// A driver must be scheduled for this state
    Scheduled(Arc<IndexBuildState>),
}

/// Coordinator for all index builds on this node.
///
/// Cheap to clone: clones share the registry and collaborators, so a
/// clone can be moved into a driver task or held by a scoped guard.
#[derive(Clone)]
pub struct IndexBuildCoordinator {
    pub(crate) catalog: Arc<CollectionCatalog>,
    pub(crate) lock_manager: Arc<LockManager>,
    pub(crate) repl: Arc<dyn ReplCoordinator>,
    pub(crate) oplog: Arc<dyn Oplog>,
    pub(crate) builder: Arc<dyn IndexBuilder>,
    pub(crate) registry: Arc<BuildRegistry>,
    pub(crate) config: CoordinatorConfig,
}

impl IndexBuildCoordinator {
    /// Assemble a coordinator from its collaborators.
    pub fn new(
        catalog: Arc<CollectionCatalog>,
        lock_manager: Arc<LockManager>,
        repl: Arc<dyn ReplCoordinator>,
        oplog: Arc<dyn Oplog>,
        builder: Arc<dyn IndexBuilder>,
        config: CoordinatorConfig,
    ) -> Self {
        IndexBuildCoordinator {
            catalog,
            lock_manager,
            repl,
            oplog,
            builder,
            registry: Arc::new(BuildRegistry::new()),
            config,
        }
    }

    /// True when new builds use the two-phase protocol.
    pub fn supports_two_phase(&self) -> bool {
        self.config.supports_two_phase()
    }

    /// The protocol new builds should be registered under.
    pub fn protocol_for_new_builds(&self) -> BuildProtocol {
        if self.supports_two_phase() {
            BuildProtocol::TwoPhase
        } else {
            BuildProtocol::SinglePhase
        }
    }

    /// Register an index build and schedule its driver.
    ///
    /// On success the returned handle resolves with the build's catalog
    /// stats once the driver finishes. Registrations fully subsumed by
    /// existing indexes resolve immediately with unchanged counts.
    pub async fn start_index_build(
        &self,
        opctx: &Arc<OperationContext>,
        db_name: &str,
        collection_uuid: CollectionId,
        specs: Vec<IndexSpec>,
        build_uuid: BuildId,
        protocol: BuildProtocol,
        options: BuildOptions,
    ) -> Result<BuildCompletion> {
        let mut options = options;
        let registered = self
            .register_and_setup(
                opctx,
                db_name,
                collection_uuid,
                specs,
                build_uuid,
                protocol,
                &mut options,
            )
            .await?;

        match registered {
            Registered::Ready(completion) => Ok(completion),
            Registered::Scheduled(state) => {
                let completion = state.completion();
                let driver_ctx = OperationContext::new();
                state.set_driver_ctx(driver_ctx.clone());
                let coordinator = self.clone();
                tokio::spawn(async move {
                    coordinator
                        .run_index_build(driver_ctx, build_uuid, options)
                        .await;
                });
                Ok(completion)
            }
        }
    }

    /// Validate, register, and set up a build without scheduling it.
    pub(crate) async fn register_and_setup(
        &self,
        opctx: &Arc<OperationContext>,
        db_name: &str,
        collection_uuid: CollectionId,
        specs: Vec<IndexSpec>,
        build_uuid: BuildId,
        protocol: BuildProtocol,
        options: &mut BuildOptions,
    ) -> Result<Registered> {
        opctx.check_for_interrupt()?;

        // Held only while ascertaining what to build and materializing the
        // unfinished entries; the driver reacquires its own locks.
        let _db_lock = self
            .lock_manager
            .lock(
                ResourceId::Database(db_name.to_string()),
                LockMode::IntentExclusive,
            )
            .await;
        let _coll_lock = self
            .lock_manager
            .lock(ResourceId::Collection(collection_uuid), LockMode::Exclusive)
            .await;

        let collection = self
            .catalog
            .lookup_by_uuid(collection_uuid)
            .ok_or_else(|| {
                osprey_db_core::Error::not_found(format!("collection {collection_uuid}"))
            })?;
        let nss = collection.nss();

        let secondary_application =
            self.repl.using_replica_sets() && !self.repl.accepts_writes_for(&nss);
        if secondary_application {
            options.repl_set_and_not_primary_at_start = true;
        }

        // During replication-stream application the specs were already
        // normalized by the primary; do not modify them further.
        let filtered_specs = if secondary_application {
            specs
        } else {
            let with_defaults = collection.add_collation_defaults(&specs);
            let filtered = collection.remove_existing_indexes(&with_defaults)?;
            for spec in &filtered {
                collection.check_shard_key_restrictions(spec)?;
            }
            filtered
        };

        if filtered_specs.is_empty() {
            // Everything requested is already built or being built.
            let n = collection.num_indexes_total();
            return Ok(Registered::Ready(BuildCompletion::ready(
                BuildOutcome::Succeeded(CatalogStats {
                    num_indexes_before: n,
                    num_indexes_after: n,
                }),
            )));
        }

        let state = IndexBuildState::new(
            build_uuid,
            collection_uuid,
            db_name,
            filtered_specs.clone(),
            protocol,
            options.commit_quorum.clone(),
        );
        state.set_num_indexes_before(collection.num_indexes_total());

        self.registry.register(&state)?;

        let constraints = if self.repl.should_relax_constraints(&nss) {
            IndexConstraints::Relax
        } else {
            IndexConstraints::Enforce
        };

        // Two-phase primaries open the build in the replication log so
        // secondaries start their own drivers.
        let on_init = if protocol == BuildProtocol::TwoPhase && self.repl.accepts_writes_for(&nss)
        {
            let oplog = self.oplog.clone();
            let opctx = opctx.clone();
            let nss = nss.clone();
            let specs = filtered_specs.clone();
            Box::new(move || {
                Box::pin(async move {
                    oplog
                        .append(
                            &opctx,
                            OplogRecord::StartIndexBuild {
                                ns: nss,
                                collection_uuid,
                                build_uuid,
                                specs,
                            },
                        )
                        .await?;
                    Ok(())
                }) as futures::future::BoxFuture<'static, Result<()>>
            }) as crate::builder::OnInitFn<'static>
        } else {
            noop_on_init()
        };

        let setup_result = self
            .builder
            .setup(
                opctx,
                &collection,
                &filtered_specs,
                build_uuid,
                on_init,
                SetupOptions {
                    constraints,
                    for_recovery: false,
                    protocol,
                },
            )
            .await;

        if let Err(err) = setup_result {
            self.builder
                .teardown(opctx, &collection, build_uuid, noop_on_cleanup())
                .await;
            // Unregister before publishing so callers do not see the build
            // again.
            self.registry.unregister(&state);

            if err.converts_to_success(constraints == IndexConstraints::Relax) {
                tracing::debug!(build_id = %build_uuid, error = %err,
                    "ignoring indexing error; specs subsumed by existing indexes");
                let n = state.stats().num_indexes_before;
                return Ok(Registered::Ready(BuildCompletion::ready(
                    BuildOutcome::Succeeded(CatalogStats {
                        num_indexes_before: n,
                        num_indexes_after: n,
                    }),
                )));
            }

            // A joiner may already hold the state; resolve it before failing.
            state.publish(BuildOutcome::Failed(err.to_string()));
            return Err(err);
        }

        tracing::info!(build_id = %build_uuid, nss = %nss,
            collection = %collection_uuid, num_specs = state.specs.len(),
            protocol = ?protocol, "registered index build");
        Ok(Registered::Scheduled(state))
    }

    /// Wait for the build identified by `build_uuid` to complete. A no-op
    /// for unknown builds.
    pub async fn join_index_build(&self, build_uuid: BuildId) {
        let Ok(state) = self.registry.get(build_uuid) else {
            return;
        };
        let outcome = state.completion().wait().await;
        tracing::info!(build_id = %build_uuid, outcome = ?outcome, "index build joined");
    }

    /// Deliver the commit signal from a `commitIndexBuild` log record.
    ///
    /// The record's timestamp must already be in the operation's recovery
    /// unit.
    pub fn commit_index_build(
        &self,
        opctx: &OperationContext,
        _specs: &[IndexSpec],
        build_uuid: BuildId,
    ) -> Result<()> {
        let state = self.registry.get(build_uuid)?;
        let commit_timestamp = opctx.recovery_unit().commit_timestamp();
        if commit_timestamp.is_null() {
            return Err(CoordinatorError::internal(format!(
                "commitIndexBuild for {build_uuid} carried no timestamp"
            )));
        }
        state.try_set_commit_ready(commit_timestamp)
    }

    /// Best-effort abort of one build: forwards to the builder and sets the
    /// abort signal on the state. Idempotent.
    pub fn abort_index_build_by_build_uuid(
        &self,
        opctx: &OperationContext,
        build_uuid: BuildId,
        reason: &str,
    ) {
        self.builder.abort(build_uuid, reason);
        if let Ok(state) = self.registry.get(build_uuid) {
            let abort_timestamp = opctx.recovery_unit().commit_timestamp();
            state.set_aborted(reason, abort_timestamp);
        }
    }

    /// Signal every build on a collection to abort, then wait until the
    /// collection tracker drains.
    ///
    /// The caller must hold a [`crate::ScopedDisallowCollection`] for the
    /// collection so no new builds register behind the sweep.
    pub async fn abort_collection_index_builds(&self, collection_uuid: CollectionId, reason: &str) {
        assert!(
            self.registry.is_collection_disallowed(collection_uuid),
            "abort_collection_index_builds without ScopedDisallowCollection"
        );
        let builds = self.registry.collection_builds(collection_uuid);
        for state in &builds {
            self.builder.abort(state.build_uuid, reason);
            state.set_aborted(reason, Timestamp::NULL);
        }
        tracing::info!(collection = %collection_uuid, num_builds = builds.len(),
            reason = %reason, "aborting collection index builds");
        self.registry.await_none_for_collection(collection_uuid).await;
    }

    /// Signal every build on a database to abort, then wait until the
    /// database tracker drains.
    ///
    /// The caller must hold a [`crate::ScopedDisallowDatabase`] for the
    /// database.
    pub async fn abort_database_index_builds(&self, db_name: &str, reason: &str) {
        assert!(
            self.registry.is_db_disallowed(db_name),
            "abort_database_index_builds without ScopedDisallowDatabase"
        );
        let builds = self.registry.database_builds(db_name);
        for state in &builds {
            self.builder.abort(state.build_uuid, reason);
            state.set_aborted(reason, Timestamp::NULL);
        }
        tracing::info!(db = %db_name, num_builds = builds.len(), reason = %reason,
            "aborting database index builds");
        self.registry.await_none_for_db(db_name).await;
    }

    /// Step-up hook: unblock every non-aborted build. The commit timestamp
    /// stays null; each driver allocates one from its own oplog write.
    pub fn on_step_up(&self) {
        let builds = self.registry.snapshot();
        tracing::info!(num_builds = builds.len(),
            "this node is stepping up to primary; releasing commit gates");
        for state in builds {
            state.set_commit_ready_at_step_up();
        }
    }

    /// Rollback hook: abort every non-aborted build. Abort timestamps stay
    /// null; teardown uses ghost timestamps.
    pub fn on_rollback(&self) {
        let builds = self.registry.snapshot();
        tracing::info!(num_builds = builds.len(),
            "this node is entering the rollback state; aborting index builds");
        for state in builds {
            state.set_aborted("rollback", Timestamp::NULL);
        }
    }

    /// Interrupt every driver with the shutdown signal and wait for the
    /// registry to drain. Secondary builds are left in a recoverable,
    /// unfinished state.
    pub async fn shutdown(&self) {
        let builds = self.registry.snapshot();
        tracing::info!(num_builds = builds.len(), "shutting down index builds");
        for state in &builds {
            if let Some(ctx) = state.driver_ctx() {
                ctx.signal_shutdown();
            }
        }
        self.wait_for_all_index_builds_to_stop().await;
    }

    /// Wait until every database tracker reports empty. Callers must have
    /// already interrupted the drivers' operation contexts.
    pub async fn wait_for_all_index_builds_to_stop(&self) {
        self.registry.await_no_builds().await;
    }

    /// Replace the commit quorum on the two-phase build managing exactly
    /// these indexes. Quorum feasibility is not evaluated here.
    pub fn set_commit_quorum(
        &self,
        nss: &NamespaceString,
        index_names: &[&str],
        quorum: Value,
    ) -> Result<()> {
        let collection = self
            .catalog
            .lookup_by_nss(nss)
            .ok_or_else(|| osprey_db_core::Error::not_found(format!("collection {nss}")))?;
        let builds = self.registry.collection_builds(collection.uuid());
        for state in builds {
            if index_names
                .iter()
                .all(|n| state.index_names.iter().any(|have| have == n))
            {
                if state.protocol != BuildProtocol::TwoPhase {
                    return Err(CoordinatorError::CannotCreateIndex(format!(
                        "build {} does not use a commit quorum",
                        state.build_uuid
                    )));
                }
                state.set_commit_quorum(Some(quorum));
                return Ok(());
            }
        }
        Err(osprey_db_core::Error::not_found(format!(
            "no index build on {nss} manages indexes {index_names:?}"
        ))
        .into())
    }

    /// True when the build's driver is parked at the commit gate.
    pub fn is_waiting_for_commit_or_abort(&self, build_uuid: BuildId) -> bool {
        self.registry
            .get(build_uuid)
            .map(|state| state.is_waiting_for_commit_or_abort())
            .unwrap_or(false)
    }

    /// Number of builds running on a database.
    pub fn num_in_progress_for_db(&self, db_name: &str) -> usize {
        self.registry.num_in_progress_for_db(db_name)
    }

    /// True when a build is running on the collection.
    pub fn in_progress_for_collection(&self, collection_uuid: CollectionId) -> bool {
        self.registry.in_progress_for_collection(collection_uuid)
    }

    /// True when a build is running on the database.
    pub fn in_progress_for_db(&self, db_name: &str) -> bool {
        self.registry.in_progress_for_db(db_name)
    }

    /// Error unless no builds are running anywhere.
    pub fn assert_no_index_builds_in_progress(&self) -> Result<()> {
        self.registry.assert_no_builds_in_progress()
    }

    /// Error unless no builds are running on the collection.
    pub fn assert_none_for_collection(&self, collection_uuid: CollectionId) -> Result<()> {
        self.registry.assert_none_for_collection(collection_uuid)
    }

    /// Error unless no builds are running on the database.
    pub fn assert_none_for_db(&self, db_name: &str) -> Result<()> {
        self.registry.assert_none_for_db(db_name)
    }

    /// Wait for every build on the collection to finish.
    pub async fn await_none_for_collection(&self, collection_uuid: CollectionId) {
        self.registry.await_none_for_collection(collection_uuid).await;
    }

    /// Wait for every build on the database to finish.
    pub async fn await_none_for_db(&self, db_name: &str) {
        self.registry.await_none_for_db(db_name).await;
    }

    /// Diagnostic dump of current activity.
    pub fn summary(&self) -> CoordinatorSummary {
        let builds = self.registry.snapshot();
        let mut summary = CoordinatorSummary::default();
        for state in builds {
            *summary
                .builds_per_database
                .entry(state.db_name.clone())
                .or_insert(0) += 1;
            if !summary.active_collections.contains(&state.collection_uuid) {
                summary.active_collections.push(state.collection_uuid);
            }
        }
        summary
    }
}

impl std::fmt::Debug for IndexBuildCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexBuildCoordinator")
            .field("registry", &self.registry)
            .field("config", &self.config)
            .finish()
    }
}
