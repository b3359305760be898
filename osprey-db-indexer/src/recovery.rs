//! Startup-time rebuild of unfinished index builds.
//!
//! After a crash (or a shutdown that interrupted a replicated build), the
//! catalog may contain unfinished index entries. Recovery drops whatever is
//! left of them and rebuilds from scratch, inline under the global
//! exclusive lock, with no-op replication callbacks: the log records that
//! drove the original build have already been applied or discarded.
//!
//! A node that cannot rebuild its own unfinished indexes cannot serve;
//! any failure past setup is process-fatal.

use crate::build_state::{BuildProtocol, IndexBuildState};
use crate::builder::{
    noop_on_cleanup, noop_on_commit, noop_on_create_each, noop_on_init, IndexConstraints,
    SetupOptions,
};
use crate::coordinator::IndexBuildCoordinator;
use crate::error::{CoordinatorError, Result};
use osprey_db_core::{
    BuildId, CollectionId, IndexSpec, LockMode, NamespaceString, OperationContext, ResourceId,
};
use std::sync::Arc;

fn fatal_recovery(build_uuid: BuildId, nss: &NamespaceString, err: &CoordinatorError) -> ! {
    tracing::error!(build_id = %build_uuid, nss = %nss, error = %err,
        "index rebuild for recovery failed; this node cannot serve");
    std::process::abort();
}

impl IndexBuildCoordinator {
    /// Drop and rebuild the named indexes on `nss`, inline, under the
    /// global exclusive lock. Returns `(records_scanned, bytes_scanned)`.
    ///
    /// Failures before the build is set up (unknown namespace, nameless
    /// specs) are returned; failures after are fatal.
    pub async fn start_index_rebuild_for_recovery(
        &self,
        opctx: &Arc<OperationContext>,
        nss: &NamespaceString,
        specs: Vec<IndexSpec>,
        build_uuid: BuildId,
    ) -> Result<(u64, u64)> {
        let _global = self
            .lock_manager
            .lock(ResourceId::Global, LockMode::Exclusive)
            .await;

        let mut index_names = Vec::new();
        for spec in &specs {
            if spec.name.is_empty() {
                return Err(CoordinatorError::CannotCreateIndex(format!(
                    "cannot create an index for a spec without a non-empty 'name' field: {spec:?}"
                )));
            }
            index_names.push(spec.name.clone());
        }

        let collection = self
            .catalog
            .lookup_by_nss(nss)
            .ok_or_else(|| osprey_db_core::Error::not_found(format!("collection {nss}")))?;

        // Drop whatever is left of the named indexes: a missing descriptor
        // means an unfinished entry, removed directly from the catalog.
        for name in &index_names {
            collection.remove_index(name);
        }
        collection.reinit();

        // Collections may lack stable UUIDs mid-upgrade; the registered
        // state gets a fresh one. The build runs single-phase since the
        // global lock already excludes every writer.
        let state = IndexBuildState::new(
            build_uuid,
            CollectionId::new(),
            nss.db(),
            specs.clone(),
            BuildProtocol::SinglePhase,
            None,
        );
        state.set_num_indexes_before(collection.num_indexes_total() + index_names.len());
        self.registry.register(&state)?;

        let setup_result = self
            .builder
            .setup(
                opctx,
                &collection,
                &specs,
                build_uuid,
                noop_on_init(),
                SetupOptions {
                    constraints: IndexConstraints::Enforce,
                    for_recovery: true,
                    protocol: BuildProtocol::SinglePhase,
                },
            )
            .await;
        if let Err(err) = setup_result {
            fatal_recovery(build_uuid, nss, &err);
        }

        self.run_index_rebuild_for_recovery(opctx, &state, &collection, nss)
            .await
    }

    async fn run_index_rebuild_for_recovery(
        &self,
        opctx: &Arc<OperationContext>,
        state: &Arc<IndexBuildState>,
        collection: &Arc<osprey_db_core::Collection>,
        nss: &NamespaceString,
    ) -> Result<(u64, u64)> {
        let build_uuid = state.build_uuid;
        tracing::info!(build_id = %build_uuid, nss = %nss, "index rebuild starting");

        let rebuild: Result<(u64, u64)> = async {
            let scanned = self
                .builder
                .start_for_recovery(opctx, nss, build_uuid)
                .await?;
            self.builder.check_violations(opctx, build_uuid).await?;
            self.builder
                .commit(
                    opctx,
                    collection,
                    nss,
                    build_uuid,
                    noop_on_create_each(),
                    noop_on_commit(),
                )
                .await?;
            Ok(scanned)
        }
        .await;

        let scanned = match rebuild {
            Ok(scanned) => scanned,
            Err(err) => fatal_recovery(build_uuid, nss, &err),
        };

        state.set_num_indexes_after(collection.num_indexes_total());
        self.builder
            .teardown(opctx, collection, build_uuid, noop_on_cleanup())
            .await;

        // Recovery rebuilds exactly the indexes it dropped.
        let stats = state.stats();
        assert_eq!(
            stats.num_indexes_before, stats.num_indexes_after,
            "index rebuild for {build_uuid} changed the catalog index count"
        );

        self.registry.unregister(state);
        tracing::info!(build_id = %build_uuid, nss = %nss,
            records = scanned.0, bytes = scanned.1,
            num_indexes = stats.num_indexes_after, "index rebuild completed");
        Ok(scanned)
    }
}
