//! Foreground `createIndexes` glue.
//!
//! These paths bypass driver scheduling: each takes the collection
//! exclusive lock for its whole duration, so no concurrent writer exists,
//! no side table accumulates, and no drains are needed. They still emit
//! the protocol's replication records so secondaries observe the same log
//! shapes as a coordinated build.

use crate::builder::{
    noop_on_cleanup, noop_on_init, IndexConstraints, OnCommitFn, OnCreateEachFn, SetupOptions,
};
use crate::config::FeatureVersion;
use crate::coordinator::IndexBuildCoordinator;
use crate::error::{CoordinatorError, Result};
use futures::future::BoxFuture;
use osprey_db_core::{BuildId, CollectionId, IndexSpec, LockMode, OperationContext, ResourceId};
use osprey_db_repl::OplogRecord;
use std::sync::Arc;

impl IndexBuildCoordinator {
    /// Create indexes in the foreground: scan and commit with no drains.
    ///
    /// Two-phase deployments write `startIndexBuild` + `commitIndexBuild`
    /// records on success; single-phase writes one `createIndex` per spec.
    /// No abort record is written on failure.
    pub async fn create_indexes(
        &self,
        opctx: &Arc<OperationContext>,
        collection_uuid: CollectionId,
        specs: Vec<IndexSpec>,
        _from_migrate: bool,
    ) -> Result<()> {
        let collection = self
            .catalog
            .lookup_by_uuid(collection_uuid)
            .ok_or_else(|| {
                osprey_db_core::Error::not_found(format!("collection {collection_uuid}"))
            })?;
        let _coll_lock = self
            .lock_manager
            .lock(ResourceId::Collection(collection_uuid), LockMode::Exclusive)
            .await;
        let nss = collection.nss();
        let build_uuid = BuildId::new();
        let protocol = self.protocol_for_new_builds();

        let result: Result<()> = async {
            self.builder
                .setup(
                    opctx,
                    &collection,
                    &specs,
                    build_uuid,
                    noop_on_init(),
                    SetupOptions {
                        constraints: IndexConstraints::Enforce,
                        for_recovery: false,
                        protocol,
                    },
                )
                .await?;
            self.builder
                .scan_and_sort(opctx, &collection, build_uuid)
                .await?;
            self.builder.check_violations(opctx, build_uuid).await?;

            let on_create_each: OnCreateEachFn<'static> = {
                let two_phase = self.supports_two_phase();
                let oplog = self.oplog.clone();
                let opctx = opctx.clone();
                let nss = nss.clone();
                Box::new(move |spec| {
                    let oplog = oplog.clone();
                    let opctx = opctx.clone();
                    let nss = nss.clone();
                    Box::pin(async move {
                        if two_phase {
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
                let two_phase = self.supports_two_phase();
                let oplog = self.oplog.clone();
                let opctx = opctx.clone();
                let nss = nss.clone();
                let specs = specs.clone();
                Box::new(move || {
                    Box::pin(async move {
                        if !two_phase {
                            // Completion is timestamped by the createIndex
                            // records.
                            return Ok(());
                        }
                        oplog
                            .append(
                                &opctx,
                                OplogRecord::StartIndexBuild {
                                    ns: nss.clone(),
                                    collection_uuid,
                                    build_uuid,
                                    specs: specs.clone(),
                                },
                            )
                            .await?;
                        oplog
                            .append(
                                &opctx,
                                OplogRecord::CommitIndexBuild {
                                    ns: nss,
                                    collection_uuid,
                                    build_uuid,
                                    specs,
                                },
                            )
                            .await?;
                        Ok(())
                    }) as BoxFuture<'static, Result<()>>
                })
            };

            self.builder
                .commit(
                    opctx,
                    &collection,
                    &nss,
                    build_uuid,
                    on_create_each,
                    on_commit,
                )
                .await
        }
        .await;

        // Teardown runs on success and failure alike: committed builds only
        // shed bookkeeping, failed ones also shed their unfinished entries.
        opctx.recovery_unit().abandon_snapshot();
        self.builder
            .teardown(opctx, &collection, build_uuid, noop_on_cleanup())
            .await;
        result
    }

    /// Create already-complete indexes on an empty collection, bypassing
    /// the scan entirely.
    pub async fn create_indexes_on_empty_collection(
        &self,
        opctx: &Arc<OperationContext>,
        collection_uuid: CollectionId,
        specs: Vec<IndexSpec>,
        _from_migrate: bool,
    ) -> Result<()> {
        let collection = self
            .catalog
            .lookup_by_uuid(collection_uuid)
            .ok_or_else(|| {
                osprey_db_core::Error::not_found(format!("collection {collection_uuid}"))
            })?;
        if collection.num_records() != 0 {
            return Err(CoordinatorError::internal(format!(
                "create_indexes_on_empty_collection on non-empty collection {collection_uuid}"
            )));
        }
        let _coll_lock = self
            .lock_manager
            .lock(ResourceId::Collection(collection_uuid), LockMode::Exclusive)
            .await;
        let nss = collection.nss();

        // Fully-upgraded deployments bracket even the empty fast path with
        // build records so downstream nodes can track it uniformly.
        let bracket_build = self.config.feature_compat == FeatureVersion::V44;
        let build_uuid = bracket_build.then(BuildId::new);

        if let Some(build_uuid) = build_uuid {
            self.oplog
                .append(
                    opctx,
                    OplogRecord::StartIndexBuild {
                        ns: nss.clone(),
                        collection_uuid,
                        build_uuid,
                        specs: specs.clone(),
                    },
                )
                .await?;
        }

        if self.supports_two_phase() {
            let build_uuid = build_uuid.ok_or_else(|| {
                CoordinatorError::internal("two-phase build without a build UUID")
            })?;
            // All indexes become visible at the commitIndexBuild timestamp.
            self.oplog
                .append(
                    opctx,
                    OplogRecord::CommitIndexBuild {
                        ns: nss.clone(),
                        collection_uuid,
                        build_uuid,
                        specs: specs.clone(),
                    },
                )
                .await?;
            let ready_at = opctx.recovery_unit().commit_timestamp();
            for spec in &specs {
                collection.create_index_on_empty(spec, ready_at)?;
            }
        } else {
            // Each index becomes visible at its own createIndex timestamp.
            for spec in &specs {
                self.oplog
                    .append(
                        opctx,
                        OplogRecord::CreateIndex {
                            ns: nss.clone(),
                            collection_uuid,
                            spec: spec.clone(),
                        },
                    )
                    .await?;
                collection.create_index_on_empty(spec, opctx.recovery_unit().commit_timestamp())?;
            }
            if let Some(build_uuid) = build_uuid {
                self.oplog
                    .append(
                        opctx,
                        OplogRecord::CommitIndexBuild {
                            ns: nss,
                            collection_uuid,
                            build_uuid,
                            specs,
                        },
                    )
                    .await?;
            }
        }
        Ok(())
    }
}
