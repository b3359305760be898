//! Two-phase scenarios on a replica-set member: oplog-driven commit and
//! abort, step-up, and the commit-gate locking contract.

use osprey_db_core::{
    BuildId, CollectionCatalog, IndexSpec, LockManager, NamespaceString, OperationContext,
    ResourceId, Timestamp,
};
use osprey_db_indexer::{
    BuildOptions, BuildOutcome, BuildProtocol, CoordinatorConfig, IndexBuildCoordinator,
    MemoryIndexBuilder,
};
use osprey_db_repl::{MemberRole, MemoryOplog, MemoryReplCoord, OplogRecord};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

struct Node {
    catalog: Arc<CollectionCatalog>,
    lock_manager: Arc<LockManager>,
    repl: Arc<MemoryReplCoord>,
    oplog: Arc<MemoryOplog>,
    coordinator: IndexBuildCoordinator,
}

fn replica_member(role: MemberRole) -> Node {
    let catalog = Arc::new(CollectionCatalog::new());
    let lock_manager = Arc::new(LockManager::new());
    let repl = MemoryReplCoord::replica_set_member(role);
    let oplog = MemoryOplog::new();
    let builder = MemoryIndexBuilder::new(catalog.clone());
    let coordinator = IndexBuildCoordinator::new(
        catalog.clone(),
        lock_manager.clone(),
        repl.clone(),
        oplog.clone(),
        builder,
        CoordinatorConfig::default(),
    );
    Node {
        catalog,
        lock_manager,
        repl,
        oplog,
        coordinator,
    }
}

fn nss(s: &str) -> NamespaceString {
    s.parse().unwrap()
}

/// Poll until the driver has parked at the commit gate.
async fn wait_for_commit_gate(node: &Node, build_uuid: BuildId) {
    let coordinator = node.coordinator.clone();
    wait_until(move || coordinator.is_waiting_for_commit_or_abort(build_uuid)).await;
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..2_000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    panic!("condition not reached within timeout");
}

/// S2: a secondary applies startIndexBuild then commitIndexBuild; the
/// catalog becomes visible at the replicated commit timestamp.
#[tokio::test]
async fn secondary_commits_at_the_replicated_timestamp() {
    let node = replica_member(MemberRole::Secondary);
    let collection = node.catalog.create_collection(nss("app.users")).unwrap();
    for i in 0..10 {
        collection.insert(json!({"a": i}));
    }

    let build_uuid = BuildId::new();
    let specs = vec![IndexSpec::ascending("a_1", &["a"])];
    let apply_ctx = OperationContext::new();
    let completion = node
        .coordinator
        .start_index_build(
            &apply_ctx,
            "app",
            collection.uuid(),
            specs.clone(),
            build_uuid,
            BuildProtocol::TwoPhase,
            BuildOptions::default(),
        )
        .await
        .unwrap();

    wait_for_commit_gate(&node, build_uuid).await;

    // Apply the primary's commitIndexBuild record at timestamp 42.
    let commit_ts = Timestamp::from_raw(42);
    let commit_ctx = OperationContext::new();
    commit_ctx.recovery_unit().set_commit_timestamp(commit_ts);
    node.coordinator
        .commit_index_build(&commit_ctx, &specs, build_uuid)
        .unwrap();

    match completion.wait().await {
        BuildOutcome::Succeeded(stats) => {
            assert_eq!(stats.num_indexes_after, stats.num_indexes_before + 1);
        }
        BuildOutcome::Failed(msg) => panic!("build failed: {msg}"),
    }

    let entry = collection.index_entry("a_1").unwrap();
    assert!(!entry.building);
    assert_eq!(entry.ready_at, commit_ts);

    // A secondary writes nothing to the log.
    assert!(node.oplog.is_empty());
    assert!(!node.coordinator.in_progress_for_collection(collection.uuid()));
}

/// S3: a secondary applies startIndexBuild then abortIndexBuild; the build
/// unregisters, no catalog entry remains, and oplog application survives.
#[tokio::test]
async fn secondary_aborts_on_the_replicated_abort_record() {
    let node = replica_member(MemberRole::Secondary);
    let collection = node.catalog.create_collection(nss("app.users")).unwrap();
    collection.insert(json!({"a": 1}));

    let build_uuid = BuildId::new();
    let apply_ctx = OperationContext::new();
    let completion = node
        .coordinator
        .start_index_build(
            &apply_ctx,
            "app",
            collection.uuid(),
            vec![IndexSpec::ascending("a_1", &["a"])],
            build_uuid,
            BuildProtocol::TwoPhase,
            BuildOptions::default(),
        )
        .await
        .unwrap();

    wait_for_commit_gate(&node, build_uuid).await;

    let abort_ctx = OperationContext::new();
    abort_ctx
        .recovery_unit()
        .set_commit_timestamp(Timestamp::from_raw(77));
    node.coordinator
        .abort_index_build_by_build_uuid(&abort_ctx, build_uuid, "aborted by primary");

    // The mandated abort is swallowed so the applier can continue.
    match completion.wait().await {
        BuildOutcome::Succeeded(stats) => {
            assert_eq!(stats.num_indexes_before, stats.num_indexes_after);
        }
        BuildOutcome::Failed(msg) => panic!("mandated abort must be swallowed: {msg}"),
    }

    assert!(collection.index_entry("a_1").is_none());
    assert!(!node.coordinator.in_progress_for_collection(collection.uuid()));
    assert!(node.oplog.is_empty());
}

/// S5: a build parked at the gate is released by step-up with a null
/// commit timestamp; the driver allocates its own from the commit record.
#[tokio::test]
async fn step_up_releases_the_gate_and_the_new_primary_commits() {
    let node = replica_member(MemberRole::Secondary);
    let collection = node.catalog.create_collection(nss("app.users")).unwrap();
    for i in 0..5 {
        collection.insert(json!({"a": i}));
    }

    let build_uuid = BuildId::new();
    let apply_ctx = OperationContext::new();
    let completion = node
        .coordinator
        .start_index_build(
            &apply_ctx,
            "app",
            collection.uuid(),
            vec![IndexSpec::ascending("a_1", &["a"])],
            build_uuid,
            BuildProtocol::TwoPhase,
            BuildOptions::default(),
        )
        .await
        .unwrap();

    wait_for_commit_gate(&node, build_uuid).await;
    // The gate contract: nothing may be held while waiting, or step-down
    // could never advance.
    assert!(!node.lock_manager.is_locked(&ResourceId::ReplState));

    node.repl.set_role(MemberRole::Primary);
    node.coordinator.on_step_up();

    match completion.wait().await {
        BuildOutcome::Succeeded(stats) => assert_eq!(stats.num_indexes_after, 1),
        BuildOutcome::Failed(msg) => panic!("build failed after step-up: {msg}"),
    }

    // The new primary wrote the commit record itself and stamped the
    // catalog with its optime.
    let commits = node
        .oplog
        .find(|r| matches!(r, OplogRecord::CommitIndexBuild { .. }));
    assert_eq!(commits.len(), 1);
    assert_eq!(
        collection.index_entry("a_1").unwrap().ready_at,
        commits[0].0
    );
}

/// A primary's two-phase build skips the gate entirely and brackets the
/// log with startIndexBuild / commitIndexBuild.
#[tokio::test]
async fn primary_two_phase_build_writes_both_records() {
    let node = replica_member(MemberRole::Primary);
    let collection = node.catalog.create_collection(nss("app.users")).unwrap();
    collection.insert(json!({"a": 1}));

    let opctx = OperationContext::new();
    let completion = node
        .coordinator
        .start_index_build(
            &opctx,
            "app",
            collection.uuid(),
            vec![IndexSpec::ascending("a_1", &["a"])],
            BuildId::new(),
            BuildProtocol::TwoPhase,
            BuildOptions::default(),
        )
        .await
        .unwrap();
    assert!(matches!(
        completion.wait().await,
        BuildOutcome::Succeeded(_)
    ));

    let records = node.oplog.entries();
    assert_eq!(records.len(), 2);
    assert!(matches!(records[0].1, OplogRecord::StartIndexBuild { .. }));
    assert!(matches!(records[1].1, OplogRecord::CommitIndexBuild { .. }));
    assert_eq!(
        collection.index_entry("a_1").unwrap().ready_at,
        records[1].0
    );
}

/// A primary whose build fails replicates the abort decision.
#[tokio::test]
async fn primary_failure_emits_abort_index_build() {
    let node = replica_member(MemberRole::Primary);
    let collection = node.catalog.create_collection(nss("app.users")).unwrap();
    collection.insert(json!({"email": "dup"}));
    collection.insert(json!({"email": "dup"}));

    let opctx = OperationContext::new();
    let completion = node
        .coordinator
        .start_index_build(
            &opctx,
            "app",
            collection.uuid(),
            vec![IndexSpec::ascending("email_u", &["email"]).with_unique()],
            BuildId::new(),
            BuildProtocol::TwoPhase,
            BuildOptions::default(),
        )
        .await
        .unwrap();

    assert!(matches!(completion.wait().await, BuildOutcome::Failed(_)));

    let aborts = node
        .oplog
        .find(|r| matches!(r, OplogRecord::AbortIndexBuild { .. }));
    assert_eq!(aborts.len(), 1);
    if let OplogRecord::AbortIndexBuild { cause, .. } = &aborts[0].1 {
        assert!(cause.contains("duplicate key"), "got cause: {cause}");
    }
    assert!(collection.index_entry("email_u").is_none());
}

/// A commit record landing on an aborted build is an invariant violation:
/// the first signal writer wins.
#[tokio::test]
async fn commit_after_abort_is_rejected() {
    let node = replica_member(MemberRole::Secondary);
    let collection = node.catalog.create_collection(nss("app.users")).unwrap();
    collection.insert(json!({"a": 1}));

    let build_uuid = BuildId::new();
    let specs = vec![IndexSpec::ascending("a_1", &["a"])];
    let apply_ctx = OperationContext::new();
    let completion = node
        .coordinator
        .start_index_build(
            &apply_ctx,
            "app",
            collection.uuid(),
            specs.clone(),
            build_uuid,
            BuildProtocol::TwoPhase,
            BuildOptions::default(),
        )
        .await
        .unwrap();

    wait_for_commit_gate(&node, build_uuid).await;

    let abort_ctx = OperationContext::new();
    abort_ctx
        .recovery_unit()
        .set_commit_timestamp(Timestamp::from_raw(5));
    node.coordinator
        .abort_index_build_by_build_uuid(&abort_ctx, build_uuid, "dropped");

    // The build may still be draining out of the registry; a late commit
    // record either hits the aborted state or finds no build at all.
    let commit_ctx = OperationContext::new();
    commit_ctx
        .recovery_unit()
        .set_commit_timestamp(Timestamp::from_raw(6));
    assert!(node
        .coordinator
        .commit_index_build(&commit_ctx, &specs, build_uuid)
        .is_err());

    completion.wait().await;
}

/// commitIndexBuild records always carry a timestamp.
#[tokio::test]
async fn commit_without_timestamp_is_rejected() {
    let node = replica_member(MemberRole::Secondary);
    let collection = node.catalog.create_collection(nss("app.users")).unwrap();
    collection.insert(json!({"a": 1}));

    let build_uuid = BuildId::new();
    let specs = vec![IndexSpec::ascending("a_1", &["a"])];
    let apply_ctx = OperationContext::new();
    let _completion = node
        .coordinator
        .start_index_build(
            &apply_ctx,
            "app",
            collection.uuid(),
            specs.clone(),
            build_uuid,
            BuildProtocol::TwoPhase,
            BuildOptions::default(),
        )
        .await
        .unwrap();

    let bare_ctx = OperationContext::new();
    let err = node
        .coordinator
        .commit_index_build(&bare_ctx, &specs, build_uuid)
        .unwrap_err();
    assert!(err.to_string().contains("no timestamp"));

    // Clean up: roll the build back so the test runtime drains.
    node.coordinator.on_rollback();
    node.coordinator.wait_for_all_index_builds_to_stop().await;
}

/// Rollback aborts every non-aborted build with a null abort timestamp;
/// teardown then runs on ghost timestamps.
#[tokio::test]
async fn rollback_aborts_active_builds() {
    let node = replica_member(MemberRole::Secondary);
    let collection = node.catalog.create_collection(nss("app.users")).unwrap();
    collection.insert(json!({"a": 1}));

    let build_uuid = BuildId::new();
    let apply_ctx = OperationContext::new();
    let completion = node
        .coordinator
        .start_index_build(
            &apply_ctx,
            "app",
            collection.uuid(),
            vec![IndexSpec::ascending("a_1", &["a"])],
            build_uuid,
            BuildProtocol::TwoPhase,
            BuildOptions::default(),
        )
        .await
        .unwrap();

    wait_for_commit_gate(&node, build_uuid).await;
    node.coordinator.on_rollback();

    match completion.wait().await {
        BuildOutcome::Succeeded(stats) => {
            assert_eq!(stats.num_indexes_before, stats.num_indexes_after);
        }
        BuildOutcome::Failed(msg) => panic!("rollback abort must be swallowed: {msg}"),
    }
    assert!(collection.index_entry("a_1").is_none());
    assert!(!node.coordinator.in_progress_for_db("app"));
}

/// The commit quorum can be replaced while a two-phase build is running.
#[tokio::test]
async fn set_commit_quorum_replaces_the_policy() {
    let node = replica_member(MemberRole::Secondary);
    let collection = node.catalog.create_collection(nss("app.users")).unwrap();
    collection.insert(json!({"a": 1}));

    let build_uuid = BuildId::new();
    let apply_ctx = OperationContext::new();
    let _completion = node
        .coordinator
        .start_index_build(
            &apply_ctx,
            "app",
            collection.uuid(),
            vec![IndexSpec::ascending("a_1", &["a"])],
            build_uuid,
            BuildProtocol::TwoPhase,
            BuildOptions {
                commit_quorum: Some(json!("majority")),
                ..BuildOptions::default()
            },
        )
        .await
        .unwrap();

    node.coordinator
        .set_commit_quorum(&nss("app.users"), &["a_1"], json!(2))
        .unwrap();

    assert!(node
        .coordinator
        .set_commit_quorum(&nss("app.users"), &["missing_1"], json!(2))
        .is_err());

    node.coordinator.on_rollback();
    node.coordinator.wait_for_all_index_builds_to_stop().await;
}
