//! Single-node build scenarios: the coordinated single-phase path, the
//! foreground fast paths, and startup recovery rebuilds.

use osprey_db_core::{
    BuildId, CollectionCatalog, IndexSpec, LockManager, NamespaceString, OperationContext,
};
use osprey_db_indexer::{
    BuildOptions, BuildOutcome, BuildProtocol, CoordinatorConfig, IndexBuildCoordinator,
    MemoryIndexBuilder,
};
use osprey_db_repl::{MemoryOplog, MemoryReplCoord, OplogRecord};
use serde_json::json;
use std::sync::Arc;

struct Node {
    catalog: Arc<CollectionCatalog>,
    oplog: Arc<MemoryOplog>,
    coordinator: IndexBuildCoordinator,
}

fn standalone(config: CoordinatorConfig) -> Node {
    let catalog = Arc::new(CollectionCatalog::new());
    let lock_manager = Arc::new(LockManager::new());
    let repl = MemoryReplCoord::standalone();
    let oplog = MemoryOplog::new();
    let builder = MemoryIndexBuilder::new(catalog.clone());
    let coordinator = IndexBuildCoordinator::new(
        catalog.clone(),
        lock_manager,
        repl,
        oplog.clone(),
        builder,
        config,
    );
    Node {
        catalog,
        oplog,
        coordinator,
    }
}

fn nss(s: &str) -> NamespaceString {
    s.parse().unwrap()
}

#[tokio::test]
async fn single_phase_build_emits_one_create_index_record() {
    let node = standalone(CoordinatorConfig::single_phase());
    let collection = node.catalog.create_collection(nss("app.users")).unwrap();
    for i in 0..10 {
        collection.insert(json!({"a": i}));
    }

    let opctx = OperationContext::new();
    let completion = node
        .coordinator
        .start_index_build(
            &opctx,
            "app",
            collection.uuid(),
            vec![IndexSpec::ascending("a_1", &["a"])],
            BuildId::new(),
            BuildProtocol::SinglePhase,
            BuildOptions::default(),
        )
        .await
        .unwrap();

    match completion.wait().await {
        BuildOutcome::Succeeded(stats) => {
            assert_eq!(stats.num_indexes_before, 0);
            assert_eq!(stats.num_indexes_after, 1);
        }
        BuildOutcome::Failed(msg) => panic!("build failed: {msg}"),
    }

    let records = node
        .oplog
        .find(|r| matches!(r, OplogRecord::CreateIndex { .. }));
    assert_eq!(records.len(), 1);
    assert_eq!(node.oplog.len(), 1);

    let entry = collection.index_entry("a_1").unwrap();
    assert!(!entry.building);
    // The catalog write was stamped by the createIndex record's optime.
    assert_eq!(entry.ready_at, records[0].0);

    assert!(!node.coordinator.in_progress_for_collection(collection.uuid()));
    assert_eq!(node.coordinator.num_in_progress_for_db("app"), 0);
}

#[tokio::test]
async fn build_captures_writes_landing_during_the_scan() {
    let node = standalone(CoordinatorConfig::single_phase());
    let collection = node.catalog.create_collection(nss("app.events")).unwrap();
    for i in 0..200 {
        collection.insert(json!({"seq": i}));
    }

    let opctx = OperationContext::new();
    let completion = node
        .coordinator
        .start_index_build(
            &opctx,
            "app",
            collection.uuid(),
            vec![IndexSpec::ascending("seq_1", &["seq"])],
            BuildId::new(),
            BuildProtocol::SinglePhase,
            BuildOptions::default(),
        )
        .await
        .unwrap();

    // The collection stays open for writes while the build runs.
    for i in 200..230 {
        collection.insert(json!({"seq": i}));
    }

    assert!(matches!(
        completion.wait().await,
        BuildOutcome::Succeeded(_)
    ));
    assert!(collection.index_entry("seq_1").is_some());
}

#[tokio::test]
async fn fully_subsumed_specs_resolve_immediately() {
    let node = standalone(CoordinatorConfig::single_phase());
    let collection = node.catalog.create_collection(nss("app.users")).unwrap();
    collection.insert(json!({"a": 1}));

    let opctx = OperationContext::new();
    let spec = IndexSpec::ascending("a_1", &["a"]);
    let first = node
        .coordinator
        .start_index_build(
            &opctx,
            "app",
            collection.uuid(),
            vec![spec.clone()],
            BuildId::new(),
            BuildProtocol::SinglePhase,
            BuildOptions::default(),
        )
        .await
        .unwrap();
    assert!(matches!(first.wait().await, BuildOutcome::Succeeded(_)));

    // Requesting the same spec again is v4.0-compatible: success with
    // unchanged counts, no new build registered.
    let second = node
        .coordinator
        .start_index_build(
            &opctx,
            "app",
            collection.uuid(),
            vec![spec],
            BuildId::new(),
            BuildProtocol::SinglePhase,
            BuildOptions::default(),
        )
        .await
        .unwrap();
    match second.wait().await {
        BuildOutcome::Succeeded(stats) => {
            assert_eq!(stats.num_indexes_before, stats.num_indexes_after);
            assert_eq!(stats.num_indexes_after, 1);
        }
        BuildOutcome::Failed(msg) => panic!("expected conversion to success: {msg}"),
    }
    assert_eq!(node.oplog.len(), 1);
}

#[tokio::test]
async fn unique_violation_fails_the_build_and_cleans_up() {
    let node = standalone(CoordinatorConfig::single_phase());
    let collection = node.catalog.create_collection(nss("app.users")).unwrap();
    collection.insert(json!({"email": "x@example.com"}));
    collection.insert(json!({"email": "x@example.com"}));

    let opctx = OperationContext::new();
    let completion = node
        .coordinator
        .start_index_build(
            &opctx,
            "app",
            collection.uuid(),
            vec![IndexSpec::ascending("email_u", &["email"]).with_unique()],
            BuildId::new(),
            BuildProtocol::SinglePhase,
            BuildOptions::default(),
        )
        .await
        .unwrap();

    match completion.wait().await {
        BuildOutcome::Failed(msg) => assert!(msg.contains("duplicate key"), "got: {msg}"),
        BuildOutcome::Succeeded(_) => panic!("duplicate keys must fail a unique build"),
    }
    // No catalog entry and no oplog record remain.
    assert!(collection.index_entry("email_u").is_none());
    assert!(node.oplog.is_empty());
    assert!(!node.coordinator.in_progress_for_collection(collection.uuid()));
}

#[tokio::test]
async fn foreground_create_indexes_single_phase() {
    let node = standalone(CoordinatorConfig::single_phase());
    let collection = node.catalog.create_collection(nss("app.users")).unwrap();
    collection.insert(json!({"a": 1, "b": 2}));

    let opctx = OperationContext::new();
    node.coordinator
        .create_indexes(
            &opctx,
            collection.uuid(),
            vec![
                IndexSpec::ascending("a_1", &["a"]),
                IndexSpec::ascending("b_1", &["b"]),
            ],
            false,
        )
        .await
        .unwrap();

    assert_eq!(collection.num_indexes_ready(), 2);
    let creates = node
        .oplog
        .find(|r| matches!(r, OplogRecord::CreateIndex { .. }));
    assert_eq!(creates.len(), 2);
}

#[tokio::test]
async fn foreground_create_indexes_two_phase_brackets_the_log() {
    let node = standalone(CoordinatorConfig::default());
    let collection = node.catalog.create_collection(nss("app.users")).unwrap();
    collection.insert(json!({"a": 1}));

    let opctx = OperationContext::new();
    node.coordinator
        .create_indexes(
            &opctx,
            collection.uuid(),
            vec![IndexSpec::ascending("a_1", &["a"])],
            false,
        )
        .await
        .unwrap();

    let records: Vec<_> = node.oplog.entries();
    assert_eq!(records.len(), 2);
    assert!(matches!(records[0].1, OplogRecord::StartIndexBuild { .. }));
    assert!(matches!(records[1].1, OplogRecord::CommitIndexBuild { .. }));
    // Catalog visibility matches the commit record's timestamp.
    let entry = collection.index_entry("a_1").unwrap();
    assert_eq!(entry.ready_at, records[1].0);
}

#[tokio::test]
async fn empty_collection_fast_path_skips_the_scan() {
    let node = standalone(CoordinatorConfig::default());
    let collection = node.catalog.create_collection(nss("app.empty")).unwrap();

    let opctx = OperationContext::new();
    node.coordinator
        .create_indexes_on_empty_collection(
            &opctx,
            collection.uuid(),
            vec![
                IndexSpec::ascending("a_1", &["a"]),
                IndexSpec::ascending("b_1", &["b"]),
            ],
            false,
        )
        .await
        .unwrap();

    assert_eq!(collection.num_indexes_ready(), 2);
    let records = node.oplog.entries();
    assert!(matches!(records[0].1, OplogRecord::StartIndexBuild { .. }));
    assert!(matches!(
        records.last().unwrap().1,
        OplogRecord::CommitIndexBuild { .. }
    ));

    // Both entries become visible at the commitIndexBuild timestamp.
    let commit_ts = records.last().unwrap().0;
    assert_eq!(collection.index_entry("a_1").unwrap().ready_at, commit_ts);
    assert_eq!(collection.index_entry("b_1").unwrap().ready_at, commit_ts);
}

#[tokio::test]
async fn empty_collection_fast_path_rejects_documents() {
    let node = standalone(CoordinatorConfig::default());
    let collection = node.catalog.create_collection(nss("app.full")).unwrap();
    collection.insert(json!({"a": 1}));

    let opctx = OperationContext::new();
    let err = node
        .coordinator
        .create_indexes_on_empty_collection(
            &opctx,
            collection.uuid(),
            vec![IndexSpec::ascending("a_1", &["a"])],
            false,
        )
        .await
        .unwrap_err();
    assert!(err.to_string().contains("non-empty"));
}

#[tokio::test]
async fn recovery_rebuild_is_idempotent() {
    let node = standalone(CoordinatorConfig::single_phase());
    let collection = node.catalog.create_collection(nss("app.users")).unwrap();
    for i in 0..25 {
        collection.insert(json!({"a": i}));
    }

    let opctx = OperationContext::new();
    let specs = vec![IndexSpec::ascending("a_1", &["a"])];

    let (records, bytes) = node
        .coordinator
        .start_index_rebuild_for_recovery(&opctx, &nss("app.users"), specs.clone(), BuildId::new())
        .await
        .unwrap();
    assert_eq!(records, 25);
    assert!(bytes > 0);
    assert!(!collection.index_entry("a_1").unwrap().building);

    let first_ready = collection.index_entry("a_1").unwrap().ready_at;

    // A second rebuild of the same specs drops and rebuilds the same
    // indexes and leaves the catalog count unchanged.
    let (records, _) = node
        .coordinator
        .start_index_rebuild_for_recovery(&opctx, &nss("app.users"), specs, BuildId::new())
        .await
        .unwrap();
    assert_eq!(records, 25);
    assert_eq!(collection.num_indexes_total(), 1);
    assert_ne!(collection.index_entry("a_1").unwrap().ready_at, first_ready);
    assert!(!node.coordinator.in_progress_for_db("app"));
}

#[tokio::test]
async fn recovery_rejects_nameless_specs() {
    let node = standalone(CoordinatorConfig::single_phase());
    node.catalog.create_collection(nss("app.users")).unwrap();

    let mut spec = IndexSpec::ascending("x", &["a"]);
    spec.name.clear();
    let opctx = OperationContext::new();
    let err = node
        .coordinator
        .start_index_rebuild_for_recovery(&opctx, &nss("app.users"), vec![spec], BuildId::new())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        osprey_db_indexer::CoordinatorError::CannotCreateIndex(_)
    ));
}

#[tokio::test]
async fn summary_reports_active_builds() {
    let node = standalone(CoordinatorConfig::single_phase());
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
            BuildProtocol::SinglePhase,
            BuildOptions::default(),
        )
        .await
        .unwrap();

    // After completion the summary must be empty again.
    completion.wait().await;
    let summary = node.coordinator.summary();
    assert!(summary.builds_per_database.is_empty());
    assert!(summary.active_collections.is_empty());
    assert!(!collection.index_entry("a_1").unwrap().ready_at.is_null());
}
