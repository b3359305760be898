//! The index builder seam.
//!
//! [`IndexBuilder`] is the coordinator's contract with the component that
//! actually generates and stores index keys. The coordinator sequences
//! *when* scans, drains, constraint checks, and commits happen; the builder
//! owns *how*.
//!
//! [`MemoryIndexBuilder`] is a complete in-memory implementation: it keeps
//! one sorted key set per index, funnels concurrent collection writes into
//! a per-build side table through a registered write interceptor, and
//! enforces unique constraints at commit time. It backs the test suite and
//! embedded deployments.

use crate::build_state::BuildProtocol;
use crate::error::{CoordinatorError, Result};
use async_trait::async_trait;
use futures::future::BoxFuture;
use osprey_db_core::{
    BuildId, Collection, CollectionCatalog, IndexSpec, NamespaceString, OperationContext,
    RecordId, WriteInterceptor, WriteOp,
};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;

/// Whether a drain yields between batches.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DrainYieldPolicy {
    /// Yield to the scheduler between batches (intent-lock drains)
    Yield,
    /// Run to completion without yielding (quiescent drains under S or X)
    NoYield,
}

/// Constraint enforcement during a build.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum IndexConstraints {
    /// Enforce uniqueness and report violations
    #[default]
    Enforce,
    /// Relax enforcement (replicated writes were validated upstream)
    Relax,
}

/// Options for [`IndexBuilder::setup`].
#[derive(Clone, Debug)]
pub struct SetupOptions {
    /// Constraint enforcement for this build
    pub constraints: IndexConstraints,
    /// True for startup-recovery rebuilds
    pub for_recovery: bool,
    /// The protocol the coordinator registered the build under
    pub protocol: BuildProtocol,
}

impl Default for SetupOptions {
    fn default() -> Self {
        SetupOptions {
            constraints: IndexConstraints::Enforce,
            for_recovery: false,
            protocol: BuildProtocol::SinglePhase,
        }
    }
}

/// Callback run while setup materializes the unfinished indexes.
pub type OnInitFn<'a> = Box<dyn FnOnce() -> BoxFuture<'a, Result<()>> + Send + 'a>;

/// Callback run once per spec as the commit finalizes it.
pub type OnCreateEachFn<'a> =
    Box<dyn Fn(IndexSpec) -> BoxFuture<'a, Result<()>> + Send + Sync + 'a>;

/// Callback run once as the commit completes.
pub type OnCommitFn<'a> = Box<dyn FnOnce() -> BoxFuture<'a, Result<()>> + Send + 'a>;

/// Callback run during teardown of an uncommitted build.
pub type OnCleanupFn<'a> = Box<dyn FnOnce() -> BoxFuture<'a, ()> + Send + 'a>;

/// A no-op init callback.
pub fn noop_on_init<'a>() -> OnInitFn<'a> {
    Box::new(|| Box::pin(async { Ok(()) }) as BoxFuture<'a, Result<()>>)
}

/// A no-op per-spec commit callback.
pub fn noop_on_create_each<'a>() -> OnCreateEachFn<'a> {
    Box::new(|_| Box::pin(async { Ok(()) }) as BoxFuture<'a, Result<()>>)
}

/// A no-op commit callback.
pub fn noop_on_commit<'a>() -> OnCommitFn<'a> {
    Box::new(|| Box::pin(async { Ok(()) }) as BoxFuture<'a, Result<()>>)
}

/// A no-op cleanup callback.
pub fn noop_on_cleanup<'a>() -> OnCleanupFn<'a> {
    Box::new(|| Box::pin(async {}) as BoxFuture<'a, ()>)
}

/// Contract between the coordinator and the key-generation machinery.
#[async_trait]
pub trait IndexBuilder: Send + Sync {
    /// Materialize the indexes in the catalog in an unfinished state and
    /// prepare per-build bookkeeping (side table, interceptor).
    async fn setup(
        &self,
        opctx: &OperationContext,
        collection: &Arc<Collection>,
        specs: &[IndexSpec],
        build_uuid: BuildId,
        on_init: OnInitFn<'_>,
        options: SetupOptions,
    ) -> Result<()>;

    /// Phase 1: scan the collection and sort keys into the build's key sets.
    async fn scan_and_sort(
        &self,
        opctx: &OperationContext,
        collection: &Arc<Collection>,
        build_uuid: BuildId,
    ) -> Result<()>;

    /// Apply buffered side-table writes.
    async fn drain(
        &self,
        opctx: &OperationContext,
        build_uuid: BuildId,
        yield_policy: DrainYieldPolicy,
    ) -> Result<()>;

    /// Check accumulated constraint violations (duplicate unique keys).
    async fn check_violations(&self, opctx: &OperationContext, build_uuid: BuildId) -> Result<()>;

    /// Flip the unfinished indexes to ready, stamping them with the
    /// operation's commit timestamp (or a ghost timestamp when none is
    /// set). Runs `on_create_each` per spec and `on_commit` once.
    async fn commit(
        &self,
        opctx: &OperationContext,
        collection: &Arc<Collection>,
        nss: &NamespaceString,
        build_uuid: BuildId,
        on_create_each: OnCreateEachFn<'_>,
        on_commit: OnCommitFn<'_>,
    ) -> Result<()>;

    /// Remove all build bookkeeping. For an uncommitted build this also
    /// removes the unfinished catalog entries, after running `on_cleanup`.
    /// Total: never fails, no-op for unknown builds.
    async fn teardown(
        &self,
        opctx: &OperationContext,
        collection: &Arc<Collection>,
        build_uuid: BuildId,
        on_cleanup: OnCleanupFn<'_>,
    );

    /// Ask a running build to stop. Returns whether the builder knew the
    /// build and delivered the request.
    fn abort(&self, build_uuid: BuildId, reason: &str) -> bool;

    /// True while the builder tracks this build.
    fn is_background(&self, build_uuid: BuildId) -> bool;

    /// Recovery path: scan and key the collection in one step, returning
    /// `(records_scanned, bytes_scanned)`.
    async fn start_for_recovery(
        &self,
        opctx: &OperationContext,
        nss: &NamespaceString,
        build_uuid: BuildId,
    ) -> Result<(u64, u64)>;
}

// =============================================================================
// In-memory implementation
// =============================================================================

/// Side table buffering writes that land during a scan.
struct SideTable {
    ops: Mutex<VecDeque<WriteOp>>,
}

impl SideTable {
    fn new() -> Arc<Self> {
        Arc::new(SideTable {
            ops: Mutex::new(VecDeque::new()),
        })
    }

    fn drain_batch(&self, max: usize) -> Vec<WriteOp> {
        let mut ops = self.ops.lock();
        let n = ops.len().min(max);
        ops.drain(..n).collect()
    }

    fn is_empty(&self) -> bool {
        self.ops.lock().is_empty()
    }
}

impl WriteInterceptor for SideTable {
    fn record_write(&self, op: WriteOp) {
        self.ops.lock().push_back(op);
    }
}

/// Encode the key a document contributes to one index.
///
/// Missing fields index as JSON null, so two documents both lacking a
/// unique field collide.
fn extract_key(spec: &IndexSpec, doc: &Value) -> String {
    let parts: Vec<Value> = spec
        .key_fields()
        .map(|field| doc.get(field).cloned().unwrap_or(Value::Null))
        .collect();
    Value::Array(parts).to_string()
}

struct BuildEntry {
    collection: Arc<Collection>,
    specs: Vec<IndexSpec>,
    constraints: IndexConstraints,
    interceptor_token: u64,
    side_table: Arc<SideTable>,
    /// Index name -> sorted (key, record) set
    keys: HashMap<String, BTreeSet<(String, RecordId)>>,
    aborted: Option<String>,
    committed: bool,
}

impl BuildEntry {
    fn apply_insert(&mut self, id: RecordId, doc: &Value) {
        for spec in &self.specs {
            let key = extract_key(spec, doc);
            if let Some(set) = self.keys.get_mut(&spec.name) {
                set.insert((key, id));
            }
        }
    }

    fn apply_delete(&mut self, id: RecordId) {
        for set in self.keys.values_mut() {
            set.retain(|(_, record)| *record != id);
        }
    }

    fn apply_op(&mut self, op: &WriteOp) {
        match op {
            WriteOp::Insert { id, doc } => self.apply_insert(*id, doc),
            WriteOp::Delete { id } => self.apply_delete(*id),
        }
    }

    fn check_aborted(&self, build_uuid: BuildId) -> Result<()> {
        match &self.aborted {
            Some(reason) => {
                tracing::debug!(build_id = %build_uuid, reason = %reason,
                    "index builder observed abort request");
                Err(CoordinatorError::BuildAborted(reason.clone()))
            }
            None => Ok(()),
        }
    }
}

const DRAIN_BATCH: usize = 64;
const SCAN_BATCH: usize = 256;

/// In-memory index builder over the core catalog's document store.
pub struct MemoryIndexBuilder {
    catalog: Arc<CollectionCatalog>,
    builds: Mutex<HashMap<BuildId, BuildEntry>>,
}

impl MemoryIndexBuilder {
    /// Create a builder over `catalog` (used for ghost timestamps).
    pub fn new(catalog: Arc<CollectionCatalog>) -> Arc<Self> {
        Arc::new(MemoryIndexBuilder {
            catalog,
            builds: Mutex::new(HashMap::new()),
        })
    }

    /// The sorted key set of one index under a tracked build (tests).
    pub fn key_set(&self, build_uuid: BuildId, index_name: &str) -> Option<Vec<(String, RecordId)>> {
        let builds = self.builds.lock();
        builds
            .get(&build_uuid)
            .and_then(|e| e.keys.get(index_name))
            .map(|set| set.iter().cloned().collect())
    }

    /// True when the build's side table has no pending writes (tests).
    pub fn side_table_empty(&self, build_uuid: BuildId) -> bool {
        let builds = self.builds.lock();
        builds
            .get(&build_uuid)
            .map(|e| e.side_table.is_empty())
            .unwrap_or(true)
    }

    fn with_entry<T>(
        &self,
        build_uuid: BuildId,
        f: impl FnOnce(&mut BuildEntry) -> T,
    ) -> Result<T> {
        let mut builds = self.builds.lock();
        let entry = builds
            .get_mut(&build_uuid)
            .ok_or(CoordinatorError::NoSuchBuild(build_uuid))?;
        Ok(f(entry))
    }
}

#[async_trait]
impl IndexBuilder for MemoryIndexBuilder {
    async fn setup(
        &self,
        _opctx: &OperationContext,
        collection: &Arc<Collection>,
        specs: &[IndexSpec],
        build_uuid: BuildId,
        on_init: OnInitFn<'_>,
        options: SetupOptions,
    ) -> Result<()> {
        // Materialize unfinished catalog entries, undoing on partial failure.
        let mut created: Vec<String> = Vec::new();
        for spec in specs {
            spec.validate()?;
            if let Err(err) = collection.start_building_index(spec) {
                for name in &created {
                    collection.remove_index(name);
                }
                return Err(err.into());
            }
            created.push(spec.name.clone());
        }

        if let Err(err) = on_init().await {
            for name in &created {
                collection.remove_index(name);
            }
            return Err(err);
        }

        let side_table = SideTable::new();
        let interceptor_token =
            collection.register_interceptor(side_table.clone() as Arc<dyn WriteInterceptor>);

        let keys = specs
            .iter()
            .map(|s| (s.name.clone(), BTreeSet::new()))
            .collect();

        self.builds.lock().insert(
            build_uuid,
            BuildEntry {
                collection: collection.clone(),
                specs: specs.to_vec(),
                constraints: options.constraints,
                interceptor_token,
                side_table,
                keys,
                aborted: None,
                committed: false,
            },
        );
        tracing::debug!(build_id = %build_uuid, collection = %collection.uuid(),
            num_specs = specs.len(), for_recovery = options.for_recovery,
            "index builder set up");
        Ok(())
    }

    async fn scan_and_sort(
        &self,
        opctx: &OperationContext,
        collection: &Arc<Collection>,
        build_uuid: BuildId,
    ) -> Result<()> {
        let docs = collection.scan();
        for chunk in docs.chunks(SCAN_BATCH) {
            opctx.check_for_interrupt()?;
            self.with_entry(build_uuid, |entry| -> Result<()> {
                entry.check_aborted(build_uuid)?;
                for (id, doc) in chunk {
                    entry.apply_insert(*id, doc);
                }
                Ok(())
            })??;
            tokio::task::yield_now().await;
        }
        Ok(())
    }

    async fn drain(
        &self,
        opctx: &OperationContext,
        build_uuid: BuildId,
        yield_policy: DrainYieldPolicy,
    ) -> Result<()> {
        loop {
            opctx.check_for_interrupt()?;
            let done = self.with_entry(build_uuid, |entry| -> Result<bool> {
                entry.check_aborted(build_uuid)?;
                let batch = entry.side_table.drain_batch(DRAIN_BATCH);
                if batch.is_empty() {
                    return Ok(true);
                }
                for op in &batch {
                    entry.apply_op(op);
                }
                Ok(false)
            })??;
            if done {
                return Ok(());
            }
            if yield_policy == DrainYieldPolicy::Yield {
                tokio::task::yield_now().await;
            }
        }
    }

    async fn check_violations(&self, opctx: &OperationContext, build_uuid: BuildId) -> Result<()> {
        opctx.check_for_interrupt()?;
        self.with_entry(build_uuid, |entry| {
            entry.check_aborted(build_uuid)?;
            if entry.constraints == IndexConstraints::Relax {
                return Ok(());
            }
            for spec in entry.specs.iter().filter(|s| s.unique) {
                let Some(set) = entry.keys.get(&spec.name) else {
                    continue;
                };
                let mut previous: Option<&str> = None;
                for (key, _) in set {
                    if previous == Some(key.as_str()) {
                        return Err(CoordinatorError::ConstraintViolation(format!(
                            "duplicate key {key} for unique index '{}'",
                            spec.name
                        )));
                    }
                    previous = Some(key);
                }
            }
            Ok(())
        })?
    }

    async fn commit(
        &self,
        opctx: &OperationContext,
        collection: &Arc<Collection>,
        nss: &NamespaceString,
        build_uuid: BuildId,
        on_create_each: OnCreateEachFn<'_>,
        on_commit: OnCommitFn<'_>,
    ) -> Result<()> {
        let specs = self.with_entry(build_uuid, |entry| -> Result<Vec<IndexSpec>> {
            entry.check_aborted(build_uuid)?;
            // Absorb anything that slipped in since the last drain.
            loop {
                let batch = entry.side_table.drain_batch(DRAIN_BATCH);
                if batch.is_empty() {
                    break;
                }
                for op in &batch {
                    entry.apply_op(op);
                }
            }
            Ok(entry.specs.clone())
        })??;

        for spec in &specs {
            on_create_each(spec.clone()).await?;
        }
        on_commit().await?;

        // The commit timestamp comes from the surrounding write unit: set by
        // a TimestampBlock on secondaries, by the oplog append on primaries,
        // or minted from the storage clock when neither applies.
        let mut ready_at = opctx.recovery_unit().commit_timestamp();
        if ready_at.is_null() {
            ready_at = self.catalog.ghost_timestamp();
        }
        for spec in &specs {
            collection.mark_index_ready(&spec.name, ready_at)?;
        }

        self.with_entry(build_uuid, |entry| {
            entry.committed = true;
            entry
                .collection
                .unregister_interceptor(entry.interceptor_token);
        })?;

        tracing::info!(build_id = %build_uuid, nss = %nss, ready_at = %ready_at,
            num_specs = specs.len(), "index build committed in catalog");
        Ok(())
    }

    async fn teardown(
        &self,
        _opctx: &OperationContext,
        collection: &Arc<Collection>,
        build_uuid: BuildId,
        on_cleanup: OnCleanupFn<'_>,
    ) {
        let entry = self.builds.lock().remove(&build_uuid);
        let Some(entry) = entry else {
            return;
        };
        entry
            .collection
            .unregister_interceptor(entry.interceptor_token);
        if !entry.committed {
            on_cleanup().await;
            for spec in &entry.specs {
                if collection
                    .index_entry(&spec.name)
                    .map(|e| e.building)
                    .unwrap_or(false)
                {
                    collection.remove_index(&spec.name);
                }
            }
            tracing::debug!(build_id = %build_uuid,
                "tore down uncommitted index build");
        }
    }

    fn abort(&self, build_uuid: BuildId, reason: &str) -> bool {
        let mut builds = self.builds.lock();
        match builds.get_mut(&build_uuid) {
            Some(entry) if !entry.committed => {
                if entry.aborted.is_none() {
                    entry.aborted = Some(reason.to_string());
                }
                true
            }
            _ => false,
        }
    }

    fn is_background(&self, build_uuid: BuildId) -> bool {
        self.builds.lock().contains_key(&build_uuid)
    }

    async fn start_for_recovery(
        &self,
        opctx: &OperationContext,
        nss: &NamespaceString,
        build_uuid: BuildId,
    ) -> Result<(u64, u64)> {
        let collection = self.with_entry(build_uuid, |entry| entry.collection.clone())?;
        debug_assert_eq!(collection.nss(), *nss);
        self.scan_and_sort(opctx, &collection, build_uuid).await?;
        Ok((collection.num_records() as u64, collection.data_size()))
    }
}

impl std::fmt::Debug for MemoryIndexBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryIndexBuilder")
            .field("num_builds", &self.builds.lock().len())
            .finish()
    }
}
