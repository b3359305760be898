//! In-memory registry of active index builds.
//!
//! One table maps build UUIDs to state; per-database and per-collection
//! trackers index the same states for collection- and database-scoped abort
//! and wait operations. The three views agree on membership at every
//! observable moment: registration and unregistration mutate all of them
//! under the one registry mutex.
//!
//! Trackers are erased eagerly when their last build unregisters. Waiters
//! therefore treat "tracker missing" as "empty now", and each tracker's
//! empty-notify is shared (`Arc`) so a waiter's condition cannot be freed
//! underneath it by that erasure.
//!
//! The registry mutex is held only for metadata updates, never across
//! builder, catalog, or oplog calls.

use crate::build_state::{BuildPhaseBrief, IndexBuildState};
use crate::error::{CoordinatorError, Result};
use osprey_db_core::{BuildId, CollectionId};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Notify;

struct Tracker {
    builds: HashMap<BuildId, Arc<IndexBuildState>>,
    empty: Arc<Notify>,
}

impl Tracker {
    fn new() -> Self {
        Tracker {
            builds: HashMap::new(),
            empty: Arc::new(Notify::new()),
        }
    }
}

#[derive(Default)]
struct RegistryInner {
    all_builds: HashMap<BuildId, Arc<IndexBuildState>>,
    by_collection: HashMap<CollectionId, Tracker>,
    by_database: HashMap<String, Tracker>,
    disallowed_dbs: HashMap<String, u32>,
    disallowed_collections: HashMap<CollectionId, u32>,
}

/// Registry of all in-flight index builds on this node.
#[derive(Default)]
pub struct BuildRegistry {
    inner: Mutex<RegistryInner>,
}

impl BuildRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        BuildRegistry::default()
    }

    /// Admit a build: reject disallowed targets and index-name collisions,
    /// then insert into all three views.
    pub fn register(&self, state: &Arc<IndexBuildState>) -> Result<()> {
        let mut inner = self.inner.lock();

        if inner.disallowed_collections.contains_key(&state.collection_uuid)
            || inner.disallowed_dbs.contains_key(&state.db_name)
        {
            return Err(CoordinatorError::CannotCreateIndex(format!(
                "collection {} is in the process of being dropped; new index builds \
                 are not currently allowed",
                state.collection_uuid
            )));
        }

        // Index names across concurrent builds on one collection are
        // disjoint. Duplicate specs inside one build are the builder's
        // problem; cross-build collisions are rejected here.
        if let Some(tracker) = inner.by_collection.get(&state.collection_uuid) {
            for existing in tracker.builds.values() {
                for name in &state.index_names {
                    if !existing.index_names.contains(name) {
                        continue;
                    }
                    let message = format!(
                        "index build conflict: {}: an index named '{}' is already being \
                         built on collection {} by build {}",
                        state.build_uuid, name, state.collection_uuid, existing.build_uuid
                    );
                    tracing::info!(
                        build_id = %state.build_uuid,
                        existing_build_id = %existing.build_uuid,
                        index_name = %name,
                        "rejecting index build registration"
                    );
                    return match existing.phase_brief() {
                        BuildPhaseBrief::Aborted(reason) => Err(CoordinatorError::BuildAborted(
                            format!("{message} (aborted with reason: {reason})"),
                        )),
                        _ => Err(CoordinatorError::AlreadyInProgress(message)),
                    };
                }
            }
        }

        inner
            .by_database
            .entry(state.db_name.clone())
            .or_insert_with(Tracker::new)
            .builds
            .insert(state.build_uuid, state.clone());
        inner
            .by_collection
            .entry(state.collection_uuid)
            .or_insert_with(Tracker::new)
            .builds
            .insert(state.build_uuid, state.clone());

        let displaced = inner.all_builds.insert(state.build_uuid, state.clone());
        assert!(
            displaced.is_none(),
            "index build {} registered twice",
            state.build_uuid
        );
        Ok(())
    }

    /// Remove a build from all three views, erasing (and signaling) empty
    /// trackers.
    pub fn unregister(&self, state: &IndexBuildState) {
        let mut inner = self.inner.lock();

        let mut emptied: Vec<Arc<Notify>> = Vec::new();
        if let Some(tracker) = inner.by_database.get_mut(&state.db_name) {
            tracker.builds.remove(&state.build_uuid);
            if tracker.builds.is_empty() {
                emptied.push(tracker.empty.clone());
                inner.by_database.remove(&state.db_name);
            }
        }
        if let Some(tracker) = inner.by_collection.get_mut(&state.collection_uuid) {
            tracker.builds.remove(&state.build_uuid);
            if tracker.builds.is_empty() {
                emptied.push(tracker.empty.clone());
                inner.by_collection.remove(&state.collection_uuid);
            }
        }
        inner.all_builds.remove(&state.build_uuid);
        drop(inner);

        for notify in emptied {
            notify.notify_waiters();
        }
    }

    /// Look up a build by UUID.
    pub fn get(&self, build_uuid: BuildId) -> Result<Arc<IndexBuildState>> {
        self.inner
            .lock()
            .all_builds
            .get(&build_uuid)
            .cloned()
            .ok_or(CoordinatorError::NoSuchBuild(build_uuid))
    }

    /// Snapshot of every active build. Safe to examine without the registry
    /// lock: each element keeps a shared reference.
    pub fn snapshot(&self) -> Vec<Arc<IndexBuildState>> {
        self.inner.lock().all_builds.values().cloned().collect()
    }

    /// Active builds on one collection.
    pub fn collection_builds(&self, collection_uuid: CollectionId) -> Vec<Arc<IndexBuildState>> {
        let inner = self.inner.lock();
        inner
            .by_collection
            .get(&collection_uuid)
            .map(|t| t.builds.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Active builds on one database.
    pub fn database_builds(&self, db_name: &str) -> Vec<Arc<IndexBuildState>> {
        let inner = self.inner.lock();
        inner
            .by_database
            .get(db_name)
            .map(|t| t.builds.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of builds running on a database.
    pub fn num_in_progress_for_db(&self, db_name: &str) -> usize {
        let inner = self.inner.lock();
        inner
            .by_database
            .get(db_name)
            .map(|t| t.builds.len())
            .unwrap_or(0)
    }

    /// True when any build is running on the collection.
    pub fn in_progress_for_collection(&self, collection_uuid: CollectionId) -> bool {
        self.inner
            .lock()
            .by_collection
            .contains_key(&collection_uuid)
    }

    /// True when any build is running on the database.
    pub fn in_progress_for_db(&self, db_name: &str) -> bool {
        self.inner.lock().by_database.contains_key(db_name)
    }

    /// Total number of active builds.
    pub fn num_in_progress(&self) -> usize {
        self.inner.lock().all_builds.len()
    }

    /// Error unless no builds are running anywhere.
    pub fn assert_no_builds_in_progress(&self) -> Result<()> {
        let n = self.num_in_progress();
        if n != 0 {
            return Err(CoordinatorError::BackgroundOperationInProgress(format!(
                "cannot perform operation: there are currently {n} index builds running"
            )));
        }
        Ok(())
    }

    /// Error unless no builds are running on the collection.
    pub fn assert_none_for_collection(&self, collection_uuid: CollectionId) -> Result<()> {
        if self.in_progress_for_collection(collection_uuid) {
            return Err(CoordinatorError::BackgroundOperationInProgress(format!(
                "cannot perform operation: an index build is currently running for \
                 collection with UUID {collection_uuid}"
            )));
        }
        Ok(())
    }

    /// Error unless no builds are running on the database.
    pub fn assert_none_for_db(&self, db_name: &str) -> Result<()> {
        if self.in_progress_for_db(db_name) {
            return Err(CoordinatorError::BackgroundOperationInProgress(format!(
                "cannot perform operation: an index build is currently running for \
                 database {db_name}"
            )));
        }
        Ok(())
    }

    /// Wait until the collection's tracker is empty (or absent).
    pub async fn await_none_for_collection(&self, collection_uuid: CollectionId) {
        loop {
            let notify = {
                let inner = self.inner.lock();
                match inner.by_collection.get(&collection_uuid) {
                    None => return,
                    Some(t) => t.empty.clone(),
                }
            };
            // Register interest before the re-check so an erasure between
            // the two cannot be missed.
            let notified = notify.notified();
            if !self.in_progress_for_collection(collection_uuid) {
                return;
            }
            notified.await;
        }
    }

    /// Wait until the database's tracker is empty (or absent).
    pub async fn await_none_for_db(&self, db_name: &str) {
        loop {
            let notify = {
                let inner = self.inner.lock();
                match inner.by_database.get(db_name) {
                    None => return,
                    Some(t) => t.empty.clone(),
                }
            };
            let notified = notify.notified();
            if !self.in_progress_for_db(db_name) {
                return;
            }
            notified.await;
        }
    }

    /// Wait until every database tracker reports empty.
    pub async fn await_no_builds(&self) {
        loop {
            let notify = {
                let inner = self.inner.lock();
                match inner.by_database.values().next() {
                    None => return,
                    Some(t) => t.empty.clone(),
                }
            };
            let notified = notify.notified();
            if self.inner.lock().by_database.is_empty() {
                return;
            }
            notified.await;
        }
    }

    /// Push an admission ban for a database. Bans stack.
    pub fn disallow_db(&self, db_name: &str) {
        let mut inner = self.inner.lock();
        *inner.disallowed_dbs.entry(db_name.to_string()).or_insert(0) += 1;
    }

    /// Pop one admission ban for a database.
    pub fn allow_db(&self, db_name: &str) {
        let mut inner = self.inner.lock();
        match inner.disallowed_dbs.get_mut(db_name) {
            Some(count) if *count > 1 => *count -= 1,
            Some(_) => {
                inner.disallowed_dbs.remove(db_name);
            }
            None => unreachable!("allow_db without matching disallow_db for {db_name}"),
        }
    }

    /// Push an admission ban for a collection. Bans stack.
    pub fn disallow_collection(&self, collection_uuid: CollectionId) {
        let mut inner = self.inner.lock();
        *inner
            .disallowed_collections
            .entry(collection_uuid)
            .or_insert(0) += 1;
    }

    /// Pop one admission ban for a collection.
    pub fn allow_collection(&self, collection_uuid: CollectionId) {
        let mut inner = self.inner.lock();
        match inner.disallowed_collections.get_mut(&collection_uuid) {
            Some(count) if *count > 1 => *count -= 1,
            Some(_) => {
                inner.disallowed_collections.remove(&collection_uuid);
            }
            None => unreachable!(
                "allow_collection without matching disallow_collection for {collection_uuid}"
            ),
        }
    }

    /// True when the database is currently banned.
    pub fn is_db_disallowed(&self, db_name: &str) -> bool {
        self.inner.lock().disallowed_dbs.contains_key(db_name)
    }

    /// True when the collection is currently banned.
    pub fn is_collection_disallowed(&self, collection_uuid: CollectionId) -> bool {
        self.inner
            .lock()
            .disallowed_collections
            .contains_key(&collection_uuid)
    }

    /// Sanity check for shutdown/tests: every table is empty.
    pub fn verify_empty(&self) {
        let inner = self.inner.lock();
        assert!(inner.all_builds.is_empty());
        assert!(inner.by_collection.is_empty());
        assert!(inner.by_database.is_empty());
        assert!(inner.disallowed_dbs.is_empty());
        assert!(inner.disallowed_collections.is_empty());
    }
}

impl std::fmt::Debug for BuildRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("BuildRegistry")
            .field("num_builds", &inner.all_builds.len())
            .field("num_collections", &inner.by_collection.len())
            .field("num_databases", &inner.by_database.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build_state::BuildProtocol;
    use osprey_db_core::{IndexSpec, Timestamp};

    fn make_state(
        collection: CollectionId,
        db: &str,
        names: &[&str],
    ) -> Arc<IndexBuildState> {
        let specs = names
            .iter()
            .map(|n| IndexSpec::ascending(*n, &["a"]))
            .collect();
        IndexBuildState::new(
            BuildId::new(),
            collection,
            db,
            specs,
            BuildProtocol::TwoPhase,
            None,
        )
    }

    #[test]
    fn views_agree_on_membership() {
        let registry = BuildRegistry::new();
        let coll = CollectionId::new();
        let a = make_state(coll, "app", &["a_1"]);
        let b = make_state(coll, "app", &["b_1"]);

        registry.register(&a).unwrap();
        registry.register(&b).unwrap();
        assert_eq!(registry.num_in_progress(), 2);
        assert_eq!(registry.num_in_progress_for_db("app"), 2);
        assert_eq!(registry.collection_builds(coll).len(), 2);

        registry.unregister(&a);
        assert_eq!(registry.num_in_progress(), 1);
        assert!(registry.in_progress_for_collection(coll));

        registry.unregister(&b);
        assert_eq!(registry.num_in_progress(), 0);
        assert!(!registry.in_progress_for_collection(coll));
        assert!(!registry.in_progress_for_db("app"));
        registry.verify_empty();
    }

    #[test]
    fn overlapping_names_conflict() {
        let registry = BuildRegistry::new();
        let coll = CollectionId::new();
        let first = make_state(coll, "app", &["a_1", "b_1"]);
        let second = make_state(coll, "app", &["b_1", "c_1"]);

        registry.register(&first).unwrap();
        let err = registry.register(&second).unwrap_err();
        assert!(matches!(err, CoordinatorError::AlreadyInProgress(_)));

        // The same names on a different collection are fine.
        let elsewhere = make_state(CollectionId::new(), "app", &["b_1"]);
        registry.register(&elsewhere).unwrap();
    }

    #[test]
    fn collision_with_aborted_build_reports_aborted() {
        let registry = BuildRegistry::new();
        let coll = CollectionId::new();
        let first = make_state(coll, "app", &["a_1"]);
        registry.register(&first).unwrap();
        first.set_aborted("dropped", Timestamp::NULL);

        let second = make_state(coll, "app", &["a_1"]);
        let err = registry.register(&second).unwrap_err();
        assert!(err.is_build_aborted());
    }

    #[test]
    fn disallowed_targets_reject_registration() {
        let registry = BuildRegistry::new();
        let coll = CollectionId::new();

        registry.disallow_collection(coll);
        let state = make_state(coll, "app", &["a_1"]);
        assert!(matches!(
            registry.register(&state).unwrap_err(),
            CoordinatorError::CannotCreateIndex(_)
        ));

        registry.allow_collection(coll);
        registry.register(&state).unwrap();
        registry.unregister(&state);
    }

    #[test]
    fn disallow_counters_stack() {
        let registry = BuildRegistry::new();
        let coll = CollectionId::new();
        registry.disallow_collection(coll);
        registry.disallow_collection(coll);
        registry.allow_collection(coll);
        assert!(registry.is_collection_disallowed(coll));
        registry.allow_collection(coll);
        assert!(!registry.is_collection_disallowed(coll));
    }

    #[tokio::test]
    async fn await_none_returns_when_tracker_drains() {
        let registry = Arc::new(BuildRegistry::new());
        let coll = CollectionId::new();
        let state = make_state(coll, "app", &["a_1"]);
        registry.register(&state).unwrap();

        let registry2 = registry.clone();
        let waiter =
            tokio::spawn(async move { registry2.await_none_for_collection(coll).await });

        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        registry.unregister(&state);
        waiter.await.unwrap();
    }

    #[tokio::test]
    async fn await_none_returns_immediately_without_tracker() {
        let registry = BuildRegistry::new();
        registry.await_none_for_collection(CollectionId::new()).await;
        registry.await_none_for_db("nope").await;
        registry.await_no_builds().await;
    }
}
