//! Scoped admission guards.
//!
//! For a guard's lifetime no new index build can register on the guarded
//! database or collection. Destructive operations use the pattern:
//!
//! ```ignore
//! let guard = ScopedDisallowCollection::new(&coordinator, collection_uuid);
//! coordinator
//!     .abort_collection_index_builds(collection_uuid, "collection dropped")
//!     .await;
//! catalog.drop_collection(collection_uuid)?;
//! drop(guard);
//! ```
//!
//! Guards stack: overlapping guards on the same target are legal, and
//! admission reopens only when the last one releases.

use crate::coordinator::IndexBuildCoordinator;
use osprey_db_core::CollectionId;

/// Blocks new index builds on a database for this object's lifetime.
pub struct ScopedDisallowDatabase {
    coordinator: IndexBuildCoordinator,
    db_name: String,
}

impl ScopedDisallowDatabase {
    /// Disallow new builds on `db_name` until the guard drops.
    pub fn new(coordinator: &IndexBuildCoordinator, db_name: impl Into<String>) -> Self {
        let db_name = db_name.into();
        coordinator.registry.disallow_db(&db_name);
        ScopedDisallowDatabase {
            coordinator: coordinator.clone(),
            db_name,
        }
    }
}

impl Drop for ScopedDisallowDatabase {
    fn drop(&mut self) {
        self.coordinator.registry.allow_db(&self.db_name);
    }
}

/// Blocks new index builds on a collection for this object's lifetime.
pub struct ScopedDisallowCollection {
    coordinator: IndexBuildCoordinator,
    collection_uuid: CollectionId,
}

impl ScopedDisallowCollection {
    /// Disallow new builds on `collection_uuid` until the guard drops.
    pub fn new(coordinator: &IndexBuildCoordinator, collection_uuid: CollectionId) -> Self {
        coordinator.registry.disallow_collection(collection_uuid);
        ScopedDisallowCollection {
            coordinator: coordinator.clone(),
            collection_uuid,
        }
    }
}

impl Drop for ScopedDisallowCollection {
    fn drop(&mut self) {
        self.coordinator
            .registry
            .allow_collection(self.collection_uuid);
    }
}
