//! Collection catalog with an in-memory document store.
//!
//! Collections are addressed by `CollectionId` so that an index build can
//! keep operating on a collection that is concurrently renamed. The catalog
//! promises UUID-lookup stability for as long as a caller holds the
//! collection (handles are reference counted).
//!
//! Each collection carries its own index catalog: ready entries have a
//! non-null `ready_at` timestamp, in-progress entries are flagged
//! `building`. Writes flow through registered interceptors, which is how an
//! index builder captures side-table entries during its collection scan.

use crate::error::{Error, Result};
use crate::ids::{CollectionId, RecordId};
use crate::namespace::NamespaceString;
use crate::spec::IndexSpec;
use crate::timestamp::Timestamp;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// A document write observed by an interceptor.
#[derive(Clone, Debug)]
pub enum WriteOp {
    /// A document was inserted.
    Insert {
        /// Record identifier assigned to the document
        id: RecordId,
        /// Document body
        doc: Value,
    },
    /// A document was deleted.
    Delete {
        /// Record identifier of the removed document
        id: RecordId,
    },
}

/// Observer of collection writes.
///
/// Index builders register one of these for the duration of a build so that
/// writes concurrent with the scan are buffered for a later drain.
pub trait WriteInterceptor: Send + Sync {
    /// Record one write. Must not block.
    fn record_write(&self, op: WriteOp);
}

/// One entry in a collection's index catalog.
#[derive(Clone, Debug)]
pub struct IndexCatalogEntry {
    /// The index specification
    pub spec: IndexSpec,
    /// True while an index build owns this entry
    pub building: bool,
    /// Timestamp at which the index became visible; null while building
    pub ready_at: Timestamp,
}

#[derive(Default)]
struct CollectionInner {
    documents: BTreeMap<RecordId, Value>,
    next_record_id: u64,
    indexes: Vec<IndexCatalogEntry>,
    interceptors: Vec<(u64, Arc<dyn WriteInterceptor>)>,
    next_interceptor_token: u64,
    default_collation: Option<Value>,
    shard_key: Option<Vec<String>>,
}

/// A user collection: documents plus its index catalog.
pub struct Collection {
    uuid: CollectionId,
    nss: RwLock<NamespaceString>,
    inner: RwLock<CollectionInner>,
}

impl Collection {
    fn new(uuid: CollectionId, nss: NamespaceString) -> Self {
        Collection {
            uuid,
            nss: RwLock::new(nss),
            inner: RwLock::new(CollectionInner::default()),
        }
    }

    /// The collection's stable identifier.
    pub fn uuid(&self) -> CollectionId {
        self.uuid
    }

    /// The current namespace. May change across a rename.
    pub fn nss(&self) -> NamespaceString {
        self.nss.read().clone()
    }

    /// Number of documents.
    pub fn num_records(&self) -> usize {
        self.inner.read().documents.len()
    }

    /// Approximate data size in bytes (sum of serialized document lengths).
    pub fn data_size(&self) -> u64 {
        let inner = self.inner.read();
        inner
            .documents
            .values()
            .map(|d| d.to_string().len() as u64)
            .sum()
    }

    /// Insert a document, funneling the write through registered
    /// interceptors.
    pub fn insert(&self, doc: Value) -> RecordId {
        let (id, interceptors) = {
            let mut inner = self.inner.write();
            inner.next_record_id += 1;
            let id = RecordId(inner.next_record_id);
            inner.documents.insert(id, doc.clone());
            let interceptors: Vec<_> =
                inner.interceptors.iter().map(|(_, i)| i.clone()).collect();
            (id, interceptors)
        };
        for interceptor in interceptors {
            interceptor.record_write(WriteOp::Insert {
                id,
                doc: doc.clone(),
            });
        }
        id
    }

    /// Delete a document by id. Returns false when the id is unknown.
    pub fn delete(&self, id: RecordId) -> bool {
        let (removed, interceptors) = {
            let mut inner = self.inner.write();
            let removed = inner.documents.remove(&id).is_some();
            let interceptors: Vec<_> =
                inner.interceptors.iter().map(|(_, i)| i.clone()).collect();
            (removed, interceptors)
        };
        if removed {
            for interceptor in interceptors {
                interceptor.record_write(WriteOp::Delete { id });
            }
        }
        removed
    }

    /// Snapshot of all documents, for a builder's collection scan.
    pub fn scan(&self) -> Vec<(RecordId, Value)> {
        let inner = self.inner.read();
        inner
            .documents
            .iter()
            .map(|(id, doc)| (*id, doc.clone()))
            .collect()
    }

    /// Register a write interceptor, returning a token for removal.
    pub fn register_interceptor(&self, interceptor: Arc<dyn WriteInterceptor>) -> u64 {
        let mut inner = self.inner.write();
        inner.next_interceptor_token += 1;
        let token = inner.next_interceptor_token;
        inner.interceptors.push((token, interceptor));
        token
    }

    /// Remove a previously registered interceptor.
    pub fn unregister_interceptor(&self, token: u64) {
        let mut inner = self.inner.write();
        inner.interceptors.retain(|(t, _)| *t != token);
    }

    /// Total index count: ready plus in-progress entries.
    pub fn num_indexes_total(&self) -> usize {
        self.inner.read().indexes.len()
    }

    /// Number of ready (committed) indexes.
    pub fn num_indexes_ready(&self) -> usize {
        self.inner
            .read()
            .indexes
            .iter()
            .filter(|e| !e.building)
            .count()
    }

    /// Snapshot of the index catalog entries.
    pub fn index_entries(&self) -> Vec<IndexCatalogEntry> {
        self.inner.read().indexes.clone()
    }

    /// Look up one index entry by name.
    pub fn index_entry(&self, name: &str) -> Option<IndexCatalogEntry> {
        self.inner
            .read()
            .indexes
            .iter()
            .find(|e| e.spec.name == name)
            .cloned()
    }

    /// Set the collection-default collation applied to new index specs.
    pub fn set_default_collation(&self, collation: Option<Value>) {
        self.inner.write().default_collation = collation;
    }

    /// Set the shard-key pattern used to vet unique index specs.
    pub fn set_shard_key(&self, fields: Option<Vec<String>>) {
        self.inner.write().shard_key = fields;
    }

    /// Fill in the collection-default collation on specs that have none.
    pub fn add_collation_defaults(&self, specs: &[IndexSpec]) -> Vec<IndexSpec> {
        let default = self.inner.read().default_collation.clone();
        specs
            .iter()
            .cloned()
            .map(|mut spec| {
                if spec.collation.is_none() {
                    spec.collation = default.clone();
                }
                spec
            })
            .collect()
    }

    /// Filter out specs subsumed by existing or in-progress indexes.
    ///
    /// A spec whose name and options match an existing entry is dropped from
    /// the result. A spec whose name matches an entry with different
    /// options, or whose options match an entry under a different name, is
    /// an options conflict.
    pub fn remove_existing_indexes(&self, specs: &[IndexSpec]) -> Result<Vec<IndexSpec>> {
        let inner = self.inner.read();
        let mut filtered = Vec::new();
        for spec in specs {
            let mut keep = true;
            for entry in &inner.indexes {
                if entry.spec.name == spec.name {
                    if entry.spec.same_options(spec) {
                        keep = false;
                        break;
                    }
                    return Err(Error::IndexOptionsConflict(format!(
                        "an index named '{}' already exists with different options",
                        spec.name
                    )));
                }
                if entry.spec.same_options(spec) {
                    return Err(Error::IndexOptionsConflict(format!(
                        "index '{}' has the same key pattern and options as existing index '{}'",
                        spec.name, entry.spec.name
                    )));
                }
            }
            if keep {
                filtered.push(spec.clone());
            }
        }
        Ok(filtered)
    }

    /// Reject unique specs whose key is not prefixed by the shard key.
    pub fn check_shard_key_restrictions(&self, spec: &IndexSpec) -> Result<()> {
        if !spec.unique {
            return Ok(());
        }
        let inner = self.inner.read();
        if let Some(shard_key) = &inner.shard_key {
            if !spec.key_prefix_matches(shard_key) {
                return Err(Error::cannot_create_index(format!(
                    "cannot create unique index '{}': key is not prefixed by the shard key {:?}",
                    spec.name, shard_key
                )));
            }
        }
        Ok(())
    }

    /// Materialize an unfinished index entry for a build.
    ///
    /// Fails with `IndexAlreadyExists` when the name is taken by a ready
    /// entry, and `IndexOptionsConflict` when it is taken by another build.
    pub fn start_building_index(&self, spec: &IndexSpec) -> Result<()> {
        let mut inner = self.inner.write();
        if let Some(entry) = inner.indexes.iter().find(|e| e.spec.name == spec.name) {
            if entry.building {
                return Err(Error::IndexOptionsConflict(format!(
                    "index '{}' is already being built",
                    spec.name
                )));
            }
            return Err(Error::IndexAlreadyExists(spec.name.clone()));
        }
        inner.indexes.push(IndexCatalogEntry {
            spec: spec.clone(),
            building: true,
            ready_at: Timestamp::NULL,
        });
        Ok(())
    }

    /// Flip an unfinished entry to ready, stamping its visibility timestamp.
    pub fn mark_index_ready(&self, name: &str, ready_at: Timestamp) -> Result<()> {
        let mut inner = self.inner.write();
        let entry = inner
            .indexes
            .iter_mut()
            .find(|e| e.spec.name == name)
            .ok_or_else(|| Error::not_found(format!("index '{name}'")))?;
        entry.building = false;
        entry.ready_at = ready_at;
        Ok(())
    }

    /// Remove an index entry entirely (teardown of an unfinished build, or
    /// a normal index drop). Returns false when the name is unknown.
    pub fn remove_index(&self, name: &str) -> bool {
        let mut inner = self.inner.write();
        let before = inner.indexes.len();
        inner.indexes.retain(|e| e.spec.name != name);
        inner.indexes.len() != before
    }

    /// Append a ready index directly, bypassing the build machinery.
    ///
    /// Used by the empty-collection fast path, where there is nothing to
    /// scan or drain.
    pub fn create_index_on_empty(&self, spec: &IndexSpec, ready_at: Timestamp) -> Result<()> {
        if self.num_records() != 0 {
            return Err(Error::other(format!(
                "collection {} is not empty",
                self.uuid
            )));
        }
        let mut inner = self.inner.write();
        if inner.indexes.iter().any(|e| e.spec.name == spec.name) {
            return Err(Error::IndexAlreadyExists(spec.name.clone()));
        }
        inner.indexes.push(IndexCatalogEntry {
            spec: spec.clone(),
            building: false,
            ready_at,
        });
        Ok(())
    }

    /// Reinitialize the handle after recovery surgery: drop any leftover
    /// interceptors so a fresh build starts from a clean slate.
    pub fn reinit(&self) {
        self.inner.write().interceptors.clear();
    }
}

impl std::fmt::Debug for Collection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.read();
        f.debug_struct("Collection")
            .field("uuid", &self.uuid)
            .field("nss", &*self.nss.read())
            .field("num_records", &inner.documents.len())
            .field("num_indexes", &inner.indexes.len())
            .finish()
    }
}

/// Process-wide collection catalog.
pub struct CollectionCatalog {
    by_uuid: RwLock<HashMap<CollectionId, Arc<Collection>>>,
    by_nss: RwLock<HashMap<NamespaceString, CollectionId>>,
    /// Storage-side logical clock used to mint ghost timestamps.
    storage_clock: AtomicU64,
}

impl CollectionCatalog {
    /// Create an empty catalog.
    pub fn new() -> Self {
        CollectionCatalog {
            by_uuid: RwLock::new(HashMap::new()),
            by_nss: RwLock::new(HashMap::new()),
            // Ghost timestamps start well away from replication timestamps
            // so test assertions can tell them apart.
            storage_clock: AtomicU64::new(1_000_000),
        }
    }

    /// Create a collection under a fresh UUID.
    pub fn create_collection(&self, nss: NamespaceString) -> Result<Arc<Collection>> {
        self.create_collection_with_uuid(nss, CollectionId::new())
    }

    /// Create a collection under a caller-supplied UUID (oplog application
    /// creates collections with the primary's UUID).
    pub fn create_collection_with_uuid(
        &self,
        nss: NamespaceString,
        uuid: CollectionId,
    ) -> Result<Arc<Collection>> {
        let mut by_nss = self.by_nss.write();
        if by_nss.contains_key(&nss) {
            return Err(Error::other(format!("namespace {nss} already exists")));
        }
        let collection = Arc::new(Collection::new(uuid, nss.clone()));
        self.by_uuid.write().insert(uuid, collection.clone());
        by_nss.insert(nss, uuid);
        Ok(collection)
    }

    /// Look up a collection by UUID.
    pub fn lookup_by_uuid(&self, uuid: CollectionId) -> Option<Arc<Collection>> {
        self.by_uuid.read().get(&uuid).cloned()
    }

    /// Look up a collection's current namespace by UUID.
    pub fn lookup_nss_by_uuid(&self, uuid: CollectionId) -> Option<NamespaceString> {
        self.by_uuid.read().get(&uuid).map(|c| c.nss())
    }

    /// Look up a collection by namespace.
    pub fn lookup_by_nss(&self, nss: &NamespaceString) -> Option<Arc<Collection>> {
        let uuid = *self.by_nss.read().get(nss)?;
        self.lookup_by_uuid(uuid)
    }

    /// Rename a collection. UUID lookups are unaffected.
    pub fn rename_collection(&self, uuid: CollectionId, new_nss: NamespaceString) -> Result<()> {
        let collection = self
            .lookup_by_uuid(uuid)
            .ok_or_else(|| Error::not_found(format!("collection {uuid}")))?;
        let mut by_nss = self.by_nss.write();
        if by_nss.contains_key(&new_nss) {
            return Err(Error::other(format!("namespace {new_nss} already exists")));
        }
        let old = collection.nss();
        by_nss.remove(&old);
        by_nss.insert(new_nss.clone(), uuid);
        *collection.nss.write() = new_nss;
        Ok(())
    }

    /// Drop a collection. Outstanding `Arc<Collection>` handles stay valid.
    pub fn drop_collection(&self, uuid: CollectionId) -> Result<()> {
        let collection = self
            .lookup_by_uuid(uuid)
            .ok_or_else(|| Error::not_found(format!("collection {uuid}")))?;
        self.by_nss.write().remove(&collection.nss());
        self.by_uuid.write().remove(&uuid);
        Ok(())
    }

    /// Mint a storage-assigned ghost timestamp, for catalog writes that have
    /// no replication-driven timestamp (rollback teardown, unreplicated
    /// single-phase commits).
    pub fn ghost_timestamp(&self) -> Timestamp {
        Timestamp::from_raw(self.storage_clock.fetch_add(1, Ordering::SeqCst) + 1)
    }
}

impl std::fmt::Debug for CollectionCatalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CollectionCatalog")
            .field("num_collections", &self.by_uuid.read().len())
            .finish()
    }
}
