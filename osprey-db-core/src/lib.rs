//! # Osprey DB Core
//!
//! Shared foundations for Osprey DB: identifiers, logical timestamps, index
//! specifications, the collection catalog (with an in-memory document
//! store), the multi-granularity lock manager, and operation contexts with
//! two-level interruption.
//!
//! Higher layers — replication plumbing and the index build coordinator —
//! build on these types without reaching back into each other.

pub mod catalog;
pub mod error;
pub mod ids;
pub mod lock;
pub mod namespace;
pub mod opctx;
pub mod spec;
pub mod timestamp;
pub mod txn;

pub use catalog::{Collection, CollectionCatalog, IndexCatalogEntry, WriteInterceptor, WriteOp};
pub use error::{Error, Result};
pub use ids::{BuildId, CollectionId, RecordId};
pub use lock::{LockGuard, LockManager, LockMode, ResourceId};
pub use namespace::NamespaceString;
pub use opctx::OperationContext;
pub use spec::{IndexSpec, KeyOrder};
pub use timestamp::Timestamp;
pub use txn::{PrepareConflictBehavior, RecoveryUnit, TimestampBlock};
