//! # Osprey DB Indexer
//!
//! Index build coordination for Osprey DB. This crate provides:
//!
//! - The process-wide [`IndexBuildCoordinator`]: registration, conflict
//!   detection, admission control, and one driver task per build
//! - The three-phase build sequence (scan, drain, commit) with live-traffic
//!   side-table capture
//! - Two-phase cross-replica coordination through `startIndexBuild` /
//!   `commitIndexBuild` / `abortIndexBuild` log records
//! - Role-transition hooks (step-up, rollback), shutdown draining, and
//!   startup recovery rebuilds
//! - Scoped admission guards used by drop-collection / drop-database
//!
//! ## Design
//!
//! Builds are externally affected, waited upon, and aborted through the
//! coordinator; results reach callers through shared completion handles.
//! The driver keeps the collection writable during the scan by downgrading
//! its lock and letting an interceptor buffer concurrent writes for later
//! drains. On a replica-set member that does not accept writes, a
//! two-phase driver parks at the commit gate with every lock released and
//! waits for the primary's decision to arrive over the log.

pub mod build_state;
pub mod builder;
pub mod commands;
pub mod config;
pub mod coordinator;
pub mod driver;
pub mod error;
pub mod guard;
pub mod recovery;
pub mod registry;

pub use build_state::{
    BuildCompletion, BuildOutcome, BuildProtocol, CatalogStats, IndexBuildState,
};
pub use builder::{
    noop_on_cleanup, noop_on_commit, noop_on_create_each, noop_on_init, DrainYieldPolicy,
    IndexBuilder, IndexConstraints, MemoryIndexBuilder, OnCleanupFn, OnCommitFn, OnCreateEachFn,
    OnInitFn, SetupOptions,
};
pub use config::{CoordinatorConfig, FeatureVersion};
pub use coordinator::{BuildOptions, CoordinatorSummary, IndexBuildCoordinator};
pub use error::{CoordinatorError, Result};
pub use guard::{ScopedDisallowCollection, ScopedDisallowDatabase};
pub use registry::BuildRegistry;
