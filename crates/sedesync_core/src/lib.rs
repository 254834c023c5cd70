//! # SedeSync Core
//!
//! Storage and apply logic for one site of a SedeSync deployment.
//!
//! This crate provides:
//! - The ChangeRecord store (outbox), in memory or as a journal
//! - Entity storage with the applied-change ledger
//! - Change capture hooks for syncable entity types
//! - The apply engine with conflict detection
//! - The conflict registry and operator resolution
//! - Full-sync table reconciliation
//! - `SiteNode`, which bundles all of the above for one home site

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod apply;
mod capture;
mod dir;
mod entity;
mod error;
mod journal;
mod node;
mod reconcile;
mod registry;
mod resolution;
mod store;

pub use apply::{ApplyContext, ApplyEngine};
pub use capture::{
    CaptureContext, CaptureOutcome, CaptureWarning, ChangeCapture, SyncHooks, SyncableEntity,
    MAX_CAPTURE_WARNINGS,
};
pub use dir::NodeDir;
pub use entity::{
    AppliedMark, EntityRow, EntityStore, EntityWrite, FileEntityStore, MemoryEntityStore,
};
pub use error::{CoreError, CoreResult};
pub use journal::{compute_crc32, Journal};
pub use node::SiteNode;
pub use reconcile::{RowError, TableReconcile, LOCAL_CHANGES_PENDING};
pub use registry::ConflictRegistry;
pub use resolution::Resolution;
pub use store::{
    ChangePage, ChangeQuery, ChangeStore, FileChangeStore, MemoryChangeStore, StatusCounts,
};
