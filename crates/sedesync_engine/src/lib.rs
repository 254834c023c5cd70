//! # SedeSync Engine
//!
//! Runs the sync protocol between a site and its hub.
//!
//! This crate provides:
//! - Push, pull and full sync for every registered site
//! - Per-site run leases with expiry
//! - Retry with exponential backoff
//! - Transport abstraction with HTTP, loopback and mock implementations
//! - The periodic scheduler and the retention cleanup job
//! - Operator reports (status, push, pull, full sync, retry, cleanup)
//!
//! ## Architecture
//!
//! Sites sync in a hub-and-spoke topology. An incremental run is a push
//! followed by a pull:
//! 1. PENDING records go to the hub in sequence order with the site's
//!    pull watermark, and each comes back SYNCED, FAILED or held behind
//!    a conflict
//! 2. The hub's changes above the watermark are applied page by page and
//!    the watermark advances after each page
//!
//! ## Key Invariants
//!
//! - One run per site at a time
//! - A transport failure aborts the call without touching local statuses
//! - Records of one global id are sent in creation order; after a failure
//!   the later ones fail without being sent
//! - Conflicts are never resolved automatically

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod engine;
mod error;
mod http;
mod lease;
mod reports;
mod scheduler;
mod state;
mod transport;

pub use config::{
    FullSyncPolicy, RetryConfig, SchedulerConfig, SyncConfig, DEFAULT_CLEANUP_INTERVAL,
    DEFAULT_LEASE_TTL, DEFAULT_RETENTION, DEFAULT_SYNC_INTERVAL,
};
pub use engine::SyncEngine;
pub use error::{SyncError, SyncResult};
pub use http::{
    HttpClient, HttpFailure, HttpTransport, LoopbackClient, LoopbackServer, FULL_SYNC_PATH,
    PULL_PATH, PUSH_PATH,
};
pub use lease::{LeaseGuard, SiteLeases};
pub use reports::{
    CleanupReport, FullSyncReport, IncrementalReport, PullFailure, PullReport, PushReport,
    RetryReport, RunOutcome, StatusReport,
};
pub use scheduler::{Scheduler, SchedulerHandle};
pub use state::{SyncState, SyncStats};
pub use transport::{MockTransport, SyncTransport};
