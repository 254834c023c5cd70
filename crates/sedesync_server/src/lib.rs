//! # SedeSync Server
//!
//! The hub of a SedeSync deployment.
//!
//! This crate provides:
//! - Handlers for push, pull and full sync
//! - CBOR body dispatch for `/sync/push`, `/sync/pull` and `/sync/full`
//! - Hub-local writes that are published as soon as they are captured
//!
//! # Protocol
//!
//! 1. A site pushes its PENDING records with its pull watermark; each one
//!    is applied to the hub's node and answered with an outcome
//! 2. A site pulls every SYNCED record above its watermark except its own
//! 3. A full sync returns the live rows of whole tables and the log head

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod config;
mod error;
mod handler;
mod server;

pub use config::ServerConfig;
pub use error::{ServerError, ServerResult};
pub use handler::{HandlerContext, RequestHandler};
pub use server::{SyncServer, FULL_SYNC_PATH, PULL_PATH, PUSH_PATH};
