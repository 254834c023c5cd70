//! # SedeSync Testkit
//!
//! Test utilities for SedeSync.
//!
//! This crate provides:
//! - A sample `Patient` entity and site helpers
//! - In-process transports to a hub, including a flaky one
//! - A `TestNetwork` of sites registered with one engine
//! - Property-based test generators using proptest
//!
//! ## Usage
//!
//! ```rust,ignore
//! use sedesync_testkit::prelude::*;
//!
//! #[test]
//! fn patient_reaches_sur() {
//!     let net = TestNetwork::new(&[SiteCode::Norte, SiteCode::Sur]);
//!     let patient = Patient::new(net.id(SiteCode::Norte), "Ana");
//!     net.save(SiteCode::Norte, &patient);
//!     net.sync_all();
//!     net.sync_all();
//!     assert!(net.patient_at(SiteCode::Sur, patient.id).is_some());
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use sedesync_protocol::SiteCode;
}

pub use fixtures::*;
pub use generators::*;
