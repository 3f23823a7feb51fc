// Test code is allowed to panic on failure
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic,
    dead_code
)]

//! Common test utilities shared across all test targets
//!
//! - [`SimulatedCluster`] - an [`ObjectStore`] that behaves like a cluster
//!   with working controllers: deployments roll out, CRDs become established
//! - [`FakeManifests`] - a release artifact store serving every manifest the
//!   job fetches, with per-path failure injection
//! - [`Harness`] - both of the above wired into an [`Executor`]
//!
//! # Usage
//!
//! Include this module in your test file:
//! ```rust,ignore
//! #[path = "../common/mod.rs"]
//! mod common;
//! use common::*;
//! ```
//!
//! [`ObjectStore`]: vjailbreak_upgrade::ObjectStore
//! [`Executor`]: vjailbreak_upgrade::Executor

mod cluster;

pub use cluster::*;
pub use fixtures::*;
