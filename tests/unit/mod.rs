// Test code is allowed to panic on failure
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic
)]

//! Unit tests for vjailbreak-upgrade
//!
//! This module contains unit tests for:
//! - Status state machine transitions
//! - Progress record persistence and tracking
//! - Release manifest handling
//! - Snapshot encoding and restore

#[path = "../common/mod.rs"]
mod common;

mod backup;
mod manifest;
