pub mod common;
pub mod deployment;
pub mod manifest;

pub use common::FIELD_MANAGER;
pub use manifest::{FetchError, HttpManifestSource, ManifestError, ManifestSource};
