//! The vjailbreak API group
//!
//! Well-known kinds are addressed through fixed descriptors; everything else
//! in the group is discovered at runtime from the installed CRDs.

mod discovery;
mod product;

pub use discovery::{CrdInfo, discover_product_crds, is_established, list_instances};
pub use product::*;
