//! udisk workspace root
//!
//! This crate ties the udisk crates together and hosts integration tests
//! that exercise the namespace, content store and transfer layers together.

pub use udisk_cas as cas;
pub use udisk_chunker as chunker;
pub use udisk_index as index;
pub use udisk_namespace as namespace;
pub use udisk_transfer as transfer;
