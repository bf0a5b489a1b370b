pub mod errors;
pub mod registry;
pub mod store;
pub mod tree;

pub use errors::{NamespaceError, Result};
pub use registry::{validate_user_id, RegistryConfig, UserRegistry};
pub use store::{DiskNodeStore, MemoryNodeStore, NodeKind, NodeStat, NodeStore, NodeStoreKind};
pub use tree::NamespaceTree;
pub use udisk_index::path;
