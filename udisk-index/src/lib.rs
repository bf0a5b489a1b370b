pub mod database_pool;
pub mod errors;
pub mod path;
pub mod repository;
pub mod schema;

pub use database_pool::{DatabasePool, DatabasePoolBuilder};
pub use errors::{IndexError, Result};
pub use repository::{DirectoryMap, MetadataRepository, NodeRecord};
