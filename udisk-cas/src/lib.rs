pub mod atomic;
pub mod errors;
pub mod storage;

pub use atomic::ObjectWriter;
pub use errors::{CasError, Result};
pub use storage::{
    ContentStore, ContentStoreConfig, FsyncPolicy, ObjectRef, RecoveryStats, StorageStats,
};
