//! Upload and download tasks over the content store.
//!
//! A task is planned against a user's namespace, fed or drained chunk by
//! chunk, and completed once. Uploads are staged per task until completion
//! publishes the whole object and points the target path at its digest.

pub mod errors;
pub mod manager;
pub mod task;

pub use errors::{Result, TransferError};
pub use manager::{
    ChunkPayload, TransferConfig, TransferManager, DEFAULT_LARGE_THRESHOLD, DEFAULT_MAX_OBJECT_SIZE,
    DEFAULT_SMALL_THRESHOLD,
};
pub use task::{Direction, SizeCategory, Task, TaskStatus};
