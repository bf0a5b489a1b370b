pub mod errors;
pub mod hash;
pub mod plan;

pub use errors::{ChunkerError, Result};
pub use hash::{ChunkHash, ContentHash, ContentHasher};
pub use plan::{ChunkInfo, ChunkPlan, DEFAULT_CHUNK_SIZE};
