use thiserror::Error;
use udisk_chunker::ContentHash;

#[derive(Error, Debug)]
pub enum CasError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Object not found: {0}")]
    ObjectNotFound(ContentHash),

    #[error("Hash mismatch: expected {expected}, got {actual}")]
    HashMismatch {
        expected: ContentHash,
        actual: ContentHash,
    },

    #[error("Corrupt object: {0}")]
    CorruptObject(String),

    #[error("Storage path error: {0}")]
    StoragePath(String),

    #[error("Atomic write failed: {0}")]
    AtomicWriteFailed(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Range {offset}+{length} out of bounds for object {hash} of {size} bytes")]
    RangeOutOfBounds {
        hash: ContentHash,
        offset: u64,
        length: u64,
        size: u64,
    },
}

pub type Result<T> = std::result::Result<T, CasError>;
