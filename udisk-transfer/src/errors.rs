use thiserror::Error;
use udisk_cas::CasError;
use udisk_chunker::ChunkerError;
use udisk_namespace::NamespaceError;

#[derive(Error, Debug)]
pub enum TransferError {
    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Integrity mismatch: expected {expected}, got {actual}")]
    IntegrityMismatch { expected: String, actual: String },

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Invalid chunk: {0}")]
    InvalidChunk(String),

    #[error("Invalid digest: {0}")]
    InvalidDigest(String),

    #[error("Object of {size} bytes exceeds the {limit} byte limit")]
    TooLarge { size: u64, limit: u64 },

    #[error("Chunk plan error: {0}")]
    Plan(#[from] ChunkerError),

    #[error("Namespace error: {0}")]
    Namespace(NamespaceError),

    #[error("Storage error: {0}")]
    Storage(#[from] CasError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl From<NamespaceError> for TransferError {
    fn from(err: NamespaceError) -> Self {
        match err {
            NamespaceError::NotFound(path) => TransferError::NotFound(path),
            NamespaceError::AlreadyExists(path) => TransferError::AlreadyExists(path),
            other => TransferError::Namespace(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, TransferError>;
