use thiserror::Error;

#[derive(Error, Debug)]
pub enum IndexError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Schema version mismatch: expected {expected}, got {actual}")]
    SchemaVersionMismatch { expected: u32, actual: u32 },

    #[error("Parent directory not found: {0}")]
    ParentNotFound(String),

    #[error("Parent is not a directory: {0}")]
    ParentNotDirectory(String),

    #[error("Node not found: {0}")]
    NodeNotFound(String),

    #[error("Path already in use: {0}")]
    PathConflict(String),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Database error: {0}")]
    DatabaseError(String),
}

pub type Result<T> = std::result::Result<T, IndexError>;
