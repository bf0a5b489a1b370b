use thiserror::Error;
use udisk_index::IndexError;

#[derive(Error, Debug)]
pub enum NamespaceError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Not a directory: {0}")]
    NotADirectory(String),

    #[error("Is a directory: {0}")]
    IsADirectory(String),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Invalid user id: {0:?}")]
    InvalidUser(String),

    #[error("Index error: {0}")]
    Index(#[from] IndexError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Node store error: {0}")]
    Storage(String),
}

pub type Result<T> = std::result::Result<T, NamespaceError>;
