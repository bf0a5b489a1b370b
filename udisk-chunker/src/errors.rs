use thiserror::Error;

#[derive(Error, Debug)]
pub enum ChunkerError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid digest: {0}")]
    InvalidDigest(String),
}

pub type Result<T> = std::result::Result<T, ChunkerError>;
