//! Error types for the registry client.

use thiserror::Error;

/// Registry errors.
#[derive(Error, Debug)]
pub enum RegistryError {
    /// Connection pool error.
    #[error("registry pool error: {0}")]
    Pool(#[from] deadpool_redis::PoolError),

    /// Redis command error.
    #[error("registry error: {0}")]
    Redis(#[from] redis::RedisError),

    /// A script returned a reply outside its contract.
    #[error("malformed script reply: {0}")]
    Reply(String),

    /// Serialisation error.
    #[error("serialisation error: {0}")]
    Serialisation(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for registry operations.
pub type Result<T> = std::result::Result<T, RegistryError>;
