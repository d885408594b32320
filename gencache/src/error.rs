//! Error types for cache operations.

use thiserror::Error;

/// Result type for cache operations.
pub type CacheResult<T> = Result<T, CacheError>;

/// Cache-specific errors.
///
/// A missing key is never an error: reads return `Ok(None)` and conditional
/// writes report conflicts as `Ok(false)`.
#[derive(Debug, Error)]
pub enum CacheError {
    /// Memcached-specific error
    #[cfg(feature = "memcached")]
    #[error("Memcached error: {0}")]
    Memcached(#[from] memcache::MemcacheError),

    /// Redis-specific error
    #[cfg(feature = "redis")]
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Deserialization error
    #[error("Deserialization error: {0}")]
    Deserialization(String),

    /// Connection error
    #[error("Connection error: {0}")]
    Connection(String),

    /// Backend rejected or failed an operation
    #[error("Backend error: {0}")]
    Backend(String),

    /// Increment or decrement on a value that is not a number
    #[error("Cannot increment or decrement non-numeric value at key: {0}")]
    NonNumeric(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid node address
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    /// A bucket was configured without any node
    #[error("Bucket '{0}' has no nodes configured")]
    EmptyBucket(String),

    /// The bucket map has no "default" entry
    #[error("No \"default\" bucket configured")]
    MissingDefaultBucket,

    /// Generic error
    #[error("Cache error: {0}")]
    Other(String),
}

impl CacheError {
    /// Check if this error was caused by the transport rather than the
    /// command itself.
    pub fn is_connection_error(&self) -> bool {
        match self {
            Self::Connection(_) => true,
            #[cfg(feature = "redis")]
            Self::Redis(e) => e.is_io_error() || e.is_connection_dropped(),
            _ => false,
        }
    }

    /// Check if this error is a configuration problem detected at
    /// construction time.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            Self::Config(_)
                | Self::InvalidAddress(_)
                | Self::EmptyBucket(_)
                | Self::MissingDefaultBucket
        )
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<tokio::task::JoinError> for CacheError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::Other(format!("Task join error: {}", err))
    }
}
