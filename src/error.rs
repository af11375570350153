//! Bucket proxy error types

use thiserror::Error;

/// Result type alias for proxy operations
pub type Result<T> = std::result::Result<T, Error>;

/// Proxy error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // Storage errors
    #[error("Object not found: {0}")]
    ObjectNotFound(String),

    #[error("Invalid object name {name:?}: {reason}")]
    InvalidObjectName { name: String, reason: String },

    #[error("Storage error: {0}")]
    Storage(#[from] object_store::Error),

    // Network errors
    #[error("Failed to bind {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Network error: {0}")]
    Network(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Check if this error means the addressed object does not exist
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Error::ObjectNotFound(_) | Error::Storage(object_store::Error::NotFound { .. })
        )
    }
}
