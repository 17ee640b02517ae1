//! Error types for the storage crate.

use thiserror::Error;

pub use xsense_core::CoreError;

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Storage error types.
#[derive(Debug, Error)]
pub enum Error {
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Storage/Database error.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Invalid input.
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl From<Error> for CoreError {
    fn from(e: Error) -> Self {
        match e {
            Error::Io(e) => CoreError::Storage(e.to_string()),
            Error::Serialization(s) => CoreError::Serialization(s),
            Error::Storage(s) => CoreError::Storage(s),
            Error::InvalidInput(s) => CoreError::MalformedInput(s),
        }
    }
}

impl From<xsense_core::StorageError> for Error {
    fn from(e: xsense_core::StorageError) -> Self {
        match e {
            xsense_core::StorageError::Io(e) => Error::Io(e),
            xsense_core::StorageError::Serialization(s) => Error::Serialization(s),
            other => Error::Storage(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
