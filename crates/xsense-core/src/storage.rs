//! Core storage abstractions.
//!
//! The host's durable attribute store is modelled as a namespaced key/value
//! backend. Every instance owns one table named after its id.

use std::sync::Arc;

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;

/// Storage error types.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Backend error.
    #[error("Backend error: {0}")]
    Backend(String),

    /// Other error.
    #[error("Storage error: {0}")]
    Other(#[from] anyhow::Error),
}

/// Core storage backend trait.
///
/// Implemented by the redb and memory backends in `xsense-storage`.
pub trait StorageBackend: Send + Sync {
    /// Write a value to a key in the specified table.
    fn write(&self, table: &str, key: &str, value: &[u8]) -> Result<()>;

    /// Read a value by key from the specified table.
    fn read(&self, table: &str, key: &str) -> Result<Option<Vec<u8>>>;

    /// Delete a key from the specified table.
    fn delete(&self, table: &str, key: &str) -> Result<bool>;

    /// Scan keys with a given prefix in the specified table.
    fn scan(&self, table: &str, prefix: &str) -> Result<Vec<(String, Vec<u8>)>>;

    /// Check if this backend survives a process restart.
    fn is_persistent(&self) -> bool;
}

/// Shared handle to a storage backend.
pub type SharedBackend = Arc<dyn StorageBackend>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = StorageError::Backend("table missing".to_string());
        assert!(err.to_string().contains("table missing"));
    }
}
