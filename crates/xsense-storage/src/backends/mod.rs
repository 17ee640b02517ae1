//! Storage backend implementations.
//!
//! Implementations of [`StorageBackend`] feature-gated per engine.

use serde_json::Value;
use std::sync::Arc;
use xsense_core::storage::{Result, StorageBackend, StorageError};

#[cfg(feature = "redb")]
pub mod redb;

#[cfg(feature = "memory")]
pub mod memory;

#[cfg(feature = "redb")]
pub use redb::{RedbBackend, RedbBackendConfig};

#[cfg(feature = "memory")]
pub use memory::{MemoryBackend, MemoryBackendConfig};

/// Create a storage backend by type identifier.
///
/// ```no_run
/// use xsense_storage::backends::create_backend;
/// use serde_json::json;
///
/// # fn main() -> anyhow::Result<()> {
/// let backend = create_backend("redb", &json!({"path": "./data/xsense.redb"}))?;
/// assert!(backend.is_persistent());
/// # Ok(())
/// # }
/// ```
pub fn create_backend(backend_type: &str, config: &Value) -> Result<Arc<dyn StorageBackend>> {
    match backend_type {
        #[cfg(feature = "redb")]
        "redb" => {
            let cfg: RedbBackendConfig = serde_json::from_value(config.clone())
                .map_err(|e| StorageError::Configuration(format!("Invalid redb config: {}", e)))?;
            Ok(Arc::new(RedbBackend::new(cfg)?))
        }

        #[cfg(feature = "memory")]
        "memory" => {
            let cfg: MemoryBackendConfig = serde_json::from_value(config.clone())
                .map_err(|e| StorageError::Configuration(format!("Invalid memory config: {}", e)))?;
            Ok(Arc::new(MemoryBackend::new(cfg)))
        }

        _ => Err(StorageError::Configuration(format!(
            "Unknown backend type: {}. Available backends: {}",
            backend_type,
            available_backends().join(", ")
        ))),
    }
}

/// Backend types compiled into this build.
pub fn available_backends() -> Vec<&'static str> {
    let mut backends = Vec::new();
    if cfg!(feature = "redb") {
        backends.push("redb");
    }
    if cfg!(feature = "memory") {
        backends.push("memory");
    }
    backends
}
