//! In-memory storage backend.
//!
//! Non-persistent; used by tests and the offline CLI commands.

use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock as StdRwLock;
use xsense_core::storage::{Result, StorageBackend, StorageError};

/// Configuration for MemoryBackend.
#[derive(Debug, Clone, Default, serde::Deserialize, serde::Serialize)]
pub struct MemoryBackendConfig {
    /// Initial capacity hint (number of instances).
    #[serde(default)]
    pub capacity: Option<usize>,
}

impl MemoryBackendConfig {
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = Some(capacity);
        self
    }
}

/// In-memory storage backend.
#[derive(Default)]
pub struct MemoryBackend {
    data: StdRwLock<HashMap<String, BTreeMap<String, Vec<u8>>>>,
}

impl MemoryBackend {
    pub fn new(config: MemoryBackendConfig) -> Self {
        let data = config
            .capacity
            .map(HashMap::with_capacity)
            .unwrap_or_default();
        Self {
            data: StdRwLock::new(data),
        }
    }

    /// Number of keys stored for one table.
    pub fn count(&self, table: &str) -> usize {
        self.data
            .read()
            .ok()
            .and_then(|d| d.get(table).map(BTreeMap::len))
            .unwrap_or(0)
    }
}

fn poisoned(e: impl std::fmt::Display) -> StorageError {
    StorageError::Backend(e.to_string())
}

impl StorageBackend for MemoryBackend {
    fn write(&self, table: &str, key: &str, value: &[u8]) -> Result<()> {
        let mut data = self.data.write().map_err(poisoned)?;
        data.entry(table.to_string())
            .or_default()
            .insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn read(&self, table: &str, key: &str) -> Result<Option<Vec<u8>>> {
        let data = self.data.read().map_err(poisoned)?;
        Ok(data.get(table).and_then(|t| t.get(key)).cloned())
    }

    fn delete(&self, table: &str, key: &str) -> Result<bool> {
        let mut data = self.data.write().map_err(poisoned)?;
        Ok(data.get_mut(table).and_then(|t| t.remove(key)).is_some())
    }

    fn scan(&self, table: &str, prefix: &str) -> Result<Vec<(String, Vec<u8>)>> {
        let data = self.data.read().map_err(poisoned)?;
        Ok(data
            .get(table)
            .map(|t| {
                t.iter()
                    .filter(|(k, _)| k.starts_with(prefix))
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect()
            })
            .unwrap_or_default())
    }

    fn is_persistent(&self) -> bool {
        false
    }
}
