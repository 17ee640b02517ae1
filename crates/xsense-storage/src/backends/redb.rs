//! Redb storage backend.
//!
//! Instance attributes survive restarts in one redb file. All instances share
//! a single table; keys are namespaced as `instance:attribute`.

use lru::LruCache;
use redb::{Database, ReadableTable, TableDefinition};
use std::fmt::Display;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock as StdRwLock};
use xsense_core::storage::{Result, StorageBackend, StorageError};

const ATTRIBUTE_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("attributes");

const DEFAULT_CACHE_CAPACITY: usize = 256;

const MEMORY_PATH: &str = ":memory:";

/// Configuration for RedbBackend.
#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
pub struct RedbBackendConfig {
    /// Path to the database file.
    pub path: String,

    /// Create parent directories if they don't exist.
    #[serde(default = "default_create_dirs")]
    pub create_dirs: bool,

    /// LRU cache capacity (number of entries). 0 disables caching.
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,
}

fn default_create_dirs() -> bool {
    true
}

fn default_cache_capacity() -> usize {
    DEFAULT_CACHE_CAPACITY
}

impl RedbBackendConfig {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            create_dirs: true,
            cache_capacity: DEFAULT_CACHE_CAPACITY,
        }
    }

    pub fn with_create_dirs(mut self, create_dirs: bool) -> Self {
        self.create_dirs = create_dirs;
        self
    }

    pub fn with_cache_capacity(mut self, capacity: usize) -> Self {
        self.cache_capacity = capacity;
        self
    }

    /// Throwaway database in the temp directory, removed on drop.
    pub fn memory() -> Self {
        Self {
            path: MEMORY_PATH.to_string(),
            create_dirs: false,
            cache_capacity: 64,
        }
    }
}

fn make_key(table: &str, key: &str) -> String {
    let mut result = String::with_capacity(table.len() + key.len() + 1);
    result.push_str(table);
    result.push(':');
    result.push_str(key);
    result
}

fn backend_err(e: impl Display) -> StorageError {
    StorageError::Backend(e.to_string())
}

/// redb-based persistent storage backend with a write-through LRU cache.
pub struct RedbBackend {
    db: Arc<Database>,
    path: String,
    /// Backing file of a `:memory:` database.
    temp_path: Option<PathBuf>,
    /// `None` when caching is disabled.
    cache: Option<StdRwLock<LruCache<String, Vec<u8>>>>,
}

impl RedbBackend {
    pub fn new(config: RedbBackendConfig) -> Result<Self> {
        let (db, temp_path) = if config.path == MEMORY_PATH {
            // redb has no in-memory mode
            let temp_path = std::env::temp_dir().join(format!("xsense_{}.redb", uuid::Uuid::new_v4()));
            let db = Database::create(&temp_path).map_err(backend_err)?;
            (db, Some(temp_path))
        } else {
            let path_ref = Path::new(&config.path);
            if config.create_dirs {
                if let Some(parent) = path_ref.parent().filter(|p| !p.as_os_str().is_empty()) {
                    std::fs::create_dir_all(parent)?;
                }
            }
            // create() opens an existing file without truncating it
            (Database::create(path_ref).map_err(backend_err)?, None)
        };

        let cache = NonZeroUsize::new(config.cache_capacity).map(|cap| StdRwLock::new(LruCache::new(cap)));

        let backend = Self {
            db: Arc::new(db),
            path: config.path,
            temp_path,
            cache,
        };
        backend.ensure_table()?;
        Ok(backend)
    }

    /// Open or create a redb backend at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::new(RedbBackendConfig::new(path.as_ref().to_string_lossy().to_string()))
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    fn ensure_table(&self) -> Result<()> {
        let txn = self.db.begin_write().map_err(backend_err)?;
        txn.open_table(ATTRIBUTE_TABLE).map_err(backend_err)?;
        txn.commit().map_err(backend_err)?;
        Ok(())
    }

    fn cache_put(&self, key: String, value: Vec<u8>) {
        if let Some(Ok(mut cache)) = self.cache.as_ref().map(|c| c.write()) {
            cache.put(key, value);
        }
    }

    fn cache_get(&self, key: &str) -> Option<Vec<u8>> {
        // get() updates the LRU position, hence the write lock
        let mut cache = self.cache.as_ref()?.write().ok()?;
        cache.get(key).cloned()
    }

    fn cache_pop(&self, key: &str) {
        if let Some(Ok(mut cache)) = self.cache.as_ref().map(|c| c.write()) {
            cache.pop(key);
        }
    }
}

impl StorageBackend for RedbBackend {
    fn write(&self, table: &str, key: &str, value: &[u8]) -> Result<()> {
        let namespaced = make_key(table, key);

        let txn = self.db.begin_write().map_err(backend_err)?;
        {
            let mut t = txn.open_table(ATTRIBUTE_TABLE).map_err(backend_err)?;
            t.insert(namespaced.as_str(), value).map_err(backend_err)?;
        }
        txn.commit().map_err(backend_err)?;

        self.cache_put(namespaced, value.to_vec());
        Ok(())
    }

    fn read(&self, table: &str, key: &str) -> Result<Option<Vec<u8>>> {
        let namespaced = make_key(table, key);
        if let Some(cached) = self.cache_get(&namespaced) {
            return Ok(Some(cached));
        }

        let txn = self.db.begin_read().map_err(backend_err)?;
        let t = txn.open_table(ATTRIBUTE_TABLE).map_err(backend_err)?;
        let found = t
            .get(namespaced.as_str())
            .map_err(backend_err)?
            .map(|value| value.value().to_vec());
        if let Some(data) = &found {
            self.cache_put(namespaced, data.clone());
        }
        Ok(found)
    }

    fn delete(&self, table: &str, key: &str) -> Result<bool> {
        let namespaced = make_key(table, key);
        self.cache_pop(&namespaced);

        let txn = self.db.begin_write().map_err(backend_err)?;
        let removed = {
            let mut t = txn.open_table(ATTRIBUTE_TABLE).map_err(backend_err)?;
            let previous = t.remove(namespaced.as_str()).map_err(backend_err)?;
            previous.is_some()
        };
        txn.commit().map_err(backend_err)?;
        Ok(removed)
    }

    fn scan(&self, table: &str, prefix: &str) -> Result<Vec<(String, Vec<u8>)>> {
        let full_prefix = make_key(table, prefix);
        let strip = table.len() + 1;

        let txn = self.db.begin_read().map_err(backend_err)?;
        let t = txn.open_table(ATTRIBUTE_TABLE).map_err(backend_err)?;

        let mut results = Vec::new();
        for item in t.range(full_prefix.as_str()..).map_err(backend_err)? {
            let (key, value) = item.map_err(backend_err)?;
            let key_str = key.value();
            if !key_str.starts_with(&full_prefix) {
                break;
            }
            if let Some(rest) = key_str.get(strip..) {
                results.push((rest.to_string(), value.value().to_vec()));
            }
        }
        Ok(results)
    }

    fn is_persistent(&self) -> bool {
        self.temp_path.is_none()
    }
}

impl Drop for RedbBackend {
    fn drop(&mut self) {
        if let Some(temp_path) = &self.temp_path {
            if let Err(e) = std::fs::remove_file(temp_path) {
                tracing::debug!("Failed to remove temporary database file {}: {}", temp_path.display(), e);
            }
        }
    }
}
