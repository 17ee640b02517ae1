//! Per-instance durable attributes.

use xsense_core::config::attributes::EMPTY_OBJECT;
use xsense_core::storage::SharedBackend;

use crate::error::Result;

/// Durable string attributes of one instance.
///
/// Missing attributes read as `{}` (strings) or `0` (integers). Read failures
/// are logged and degrade to the default.
#[derive(Clone)]
pub struct AttributeStore {
    backend: SharedBackend,
    instance: String,
}

impl AttributeStore {
    pub fn new(backend: SharedBackend, instance: impl Into<String>) -> Self {
        Self {
            backend,
            instance: instance.into(),
        }
    }

    pub fn instance(&self) -> &str {
        &self.instance
    }

    pub fn backend(&self) -> &SharedBackend {
        &self.backend
    }

    /// Read a string attribute, `{}` when unset.
    pub fn get(&self, key: &str) -> String {
        self.get_or(key, EMPTY_OBJECT)
    }

    /// Read a string attribute with an explicit default.
    pub fn get_or(&self, key: &str, default: &str) -> String {
        match self.backend.read(&self.instance, key) {
            Ok(Some(bytes)) => String::from_utf8_lossy(&bytes).into_owned(),
            Ok(None) => default.to_string(),
            Err(e) => {
                tracing::warn!(instance = %self.instance, key, error = %e, "attribute read failed");
                default.to_string()
            }
        }
    }

    pub fn put(&self, key: &str, value: &str) -> Result<()> {
        self.backend.write(&self.instance, key, value.as_bytes())?;
        Ok(())
    }

    /// Read an integer attribute, `0` when unset or unparsable.
    pub fn get_int(&self, key: &str) -> i64 {
        self.get_or(key, "0").trim().parse().unwrap_or(0)
    }

    pub fn put_int(&self, key: &str, value: i64) -> Result<()> {
        self.put(key, &value.to_string())
    }

    /// Remove every attribute of this instance.
    pub fn clear(&self) -> Result<usize> {
        let keys = self.backend.scan(&self.instance, "")?;
        for (key, _) in &keys {
            self.backend.delete(&self.instance, key)?;
        }
        Ok(keys.len())
    }
}

impl std::fmt::Debug for AttributeStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttributeStore")
            .field("instance", &self.instance)
            .field("persistent", &self.backend.is_persistent())
            .finish()
    }
}
