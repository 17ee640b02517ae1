//! Configuration file for the `xsense` binary.
//!
//! ```toml
//! [mqtt]
//! host = "broker.local"
//! port = 1883
//!
//! [bridge]
//! topic_root = "homeassistant/binary_sensor"
//!
//! [storage]
//! backend = "redb"
//! path = "./data/xsense.redb"
//!
//! [konfigurator]
//! enabled = true
//! auto_provision = false
//! ```
//!
//! Every section is optional. Command-line flags and environment variables
//! override the file.

use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::json;
use xsense_core::SharedBackend;
use xsense_devices::{BridgeConfig, MqttBusConfig};

fn default_backend() -> String {
    "redb".to_string()
}

fn default_path() -> String {
    "./data/xsense.redb".to_string()
}

fn default_true() -> bool {
    true
}

fn default_provision_interval() -> u64 {
    30
}

/// Storage section.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct StorageSection {
    /// `redb` or `memory`.
    #[serde(default = "default_backend")]
    pub backend: String,

    #[serde(default = "default_path")]
    pub path: String,
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            path: default_path(),
        }
    }
}

impl StorageSection {
    pub fn open(&self) -> Result<SharedBackend> {
        let config = match self.backend.as_str() {
            "memory" => json!({}),
            _ => json!({ "path": self.path }),
        };
        xsense_storage::create_backend(&self.backend, &config)
            .with_context(|| format!("cannot open {} storage at {}", self.backend, self.path))
    }
}

/// Konfigurator section.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct KonfiguratorSection {
    /// Keep a Konfigurator below the Bridge.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Create Device instances for every discovered device.
    #[serde(default)]
    pub auto_provision: bool,

    #[serde(default = "default_provision_interval")]
    pub provision_interval_secs: u64,
}

impl Default for KonfiguratorSection {
    fn default() -> Self {
        Self {
            enabled: true,
            auto_provision: false,
            provision_interval_secs: default_provision_interval(),
        }
    }
}

/// Whole configuration file.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct XsenseConfig {
    pub mqtt: MqttBusConfig,
    pub bridge: BridgeConfig,
    pub storage: StorageSection,
    pub konfigurator: KonfiguratorSection,
}

/// Values given on the command line or through the environment.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub mqtt_host: Option<String>,
    pub mqtt_port: Option<u16>,
    pub topic_root: Option<String>,
    pub storage_path: Option<String>,
}

impl XsenseConfig {
    pub fn parse(text: &str) -> Result<Self> {
        toml::from_str(text).context("invalid configuration")
    }

    /// Load a file; a missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::info!(path = %path.display(), "no configuration file, using defaults");
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read {}", path.display()))?;
        let config = Self::parse(&text)?;
        tracing::info!(path = %path.display(), "configuration loaded");
        Ok(config)
    }

    pub fn apply(mut self, overrides: Overrides) -> Self {
        if let Some(host) = overrides.mqtt_host {
            self.mqtt.host = host;
        }
        if let Some(port) = overrides.mqtt_port {
            self.mqtt.port = port;
        }
        if let Some(root) = overrides.topic_root {
            self.bridge.topic_root = root;
        }
        if let Some(path) = overrides.storage_path {
            self.storage.path = path;
        }
        self
    }
}
