//! Bridge role: bus subscriber, discovery cache and fan-out to children.

use serde::{Deserialize, Serialize};
use xsense_core::config::{attributes, status, DEFAULT_TOPIC_ROOT};
use xsense_core::discovery::discovery_subscription_patterns;
use xsense_core::filter::{receive_filter, FilterScope};
use xsense_core::{topic, CoreError, DataKind, Envelope};
use xsense_storage::{AttributeStore, CacheRecord, DiscoveryCache, RawAnnouncement};

use crate::host::{Host, Instance, InstanceConfig, InstanceKind, PeerCall, PeerReply};

fn default_topic_root() -> String {
    DEFAULT_TOPIC_ROOT.to_string()
}

/// Bridge configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Topic prefix of the vendor's discovery announcements.
    #[serde(default = "default_topic_root")]
    pub topic_root: String,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            topic_root: default_topic_root(),
        }
    }
}

impl BridgeConfig {
    pub fn new(topic_root: impl Into<String>) -> Self {
        Self {
            topic_root: topic_root.into(),
        }
    }
}

/// Bridge instance.
pub struct Bridge {
    config: BridgeConfig,
    cache: DiscoveryCache<RawAnnouncement>,
}

impl Bridge {
    pub fn new(config: BridgeConfig, store: AttributeStore) -> Self {
        let cache = DiscoveryCache::open(store, attributes::DISCOVERY_CACHE);
        Self { config, cache }
    }

    fn root(&self) -> String {
        topic::topic_root(&self.config.topic_root)
    }

    fn subscribe(host: &mut dyn Host, filter: &str) {
        if let Err(e) = host.subscribe(filter) {
            tracing::warn!(instance = host.id(), filter, error = %e, "subscribe failed");
        }
    }

    /// Whether a bus topic concerns this bridge.
    fn accepts(&self, topic_name: &str) -> bool {
        topic::is_under_root(topic_name, &self.root())
            || !self.cache.find_by_state_topic(topic_name).is_empty()
    }

    fn remember(&mut self, host: &mut dyn Host, topic_name: &str, payload: &str) {
        let record = RawAnnouncement::new(payload);
        let state_topic = record.state_topic(topic_name);

        match self.cache.upsert(topic_name, record) {
            Ok(true) => {
                tracing::debug!(instance = host.id(), topic = topic_name, "discovery cache updated");
                // State topics outside the root need their own subscription
                if let Some(state_topic) = state_topic.filter(|t| !topic::is_under_root(t, &self.root())) {
                    Self::subscribe(host, &state_topic);
                }
            }
            Ok(false) => {}
            Err(e) => {
                tracing::error!(instance = host.id(), topic = topic_name, error = %e, "discovery cache write failed");
            }
        }
    }

    fn forward(host: &mut dyn Host, topic_name: &str, payload: &str) -> usize {
        host.send_to_children(&Envelope::new(DataKind::Bridge, topic_name, payload))
    }

    /// Re-send cached announcements to children.
    pub fn replay(&self, host: &mut dyn Host, device_filter: &str) -> usize {
        let entries = self.cache.replay(device_filter);
        tracing::debug!(
            instance = host.id(),
            cached = self.cache.len(),
            filter = device_filter,
            "replaying discovery"
        );
        for (topic_name, record) in &entries {
            Self::forward(host, topic_name, record.payload());
        }
        entries.len()
    }
}

impl Instance for Bridge {
    fn kind(&self) -> InstanceKind {
        InstanceKind::Bridge
    }

    fn config(&self) -> InstanceConfig {
        InstanceConfig::Bridge(self.config.clone())
    }

    fn reconfigure(&mut self, config: InstanceConfig) -> Result<(), CoreError> {
        match config {
            InstanceConfig::Bridge(cfg) => {
                self.config = cfg;
                Ok(())
            }
            other => Err(CoreError::malformed(format!("not a bridge config: {}", other.kind()))),
        }
    }

    fn on_activate(&mut self, host: &mut dyn Host) {
        if let Err(e) = host.set_receive_filter(&receive_filter(&FilterScope::Everything)) {
            tracing::warn!(instance = host.id(), error = %e, "cannot set receive filter");
        }

        if !host.bus_connected() {
            host.set_status(status::INACTIVE);
            return;
        }

        let root = self.root();
        host.set_status(status::ACTIVE);
        for pattern in discovery_subscription_patterns(&root) {
            Self::subscribe(host, &pattern);
        }
        for state_topic in self.cache.state_topics() {
            if !topic::is_under_root(&state_topic, &root) {
                Self::subscribe(host, &state_topic);
            }
        }
        tracing::info!(instance = host.id(), root = %root, cached = self.cache.len(), "bridge active");
    }

    fn on_message(&mut self, host: &mut dyn Host, envelope: &Envelope) {
        if envelope.kind() != Some(DataKind::Bus) || envelope.topic.is_empty() {
            return;
        }
        let topic_name = envelope.topic.as_str();
        if !self.accepts(topic_name) {
            return;
        }

        let payload = topic::decode_payload(&envelope.payload);
        if topic::is_config_topic(topic_name) {
            self.remember(host, topic_name, &payload);
        }
        Self::forward(host, topic_name, &payload);
    }

    fn on_call(&mut self, host: &mut dyn Host, call: PeerCall) -> Result<PeerReply, CoreError> {
        match call {
            PeerCall::ReplayDiscovery { device_filter } => {
                Ok(PeerReply::Count(self.replay(host, &device_filter)))
            }
            PeerCall::GetDiscoveryCache => Ok(PeerReply::Cache(self.cache.to_json())),
            other => Err(CoreError::malformed(format!("bridge does not handle {}", other.name()))),
        }
    }

    fn summary(&self) -> String {
        self.root()
    }
}
