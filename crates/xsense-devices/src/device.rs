//! Device role: one physical device and its typed variables.
//!
//! A Device keeps the descriptors of its own entities keyed by `unique_id`,
//! turns state messages into variable writes and keeps its receive filter
//! narrowed to its device id.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use xsense_core::config::{attributes, status, timers};
use xsense_core::filter::{receive_filter, FilterScope};
use xsense_core::resolver::{
    battery_variable, device_info_values, device_info_variables, entity_variable, idents,
    resolve_ident,
};
use xsense_core::state::{self, Projection};
use xsense_core::{
    parse_discovery_with, parse_entry, topic, CoreError, DataKind, DeviceInfo, Discovery,
    EntityDescriptor, Envelope, IdentPolicy, VariableValue,
};
use xsense_storage::{AttributeStore, DiscoveryCache};

use crate::host::{
    Host, Instance, InstanceConfig, InstanceId, InstanceKind, PeerCall, PeerReply, UpstreamLink,
};

fn default_true() -> bool {
    true
}

/// Device configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Vendor device id. Empty until the first announcement is adopted.
    #[serde(default)]
    pub device_id: String,

    /// Expose entities whose suffix has no fixed ident.
    #[serde(default = "default_true")]
    pub create_unknown_entities: bool,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            device_id: String::new(),
            create_unknown_entities: true,
        }
    }
}

impl DeviceConfig {
    pub fn new(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            ..Default::default()
        }
    }

    pub fn with_unknown_entities(mut self, enabled: bool) -> Self {
        self.create_unknown_entities = enabled;
        self
    }

    fn policy(&self) -> IdentPolicy {
        IdentPolicy {
            create_unknown_entities: self.create_unknown_entities,
        }
    }
}

/// Device instance.
pub struct Device {
    config: DeviceConfig,
    entities: DiscoveryCache<EntityDescriptor>,
    upstream: UpstreamLink,
}

impl Device {
    pub fn new(config: DeviceConfig, store: AttributeStore) -> Self {
        let entities = DiscoveryCache::open(store.clone(), attributes::ENTITIES);
        let upstream = UpstreamLink::new(store, attributes::AUTO_CONNECT_TRIES, timers::AUTO_CONNECT);
        Self {
            config,
            entities,
            upstream,
        }
    }

    pub fn device_id(&self) -> &str {
        self.config.device_id.trim()
    }

    fn refresh_filter(&self, host: &mut dyn Host) {
        let pattern = receive_filter(&FilterScope::for_device(self.device_id()));
        if let Err(e) = host.set_receive_filter(&pattern) {
            tracing::warn!(instance = host.id(), error = %e, "cannot set receive filter");
        }
    }

    /// Re-register variables of every cached entity.
    fn restore_variables(&self, host: &mut dyn Host) {
        let mut device: Option<&DeviceInfo> = None;
        for (_, desc) in self.entities.all() {
            if let Some(spec) = entity_variable(desc) {
                host.ensure_variable(&spec);
            }
            device.get_or_insert(&desc.device);
        }
        if let Some(device) = device {
            Self::ensure_device_variables(host, device);
        }
    }

    fn ensure_device_variables(host: &mut dyn Host, device: &DeviceInfo) {
        for spec in device_info_variables() {
            host.ensure_variable(&spec);
        }
        for (ident, value) in device_info_values(device) {
            host.set_value(ident, value);
        }
    }

    fn go_active(&self, host: &mut dyn Host, bridge: InstanceId) {
        host.set_status(status::ACTIVE);
        self.refresh_filter(host);
        tracing::info!(instance = host.id(), device_id = %self.device_id(), bridge, "device active");

        let call = PeerCall::ReplayDiscovery {
            device_filter: self.device_id().to_string(),
        };
        match host.call(bridge, call) {
            Ok(reply) => tracing::debug!(instance = host.id(), replayed = ?reply.count(), "discovery replay requested"),
            Err(e) => tracing::debug!(instance = host.id(), error = %e, "discovery replay unavailable"),
        }
    }

    /// Store a descriptor for this device and expose its variables.
    ///
    /// An empty configured device id adopts the announced one.
    pub fn update_descriptor(
        &mut self,
        host: &mut dyn Host,
        mut desc: EntityDescriptor,
    ) -> Result<(), CoreError> {
        let announced = desc.owner_device_id().trim().to_string();
        if announced.is_empty() {
            return Err(CoreError::malformed(format!("device id missing for {}", desc.unique_id)));
        }

        let adopted = self.device_id().is_empty();
        if adopted {
            self.config.device_id = announced.clone();
            let me = host.id();
            host.configure(me, InstanceConfig::Device(self.config.clone()))?;
            tracing::info!(instance = me, device_id = %announced, "device id adopted");
        } else if !self.device_id().eq_ignore_ascii_case(&announced) {
            return Err(CoreError::InconsistentIdentity {
                configured: self.device_id().to_string(),
                announced,
            });
        }

        desc.device.id = announced;
        if desc.device.name.trim().is_empty() {
            desc.device.name = desc.device.id.clone();
        }
        desc.complete_suffix();
        desc.ident = resolve_ident(&desc, self.config.policy());

        let key = desc.unique_id.clone();
        if desc.discovery_topic.is_empty() {
            if let Some(known) = self.entities.get(&key) {
                desc.discovery_topic = known.discovery_topic.clone();
            }
        }
        self.entities.upsert(&key, desc.clone())?;

        Self::ensure_device_variables(host, &desc.device);
        match entity_variable(&desc) {
            Some(spec) => {
                host.ensure_variable(&spec);
            }
            None => tracing::debug!(unique_id = %key, suffix = %desc.suffix, "entity not exposed"),
        }

        if adopted {
            self.on_activate(host);
        } else {
            self.refresh_filter(host);
        }
        Ok(())
    }

    fn process_config(&mut self, host: &mut dyn Host, topic_name: &str, payload: &str) {
        match parse_discovery_with(topic_name, payload, self.config.policy()) {
            Ok(Discovery::Removed { unique_id, topic }) => {
                match self.entities.remove_announced(&topic, &unique_id) {
                    Ok(Some(key)) => {
                        tracing::info!(instance = host.id(), unique_id = %key, "entity removed")
                    }
                    Ok(None) => {}
                    Err(e) => tracing::error!(instance = host.id(), error = %e, "cannot remove entity"),
                }
            }
            Ok(Discovery::Entity(desc)) => {
                let unique_id = desc.unique_id.clone();
                if let Err(e) = self.update_descriptor(host, desc) {
                    log_rejected(host.id(), &unique_id, &e);
                }
            }
            Err(e) => tracing::warn!(instance = host.id(), topic = topic_name, error = %e, "invalid announcement"),
        }
    }

    fn process_state(&mut self, host: &mut dyn Host, topic_name: &str, payload: &str) {
        let matches: Vec<EntityDescriptor> = self
            .entities
            .find_by_state_topic(topic_name)
            .into_iter()
            .map(|(_, desc)| desc.clone())
            .collect();
        if matches.is_empty() {
            let e = CoreError::UnresolvedReference(topic_name.to_string());
            tracing::debug!(instance = host.id(), error = %e, "no entity for state topic");
            return;
        }

        let mut seen = false;
        for desc in &matches {
            let value = match state::interpret(desc, payload) {
                Ok(Some(value)) => value,
                Ok(None) => {
                    tracing::debug!(instance = host.id(), unique_id = %desc.unique_id, "status missing");
                    continue;
                }
                Err(e) => {
                    tracing::warn!(instance = host.id(), topic = topic_name, error = %e, "invalid state payload");
                    return;
                }
            };
            seen = true;

            let Some(spec) = entity_variable(desc) else {
                continue;
            };
            host.ensure_variable(&spec);

            if let Some(percent) = state::battery_percentage(desc, &value) {
                host.ensure_variable(&battery_variable());
                host.set_value(idents::BATTERY, VariableValue::Integer(percent));
            }

            match state::project(desc, &value, spec.kind) {
                Projection::Value(v) => {
                    host.set_value(&spec.ident, v);
                }
                Projection::Unrecognized(text) => {
                    tracing::debug!(instance = host.id(), ident = %spec.ident, status = %text, "status unrecognized");
                }
            }
        }

        if seen {
            host.set_value(idents::LAST_SEEN, VariableValue::Integer(Utc::now().timestamp()));
        }
    }
}

fn log_rejected(instance: InstanceId, unique_id: &str, error: &CoreError) {
    match error {
        CoreError::InconsistentIdentity { .. } => {
            tracing::warn!(instance, unique_id, error = %error, "announcement for another device");
        }
        _ => tracing::warn!(instance, unique_id, error = %error, "announcement rejected"),
    }
}

impl Instance for Device {
    fn kind(&self) -> InstanceKind {
        InstanceKind::Device
    }

    fn config(&self) -> InstanceConfig {
        InstanceConfig::Device(self.config.clone())
    }

    fn reconfigure(&mut self, config: InstanceConfig) -> Result<(), CoreError> {
        match config {
            InstanceConfig::Device(cfg) => {
                self.config = cfg;
                Ok(())
            }
            other => Err(CoreError::malformed(format!("not a device config: {}", other.kind()))),
        }
    }

    fn on_activate(&mut self, host: &mut dyn Host) {
        self.restore_variables(host);
        if let Some(bridge) = self.upstream.activate(host) {
            self.go_active(host, bridge);
        }
    }

    fn on_message(&mut self, host: &mut dyn Host, envelope: &Envelope) {
        if envelope.kind() != Some(DataKind::Bridge) || envelope.topic.is_empty() {
            return;
        }
        let payload = topic::decode_payload(&envelope.payload);
        if topic::is_config_topic(&envelope.topic) {
            self.process_config(host, &envelope.topic, &payload);
        } else {
            self.process_state(host, &envelope.topic, &payload);
        }
    }

    fn on_timer(&mut self, host: &mut dyn Host, name: &str) {
        if name != timers::AUTO_CONNECT {
            return;
        }
        if let Some(bridge) = self.upstream.tick(host) {
            self.go_active(host, bridge);
        }
    }

    fn on_call(&mut self, host: &mut dyn Host, call: PeerCall) -> Result<PeerReply, CoreError> {
        match call {
            PeerCall::UpdateDiscovery { json } => {
                let desc = parse_entry(&json, self.config.policy())?;
                self.update_descriptor(host, desc)?;
                Ok(PeerReply::Done)
            }
            other => Err(CoreError::malformed(format!("device does not handle {}", other.name()))),
        }
    }

    fn summary(&self) -> String {
        self.device_id().to_string()
    }
}
