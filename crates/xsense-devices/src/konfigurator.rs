//! Konfigurator role: device inventory and provisioning.

use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::iter::Peekable;
use std::str::Chars;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use xsense_core::config::{attributes, status, timers};
use xsense_core::filter::{receive_filter, FilterScope};
use xsense_core::{parse_discovery, topic, CoreError, DataKind, Discovery, EntityDescriptor, Envelope};
use xsense_storage::{AttributeStore, CacheRecord, DiscoveryCache};

use crate::device::DeviceConfig;
use crate::host::{
    Host, Instance, InstanceConfig, InstanceId, InstanceKind, PeerCall, PeerReply, UpstreamLink,
};

/// Konfigurator configuration. The role has no tunables yet.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KonfiguratorConfig {}

/// One discovered device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InventoryRow {
    /// Display name, formatted for a new instance
    pub name: String,
    pub device_id: String,
    pub model: String,
    /// Entity suffixes in first-seen order
    pub entities: Vec<String>,
    /// Device instance already bound to this device
    pub instance_id: Option<InstanceId>,
}

impl InventoryRow {
    pub fn entities_label(&self) -> String {
        self.entities.join(", ")
    }
}

/// Insert a space before `(` when it directly follows a word.
pub fn format_instance_name(name: &str) -> String {
    let name = name.trim();
    match name.find('(') {
        Some(pos) if pos > 0 && !name[..pos].ends_with(' ') => {
            format!("{} {}", &name[..pos], &name[pos..])
        }
        _ => name.to_string(),
    }
}

fn take_digits(chars: &mut Peekable<Chars<'_>>) -> String {
    let mut run = String::new();
    while let Some(c) = chars.peek().copied().filter(char::is_ascii_digit) {
        run.push(c);
        chars.next();
    }
    run
}

/// Case-insensitive natural ordering: digit runs compare by value.
pub fn natural_cmp(a: &str, b: &str) -> Ordering {
    let mut left = a.chars().peekable();
    let mut right = b.chars().peekable();
    loop {
        match (left.peek().copied(), right.peek().copied()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(x), Some(y)) if x.is_ascii_digit() && y.is_ascii_digit() => {
                let l = take_digits(&mut left);
                let r = take_digits(&mut right);
                let l = l.trim_start_matches('0');
                let r = r.trim_start_matches('0');
                let ord = l.len().cmp(&r.len()).then_with(|| l.cmp(r));
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            (Some(x), Some(y)) => {
                let ord = x.to_lowercase().cmp(y.to_lowercase());
                if ord != Ordering::Equal {
                    return ord;
                }
                left.next();
                right.next();
            }
        }
    }
}

/// Konfigurator instance.
pub struct Konfigurator {
    config: KonfiguratorConfig,
    cache: DiscoveryCache<EntityDescriptor>,
    upstream: UpstreamLink,
}

impl Konfigurator {
    pub fn new(config: KonfiguratorConfig, store: AttributeStore) -> Self {
        let cache = DiscoveryCache::open(store.clone(), attributes::DISCOVERY_CACHE);
        let upstream = UpstreamLink::new(store, attributes::RETRY_TRIES, timers::RETRY_CONNECT);
        Self {
            config,
            cache,
            upstream,
        }
    }

    fn go_active(&mut self, host: &mut dyn Host, bridge: InstanceId) {
        host.set_status(status::ACTIVE);
        if let Err(e) = host.set_receive_filter(&receive_filter(&FilterScope::ConfigOnly)) {
            tracing::warn!(instance = host.id(), error = %e, "cannot set receive filter");
        }
        let imported = self.refresh_from_bridge(host, bridge);
        tracing::info!(instance = host.id(), bridge, imported, "konfigurator active");
    }

    /// Apply one announcement. Returns whether the cache changed.
    fn apply(&mut self, topic_name: &str, payload: &str) -> bool {
        let result = match parse_discovery(topic_name, payload) {
            Ok(Discovery::Entity(desc)) => {
                let key = desc.unique_id.clone();
                self.cache.upsert(&key, desc)
            }
            Ok(Discovery::Removed { unique_id, topic }) => {
                self.cache.remove_announced(&topic, &unique_id).map(|key| key.is_some())
            }
            Err(e) => {
                tracing::debug!(topic = topic_name, error = %e, "announcement skipped");
                return false;
            }
        };
        result.unwrap_or_else(|e| {
            tracing::error!(topic = topic_name, error = %e, "discovery cache write failed");
            false
        })
    }

    /// Import the Bridge's discovery cache. Returns the number of changes.
    pub fn refresh_from_bridge(&mut self, host: &mut dyn Host, bridge: InstanceId) -> usize {
        let cache = match host.call(bridge, PeerCall::GetDiscoveryCache) {
            Ok(PeerReply::Cache(Value::Object(map))) => map,
            Ok(other) => {
                tracing::debug!(instance = host.id(), reply = ?other, "unexpected cache reply");
                return 0;
            }
            Err(e) => {
                tracing::debug!(instance = host.id(), error = %e, "bridge cache unavailable");
                return 0;
            }
        };

        let mut changed = 0;
        for (topic_name, payload) in &cache {
            let Some(payload) = payload.as_str() else {
                continue;
            };
            if self.apply(topic_name, payload) {
                changed += 1;
            }
        }
        changed
    }

    /// Discovered devices, sorted naturally by device id.
    pub fn inventory(&self, host: &dyn Host) -> Vec<InventoryRow> {
        let mut rows: Vec<InventoryRow> = Vec::new();
        for (_, desc) in self.cache.all() {
            let device_id = desc.owner_device_id();
            if device_id.is_empty() {
                continue;
            }
            let index = match rows.iter().position(|r| r.device_id == device_id) {
                Some(index) => index,
                None => {
                    let name = if desc.device.name.is_empty() {
                        device_id
                    } else {
                        desc.device.name.as_str()
                    };
                    rows.push(InventoryRow {
                        name: name.to_string(),
                        device_id: device_id.to_string(),
                        model: desc.device.model.clone(),
                        entities: Vec::new(),
                        instance_id: None,
                    });
                    rows.len() - 1
                }
            };
            let row = &mut rows[index];
            if !desc.suffix.is_empty() && !row.entities.contains(&desc.suffix) {
                row.entities.push(desc.suffix.clone());
            }
        }

        rows.sort_by(|a, b| natural_cmp(&a.device_id, &b.device_id).then_with(|| a.device_id.cmp(&b.device_id)));
        for row in &mut rows {
            row.name = format_instance_name(&row.name);
            row.instance_id = find_device_instance(host, &row.device_id);
        }
        rows
    }

    /// Push cached descriptors to every Device instance with a device id.
    /// Returns the number of delivered entries.
    pub fn sync_discovery_to_devices(&self, host: &mut dyn Host) -> usize {
        if self.cache.is_empty() {
            tracing::debug!(instance = host.id(), "nothing to sync");
            return 0;
        }

        let mut sent = 0;
        for id in host.list_instances_of_kind(InstanceKind::Device) {
            let Some(device_id) = host
                .instance_config(id)
                .and_then(|c| c.device_id().map(str::to_string))
                .filter(|d| !d.is_empty())
            else {
                continue;
            };

            let entries: Vec<String> = self
                .cache
                .find_by_device_id(&device_id, true)
                .into_iter()
                .map(|(_, desc)| desc.to_json().to_string())
                .collect();
            for json in entries {
                match host.call(id, PeerCall::UpdateDiscovery { json }) {
                    Ok(_) => sent += 1,
                    Err(e) => tracing::debug!(instance = host.id(), device = id, error = %e, "sync entry rejected"),
                }
            }
        }
        tracing::info!(instance = host.id(), sent, "discovery synced to devices");
        sent
    }

    /// Create a Device instance for a discovered device.
    ///
    /// Returns `None` when an instance for the device already exists.
    pub fn provision(&self, host: &mut dyn Host, device_id: &str) -> Result<Option<InstanceId>, CoreError> {
        let device_id = device_id.trim();
        let Some(row) = self
            .inventory(host)
            .into_iter()
            .find(|r| r.device_id.eq_ignore_ascii_case(device_id))
        else {
            return Err(CoreError::UnresolvedReference(format!("device {} not discovered", device_id)));
        };
        if row.instance_id.is_some() {
            return Ok(None);
        }

        let bridge = host
            .parent_of(host.id())
            .ok_or_else(|| CoreError::unavailable("konfigurator is not attached to a bridge"))?;

        let child = host.create_instance(InstanceConfig::Device(DeviceConfig::new(row.device_id.clone())))?;
        host.connect(child, bridge)?;
        host.apply_changes(child)?;
        tracing::info!(instance = host.id(), device_id = %row.device_id, child, "device provisioned");
        Ok(Some(child))
    }

    /// Provision every discovered device without an instance.
    pub fn provision_all(&self, host: &mut dyn Host) -> Result<Vec<InstanceId>, CoreError> {
        let mut created = Vec::new();
        for row in self.inventory(host) {
            if row.instance_id.is_some() {
                continue;
            }
            if let Some(id) = self.provision(host, &row.device_id)? {
                created.push(id);
            }
        }
        Ok(created)
    }
}

fn find_device_instance(host: &dyn Host, device_id: &str) -> Option<InstanceId> {
    host.list_instances_of_kind(InstanceKind::Device)
        .into_iter()
        .find(|id| {
            host.instance_config(*id)
                .and_then(|c| c.device_id().map(|d| !d.is_empty() && d.eq_ignore_ascii_case(device_id)))
                .unwrap_or(false)
        })
}

impl Instance for Konfigurator {
    fn kind(&self) -> InstanceKind {
        InstanceKind::Konfigurator
    }

    fn config(&self) -> InstanceConfig {
        InstanceConfig::Konfigurator(self.config.clone())
    }

    fn reconfigure(&mut self, config: InstanceConfig) -> Result<(), CoreError> {
        match config {
            InstanceConfig::Konfigurator(cfg) => {
                self.config = cfg;
                Ok(())
            }
            other => Err(CoreError::malformed(format!("not a konfigurator config: {}", other.kind()))),
        }
    }

    fn on_activate(&mut self, host: &mut dyn Host) {
        if let Some(bridge) = self.upstream.activate(host) {
            self.go_active(host, bridge);
        }
    }

    fn on_message(&mut self, host: &mut dyn Host, envelope: &Envelope) {
        if envelope.kind() != Some(DataKind::Bridge) || !topic::is_config_topic(&envelope.topic) {
            return;
        }
        let payload = topic::decode_payload(&envelope.payload);
        if self.apply(&envelope.topic, &payload) {
            tracing::debug!(instance = host.id(), topic = %envelope.topic, "inventory updated");
        }
    }

    fn on_timer(&mut self, host: &mut dyn Host, name: &str) {
        if name != timers::RETRY_CONNECT {
            return;
        }
        if let Some(bridge) = self.upstream.tick(host) {
            self.go_active(host, bridge);
        }
    }

    fn on_call(&mut self, host: &mut dyn Host, call: PeerCall) -> Result<PeerReply, CoreError> {
        match call {
            PeerCall::SyncDiscovery => Ok(PeerReply::Count(self.sync_discovery_to_devices(host))),
            PeerCall::Inventory => Ok(PeerReply::Inventory(self.inventory(host))),
            PeerCall::Provision { device_id } => {
                let created = if device_id.trim().is_empty() {
                    self.provision_all(host)?.len()
                } else {
                    usize::from(self.provision(host, &device_id)?.is_some())
                };
                Ok(PeerReply::Count(created))
            }
            other => Err(CoreError::malformed(format!("konfigurator does not handle {}", other.name()))),
        }
    }

    fn summary(&self) -> String {
        let devices: BTreeSet<&str> = self
            .cache
            .all()
            .map(|(_, desc)| desc.owner_device_id())
            .filter(|id| !id.is_empty())
            .collect();
        format!("{} devices", devices.len())
    }
}
