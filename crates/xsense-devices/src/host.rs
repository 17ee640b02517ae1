//! Collaborator contracts between the roles and their host.
//!
//! Roles are plain objects implementing [`Instance`]. Everything they need
//! from the outside world (bus, attribute store, typed variables, the
//! instance directory, timers and peer calls) is reached through a
//! [`Host`] passed into every event handler.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use xsense_core::config::status;
use xsense_core::supervisor::{select_peer, TimerCommand};
use xsense_core::{ConnectionState, ConnectionSupervisor, Transition};
use xsense_core::{CoreError, Envelope, VariableSpec, VariableValue};
use xsense_storage::AttributeStore;

use crate::bridge::BridgeConfig;
use crate::device::DeviceConfig;
use crate::konfigurator::{InventoryRow, KonfiguratorConfig};

/// Instance identifier assigned by the host.
pub type InstanceId = u32;

/// Role of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceKind {
    Bridge,
    Device,
    Konfigurator,
}

impl fmt::Display for InstanceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bridge => write!(f, "bridge"),
            Self::Device => write!(f, "device"),
            Self::Konfigurator => write!(f, "konfigurator"),
        }
    }
}

/// Configuration of an instance, tagged by role.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum InstanceConfig {
    Bridge(BridgeConfig),
    Device(DeviceConfig),
    Konfigurator(KonfiguratorConfig),
}

impl InstanceConfig {
    pub fn kind(&self) -> InstanceKind {
        match self {
            Self::Bridge(_) => InstanceKind::Bridge,
            Self::Device(_) => InstanceKind::Device,
            Self::Konfigurator(_) => InstanceKind::Konfigurator,
        }
    }

    /// Configured device id of a Device instance.
    pub fn device_id(&self) -> Option<&str> {
        match self {
            Self::Device(cfg) => Some(cfg.device_id.trim()),
            _ => None,
        }
    }
}

/// Public surface of an instance, callable by its peers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerCall {
    /// Bridge: re-send cached announcements, optionally for one device.
    ReplayDiscovery { device_filter: String },
    /// Bridge: the persisted cache object.
    GetDiscoveryCache,
    /// Device: apply one serialized discovery entry.
    UpdateDiscovery { json: String },
    /// Konfigurator: push cached entries to matching Device instances.
    SyncDiscovery,
    /// Konfigurator: discovered devices and their provisioning state.
    Inventory,
    /// Konfigurator: create Device instances; an empty id provisions every
    /// discovered device without one.
    Provision { device_id: String },
}

impl PeerCall {
    pub fn name(&self) -> &'static str {
        match self {
            Self::ReplayDiscovery { .. } => "ReplayDiscovery",
            Self::GetDiscoveryCache => "GetDiscoveryCache",
            Self::UpdateDiscovery { .. } => "UpdateDiscovery",
            Self::SyncDiscovery => "SyncDiscovery",
            Self::Inventory => "Inventory",
            Self::Provision { .. } => "Provision",
        }
    }
}

/// Reply to a [`PeerCall`].
#[derive(Debug, Clone, PartialEq)]
pub enum PeerReply {
    Count(usize),
    Cache(Value),
    Inventory(Vec<InventoryRow>),
    Done,
}

impl PeerReply {
    pub fn count(&self) -> Option<usize> {
        match self {
            Self::Count(n) => Some(*n),
            _ => None,
        }
    }
}

/// Message bus client.
pub trait BusClient: Send {
    fn is_connected(&self) -> bool;

    fn subscribe(&mut self, filter: &str) -> Result<(), CoreError>;

    fn publish(&mut self, topic: &str, payload: &str) -> Result<(), CoreError>;
}

/// Typed variables of one instance.
pub trait VariableRegistry {
    /// Create or update a variable definition. Returns whether anything changed.
    fn ensure_variable(&mut self, spec: &VariableSpec) -> bool;

    /// Write a value. Unknown idents and mismatched types are ignored and
    /// yield `false`.
    fn set_value(&mut self, ident: &str, value: VariableValue) -> bool;

    fn get_value(&self, ident: &str) -> Option<VariableValue>;

    fn has_variable(&self, ident: &str) -> bool;
}

/// Instance lifecycle and lookup.
pub trait InstanceDirectory {
    fn list_instances_of_kind(&self, kind: InstanceKind) -> Vec<InstanceId>;

    fn instance_status(&self, id: InstanceId) -> Option<u16>;

    fn instance_config(&self, id: InstanceId) -> Option<InstanceConfig>;

    fn parent_of(&self, id: InstanceId) -> Option<InstanceId>;

    fn connect(&mut self, child: InstanceId, parent: InstanceId) -> Result<(), CoreError>;

    /// Create an instance without activating it.
    fn create_instance(&mut self, config: InstanceConfig) -> Result<InstanceId, CoreError>;
}

/// Everything an instance can do while handling one event.
///
/// Variable operations address the variables of the current instance.
pub trait Host: InstanceDirectory + VariableRegistry {
    /// Id of the instance handling the event.
    fn id(&self) -> InstanceId;

    fn attributes(&self, id: InstanceId) -> AttributeStore;

    fn bus_connected(&self) -> bool;

    fn subscribe(&mut self, filter: &str) -> Result<(), CoreError>;

    fn set_status(&mut self, code: u16);

    /// Arm (`Some`) or disarm (`None`) a named recurring timer.
    fn set_timer(&mut self, name: &str, interval: Option<Duration>);

    fn set_receive_filter(&mut self, pattern: &str) -> Result<(), CoreError>;

    /// Deliver an envelope to every child of the current instance whose
    /// receive filter matches. Returns the number of recipients.
    fn send_to_children(&mut self, envelope: &Envelope) -> usize;

    /// Synchronous call into a peer. Busy or missing peers yield
    /// [`CoreError::UpstreamUnavailable`].
    fn call(&mut self, target: InstanceId, call: PeerCall) -> Result<PeerReply, CoreError>;

    /// Replace an instance configuration. Idle instances are re-activated.
    fn configure(&mut self, id: InstanceId, config: InstanceConfig) -> Result<(), CoreError>;

    /// Re-activate an idle instance.
    fn apply_changes(&mut self, id: InstanceId) -> Result<(), CoreError>;
}

/// Event-driven role object.
pub trait Instance: Send {
    fn kind(&self) -> InstanceKind;

    fn config(&self) -> InstanceConfig;

    /// Take over a new configuration; activation follows separately.
    fn reconfigure(&mut self, config: InstanceConfig) -> Result<(), CoreError>;

    fn on_activate(&mut self, host: &mut dyn Host);

    fn on_message(&mut self, host: &mut dyn Host, envelope: &Envelope);

    fn on_timer(&mut self, _host: &mut dyn Host, _name: &str) {}

    fn on_call(&mut self, host: &mut dyn Host, call: PeerCall) -> Result<PeerReply, CoreError>;

    /// Short description shown next to the status; refreshed after every event.
    fn summary(&self) -> String;
}

/// Apply a supervisor timer command to a named timer.
pub fn apply_timer(host: &mut dyn Host, name: &str, command: TimerCommand) {
    match command {
        TimerCommand::Arm(interval) => host.set_timer(name, Some(interval)),
        TimerCommand::Disarm => host.set_timer(name, None),
        TimerCommand::Keep => {}
    }
}

fn is_active_bridge(host: &dyn Host, id: InstanceId) -> bool {
    host.instance_config(id).map(|c| c.kind()) == Some(InstanceKind::Bridge)
        && host.instance_status(id) == Some(status::ACTIVE)
}

/// Attach the current instance to a healthy Bridge.
///
/// An existing parent must itself be active. Without a parent, the only
/// active Bridge is selected and connected; zero or several candidates leave
/// the instance detached.
pub fn attach_upstream(host: &mut dyn Host) -> Option<InstanceId> {
    let me = host.id();
    if let Some(parent) = host.parent_of(me) {
        return is_active_bridge(host, parent).then_some(parent);
    }

    let candidates: Vec<(InstanceId, bool)> = host
        .list_instances_of_kind(InstanceKind::Bridge)
        .into_iter()
        .map(|id| (id, host.instance_status(id) == Some(status::ACTIVE)))
        .collect();
    let peer = select_peer(candidates)?;

    if let Err(e) = host.connect(me, peer) {
        tracing::warn!(instance = me, bridge = peer, error = %e, "auto-connect failed");
        return None;
    }
    (host.parent_of(me) == Some(peer)).then_some(peer)
}

/// Supervised link to the upstream Bridge with a persisted attempt counter.
///
/// Sets the degraded statuses itself; the owner only handles the attached
/// case.
pub struct UpstreamLink {
    supervisor: ConnectionSupervisor,
    store: AttributeStore,
    counter: &'static str,
    timer: &'static str,
}

impl UpstreamLink {
    pub fn new(store: AttributeStore, counter: &'static str, timer: &'static str) -> Self {
        let mut supervisor = ConnectionSupervisor::new();
        let saved = store.get_int(counter).clamp(0, i64::from(u32::MAX)) as u32;
        supervisor.restore(saved);
        Self {
            supervisor,
            store,
            counter,
            timer,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.supervisor.state()
    }

    pub fn attempts(&self) -> u32 {
        self.supervisor.attempts()
    }

    /// Handle activation. Returns the Bridge when attached.
    pub fn activate(&mut self, host: &mut dyn Host) -> Option<InstanceId> {
        let parent = attach_upstream(host);
        let transition = self.supervisor.activate(parent.is_some());
        self.settle(host, transition, parent)
    }

    /// Handle a retry tick. Returns the Bridge when attached.
    pub fn tick(&mut self, host: &mut dyn Host) -> Option<InstanceId> {
        let parent = attach_upstream(host);
        let transition = self.supervisor.tick(parent.is_some());
        self.settle(host, transition, parent)
    }

    fn settle(
        &mut self,
        host: &mut dyn Host,
        transition: Transition,
        parent: Option<InstanceId>,
    ) -> Option<InstanceId> {
        let attempts = i64::from(self.supervisor.attempts());
        if self.store.get_int(self.counter) != attempts {
            if let Err(e) = self.store.put_int(self.counter, attempts) {
                tracing::error!(instance = host.id(), error = %e, "cannot persist attempt counter");
            }
        }
        apply_timer(host, self.timer, transition.timer);

        match transition.state {
            ConnectionState::Connected => parent,
            ConnectionState::Failed => {
                tracing::warn!(instance = host.id(), attempts, "no bridge found, giving up");
                host.set_status(status::RETRIES_EXHAUSTED);
                None
            }
            ConnectionState::Retrying(_) | ConnectionState::Disconnected => {
                host.set_status(status::INACTIVE);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instance_config_tagging() {
        let cfg = InstanceConfig::Device(DeviceConfig::new("SBS1"));
        let json = serde_json::to_value(&cfg).unwrap();
        assert_eq!(json["kind"], "device");
        assert_eq!(json["device_id"], "SBS1");

        let back: InstanceConfig = serde_json::from_value(json).unwrap();
        assert_eq!(back.kind(), InstanceKind::Device);
        assert_eq!(back.device_id(), Some("SBS1"));
    }

    #[test]
    fn test_peer_call_names() {
        assert_eq!(PeerCall::GetDiscoveryCache.name(), "GetDiscoveryCache");
        assert_eq!(InstanceKind::Konfigurator.to_string(), "konfigurator");
    }
}
