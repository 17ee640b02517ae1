//! In-process host for Bridge, Device and Konfigurator instances.
//!
//! The runtime owns every instance together with its record (configuration,
//! parent link, status, receive filter, timers and variables). While an
//! instance handles an event it is taken out of its record, so re-entrant
//! calls into it fail with [`CoreError::UpstreamUnavailable`]. Messages sent
//! to a busy instance are queued and delivered once the outermost event has
//! been handled.

use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use xsense_core::config::status;
use xsense_core::{
    CoreError, DataKind, Envelope, SharedBackend, TopicFilter, VariableSpec, VariableValue,
};
use xsense_storage::AttributeStore;

use crate::bridge::Bridge;
use crate::device::Device;
use crate::error::{Result, RoleError};
use crate::host::{
    BusClient, Host, Instance, InstanceConfig, InstanceDirectory, InstanceId, InstanceKind,
    PeerCall, PeerReply, VariableRegistry,
};
use crate::konfigurator::Konfigurator;
use crate::registry::MemoryVariableRegistry;

/// Table holding the runtime's own state.
const RUNTIME_TABLE: &str = "runtime";
const INSTANCES_KEY: &str = "instances";

/// Upper bound on queued deliveries drained after one event.
const MAX_QUEUED_DELIVERIES: usize = 10_000;

/// Attribute namespace of an instance.
pub fn instance_key(id: InstanceId) -> String {
    format!("instance-{}", id)
}

#[derive(Debug, Clone)]
struct Timer {
    interval: Duration,
    elapsed: Duration,
}

struct Record {
    config: InstanceConfig,
    parent: Option<InstanceId>,
    status: u16,
    summary: String,
    filter: Option<TopicFilter>,
    timers: BTreeMap<String, Timer>,
    variables: MemoryVariableRegistry,
    /// `None` while the instance handles an event.
    instance: Option<Box<dyn Instance>>,
}

/// Persisted form of a record.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct PersistedInstance {
    id: InstanceId,
    #[serde(default)]
    parent: Option<InstanceId>,
    config: InstanceConfig,
}

fn build_instance(config: &InstanceConfig, store: AttributeStore) -> Box<dyn Instance> {
    match config {
        InstanceConfig::Bridge(cfg) => Box::new(Bridge::new(cfg.clone(), store)),
        InstanceConfig::Device(cfg) => Box::new(Device::new(cfg.clone(), store)),
        InstanceConfig::Konfigurator(cfg) => Box::new(Konfigurator::new(cfg.clone(), store)),
    }
}

/// In-process instance host.
pub struct Runtime {
    backend: SharedBackend,
    bus: Option<Box<dyn BusClient>>,
    records: BTreeMap<InstanceId, Record>,
    pending: VecDeque<(InstanceId, Envelope)>,
    next_id: InstanceId,
}

impl Runtime {
    /// Create an empty runtime without a bus.
    pub fn new(backend: SharedBackend) -> Self {
        Self {
            backend,
            bus: None,
            records: BTreeMap::new(),
            pending: VecDeque::new(),
            next_id: 1,
        }
    }

    /// Rebuild the instances persisted in `backend`. Nothing is activated.
    pub fn restore(backend: SharedBackend) -> Result<Self> {
        let mut runtime = Self::new(backend);
        let Some(bytes) = runtime.backend.read(RUNTIME_TABLE, INSTANCES_KEY)? else {
            return Ok(runtime);
        };
        let saved: Vec<PersistedInstance> =
            serde_json::from_slice(&bytes).map_err(CoreError::from)?;

        for entry in saved {
            runtime.insert_record(entry.id, entry.config, entry.parent);
            runtime.next_id = runtime.next_id.max(entry.id + 1);
        }
        tracing::info!(instances = runtime.records.len(), "runtime restored");
        Ok(runtime)
    }

    pub fn with_bus(mut self, bus: impl BusClient + 'static) -> Self {
        self.bus = Some(Box::new(bus));
        self
    }

    pub fn set_bus(&mut self, bus: Box<dyn BusClient>) {
        self.bus = Some(bus);
    }

    pub fn backend(&self) -> &SharedBackend {
        &self.backend
    }

    /// Create and activate an instance.
    pub fn spawn(&mut self, config: InstanceConfig) -> Result<InstanceId> {
        let id = self.create_record(config)?;
        self.activate_now(id)?;
        self.flush();
        Ok(id)
    }

    /// Create an instance below `parent` and activate it.
    pub fn spawn_child(&mut self, config: InstanceConfig, parent: InstanceId) -> Result<InstanceId> {
        let id = self.create_record(config)?;
        self.link(id, parent)?;
        self.activate_now(id)?;
        self.flush();
        Ok(id)
    }

    /// Re-activate an instance.
    pub fn apply_changes(&mut self, id: InstanceId) -> Result<()> {
        let result = self.activate_now(id);
        self.flush();
        result
    }

    /// Activate every instance, Bridges first.
    pub fn activate_all(&mut self) {
        let mut ids = self.list_instances_of_kind(InstanceKind::Bridge);
        ids.extend(
            self.records
                .iter()
                .filter(|(_, r)| r.config.kind() != InstanceKind::Bridge)
                .map(|(id, _)| *id),
        );
        for id in ids {
            if let Err(e) = self.activate_now(id) {
                tracing::warn!(instance = id, error = %e, "activation failed");
            }
        }
        self.flush();
    }

    /// Re-activate every instance of one kind.
    pub fn activate_kind(&mut self, kind: InstanceKind) {
        for id in self.list_instances_of_kind(kind) {
            if let Err(e) = self.activate_now(id) {
                tracing::warn!(instance = id, error = %e, "activation failed");
            }
        }
        self.flush();
    }

    /// Replace an instance configuration and re-activate it.
    pub fn configure(&mut self, id: InstanceId, config: InstanceConfig) -> Result<()> {
        let result = self.configure_now(id, config);
        self.flush();
        result
    }

    /// Invoke the public surface of an instance.
    pub fn call(&mut self, target: InstanceId, call: PeerCall) -> Result<PeerReply> {
        let result = self.call_now(target, call);
        self.flush();
        Ok(result?)
    }

    /// Hand a message received from the bus to every Bridge.
    pub fn deliver_bus_message(&mut self, topic: &str, payload: &[u8]) -> usize {
        let envelope = Envelope::new(
            DataKind::Bus,
            topic,
            String::from_utf8_lossy(payload).into_owned(),
        );
        let text = match envelope.to_json() {
            Ok(text) => text,
            Err(e) => {
                tracing::warn!(topic, error = %e, "cannot serialize bus message");
                return 0;
            }
        };

        let targets: Vec<InstanceId> = self
            .records
            .iter()
            .filter(|(_, r)| r.config.kind() == InstanceKind::Bridge)
            .filter(|(_, r)| r.filter.as_ref().map_or(true, |f| f.matches(&text)))
            .map(|(id, _)| *id)
            .collect();
        for id in &targets {
            self.deliver(*id, envelope.clone());
        }
        self.flush();
        targets.len()
    }

    /// Advance the timer clock. Each due timer fires at most once per call.
    pub fn advance(&mut self, dt: Duration) {
        let mut due = Vec::new();
        for (id, record) in self.records.iter_mut() {
            for (name, timer) in record.timers.iter_mut() {
                timer.elapsed += dt;
                if timer.elapsed >= timer.interval {
                    timer.elapsed = Duration::ZERO;
                    due.push((*id, name.clone()));
                }
            }
        }

        for (id, name) in due {
            // An earlier firing may have disarmed it
            let armed = self
                .records
                .get(&id)
                .map_or(false, |r| r.timers.contains_key(&name));
            if !armed {
                continue;
            }
            if let Err(e) = self.dispatch(id, |instance, host| instance.on_timer(host, &name)) {
                tracing::debug!(instance = id, timer = %name, error = %e, "timer not delivered");
            }
        }
        self.flush();
    }

    /// Current value of an instance variable.
    pub fn variable(&self, id: InstanceId, ident: &str) -> Option<VariableValue> {
        self.records.get(&id)?.variables.get_value(ident)
    }

    pub fn variables(&self, id: InstanceId) -> Option<&MemoryVariableRegistry> {
        self.records.get(&id).map(|r| &r.variables)
    }

    pub fn summary(&self, id: InstanceId) -> Option<&str> {
        self.records.get(&id).map(|r| r.summary.as_str())
    }

    pub fn receive_filter(&self, id: InstanceId) -> Option<&str> {
        self.records.get(&id)?.filter.as_ref().map(TopicFilter::pattern)
    }

    pub fn timer_armed(&self, id: InstanceId, name: &str) -> bool {
        self.records
            .get(&id)
            .map_or(false, |r| r.timers.contains_key(name))
    }

    pub fn attributes(&self, id: InstanceId) -> AttributeStore {
        AttributeStore::new(self.backend.clone(), instance_key(id))
    }

    fn insert_record(&mut self, id: InstanceId, config: InstanceConfig, parent: Option<InstanceId>) {
        let instance = build_instance(&config, self.attributes(id));
        self.records.insert(
            id,
            Record {
                config,
                parent,
                status: status::CREATING,
                summary: String::new(),
                filter: None,
                timers: BTreeMap::new(),
                variables: MemoryVariableRegistry::new(),
                instance: Some(instance),
            },
        );
    }

    fn create_record(&mut self, config: InstanceConfig) -> Result<InstanceId> {
        let id = self.next_id;
        self.next_id += 1;
        let kind = config.kind();
        self.insert_record(id, config, None);
        self.persist()?;
        tracing::info!(instance = id, %kind, "instance created");
        Ok(id)
    }

    fn link(&mut self, child: InstanceId, parent: InstanceId) -> Result<()> {
        if child == parent {
            return Err(CoreError::malformed("an instance cannot be its own parent").into());
        }
        if !self.records.contains_key(&parent) {
            return Err(RoleError::NotFound(parent));
        }
        let record = self.records.get_mut(&child).ok_or(RoleError::NotFound(child))?;
        if record.parent == Some(parent) {
            return Ok(());
        }
        record.parent = Some(parent);
        self.persist()?;
        tracing::info!(instance = child, parent, "instance connected");
        Ok(())
    }

    fn persist(&self) -> Result<()> {
        let saved: Vec<PersistedInstance> = self
            .records
            .iter()
            .map(|(id, r)| PersistedInstance {
                id: *id,
                parent: r.parent,
                config: r.config.clone(),
            })
            .collect();
        let bytes = serde_json::to_vec(&saved).map_err(CoreError::from)?;
        self.backend.write(RUNTIME_TABLE, INSTANCES_KEY, &bytes)?;
        Ok(())
    }

    /// Run `f` with the instance taken out of its record.
    fn dispatch<T>(
        &mut self,
        id: InstanceId,
        f: impl FnOnce(&mut dyn Instance, &mut dyn Host) -> T,
    ) -> Result<T> {
        let record = self.records.get_mut(&id).ok_or(RoleError::NotFound(id))?;
        let mut instance = record.instance.take().ok_or(RoleError::Busy(id))?;

        let out = {
            let mut ctx = Context { runtime: self, id };
            let host: &mut dyn Host = &mut ctx;
            f(instance.as_mut(), host)
        };

        if let Some(record) = self.records.get_mut(&id) {
            record.summary = instance.summary();
            record.instance = Some(instance);
        }
        Ok(out)
    }

    fn activate_now(&mut self, id: InstanceId) -> Result<()> {
        self.dispatch(id, |instance, host| instance.on_activate(host))
    }

    fn configure_now(&mut self, id: InstanceId, config: InstanceConfig) -> Result<()> {
        let record = self.records.get(&id).ok_or(RoleError::NotFound(id))?;
        if record.config.kind() != config.kind() {
            return Err(CoreError::malformed(format!(
                "instance {} is a {}, not a {}",
                id,
                record.config.kind(),
                config.kind()
            ))
            .into());
        }
        if record.instance.is_none() {
            return Err(RoleError::Busy(id));
        }

        let applied = config.clone();
        self.dispatch(id, move |instance, host| -> std::result::Result<(), CoreError> {
            instance.reconfigure(applied)?;
            instance.on_activate(host);
            Ok(())
        })??;
        self.store_config(id, config)
    }

    fn store_config(&mut self, id: InstanceId, config: InstanceConfig) -> Result<()> {
        let record = self.records.get_mut(&id).ok_or(RoleError::NotFound(id))?;
        if record.config == config {
            return Ok(());
        }
        record.config = config;
        self.persist()
    }

    fn call_now(&mut self, target: InstanceId, call: PeerCall) -> std::result::Result<PeerReply, CoreError> {
        let name = call.name();
        self.dispatch(target, move |instance, host| instance.on_call(host, call))
            .map_err(|e| {
                tracing::debug!(target, call = name, error = %e, "peer call not delivered");
                CoreError::from(e)
            })?
    }

    /// Deliver now, or queue when the target is busy.
    fn deliver(&mut self, id: InstanceId, envelope: Envelope) {
        let Some(idle) = self.records.get(&id).map(|r| r.instance.is_some()) else {
            tracing::debug!(instance = id, "message for unknown instance dropped");
            return;
        };
        if !idle {
            self.pending.push_back((id, envelope));
            return;
        }
        if let Err(e) = self.dispatch(id, |instance, host| instance.on_message(host, &envelope)) {
            tracing::debug!(instance = id, error = %e, "message not delivered");
        }
    }

    fn flush(&mut self) {
        let mut budget = MAX_QUEUED_DELIVERIES;
        while let Some((id, envelope)) = self.pending.pop_front() {
            if budget == 0 {
                tracing::warn!(dropped = self.pending.len() + 1, "delivery queue overflow");
                self.pending.clear();
                return;
            }
            budget -= 1;
            self.deliver(id, envelope);
        }
    }
}

impl InstanceDirectory for Runtime {
    fn list_instances_of_kind(&self, kind: InstanceKind) -> Vec<InstanceId> {
        self.records
            .iter()
            .filter(|(_, r)| r.config.kind() == kind)
            .map(|(id, _)| *id)
            .collect()
    }

    fn instance_status(&self, id: InstanceId) -> Option<u16> {
        self.records.get(&id).map(|r| r.status)
    }

    fn instance_config(&self, id: InstanceId) -> Option<InstanceConfig> {
        self.records.get(&id).map(|r| r.config.clone())
    }

    fn parent_of(&self, id: InstanceId) -> Option<InstanceId> {
        self.records.get(&id)?.parent
    }

    fn connect(&mut self, child: InstanceId, parent: InstanceId) -> std::result::Result<(), CoreError> {
        Ok(self.link(child, parent)?)
    }

    fn create_instance(&mut self, config: InstanceConfig) -> std::result::Result<InstanceId, CoreError> {
        Ok(self.create_record(config)?)
    }
}

/// Host view handed to one instance while it handles an event.
struct Context<'a> {
    runtime: &'a mut Runtime,
    id: InstanceId,
}

impl Context<'_> {
    fn record(&mut self) -> Option<&mut Record> {
        self.runtime.records.get_mut(&self.id)
    }
}

impl InstanceDirectory for Context<'_> {
    fn list_instances_of_kind(&self, kind: InstanceKind) -> Vec<InstanceId> {
        self.runtime.list_instances_of_kind(kind)
    }

    fn instance_status(&self, id: InstanceId) -> Option<u16> {
        self.runtime.instance_status(id)
    }

    fn instance_config(&self, id: InstanceId) -> Option<InstanceConfig> {
        self.runtime.instance_config(id)
    }

    fn parent_of(&self, id: InstanceId) -> Option<InstanceId> {
        self.runtime.parent_of(id)
    }

    fn connect(&mut self, child: InstanceId, parent: InstanceId) -> std::result::Result<(), CoreError> {
        self.runtime.connect(child, parent)
    }

    fn create_instance(&mut self, config: InstanceConfig) -> std::result::Result<InstanceId, CoreError> {
        self.runtime.create_instance(config)
    }
}

impl VariableRegistry for Context<'_> {
    fn ensure_variable(&mut self, spec: &VariableSpec) -> bool {
        self.record()
            .map_or(false, |r| r.variables.ensure_variable(spec))
    }

    fn set_value(&mut self, ident: &str, value: VariableValue) -> bool {
        self.record()
            .map_or(false, |r| r.variables.set_value(ident, value))
    }

    fn get_value(&self, ident: &str) -> Option<VariableValue> {
        self.runtime.variable(self.id, ident)
    }

    fn has_variable(&self, ident: &str) -> bool {
        self.runtime
            .records
            .get(&self.id)
            .map_or(false, |r| r.variables.has_variable(ident))
    }
}

impl Host for Context<'_> {
    fn id(&self) -> InstanceId {
        self.id
    }

    fn attributes(&self, id: InstanceId) -> AttributeStore {
        self.runtime.attributes(id)
    }

    fn bus_connected(&self) -> bool {
        self.runtime
            .bus
            .as_ref()
            .map_or(false, |bus| bus.is_connected())
    }

    fn subscribe(&mut self, filter: &str) -> std::result::Result<(), CoreError> {
        let bus = self
            .runtime
            .bus
            .as_mut()
            .ok_or_else(|| CoreError::unavailable("no bus attached"))?;
        bus.subscribe(filter)?;
        tracing::debug!(instance = self.id, filter, "subscribed");
        Ok(())
    }

    fn set_status(&mut self, code: u16) {
        let id = self.id;
        if let Some(record) = self.record() {
            if record.status != code {
                tracing::info!(instance = id, from = record.status, to = code, "status changed");
                record.status = code;
            }
        }
    }

    fn set_timer(&mut self, name: &str, interval: Option<Duration>) {
        let Some(record) = self.record() else {
            return;
        };
        match interval {
            Some(interval) => {
                record.timers.insert(
                    name.to_string(),
                    Timer {
                        interval,
                        elapsed: Duration::ZERO,
                    },
                );
            }
            None => {
                record.timers.remove(name);
            }
        }
    }

    fn set_receive_filter(&mut self, pattern: &str) -> std::result::Result<(), CoreError> {
        let filter = TopicFilter::compile(pattern)?;
        if let Some(record) = self.record() {
            record.filter = Some(filter);
        }
        Ok(())
    }

    fn send_to_children(&mut self, envelope: &Envelope) -> usize {
        let text = match envelope.to_json() {
            Ok(text) => text,
            Err(e) => {
                tracing::warn!(instance = self.id, error = %e, "cannot serialize envelope");
                return 0;
            }
        };

        let me = self.id;
        let children: Vec<InstanceId> = self
            .runtime
            .records
            .iter()
            .filter(|(_, r)| r.parent == Some(me))
            .filter(|(_, r)| r.filter.as_ref().map_or(true, |f| f.matches(&text)))
            .map(|(id, _)| *id)
            .collect();

        for child in &children {
            self.runtime.deliver(*child, envelope.clone());
        }
        children.len()
    }

    fn call(&mut self, target: InstanceId, call: PeerCall) -> std::result::Result<PeerReply, CoreError> {
        self.runtime.call_now(target, call)
    }

    fn configure(&mut self, id: InstanceId, config: InstanceConfig) -> std::result::Result<(), CoreError> {
        if id == self.id {
            // The caller is handling this event and re-activates itself
            return Ok(self.runtime.store_config(id, config)?);
        }
        Ok(self.runtime.configure_now(id, config)?)
    }

    fn apply_changes(&mut self, id: InstanceId) -> std::result::Result<(), CoreError> {
        Ok(self.runtime.activate_now(id)?)
    }
}
