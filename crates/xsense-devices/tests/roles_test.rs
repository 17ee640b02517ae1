//! Role integration tests
//!
//! - Discovery to state to variable, end to end
//! - Replay on attach and device id adoption
//! - Identity conflicts
//! - Bounded retry of the upstream attachment
//! - Konfigurator inventory, provisioning and sync
//! - Restart from a redb file

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use xsense_core::config::{attributes, status, timers};
use xsense_core::{CoreError, SharedBackend, VariableValue};
use xsense_devices::{
    BridgeConfig, DeviceConfig, InstanceConfig, InstanceDirectory, InstanceId, KonfiguratorConfig,
    MemoryBus, PeerCall, PeerReply, RoleError, Runtime,
};
use xsense_storage::{MemoryBackend, RedbBackend};

const SMOKE_TOPIC: &str = "homeassistant/binary_sensor/DEV1/DEV1_ENT1_smokealarm/config";
const BATTERY_TOPIC: &str = "homeassistant/binary_sensor/DEV1/DEV1_ENT1_battery/config";
const STATE_TOPIC: &str = "DEV1/ENT1/state";

fn smoke_announcement() -> Value {
    json!({
        "unique_id": "DEV1_ENT1_smokealarm",
        "name": "Smoke",
        "state_topic": STATE_TOPIC,
        "payload_on": "1",
        "payload_off": "0",
        "device": {
            "identifiers": ["DEV1"],
            "name": "Smoke Alarm(Kitchen)",
            "manufacturer": "X-Sense",
            "model": "XS01-M",
            "sw_version": "1.2.0"
        }
    })
}

fn battery_announcement() -> Value {
    json!({
        "unique_id": "DEV1_ENT1_battery",
        "state_topic": STATE_TOPIC,
        "value_template": "{{ value_json.battery }}",
        "device": {"identifiers": ["DEV1"], "manufacturer": "X-Sense", "model": "XS01-M"}
    })
}

fn runtime() -> (Runtime, MemoryBus) {
    let bus = MemoryBus::connected();
    let rt = Runtime::new(Arc::new(MemoryBackend::default())).with_bus(bus.clone());
    (rt, bus)
}

fn publish(rt: &mut Runtime, topic: &str, payload: &Value) {
    rt.deliver_bus_message(topic, payload.to_string().as_bytes());
}

fn spawn_bridge(rt: &mut Runtime) -> InstanceId {
    rt.spawn(InstanceConfig::Bridge(BridgeConfig::default())).unwrap()
}

#[test]
fn test_discovery_to_state_end_to_end() {
    let (mut rt, bus) = runtime();
    let bridge = spawn_bridge(&mut rt);
    let device = rt
        .spawn_child(InstanceConfig::Device(DeviceConfig::new("DEV1")), bridge)
        .unwrap();
    assert_eq!(rt.instance_status(device), Some(status::ACTIVE));

    publish(&mut rt, SMOKE_TOPIC, &smoke_announcement());
    assert_eq!(
        rt.variable(device, "Manufacturer"),
        Some(VariableValue::String("X-Sense".to_string()))
    );
    assert_eq!(rt.variable(device, "SmokeDetected"), None);
    // State topics outside the root get their own subscription
    assert!(bus.subscriptions().contains(&STATE_TOPIC.to_string()));

    publish(&mut rt, STATE_TOPIC, &json!({"status": "1"}));
    assert_eq!(rt.variable(device, "SmokeDetected"), Some(VariableValue::Boolean(true)));
    assert!(matches!(rt.variable(device, "LastSeen"), Some(VariableValue::Integer(t)) if t > 0));

    publish(&mut rt, STATE_TOPIC, &json!({"status": "0"}));
    assert_eq!(rt.variable(device, "SmokeDetected"), Some(VariableValue::Boolean(false)));

    // Unknown status leaves the value untouched
    publish(&mut rt, STATE_TOPIC, &json!({"status": "maybe"}));
    assert_eq!(rt.variable(device, "SmokeDetected"), Some(VariableValue::Boolean(false)));
}

#[test]
fn test_hex_payload_and_battery_template() {
    let (mut rt, _bus) = runtime();
    let bridge = spawn_bridge(&mut rt);
    let device = rt
        .spawn_child(InstanceConfig::Device(DeviceConfig::new("DEV1")), bridge)
        .unwrap();

    publish(&mut rt, SMOKE_TOPIC, &smoke_announcement());
    let hex_payload = hex::encode(battery_announcement().to_string());
    rt.deliver_bus_message(BATTERY_TOPIC, hex_payload.as_bytes());

    publish(&mut rt, STATE_TOPIC, &json!({"status": "1", "battery": 85}));
    assert_eq!(rt.variable(device, "Battery"), Some(VariableValue::Integer(85)));
    assert_eq!(rt.variable(device, "SmokeDetected"), Some(VariableValue::Boolean(true)));
    assert!(rt.variables(device).unwrap().get("BatteryLow").is_some());
}

#[test]
fn test_messages_of_other_devices_are_filtered() {
    let (mut rt, _bus) = runtime();
    let bridge = spawn_bridge(&mut rt);
    let device = rt
        .spawn_child(InstanceConfig::Device(DeviceConfig::new("DEV2")), bridge)
        .unwrap();

    publish(&mut rt, SMOKE_TOPIC, &smoke_announcement());
    assert!(rt.variables(device).unwrap().is_empty());
    assert!(rt.receive_filter(device).unwrap().contains("DEV2"));
}

#[test]
fn test_replay_on_attach() {
    let (mut rt, _bus) = runtime();
    let bridge = spawn_bridge(&mut rt);
    publish(&mut rt, SMOKE_TOPIC, &smoke_announcement());

    let device = rt
        .spawn_child(InstanceConfig::Device(DeviceConfig::new("dev1")), bridge)
        .unwrap();
    assert!(rt.variables(device).unwrap().get("SmokeDetected").is_some());

    let reply = rt
        .call(bridge, PeerCall::ReplayDiscovery { device_filter: "DEV1".to_string() })
        .unwrap();
    assert_eq!(reply, PeerReply::Count(1));
}

#[test]
fn test_device_id_adoption() {
    let (mut rt, _bus) = runtime();
    let bridge = spawn_bridge(&mut rt);
    publish(&mut rt, SMOKE_TOPIC, &smoke_announcement());

    let device = rt
        .spawn_child(InstanceConfig::Device(DeviceConfig::new("")), bridge)
        .unwrap();

    assert_eq!(rt.instance_config(device).unwrap().device_id(), Some("DEV1"));
    assert_eq!(rt.summary(device), Some("DEV1"));
    assert!(rt.receive_filter(device).unwrap().contains("DEV1"));
    assert!(rt.variables(device).unwrap().get("SmokeDetected").is_some());
}

#[test]
fn test_identity_conflict_rejected() {
    let (mut rt, _bus) = runtime();
    let bridge = spawn_bridge(&mut rt);
    let device = rt
        .spawn_child(InstanceConfig::Device(DeviceConfig::new("DEV2")), bridge)
        .unwrap();

    let entry = json!({
        "unique_id": "DEV1_ENT1_smokealarm",
        "state_topic": STATE_TOPIC,
        "payload_on": "1"
    });
    let err = rt
        .call(device, PeerCall::UpdateDiscovery { json: entry.to_string() })
        .unwrap_err();
    assert!(matches!(
        err,
        RoleError::Core(CoreError::InconsistentIdentity { ref configured, ref announced })
            if configured == "DEV2" && announced == "DEV1"
    ));
    assert!(rt.variables(device).unwrap().is_empty());
    assert_eq!(rt.instance_config(device).unwrap().device_id(), Some("DEV2"));
}

#[test]
fn test_tombstone_removes_entity() {
    let (mut rt, _bus) = runtime();
    let bridge = spawn_bridge(&mut rt);
    let device = rt
        .spawn_child(InstanceConfig::Device(DeviceConfig::new("DEV1")), bridge)
        .unwrap();

    publish(&mut rt, SMOKE_TOPIC, &smoke_announcement());
    rt.deliver_bus_message(SMOKE_TOPIC, b"");

    let Ok(PeerReply::Cache(cache)) = rt.call(bridge, PeerCall::GetDiscoveryCache) else {
        panic!("bridge cache expected");
    };
    assert_eq!(cache[SMOKE_TOPIC], json!(""));
    assert_eq!(
        rt.call(bridge, PeerCall::ReplayDiscovery { device_filter: String::new() }).unwrap(),
        PeerReply::Count(0)
    );

    let entities: Value =
        serde_json::from_str(&rt.attributes(device).get(attributes::ENTITIES)).unwrap();
    assert_eq!(entities["DEV1_ENT1_smokealarm"], Value::Null);

    // Variables stay, state updates no longer reach them
    publish(&mut rt, STATE_TOPIC, &json!({"status": "1"}));
    assert!(rt.variables(device).unwrap().get("SmokeDetected").is_some());
    assert_eq!(rt.variable(device, "SmokeDetected"), None);
}

#[test]
fn test_tombstone_on_object_id_topic() {
    // The object id segment differs from the unique_id
    let config_topic = "homeassistant/binary_sensor/DEV1/ENT1/config";
    let (mut rt, _bus) = runtime();
    let bridge = spawn_bridge(&mut rt);
    let device = rt
        .spawn_child(InstanceConfig::Device(DeviceConfig::new("DEV1")), bridge)
        .unwrap();
    let konf = rt
        .spawn_child(InstanceConfig::Konfigurator(KonfiguratorConfig::default()), bridge)
        .unwrap();

    publish(&mut rt, config_topic, &smoke_announcement());
    let entities: Value =
        serde_json::from_str(&rt.attributes(device).get(attributes::ENTITIES)).unwrap();
    assert_eq!(entities["DEV1_ENT1_smokealarm"]["discovery_topic"], json!(config_topic));
    assert_eq!(inventory(&mut rt, konf).len(), 1);

    rt.deliver_bus_message(config_topic, b"");

    let entities: Value =
        serde_json::from_str(&rt.attributes(device).get(attributes::ENTITIES)).unwrap();
    assert_eq!(entities["DEV1_ENT1_smokealarm"], Value::Null);
    assert!(entities.get("ENT1").is_none());
    assert!(inventory(&mut rt, konf).is_empty());
    assert_eq!(
        rt.call(konf, PeerCall::Provision { device_id: String::new() }).unwrap(),
        PeerReply::Count(0)
    );

    publish(&mut rt, STATE_TOPIC, &json!({"status": "1"}));
    assert_eq!(rt.variable(device, "SmokeDetected"), None);
}

#[test]
fn test_tombstone_for_unknown_topic_is_ignored() {
    let (mut rt, _bus) = runtime();
    let bridge = spawn_bridge(&mut rt);
    rt.deliver_bus_message("homeassistant/binary_sensor/DEV9/ENT9/config", b"");

    let Ok(PeerReply::Cache(cache)) = rt.call(bridge, PeerCall::GetDiscoveryCache) else {
        panic!("bridge cache expected");
    };
    assert_eq!(cache, json!({}));
}

#[test]
fn test_retry_gives_up_after_twelve_ticks() {
    let (mut rt, _bus) = runtime();
    let device = rt.spawn(InstanceConfig::Device(DeviceConfig::new("DEV1"))).unwrap();
    assert_eq!(rt.instance_status(device), Some(status::INACTIVE));
    assert!(rt.timer_armed(device, timers::AUTO_CONNECT));

    for _ in 0..11 {
        rt.advance(Duration::from_secs(1));
        assert_eq!(rt.instance_status(device), Some(status::INACTIVE));
    }
    rt.advance(Duration::from_secs(1));
    assert_eq!(rt.instance_status(device), Some(status::RETRIES_EXHAUSTED));
    assert!(!rt.timer_armed(device, timers::AUTO_CONNECT));
    assert_eq!(rt.attributes(device).get_int(attributes::AUTO_CONNECT_TRIES), 12);

    // A bridge appearing later is only picked up on manual activation
    let bridge = spawn_bridge(&mut rt);
    rt.advance(Duration::from_secs(1));
    assert_eq!(rt.instance_status(device), Some(status::RETRIES_EXHAUSTED));

    rt.apply_changes(device).unwrap();
    assert_eq!(rt.instance_status(device), Some(status::ACTIVE));
    assert_eq!(rt.parent_of(device), Some(bridge));
    assert_eq!(rt.attributes(device).get_int(attributes::AUTO_CONNECT_TRIES), 0);
}

#[test]
fn test_retry_attaches_when_bridge_appears() {
    let (mut rt, _bus) = runtime();
    let device = rt.spawn(InstanceConfig::Device(DeviceConfig::new("DEV1"))).unwrap();
    for _ in 0..5 {
        rt.advance(Duration::from_secs(1));
    }
    assert_eq!(rt.attributes(device).get_int(attributes::AUTO_CONNECT_TRIES), 5);

    let bridge = spawn_bridge(&mut rt);
    rt.advance(Duration::from_secs(1));
    assert_eq!(rt.instance_status(device), Some(status::ACTIVE));
    assert_eq!(rt.parent_of(device), Some(bridge));
    assert!(!rt.timer_armed(device, timers::AUTO_CONNECT));
}

#[test]
fn test_two_active_bridges_are_ambiguous() {
    let (mut rt, _bus) = runtime();
    spawn_bridge(&mut rt);
    spawn_bridge(&mut rt);
    let device = rt.spawn(InstanceConfig::Device(DeviceConfig::new("DEV1"))).unwrap();
    assert_eq!(rt.instance_status(device), Some(status::INACTIVE));
    assert_eq!(rt.parent_of(device), None);
}

#[test]
fn test_bridge_waits_for_bus() {
    let bus = MemoryBus::default();
    let mut rt = Runtime::new(Arc::new(MemoryBackend::default())).with_bus(bus.clone());
    let bridge = spawn_bridge(&mut rt);
    assert_eq!(rt.instance_status(bridge), Some(status::INACTIVE));
    assert!(bus.subscriptions().is_empty());

    bus.set_connected(true);
    rt.activate_kind(xsense_devices::InstanceKind::Bridge);
    assert_eq!(rt.instance_status(bridge), Some(status::ACTIVE));
    assert_eq!(rt.summary(bridge), Some("homeassistant/binary_sensor"));
    assert_eq!(
        bus.subscriptions(),
        vec![
            "homeassistant/binary_sensor/+/+/config".to_string(),
            "homeassistant/binary_sensor/+/+/state".to_string(),
        ]
    );
}

fn discover_two_devices(rt: &mut Runtime) {
    publish(rt, SMOKE_TOPIC.replace("DEV1", "SBS10").as_str(), &json!({
        "unique_id": "SBS10_E1_smokealarm",
        "state_topic": "SBS10/E1/state",
        "payload_on": "1",
        "payload_off": "0",
        "device": {"identifiers": ["SBS10"], "name": "Smoke Alarm(Kitchen)", "model": "XS01-M"}
    }));
    publish(rt, "homeassistant/binary_sensor/SBS10/SBS10_E1_battery/config", &json!({
        "unique_id": "SBS10_E1_battery",
        "state_topic": "SBS10/E1/state",
        "device": {"identifiers": ["SBS10"], "name": "Smoke Alarm(Kitchen)", "model": "XS01-M"}
    }));
    publish(rt, "homeassistant/binary_sensor/sbs2/sbs2_E1_online/config", &json!({
        "unique_id": "sbs2_E1_online",
        "state_topic": "sbs2/E1/state",
        "payload_on": "online",
        "payload_off": "offline"
    }));
}

fn inventory(rt: &mut Runtime, konf: InstanceId) -> Vec<xsense_devices::InventoryRow> {
    match rt.call(konf, PeerCall::Inventory).unwrap() {
        PeerReply::Inventory(rows) => rows,
        other => panic!("unexpected reply {:?}", other),
    }
}

#[test]
fn test_konfigurator_inventory_and_provisioning() {
    let (mut rt, _bus) = runtime();
    let bridge = spawn_bridge(&mut rt);
    discover_two_devices(&mut rt);

    let konf = rt
        .spawn_child(InstanceConfig::Konfigurator(KonfiguratorConfig::default()), bridge)
        .unwrap();
    assert_eq!(rt.instance_status(konf), Some(status::ACTIVE));
    assert_eq!(rt.summary(konf), Some("2 devices"));

    let rows = inventory(&mut rt, konf);
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].device_id, "sbs2");
    assert_eq!(rows[0].name, "sbs2");
    assert_eq!(rows[1].device_id, "SBS10");
    assert_eq!(rows[1].name, "Smoke Alarm (Kitchen)");
    assert_eq!(rows[1].model, "XS01-M");
    assert_eq!(rows[1].entities, vec!["battery".to_string(), "smokealarm".to_string()]);
    assert!(rows.iter().all(|r| r.instance_id.is_none()));

    let created = rt
        .call(konf, PeerCall::Provision { device_id: "SBS10".to_string() })
        .unwrap();
    assert_eq!(created, PeerReply::Count(1));

    let rows = inventory(&mut rt, konf);
    let device = rows[1].instance_id.expect("provisioned instance");
    assert_eq!(rt.parent_of(device), Some(bridge));
    assert_eq!(rt.instance_status(device), Some(status::ACTIVE));
    assert!(rt.variables(device).unwrap().get("SmokeDetected").is_some());
    assert!(rt.variables(device).unwrap().get("BatteryLow").is_some());

    // Remaining devices, then nothing left to do
    assert_eq!(
        rt.call(konf, PeerCall::Provision { device_id: String::new() }).unwrap(),
        PeerReply::Count(1)
    );
    assert_eq!(
        rt.call(konf, PeerCall::Provision { device_id: String::new() }).unwrap(),
        PeerReply::Count(0)
    );
    assert!(inventory(&mut rt, konf).iter().all(|r| r.instance_id.is_some()));

    let err = rt
        .call(konf, PeerCall::Provision { device_id: "UNKNOWN".to_string() })
        .unwrap_err();
    assert!(matches!(err, RoleError::Core(CoreError::UnresolvedReference(_))));
}

#[test]
fn test_konfigurator_sync_to_devices() {
    let (mut rt, _bus) = runtime();
    let bridge = spawn_bridge(&mut rt);
    let konf = rt
        .spawn_child(InstanceConfig::Konfigurator(KonfiguratorConfig::default()), bridge)
        .unwrap();
    // Receive filters are case-sensitive, so only the sync reaches it
    let device = rt
        .spawn_child(InstanceConfig::Device(DeviceConfig::new("sbs10")), bridge)
        .unwrap();
    discover_two_devices(&mut rt);
    assert!(rt.variables(device).unwrap().is_empty());

    let reply = rt.call(konf, PeerCall::SyncDiscovery).unwrap();
    assert_eq!(reply, PeerReply::Count(2));
    assert!(rt.variables(device).unwrap().get("SmokeDetected").is_some());
    assert!(rt.variables(device).unwrap().get("BatteryLow").is_some());
    assert_eq!(rt.instance_config(device).unwrap().device_id(), Some("sbs10"));
}

#[test]
fn test_restart_from_redb() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("xsense.redb");

    let (bridge, device) = {
        let backend: SharedBackend = Arc::new(RedbBackend::open(&path).unwrap());
        let mut rt = Runtime::new(backend).with_bus(MemoryBus::connected());
        let bridge = spawn_bridge(&mut rt);
        let device = rt
            .spawn_child(InstanceConfig::Device(DeviceConfig::new("DEV1")), bridge)
            .unwrap();
        publish(&mut rt, SMOKE_TOPIC, &smoke_announcement());
        (bridge, device)
    };

    let backend: SharedBackend = Arc::new(RedbBackend::open(&path).unwrap());
    let bus = MemoryBus::connected();
    let mut rt = Runtime::restore(backend).unwrap().with_bus(bus.clone());
    rt.activate_all();

    assert_eq!(rt.instance_status(bridge), Some(status::ACTIVE));
    assert_eq!(rt.instance_status(device), Some(status::ACTIVE));
    assert!(bus.subscriptions().contains(&STATE_TOPIC.to_string()));
    assert!(rt.variables(device).unwrap().get("SmokeDetected").is_some());

    publish(&mut rt, STATE_TOPIC, &json!({"status": "1"}));
    assert_eq!(rt.variable(device, "SmokeDetected"), Some(VariableValue::Boolean(true)));

    // New instances do not reuse restored ids
    let konf = rt
        .spawn_child(InstanceConfig::Konfigurator(KonfiguratorConfig::default()), bridge)
        .unwrap();
    assert!(konf > device);
}
