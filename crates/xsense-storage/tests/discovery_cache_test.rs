//! Discovery cache integration tests
//!
//! - Persistence across a reopened redb file
//! - Replay filtering by device id
//! - Descriptor cache lookups

use std::sync::Arc;

use serde_json::json;
use xsense_core::entity::{DeviceInfo, EntityDescriptor};
use xsense_core::storage::SharedBackend;
use xsense_storage::{
    AttributeStore, CacheLookup, DiscoveryCache, MemoryBackend, RawAnnouncement, RedbBackend,
};

const ATTRIBUTE: &str = "DiscoveryCache";

fn announcement(unique_id: &str, state_topic: &str) -> RawAnnouncement {
    RawAnnouncement::new(
        json!({"unique_id": unique_id, "state_topic": state_topic}).to_string(),
    )
}

fn descriptor(unique_id: &str, state_topic: &str, device_id: &str) -> EntityDescriptor {
    let mut desc = EntityDescriptor {
        unique_id: unique_id.to_string(),
        state_topic: state_topic.to_string(),
        device: DeviceInfo {
            id: device_id.to_string(),
            name: device_id.to_string(),
            ..Default::default()
        },
        ..Default::default()
    };
    desc.complete_suffix();
    desc
}

#[test]
fn test_cache_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("xsense.redb");
    let topic = "homeassistant/binary_sensor/A/E1/config";
    let removed = "homeassistant/binary_sensor/A/E2/config";

    {
        let backend: SharedBackend = Arc::new(RedbBackend::open(&path).unwrap());
        let mut cache = DiscoveryCache::open(AttributeStore::new(backend, "bridge"), ATTRIBUTE);
        cache.upsert(topic, announcement("A_E1_online", "A/E1/state")).unwrap();
        cache.upsert(removed, announcement("A_E2_battery", "A/E2/state")).unwrap();
        cache.upsert(removed, RawAnnouncement::new("")).unwrap();
    }

    let backend: SharedBackend = Arc::new(RedbBackend::open(&path).unwrap());
    assert!(backend.is_persistent());
    let cache: DiscoveryCache<RawAnnouncement> =
        DiscoveryCache::open(AttributeStore::new(backend, "bridge"), ATTRIBUTE);

    assert_eq!(cache.len(), 1);
    assert_eq!(cache.get(topic), Some(&announcement("A_E1_online", "A/E1/state")));
    assert_eq!(cache.lookup(removed), CacheLookup::Tombstone);
}

#[test]
fn test_replay_filters_by_device() {
    let backend: SharedBackend = Arc::new(MemoryBackend::default());
    let mut cache = DiscoveryCache::open(AttributeStore::new(backend, "bridge"), ATTRIBUTE);

    cache
        .upsert("homeassistant/binary_sensor/A/E1/config", announcement("A_E1_online", "A/E1/state"))
        .unwrap();
    cache
        .upsert("homeassistant/binary_sensor/A/E2/config", announcement("A_E2_smokealarm", "A/E2/state"))
        .unwrap();
    cache
        .upsert("homeassistant/binary_sensor/B/E1/config", announcement("B_E1_online", "B/E1/state"))
        .unwrap();
    cache
        .upsert("homeassistant/binary_sensor/A/E2/config", RawAnnouncement::new(""))
        .unwrap();

    let only_a = cache.replay("A");
    assert_eq!(only_a.len(), 1);
    assert_eq!(only_a[0].0, "homeassistant/binary_sensor/A/E1/config");

    // case-insensitive match
    assert_eq!(cache.replay("a").len(), 1);

    let all = cache.replay("");
    assert_eq!(all.len(), 2);

    // Replay is repeatable
    assert_eq!(cache.replay(""), all);
}

#[test]
fn test_replay_matches_payload_identifiers() {
    let backend: SharedBackend = Arc::new(MemoryBackend::default());
    let mut cache = DiscoveryCache::open(AttributeStore::new(backend, "bridge"), ATTRIBUTE);

    let payload = json!({
        "unique_id": "SBS1_E1_online",
        "state_topic": "SBS1/E1/state",
        "device": {"identifiers": [["xsense", "SBS1"]]}
    });
    cache.upsert("cfg/config", RawAnnouncement::new(payload.to_string())).unwrap();

    assert_eq!(cache.replay("sbs1").len(), 1);
    assert!(cache.replay("SBS2").is_empty());
}

#[test]
fn test_descriptor_cache_lookups() {
    let backend: SharedBackend = Arc::new(MemoryBackend::default());
    let store = AttributeStore::new(backend, "device");
    let mut cache = DiscoveryCache::open(store.clone(), "Entities");

    let status = descriptor("A_E1_smokealarm", "A/E1/state", "A");
    let battery = descriptor("A_E1_battery", "A/E1/state", "A");
    let other = descriptor("B_E1_online", "B/E1/state", "B");

    cache.upsert(&status.unique_id.clone(), status.clone()).unwrap();
    cache.upsert(&battery.unique_id.clone(), battery).unwrap();
    cache.upsert(&other.unique_id.clone(), other).unwrap();

    assert_eq!(cache.find_by_state_topic("A/E1/state").len(), 2);
    assert_eq!(cache.find_by_device_id("A", false).len(), 2);
    assert_eq!(cache.find_by_device_id("b", true).len(), 1);
    assert!(cache.find_by_device_id("b", false).is_empty());

    // Reopen from the same attribute store
    let reopened: DiscoveryCache<EntityDescriptor> = DiscoveryCache::open(store, "Entities");
    assert_eq!(reopened.get("A_E1_smokealarm"), Some(&status));
    assert_eq!(reopened.len(), 3);
}
