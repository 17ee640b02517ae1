//! Durable discovery cache.
//!
//! The cache maps a key to one announcement and lives as a single JSON object
//! in an instance attribute. Every mutation writes the whole object through
//! to the attribute store, which stays the source of truth across restarts.
//!
//! Two record flavours exist:
//!
//! * [`RawAnnouncement`]: the Bridge keeps the decoded payload keyed by topic.
//!   A stored `""` is a tombstone.
//! * [`EntityDescriptor`]: Devices and the Konfigurator key parsed
//!   descriptors by `unique_id`. A stored `null` is a tombstone.
//!
//! A tombstone means "removed", which is distinct from a key never seen.

use std::collections::BTreeMap;

use serde_json::{Map, Value};
use xsense_core::discovery::scalar_string;
use xsense_core::entity::EntityDescriptor;
use xsense_core::topic;

use crate::attributes::AttributeStore;
use crate::error::Result;

/// A value the discovery cache can hold.
pub trait CacheRecord: Clone + PartialEq + Sized {
    /// Persisted form of a live record.
    fn to_json(&self) -> Value;

    /// Decode a persisted live record; `None` skips a malformed entry.
    fn from_json(value: &Value) -> Option<Self>;

    /// Persisted form of a tombstone.
    fn tombstone_json() -> Value;

    /// Check if a persisted value is a tombstone.
    fn is_tombstone_json(value: &Value) -> bool;

    /// Records that encode a deletion when upserted.
    fn is_tombstone(&self) -> bool {
        false
    }

    /// State topic announced by the record, if any.
    fn state_topic(&self, key: &str) -> Option<String>;

    /// Check if the record belongs to a device.
    fn belongs_to(&self, key: &str, device_id: &str, case_insensitive: bool) -> bool;

    /// Check if the record was announced on a config topic.
    fn announced_on(&self, key: &str, config_topic: &str) -> bool;
}

/// Decoded discovery payload as received by the Bridge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawAnnouncement(pub String);

impl RawAnnouncement {
    pub fn new(payload: impl Into<String>) -> Self {
        Self(payload.into())
    }

    pub fn payload(&self) -> &str {
        &self.0
    }

    fn object(&self) -> Option<Map<String, Value>> {
        match serde_json::from_str::<Value>(&self.0).ok()? {
            Value::Object(map) => Some(map),
            _ => None,
        }
    }
}

fn same_id(a: &str, b: &str, case_insensitive: bool) -> bool {
    if case_insensitive {
        a.eq_ignore_ascii_case(b)
    } else {
        a == b
    }
}

impl CacheRecord for RawAnnouncement {
    fn to_json(&self) -> Value {
        Value::String(self.0.clone())
    }

    fn from_json(value: &Value) -> Option<Self> {
        value.as_str().map(RawAnnouncement::new)
    }

    fn tombstone_json() -> Value {
        Value::String(String::new())
    }

    fn is_tombstone_json(value: &Value) -> bool {
        matches!(value, Value::String(s) if s.is_empty())
    }

    fn is_tombstone(&self) -> bool {
        self.0.is_empty()
    }

    fn state_topic(&self, _key: &str) -> Option<String> {
        let topic = scalar_string(self.object()?.get("state_topic"));
        let topic = topic.trim();
        if topic.is_empty() {
            None
        } else {
            Some(topic.to_string())
        }
    }

    fn belongs_to(&self, key: &str, device_id: &str, case_insensitive: bool) -> bool {
        let from_topic = topic::token(key, 3);
        if !from_topic.is_empty() && same_id(from_topic, device_id, case_insensitive) {
            return true;
        }
        self.object()
            .and_then(|obj| topic::device_identifier_of(obj.get("device")))
            .map(|id| same_id(&id, device_id, case_insensitive))
            .unwrap_or(false)
    }

    fn announced_on(&self, key: &str, config_topic: &str) -> bool {
        key == config_topic
    }
}

impl CacheRecord for EntityDescriptor {
    fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or_else(|_| Value::Object(Map::new()))
    }

    fn from_json(value: &Value) -> Option<Self> {
        serde_json::from_value::<EntityDescriptor>(value.clone())
            .ok()
            .filter(EntityDescriptor::is_valid)
    }

    fn tombstone_json() -> Value {
        Value::Null
    }

    fn is_tombstone_json(value: &Value) -> bool {
        value.is_null()
    }

    fn state_topic(&self, _key: &str) -> Option<String> {
        Some(self.state_topic.clone())
    }

    fn belongs_to(&self, _key: &str, device_id: &str, case_insensitive: bool) -> bool {
        EntityDescriptor::belongs_to(self, device_id, case_insensitive)
    }

    fn announced_on(&self, _key: &str, config_topic: &str) -> bool {
        self.discovery_topic == config_topic
    }
}

/// Result of a cache lookup.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CacheLookup<'a, R> {
    /// Never seen.
    Missing,
    /// Removed by an empty announcement.
    Tombstone,
    Live(&'a R),
}

/// Durable discovery cache backed by one instance attribute.
#[derive(Debug)]
pub struct DiscoveryCache<R: CacheRecord> {
    store: AttributeStore,
    attribute: String,
    entries: BTreeMap<String, Option<R>>,
}

impl<R: CacheRecord> DiscoveryCache<R> {
    /// Load the cache from `attribute`.
    ///
    /// A malformed or non-object attribute yields an empty cache; malformed
    /// individual entries are skipped.
    pub fn open(store: AttributeStore, attribute: &str) -> Self {
        let mut cache = Self {
            store,
            attribute: attribute.to_string(),
            entries: BTreeMap::new(),
        };
        cache.reload();
        cache
    }

    /// Re-read the attribute, dropping in-memory state.
    pub fn reload(&mut self) {
        let raw = self.store.get(&self.attribute);
        self.entries = decode_entries::<R>(&raw).unwrap_or_else(|| {
            tracing::warn!(
                instance = %self.store.instance(),
                attribute = %self.attribute,
                "malformed discovery cache, starting empty"
            );
            BTreeMap::new()
        });
    }

    /// Insert or replace a record. Tombstone records delete the key.
    ///
    /// Returns whether the cache changed; an identical upsert writes nothing.
    /// A tombstone for a key never seen is ignored.
    pub fn upsert(&mut self, key: &str, value: R) -> Result<bool> {
        if value.is_tombstone() {
            return self.remove(key);
        }
        let next = Some(value);
        if self.entries.get(key) == Some(&next) {
            return Ok(false);
        }
        self.commit(key, next)
    }

    /// Tombstone a live key. Returns whether the cache changed.
    pub fn remove(&mut self, key: &str) -> Result<bool> {
        if self.get(key).is_none() {
            return Ok(false);
        }
        self.commit(key, None)
    }

    /// Key of the live record announced on `config_topic`, else `fallback`
    /// when that key is live.
    pub fn key_for_config_topic(&self, config_topic: &str, fallback: &str) -> Option<String> {
        self.all()
            .find(|(k, r)| r.announced_on(k, config_topic))
            .map(|(k, _)| k.to_string())
            .or_else(|| self.get(fallback).map(|_| fallback.to_string()))
    }

    /// Tombstone whatever was announced on `config_topic`.
    ///
    /// Returns the removed key, `None` when nothing live matched.
    pub fn remove_announced(&mut self, config_topic: &str, fallback: &str) -> Result<Option<String>> {
        let Some(key) = self.key_for_config_topic(config_topic, fallback) else {
            return Ok(None);
        };
        self.remove(&key)?;
        Ok(Some(key))
    }

    /// Live record for a key.
    pub fn get(&self, key: &str) -> Option<&R> {
        self.entries.get(key).and_then(Option::as_ref)
    }

    pub fn lookup(&self, key: &str) -> CacheLookup<'_, R> {
        match self.entries.get(key) {
            None => CacheLookup::Missing,
            Some(None) => CacheLookup::Tombstone,
            Some(Some(record)) => CacheLookup::Live(record),
        }
    }

    /// All live records in key order.
    pub fn all(&self) -> impl Iterator<Item = (&str, &R)> + '_ {
        self.entries
            .iter()
            .filter_map(|(k, v)| v.as_ref().map(|r| (k.as_str(), r)))
    }

    /// Number of live records.
    pub fn len(&self) -> usize {
        self.all().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Live records announcing `state_topic`. Several entities may share one.
    pub fn find_by_state_topic(&self, state_topic: &str) -> Vec<(&str, &R)> {
        self.all()
            .filter(|(k, r)| r.state_topic(k).as_deref() == Some(state_topic))
            .collect()
    }

    /// Live records owned by `device_id`.
    pub fn find_by_device_id(&self, device_id: &str, case_insensitive: bool) -> Vec<(&str, &R)> {
        self.all()
            .filter(|(k, r)| r.belongs_to(k, device_id, case_insensitive))
            .collect()
    }

    /// State topics of every live record.
    pub fn state_topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.all().filter_map(|(k, r)| r.state_topic(k)).collect();
        topics.sort();
        topics.dedup();
        topics
    }

    /// Entries to re-deliver: live records of `device_filter` (matched
    /// case-insensitively), or every live record when the filter is empty.
    pub fn replay(&self, device_filter: &str) -> Vec<(String, R)> {
        let filter = device_filter.trim();
        self.all()
            .filter(|(k, r)| filter.is_empty() || r.belongs_to(k, filter, true))
            .map(|(k, r)| (k.to_string(), r.clone()))
            .collect()
    }

    /// Persisted JSON object, tombstones included.
    pub fn to_json(&self) -> Value {
        encode_entries(&self.entries)
    }

    /// Persist the cache with `key` set to `value`, then apply it in memory.
    /// On a failed write the in-memory entries are left untouched.
    fn commit(&mut self, key: &str, value: Option<R>) -> Result<bool> {
        let mut next = self.entries.clone();
        next.insert(key.to_string(), value);

        let text = serde_json::to_string(&encode_entries(&next))?;
        if let Err(e) = self.store.put(&self.attribute, &text) {
            tracing::error!(
                instance = %self.store.instance(),
                attribute = %self.attribute,
                error = %e,
                "failed to persist discovery cache"
            );
            return Err(e);
        }
        self.entries = next;
        Ok(true)
    }
}

fn encode_entries<R: CacheRecord>(entries: &BTreeMap<String, Option<R>>) -> Value {
    let map: Map<String, Value> = entries
        .iter()
        .map(|(k, v)| {
            let value = v.as_ref().map(R::to_json).unwrap_or_else(R::tombstone_json);
            (k.clone(), value)
        })
        .collect();
    Value::Object(map)
}

/// Decode a persisted cache object. `None` if the text is not a JSON object.
pub fn decode_entries<R: CacheRecord>(raw: &str) -> Option<BTreeMap<String, Option<R>>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Some(BTreeMap::new());
    }
    let Value::Object(map) = serde_json::from_str::<Value>(raw).ok()? else {
        return None;
    };

    let mut entries = BTreeMap::new();
    for (key, value) in map {
        if R::is_tombstone_json(&value) {
            entries.insert(key, None);
        } else if let Some(record) = R::from_json(&value) {
            entries.insert(key, Some(record));
        } else {
            tracing::debug!(key = %key, "skipping malformed cache entry");
        }
    }
    Some(entries)
}
