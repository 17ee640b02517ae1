//! Canonical entity model produced from discovery announcements.

use serde::{Deserialize, Serialize};

use crate::topic;

/// Metadata about the physical device that owns one or more entities.
///
/// Entities share a `DeviceInfo` by `id`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceInfo {
    /// Identity key (topic token or resolved `identifiers`)
    pub id: String,
    /// Display name, defaults to `id`
    pub name: String,
    pub manufacturer: String,
    pub model: String,
    /// Firmware version
    pub sw_version: String,
}

/// One discovered data point.
///
/// Serializing a struct directly emits fields in declaration order. Once a
/// descriptor passes through `serde_json::Value` (the persisted caches),
/// keys come out sorted; either form parses back to an equal descriptor.
/// Absent optional strings are stored as empty strings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EntityDescriptor {
    /// Vendor-assigned id, unique within a device
    pub unique_id: String,

    /// Friendly name (may be empty)
    pub name: String,

    /// Classification such as `binary_sensor`
    pub component: String,

    /// Topic whose payloads update this entity
    pub state_topic: String,

    pub device_class: String,

    /// Payload meaning "on" (presence implies boolean semantics)
    pub payload_on: String,

    /// Payload meaning "off"
    pub payload_off: String,

    pub unit_of_measurement: String,

    /// Expression selecting a field out of a JSON state payload
    pub value_template: String,

    /// Lower-cased tail of `unique_id`
    pub suffix: String,

    /// Stable variable identifier, empty when the entity is not exposed
    pub ident: String,

    /// Owning device
    pub device: DeviceInfo,

    /// Config topic the announcement arrived on, empty when unknown
    pub discovery_topic: String,
}

impl EntityDescriptor {
    /// A descriptor is storable only with a unique id and a state topic.
    pub fn is_valid(&self) -> bool {
        !self.unique_id.trim().is_empty() && !self.state_topic.trim().is_empty()
    }

    /// Identity of the owning device.
    ///
    /// Prefers the device token of the state topic (`<dev>/<obj>/state`) and
    /// falls back to `device.id`.
    pub fn owner_device_id(&self) -> &str {
        let from_topic = topic::token(&self.state_topic, 3);
        if from_topic.is_empty() {
            self.device.id.as_str()
        } else {
            from_topic
        }
    }

    /// Check if this descriptor belongs to `device_id`.
    pub fn belongs_to(&self, device_id: &str, case_insensitive: bool) -> bool {
        let owner = self.owner_device_id();
        if case_insensitive {
            owner.eq_ignore_ascii_case(device_id)
        } else {
            owner == device_id
        }
    }

    /// Fill in the derived suffix if it is missing.
    pub fn complete_suffix(&mut self) {
        if self.suffix.is_empty() {
            self.suffix = topic::extract_suffix(&self.unique_id);
        }
    }

    /// Whether the descriptor declares explicit on/off payloads.
    pub fn has_binary_payloads(&self) -> bool {
        !self.payload_on.is_empty() || !self.payload_off.is_empty()
    }
}
