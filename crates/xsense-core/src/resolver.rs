//! Variable type and identity resolution.
//!
//! Maps an [`EntityDescriptor`] onto a typed, named and positioned output
//! variable. Well-known vendor suffixes get fixed identifiers; everything else
//! falls back to an identifier derived from the unique id.

use serde::{Deserialize, Serialize};

use crate::entity::{DeviceInfo, EntityDescriptor};
use crate::topic::sanitize_ident;

/// Units that imply a floating point value.
const FLOAT_UNITS: &[&str] = &[
    "°C", "°F", "K", "%", "hPa", "Pa", "W", "kW", "kWh", "V", "A", "Hz", "lx",
];

/// Position of entity variables without a known suffix.
pub const DEFAULT_POSITION: i32 = 20;

/// Fixed device-level variable idents.
pub mod idents {
    pub const MANUFACTURER: &str = "Manufacturer";
    pub const MODEL: &str = "Model";
    pub const FIRMWARE: &str = "Firmware";
    pub const LAST_SEEN: &str = "LastSeen";
    pub const BATTERY: &str = "Battery";
}

/// Data type of an output variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VariableType {
    Boolean,
    Integer,
    Float,
    String,
}

/// A typed variable value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum VariableValue {
    Boolean(bool),
    Integer(i64),
    Float(f64),
    String(String),
}

impl VariableValue {
    /// Type of this value.
    pub fn kind(&self) -> VariableType {
        match self {
            Self::Boolean(_) => VariableType::Boolean,
            Self::Integer(_) => VariableType::Integer,
            Self::Float(_) => VariableType::Float,
            Self::String(_) => VariableType::String,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }
}

/// Definition of a variable to ensure in the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariableSpec {
    pub ident: String,
    pub kind: VariableType,
    pub name: String,
    pub position: i32,
}

impl VariableSpec {
    pub fn new(ident: &str, kind: VariableType, name: &str, position: i32) -> Self {
        Self {
            ident: ident.to_string(),
            kind,
            name: name.to_string(),
            position,
        }
    }
}

/// Well-known entity suffix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KnownSuffix {
    pub suffix: &'static str,
    pub ident: &'static str,
    pub name: &'static str,
    pub position: i32,
}

/// Suffixes published by X-Sense alarms.
pub const KNOWN_SUFFIXES: &[KnownSuffix] = &[
    KnownSuffix { suffix: "online", ident: "Online", name: "Online", position: 10 },
    KnownSuffix { suffix: "battery", ident: "BatteryLow", name: "Battery Low", position: 11 },
    KnownSuffix { suffix: "lifeend", ident: "EndOfLife", name: "End Of Life", position: 12 },
    KnownSuffix { suffix: "smokealarm", ident: "SmokeDetected", name: "Smoke Detected", position: 13 },
    KnownSuffix { suffix: "smokefault", ident: "SmokeFault", name: "Smoke Fault", position: 14 },
];

/// Look up a known suffix.
pub fn known_suffix(suffix: &str) -> Option<&'static KnownSuffix> {
    KNOWN_SUFFIXES.iter().find(|k| k.suffix == suffix)
}

/// Policy for entities whose suffix is not in [`KNOWN_SUFFIXES`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentPolicy {
    /// Expose unknown entities under a derived ident
    pub create_unknown_entities: bool,
}

impl Default for IdentPolicy {
    fn default() -> Self {
        Self {
            create_unknown_entities: true,
        }
    }
}

/// Infer the variable type of an entity.
pub fn resolve_kind(desc: &EntityDescriptor) -> VariableType {
    if desc.has_binary_payloads() || desc.component == "binary_sensor" {
        return VariableType::Boolean;
    }
    if FLOAT_UNITS.contains(&desc.unit_of_measurement.trim()) {
        return VariableType::Float;
    }
    VariableType::String
}

/// Resolve the variable ident of an entity.
///
/// Returns an empty string when the suffix is unknown and the policy does not
/// allow unknown entities.
pub fn resolve_ident(desc: &EntityDescriptor, policy: IdentPolicy) -> String {
    if let Some(known) = known_suffix(&desc.suffix) {
        return known.ident.to_string();
    }
    if !policy.create_unknown_entities {
        return String::new();
    }
    let source = if desc.unique_id.is_empty() {
        desc.suffix.as_str()
    } else {
        desc.unique_id.as_str()
    };
    sanitize_ident(&format!("Entity_{}", source))
}

/// Resolve the display name of an entity variable.
pub fn resolve_name(desc: &EntityDescriptor) -> String {
    if let Some(known) = known_suffix(&desc.suffix) {
        return known.name.to_string();
    }
    let name = desc.name.trim();
    if !name.is_empty() {
        return name.to_string();
    }
    let class = desc.device_class.trim();
    if !class.is_empty() {
        return title_case(class);
    }
    let suffix = desc.suffix.trim();
    if suffix.is_empty() {
        "Entity".to_string()
    } else {
        format!("Entity {}", suffix)
    }
}

/// Resolve the sort position of an entity variable.
pub fn resolve_position(desc: &EntityDescriptor) -> i32 {
    known_suffix(&desc.suffix)
        .map(|k| k.position)
        .unwrap_or(DEFAULT_POSITION)
}

/// Full variable definition for an entity, if it is exposed at all.
pub fn entity_variable(desc: &EntityDescriptor) -> Option<VariableSpec> {
    if desc.ident.is_empty() {
        return None;
    }
    Some(VariableSpec {
        ident: desc.ident.clone(),
        kind: resolve_kind(desc),
        name: resolve_name(desc),
        position: resolve_position(desc),
    })
}

/// Device-level variables every Device instance carries.
pub fn device_info_variables() -> Vec<VariableSpec> {
    vec![
        VariableSpec::new(idents::MANUFACTURER, VariableType::String, "Manufacturer", 1),
        VariableSpec::new(idents::MODEL, VariableType::String, "Model", 2),
        VariableSpec::new(idents::FIRMWARE, VariableType::String, "Firmware", 3),
        VariableSpec::new(idents::LAST_SEEN, VariableType::Integer, "Last Seen", 4),
    ]
}

/// Values for the device-level string variables.
pub fn device_info_values(device: &DeviceInfo) -> Vec<(&'static str, VariableValue)> {
    vec![
        (idents::MANUFACTURER, VariableValue::String(device.manufacturer.clone())),
        (idents::MODEL, VariableValue::String(device.model.clone())),
        (idents::FIRMWARE, VariableValue::String(device.sw_version.clone())),
    ]
}

/// Battery percentage variable.
pub fn battery_variable() -> VariableSpec {
    VariableSpec::new(idents::BATTERY, VariableType::Integer, "Battery", 25)
}

fn title_case(raw: &str) -> String {
    raw.split(['_', ' '])
        .filter(|w| !w.is_empty())
        .map(|w| {
            let mut chars = w.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}
