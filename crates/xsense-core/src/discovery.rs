//! Discovery announcement parsing.
//!
//! Vendor bridges publish retained announcements on
//! `<root>/<component>/<deviceId>/<objectId>/config`:
//!
//! ```json
//! {
//!   "unique_id": "SBS50148995FA_00000001_smokealarm",
//!   "name": "Smoke",
//!   "state_topic": "SBS50148995FA/00000001/state",
//!   "payload_on": "1",
//!   "payload_off": "0",
//!   "device": {
//!     "identifiers": ["SBS50148995FA"],
//!     "manufacturer": "X-Sense",
//!     "model": "XS01-M"
//!   }
//! }
//! ```
//!
//! An empty payload on the same topic removes the entity.

use serde::Deserialize;
use serde_json::{Map, Value};

use crate::entity::{DeviceInfo, EntityDescriptor};
use crate::error::{CoreError, Result};
use crate::resolver::{resolve_ident, IdentPolicy};
use crate::topic;

/// Raw view of a discovery payload.
///
/// Scalar fields are kept as JSON values because vendors publish numbers and
/// booleans where strings are expected.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub unique_id: Option<Value>,
    pub name: Option<Value>,
    pub component: Option<Value>,
    pub state_topic: Option<Value>,
    pub device_class: Option<Value>,
    pub payload_on: Option<Value>,
    pub payload_off: Option<Value>,
    pub unit_of_measurement: Option<Value>,
    pub value_template: Option<Value>,
    pub device: Option<Value>,
    /// Present on descriptors forwarded between instances
    pub discovery_topic: Option<Value>,
}

/// Outcome of parsing one announcement.
#[derive(Debug, Clone, PartialEq)]
pub enum Discovery {
    /// The announcement describes a live entity.
    Entity(EntityDescriptor),
    /// Empty payload: the entity announced on `topic` was removed.
    ///
    /// `unique_id` is the object id token of the topic. Caches keyed by
    /// `unique_id` resolve the topic first and use it only as a fallback.
    Removed { unique_id: String, topic: String },
}

/// Parse a discovery announcement with the default ident policy.
pub fn parse_discovery(topic: &str, payload: &str) -> Result<Discovery> {
    parse_discovery_with(topic, payload, IdentPolicy::default())
}

/// Parse a discovery announcement.
pub fn parse_discovery_with(topic: &str, payload: &str, policy: IdentPolicy) -> Result<Discovery> {
    let payload = payload.trim();
    if payload.is_empty() {
        return Ok(Discovery::Removed {
            unique_id: topic::token(topic, 2).to_string(),
            topic: topic.to_string(),
        });
    }

    let value = parse_object(payload)?;
    build_descriptor(Some(topic), value, policy).map(Discovery::Entity)
}

/// Parse a standalone entry such as a serialized descriptor pushed between
/// instances. The device id is taken from the state topic or `device`.
pub fn parse_entry(json: &str, policy: IdentPolicy) -> Result<EntityDescriptor> {
    let value = parse_object(json.trim())?;
    build_descriptor(None, value, policy)
}

/// MQTT subscription patterns for a topic root.
pub fn discovery_subscription_patterns(root: &str) -> Vec<String> {
    let root = topic::topic_root(root);
    vec![format!("{}/+/+/config", root), format!("{}/+/+/state", root)]
}

/// Stringify a scalar JSON value. Objects, arrays and null yield `""`.
pub fn scalar_string(value: Option<&Value>) -> String {
    match value {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        Some(Value::Bool(b)) => b.to_string(),
        _ => String::new(),
    }
}

fn parse_object(text: &str) -> Result<Value> {
    let value: Value = serde_json::from_str(text)
        .map_err(|e| CoreError::malformed(format!("invalid JSON: {}", e)))?;
    if !value.is_object() {
        return Err(CoreError::malformed("payload is not a JSON object"));
    }
    Ok(value)
}

fn build_descriptor(topic: Option<&str>, value: Value, policy: IdentPolicy) -> Result<EntityDescriptor> {
    let config: DiscoveryConfig = serde_json::from_value(value)
        .map_err(|e| CoreError::malformed(format!("invalid discovery payload: {}", e)))?;
    let topic = topic.unwrap_or("");

    let mut unique_id = scalar_string(config.unique_id.as_ref()).trim().to_string();
    if unique_id.is_empty() {
        unique_id = topic::token(topic, 2).to_string();
    }
    if unique_id.is_empty() {
        return Err(CoreError::malformed("unique_id missing"));
    }

    let state_topic = scalar_string(config.state_topic.as_ref()).trim().to_string();
    if state_topic.is_empty() {
        return Err(CoreError::malformed(format!("state_topic missing for {}", unique_id)));
    }

    let device_obj = config.device.as_ref().and_then(Value::as_object);
    let device_id = resolve_device_id(topic, &state_topic, device_obj);
    if device_id.is_empty() {
        return Err(CoreError::malformed(format!("device id missing for {}", unique_id)));
    }

    let mut component = scalar_string(config.component.as_ref()).trim().to_string();
    if component.is_empty() && topic.trim_matches('/').split('/').count() >= 5 {
        component = topic::token(topic, 4).to_string();
    }

    let device = build_device_info(device_id, device_obj);
    let discovery_topic = if topic.is_empty() {
        scalar_string(config.discovery_topic.as_ref()).trim().to_string()
    } else {
        topic.to_string()
    };

    let mut desc = EntityDescriptor {
        suffix: topic::extract_suffix(&unique_id),
        unique_id,
        name: scalar_string(config.name.as_ref()),
        component,
        state_topic,
        device_class: scalar_string(config.device_class.as_ref()),
        payload_on: scalar_string(config.payload_on.as_ref()),
        payload_off: scalar_string(config.payload_off.as_ref()),
        unit_of_measurement: scalar_string(config.unit_of_measurement.as_ref()),
        value_template: scalar_string(config.value_template.as_ref()),
        ident: String::new(),
        device,
        discovery_topic,
    };
    desc.ident = resolve_ident(&desc, policy);
    Ok(desc)
}

/// Device id resolution order: the config topic's device token, the state
/// topic's device token for standalone entries, then `device.id`, then
/// `device.identifiers`.
fn resolve_device_id(topic: &str, state_topic: &str, device: Option<&Map<String, Value>>) -> String {
    let from_topic = if topic.is_empty() {
        topic::token(state_topic, 3)
    } else {
        topic::token(topic, 3)
    };
    if !from_topic.is_empty() {
        return from_topic.to_string();
    }

    let Some(device) = device else {
        return String::new();
    };
    let explicit = scalar_string(device.get("id")).trim().to_string();
    if !explicit.is_empty() {
        return explicit;
    }
    device
        .get("identifiers")
        .and_then(topic::device_identifier)
        .unwrap_or_default()
}

fn build_device_info(id: String, device: Option<&Map<String, Value>>) -> DeviceInfo {
    let field = |key: &str| scalar_string(device.and_then(|d| d.get(key)));
    let mut name = field("name").trim().to_string();
    if name.is_empty() {
        name = id.clone();
    }
    DeviceInfo {
        id,
        name,
        manufacturer: field("manufacturer"),
        model: field("model"),
        sw_version: field("sw_version"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const TOPIC: &str = "homeassistant/binary_sensor/DEV1/ENT1/config";

    fn entity(result: Result<Discovery>) -> EntityDescriptor {
        match result.unwrap() {
            Discovery::Entity(desc) => desc,
            other => panic!("expected entity, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_smoke_alarm() {
        let payload = r#"{"unique_id":"DEV1_ENT1_smokealarm","state_topic":"DEV1/ENT1/state","payload_on":"1","payload_off":"0"}"#;
        let desc = entity(parse_discovery(TOPIC, payload));
        assert_eq!(desc.unique_id, "DEV1_ENT1_smokealarm");
        assert_eq!(desc.suffix, "smokealarm");
        assert_eq!(desc.ident, "SmokeDetected");
        assert_eq!(desc.component, "binary_sensor");
        assert_eq!(desc.device.id, "DEV1");
        assert_eq!(desc.device.name, "DEV1");
        assert_eq!(desc.discovery_topic, TOPIC);
    }

    #[test]
    fn test_parse_is_idempotent() {
        let payload = json!({
            "unique_id": "DEV1_ENT1_online",
            "state_topic": "DEV1/ENT1/state",
            "device": {"identifiers": ["x", "DEV1"], "name": "Hall", "manufacturer": "X-Sense"}
        })
        .to_string();
        let a = serde_json::to_string(&entity(parse_discovery(TOPIC, &payload))).unwrap();
        let b = serde_json::to_string(&entity(parse_discovery(TOPIC, &payload))).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_empty_payload_is_removal() {
        match parse_discovery(TOPIC, "  ").unwrap() {
            Discovery::Removed { unique_id, topic } => {
                assert_eq!(unique_id, "ENT1");
                assert_eq!(topic, TOPIC);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_malformed_payloads() {
        assert!(matches!(parse_discovery(TOPIC, "{"), Err(CoreError::MalformedInput(_))));
        assert!(matches!(parse_discovery(TOPIC, "[1,2]"), Err(CoreError::MalformedInput(_))));
        assert!(matches!(
            parse_discovery(TOPIC, r#"{"unique_id":"A_online","state_topic":"  "}"#),
            Err(CoreError::MalformedInput(_))
        ));
    }

    #[test]
    fn test_unique_id_and_device_fallbacks() {
        let desc = entity(parse_discovery("cfg/config", r#"{"unique_id":"U_online","state_topic":"s","device":{"identifiers":[["a"],["SBS7"]]}}"#));
        assert_eq!(desc.device.id, "SBS7");
        assert_eq!(desc.component, "");

        let desc = entity(parse_discovery(TOPIC, r#"{"state_topic":"DEV1/ENT1/state"}"#));
        assert_eq!(desc.unique_id, "ENT1");

        assert!(parse_discovery("config", r#"{"unique_id":"U","state_topic":"s"}"#).is_err());
    }

    #[test]
    fn test_scalar_fields_are_stringified() {
        let payload = r#"{"unique_id":"D_E_level","state_topic":"D/E/state","payload_on":1,"payload_off":false,"component":"sensor"}"#;
        let desc = entity(parse_discovery(TOPIC, payload));
        assert_eq!(desc.payload_on, "1");
        assert_eq!(desc.payload_off, "false");
        assert_eq!(desc.component, "sensor");
    }

    #[test]
    fn test_ident_policy() {
        let payload = r#"{"unique_id":"DEV1_ENT1_heat","state_topic":"DEV1/ENT1/state"}"#;
        let open = entity(parse_discovery(TOPIC, payload));
        assert_eq!(open.ident, "Entity_DEV1_ENT1_heat");
        let closed = entity(parse_discovery_with(
            TOPIC,
            payload,
            IdentPolicy { create_unknown_entities: false },
        ));
        assert_eq!(closed.ident, "");
    }

    #[test]
    fn test_parse_entry() {
        let desc = parse_entry(
            r#"{"unique_id":"A_B_battery","state_topic":"A/B/state","device":{"id":"ignored"}}"#,
            IdentPolicy::default(),
        )
        .unwrap();
        assert_eq!(desc.device.id, "A");
        assert_eq!(desc.ident, "BatteryLow");

        let desc = parse_entry(
            r#"{"unique_id":"X_online","state_topic":"state","device":{"id":"SBS1"}}"#,
            IdentPolicy::default(),
        )
        .unwrap();
        assert_eq!(desc.device.id, "SBS1");
        assert_eq!(desc.discovery_topic, "");
    }

    #[test]
    fn test_forwarded_entry_keeps_config_topic() {
        let original = entity(parse_discovery(
            TOPIC,
            r#"{"unique_id":"DEV1_ENT1_smokealarm","state_topic":"DEV1/ENT1/state"}"#,
        ));
        let json = serde_json::to_string(&original).unwrap();
        let forwarded = parse_entry(&json, IdentPolicy::default()).unwrap();
        assert_eq!(forwarded.discovery_topic, TOPIC);
        assert_eq!(forwarded, original);
    }

    #[test]
    fn test_subscription_patterns() {
        let patterns = discovery_subscription_patterns("/homeassistant/binary_sensor/");
        assert_eq!(
            patterns,
            vec![
                "homeassistant/binary_sensor/+/+/config".to_string(),
                "homeassistant/binary_sensor/+/+/state".to_string(),
            ]
        );
    }
}
