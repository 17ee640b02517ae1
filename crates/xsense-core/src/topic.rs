//! Topic and payload codec.
//!
//! Pure helpers shared by the Bridge, Device and Konfigurator roles:
//! topic tokenizing from the end, config/state detection, payload
//! normalization (UTF-8 text or hex-encoded bytes) and the small string
//! conventions of the vendor's discovery announcements.

use serde_json::Value;

const CONFIG_SUFFIX: &str = "/config";
const STATE_SUFFIX: &str = "/state";

/// Return the topic segment at position `len - from_end`.
///
/// Leading and trailing `/` are ignored. Out-of-range positions yield an
/// empty string. For `<root>/<component>/<deviceId>/<objectId>/config`,
/// `token(topic, 3)` is the device id and `token(topic, 2)` the object id.
pub fn token(topic: &str, from_end: usize) -> &str {
    let parts: Vec<&str> = topic.trim_matches('/').split('/').collect();
    if from_end == 0 || from_end > parts.len() {
        return "";
    }
    parts[parts.len() - from_end]
}

/// Check if a topic carries a discovery announcement.
pub fn is_config_topic(topic: &str) -> bool {
    topic.ends_with(CONFIG_SUFFIX)
}

/// Check if a topic carries a state update by naming convention.
pub fn is_state_topic(topic: &str) -> bool {
    topic.ends_with(STATE_SUFFIX)
}

/// Normalize a topic root by removing leading and trailing separators.
pub fn topic_root(raw: &str) -> String {
    raw.trim().trim_matches('/').to_string()
}

/// Check if `topic` lies strictly below `root`.
pub fn is_under_root(topic: &str, root: &str) -> bool {
    topic
        .strip_prefix(root)
        .map(|rest| rest.starts_with('/'))
        .unwrap_or(false)
}

/// Normalize a bus payload into text.
///
/// The payload is trimmed first. A non-empty payload made only of hex digits
/// with an even length is decoded as hex bytes; anything else is returned
/// trimmed but otherwise untouched. Hex input that does not decode to UTF-8
/// is kept as text.
pub fn decode_payload(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return String::new();
    }
    if trimmed.len() % 2 == 0 && trimmed.bytes().all(|b| b.is_ascii_hexdigit()) {
        if let Ok(bytes) = hex::decode(trimmed) {
            if let Ok(text) = String::from_utf8(bytes) {
                return text;
            }
        }
    }
    trimmed.to_string()
}

/// Normalize raw payload bytes as delivered by the bus client.
pub fn decode_payload_bytes(raw: &[u8]) -> String {
    decode_payload(&String::from_utf8_lossy(raw))
}

/// Extract the semantic suffix of a unique id.
///
/// Takes the lower-cased tail after the last `_`, or after the last `-` if
/// there is no `_`. Ids without a separator yield the whole id lower-cased.
pub fn extract_suffix(unique_id: &str) -> String {
    let unique_id = unique_id.trim();
    if unique_id.is_empty() {
        return String::new();
    }
    for sep in ['_', '-'] {
        if let Some(pos) = unique_id.rfind(sep) {
            return unique_id[pos + sep.len_utf8()..].to_lowercase();
        }
    }
    unique_id.to_lowercase()
}

/// Resolve a device identity from a `device.identifiers` value.
///
/// The value may be a string, a list or a nested list. All strings found at
/// any depth are trimmed, empties are dropped and the last one wins.
pub fn device_identifier(identifiers: &Value) -> Option<String> {
    let mut stack = vec![identifiers];
    let mut last: Option<&str> = None;

    // Depth-first, left-to-right: reverse children so the leftmost pops first.
    while let Some(value) = stack.pop() {
        match value {
            Value::String(s) => {
                let s = s.trim();
                if !s.is_empty() {
                    last = Some(s);
                }
            }
            Value::Array(items) => stack.extend(items.iter().rev()),
            _ => {}
        }
    }

    last.map(str::to_string)
}

/// Resolve the identity of a `device` object, if any.
pub fn device_identifier_of(device: Option<&Value>) -> Option<String> {
    device
        .and_then(|d| d.get("identifiers"))
        .and_then(device_identifier)
}

/// Turn arbitrary text into a variable identifier.
///
/// Characters outside `[A-Za-z0-9_]` become `_`, surrounding underscores are
/// trimmed and an empty result falls back to `Entity`.
pub fn sanitize_ident(raw: &str) -> String {
    let clean: String = raw
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect();
    let clean = clean.trim_matches('_');
    if clean.is_empty() {
        "Entity".to_string()
    } else {
        clean.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_token_from_end() {
        let topic = "homeassistant/binary_sensor/DEV123/ENT1/config";
        assert_eq!(token(topic, 1), "config");
        assert_eq!(token(topic, 2), "ENT1");
        assert_eq!(token(topic, 3), "DEV123");
        assert_eq!(token(topic, 5), "homeassistant");
        assert_eq!(token(topic, 6), "");
        assert_eq!(token(topic, 0), "");
    }

    #[test]
    fn test_token_ignores_outer_slashes() {
        assert_eq!(token("/DEV1/ENT1/state/", 3), "DEV1");
        assert_eq!(token("", 1), "");
        assert_eq!(token("", 2), "");
    }

    #[test]
    fn test_config_and_state_detection() {
        assert!(is_config_topic("homeassistant/binary_sensor/D/E/config"));
        assert!(!is_config_topic("homeassistant/binary_sensor/D/E/state"));
        assert!(is_state_topic("D/E/state"));
        assert!(!is_state_topic("config"));
    }

    #[test]
    fn test_topic_root() {
        assert_eq!(topic_root("/homeassistant/binary_sensor/"), "homeassistant/binary_sensor");
        assert_eq!(topic_root("///"), "");
    }

    #[test]
    fn test_is_under_root() {
        assert!(is_under_root("homeassistant/binary_sensor/D/E/config", "homeassistant/binary_sensor"));
        assert!(!is_under_root("homeassistant/binary_sensorX/D", "homeassistant/binary_sensor"));
        assert!(!is_under_root("homeassistant/binary_sensor", "homeassistant/binary_sensor"));
    }

    #[test]
    fn test_decode_payload_hex() {
        // "{\"a\":1}" as hex
        assert_eq!(decode_payload("7b2261223a317d"), r#"{"a":1}"#);
        assert_eq!(decode_payload("  7B2261223A317D \n"), r#"{"a":1}"#);
    }

    #[test]
    fn test_decode_payload_text() {
        assert_eq!(decode_payload(r#" {"status": "ON"} "#), r#"{"status": "ON"}"#);
        assert_eq!(decode_payload("abc"), "abc"); // odd length
        assert_eq!(decode_payload("ON  OFF"), "ON  OFF");
        assert_eq!(decode_payload("   "), "");
        // Valid hex, invalid UTF-8
        assert_eq!(decode_payload("ff"), "ff");
    }

    #[test]
    fn test_decode_payload_bytes() {
        assert_eq!(decode_payload_bytes(b"7b7d"), "{}");
        assert_eq!(decode_payload_bytes(b" {} "), "{}");
    }

    #[test]
    fn test_extract_suffix() {
        assert_eq!(extract_suffix("SBS50148995FA_00000001_online"), "online");
        assert_eq!(extract_suffix("DEV1_ENT1_SmokeAlarm"), "smokealarm");
        assert_eq!(extract_suffix("abc-def-Battery"), "battery");
        assert_eq!(extract_suffix("a-b_c-d"), "c-d");
        assert_eq!(extract_suffix("no-sep-except-dash-end-"), "");
        assert_eq!(extract_suffix("  Plain  "), "plain");
        assert_eq!(extract_suffix(""), "");
        assert_eq!(extract_suffix("   "), "");
    }

    #[test]
    fn test_device_identifier_shapes() {
        assert_eq!(device_identifier(&json!(" SBS1 ")), Some("SBS1".to_string()));
        assert_eq!(device_identifier(&json!(["a", "b"])), Some("b".to_string()));
        assert_eq!(
            device_identifier(&json!([["xsense", "SBS1"], ["  "]])),
            Some("SBS1".to_string())
        );
        assert_eq!(
            device_identifier(&json!(["a", [["deep"]], 5])),
            Some("deep".to_string())
        );
        assert_eq!(device_identifier(&json!([" ", ""])), None);
        assert_eq!(device_identifier(&json!(42)), None);
    }

    #[test]
    fn test_device_identifier_of() {
        let device = json!({"identifiers": ["SBS9"], "name": "Alarm"});
        assert_eq!(device_identifier_of(Some(&device)), Some("SBS9".to_string()));
        assert_eq!(device_identifier_of(Some(&json!({}))), None);
        assert_eq!(device_identifier_of(None), None);
    }

    #[test]
    fn test_sanitize_ident() {
        assert_eq!(sanitize_ident("Entity_DEV1-ENT1.x"), "Entity_DEV1_ENT1_x");
        assert_eq!(sanitize_ident("__a b__"), "a_b");
        assert_eq!(sanitize_ident("---"), "Entity");
        assert_eq!(sanitize_ident(""), "Entity");
    }
}
