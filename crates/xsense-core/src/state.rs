//! State payload interpretation.
//!
//! Resolution is two-tier: a single-field `value_json` accessor in the
//! descriptor's `value_template`, then a literal `status` field. Nothing else
//! of the template language is evaluated.

use serde_json::Value;

use crate::entity::EntityDescriptor;
use crate::error::{CoreError, Result};
use crate::resolver::{VariableType, VariableValue};

const ACCESSOR: &str = "value_json";
const STATUS_FIELD: &str = "status";

/// Default payloads of a binary sensor that declares none.
const DEFAULT_PAYLOAD_ON: &str = "ON";
const DEFAULT_PAYLOAD_OFF: &str = "OFF";

/// Result of projecting an extracted value onto a variable type.
#[derive(Debug, Clone, PartialEq)]
pub enum Projection {
    /// Value to write.
    Value(VariableValue),
    /// The value cannot be represented; its string form is kept for logging.
    Unrecognized(String),
}

/// Extract the field name of a `value_json.<field>`, `value_json['<field>']`
/// or `value_json["<field>"]` accessor.
pub fn template_field(template: &str) -> Option<String> {
    let pos = template.find(ACCESSOR)?;
    let rest = &template[pos + ACCESSOR.len()..];

    if let Some(rest) = rest.strip_prefix('.') {
        let field: String = rest
            .chars()
            .take_while(|c| c.is_ascii_alphanumeric() || *c == '_')
            .collect();
        return if field.is_empty() { None } else { Some(field) };
    }

    let rest = rest.strip_prefix('[')?;
    let quote = rest.chars().next().filter(|c| *c == '\'' || *c == '"')?;
    let inner = &rest[1..];
    let end = inner.find(quote)?;
    if !inner[end + 1..].starts_with(']') {
        return None;
    }
    let field = &inner[..end];
    if field.is_empty() {
        None
    } else {
        Some(field.to_string())
    }
}

/// Check if a template is understood by [`interpret`].
pub fn is_supported_template(template: &str) -> bool {
    let template = template.trim();
    template.is_empty()
        || template_field(template).is_some()
        || (template.contains(ACCESSOR) && template.contains(STATUS_FIELD))
}

/// Resolve the value a state payload carries for one entity.
///
/// Returns `Ok(None)` for an empty payload or when neither the template
/// field nor a `status` field is present.
pub fn interpret(desc: &EntityDescriptor, payload: &str) -> Result<Option<Value>> {
    let payload = payload.trim();
    if payload.is_empty() {
        return Ok(None);
    }

    let value: Value = serde_json::from_str(payload)
        .map_err(|e| CoreError::malformed(format!("invalid state JSON: {}", e)))?;
    let Value::Object(object) = value else {
        return Err(CoreError::malformed("state payload is not a JSON object"));
    };

    let template = desc.value_template.trim();
    if !is_supported_template(template) {
        tracing::debug!(
            unique_id = %desc.unique_id,
            template = %template,
            "unsupported value_template"
        );
    }

    if let Some(field) = template_field(template) {
        if let Some(found) = object.get(&field) {
            return Ok(Some(found.clone()));
        }
    }

    Ok(object.get(STATUS_FIELD).cloned())
}

/// String form of an extracted value: strings verbatim, anything else as JSON.
pub fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Numeric view of a number or a numeric string.
pub fn numeric(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok().filter(|f| f.is_finite()),
        _ => None,
    }
}

/// Project an extracted value onto a variable type.
pub fn project(desc: &EntityDescriptor, value: &Value, kind: VariableType) -> Projection {
    let text = value_text(value);
    match kind {
        VariableType::Boolean => {
            let (on, off) = binary_payloads(desc);
            if !on.is_empty() && text == on {
                Projection::Value(VariableValue::Boolean(true))
            } else if !off.is_empty() && text == off {
                Projection::Value(VariableValue::Boolean(false))
            } else {
                Projection::Unrecognized(text)
            }
        }
        VariableType::Float => match numeric(value) {
            Some(f) => Projection::Value(VariableValue::Float(f)),
            None => Projection::Unrecognized(text),
        },
        VariableType::Integer => match numeric(value) {
            Some(f) => Projection::Value(VariableValue::Integer(f.round() as i64)),
            None => Projection::Unrecognized(text),
        },
        VariableType::String => Projection::Value(VariableValue::String(text)),
    }
}

/// Battery percentage for a `battery` entity carrying a numeric value.
pub fn battery_percentage(desc: &EntityDescriptor, value: &Value) -> Option<i64> {
    if desc.suffix != "battery" {
        return None;
    }
    numeric(value).map(|f| f.round().clamp(0.0, 100.0) as i64)
}

fn binary_payloads(desc: &EntityDescriptor) -> (&str, &str) {
    if desc.has_binary_payloads() {
        (desc.payload_on.as_str(), desc.payload_off.as_str())
    } else {
        (DEFAULT_PAYLOAD_ON, DEFAULT_PAYLOAD_OFF)
    }
}
