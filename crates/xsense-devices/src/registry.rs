//! In-memory typed variable registry.

use std::collections::BTreeMap;

use serde::Serialize;
use xsense_core::{VariableSpec, VariableValue};

use crate::host::VariableRegistry;

/// A registered variable and its current value.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Variable {
    pub spec: VariableSpec,
    pub value: Option<VariableValue>,
}

/// Variables of one instance, keyed by ident.
#[derive(Debug, Clone, Default)]
pub struct MemoryVariableRegistry {
    variables: BTreeMap<String, Variable>,
}

impl MemoryVariableRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, ident: &str) -> Option<&Variable> {
        self.variables.get(ident)
    }

    /// Variables ordered by position, then ident.
    pub fn list(&self) -> Vec<&Variable> {
        let mut vars: Vec<&Variable> = self.variables.values().collect();
        vars.sort_by(|a, b| {
            a.spec
                .position
                .cmp(&b.spec.position)
                .then_with(|| a.spec.ident.cmp(&b.spec.ident))
        });
        vars
    }

    pub fn len(&self) -> usize {
        self.variables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.variables.is_empty()
    }
}

impl VariableRegistry for MemoryVariableRegistry {
    fn ensure_variable(&mut self, spec: &VariableSpec) -> bool {
        match self.variables.get_mut(&spec.ident) {
            Some(existing) if existing.spec == *spec => false,
            Some(existing) => {
                if existing.spec.kind != spec.kind {
                    existing.value = None;
                }
                existing.spec = spec.clone();
                true
            }
            None => {
                self.variables.insert(
                    spec.ident.clone(),
                    Variable {
                        spec: spec.clone(),
                        value: None,
                    },
                );
                true
            }
        }
    }

    fn set_value(&mut self, ident: &str, value: VariableValue) -> bool {
        let Some(var) = self.variables.get_mut(ident) else {
            tracing::debug!(ident, "set_value on unknown variable ignored");
            return false;
        };
        if var.spec.kind != value.kind() {
            tracing::warn!(ident, expected = ?var.spec.kind, got = ?value.kind(), "variable type mismatch");
            return false;
        }
        var.value = Some(value);
        true
    }

    fn get_value(&self, ident: &str) -> Option<VariableValue> {
        self.variables.get(ident).and_then(|v| v.value.clone())
    }

    fn has_variable(&self, ident: &str) -> bool {
        self.variables.contains_key(ident)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use xsense_core::VariableType;

    #[test]
    fn test_unknown_ident_is_noop() {
        let mut reg = MemoryVariableRegistry::new();
        assert!(!reg.set_value("Online", VariableValue::Boolean(true)));
        assert!(!reg.has_variable("Online"));
    }

    #[test]
    fn test_ensure_and_set() {
        let mut reg = MemoryVariableRegistry::new();
        let spec = VariableSpec::new("Online", VariableType::Boolean, "Online", 10);
        assert!(reg.ensure_variable(&spec));
        assert!(!reg.ensure_variable(&spec));
        assert!(reg.set_value("Online", VariableValue::Boolean(true)));
        assert_eq!(reg.get_value("Online"), Some(VariableValue::Boolean(true)));
        assert!(!reg.set_value("Online", VariableValue::Integer(1)));
    }

    #[test]
    fn test_type_change_resets_value() {
        let mut reg = MemoryVariableRegistry::new();
        reg.ensure_variable(&VariableSpec::new("Level", VariableType::String, "Level", 20));
        reg.set_value("Level", VariableValue::String("high".to_string()));
        reg.ensure_variable(&VariableSpec::new("Level", VariableType::Float, "Level", 20));
        assert_eq!(reg.get_value("Level"), None);
    }

    #[test]
    fn test_list_order() {
        let mut reg = MemoryVariableRegistry::new();
        reg.ensure_variable(&VariableSpec::new("Battery", VariableType::Integer, "Battery", 25));
        reg.ensure_variable(&VariableSpec::new("Model", VariableType::String, "Model", 2));
        let idents: Vec<&str> = reg.list().iter().map(|v| v.spec.ident.as_str()).collect();
        assert_eq!(idents, vec!["Model", "Battery"]);
    }
}
