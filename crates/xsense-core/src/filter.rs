//! Receive filters.
//!
//! A receive filter is a regular expression matched against the serialized
//! envelope an instance would receive. Topics inside the envelope may arrive
//! with escaped separators (`\/`), so every separator in a pattern accepts
//! both forms.

use regex::Regex;

use crate::error::{CoreError, Result};

/// Topic separator, optionally backslash-escaped.
const SEP: &str = r"(?:\\/|/)";

/// Which messages an instance should receive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterScope {
    /// All messages.
    Everything,
    /// Config topics anywhere on the bus.
    ConfigOnly,
    /// Config and state topics of one device.
    Device(String),
}

impl FilterScope {
    /// Scope for a device instance; an empty id only receives announcements.
    pub fn for_device(device_id: &str) -> Self {
        let id = device_id.trim();
        if id.is_empty() {
            Self::ConfigOnly
        } else {
            Self::Device(id.to_string())
        }
    }
}

/// Build the pattern text for a scope.
pub fn receive_filter(scope: &FilterScope) -> String {
    match scope {
        FilterScope::Everything => ".*".to_string(),
        FilterScope::ConfigOnly => format!(r#".*"Topic"\s*:\s*".*{SEP}config".*"#),
        FilterScope::Device(id) => format!(
            r#".*"Topic"\s*:\s*"(?:[^"]*{SEP})?{id}{SEP}[^"\\/]+{SEP}(config|state)".*"#,
            id = regex::escape(id),
        ),
    }
}

/// A compiled receive filter.
#[derive(Debug, Clone)]
pub struct TopicFilter {
    pattern: String,
    regex: Regex,
}

impl TopicFilter {
    /// Compile a pattern produced by [`receive_filter`] or supplied by a host.
    pub fn compile(pattern: &str) -> Result<Self> {
        let regex = Regex::new(pattern)
            .map_err(|e| CoreError::malformed(format!("invalid receive filter: {}", e)))?;
        Ok(Self {
            pattern: pattern.to_string(),
            regex,
        })
    }

    /// Compile the filter for a scope.
    pub fn for_scope(scope: &FilterScope) -> Result<Self> {
        Self::compile(&receive_filter(scope))
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Check a serialized envelope against the filter.
    pub fn matches(&self, envelope_json: &str) -> bool {
        self.regex.is_match(envelope_json)
    }
}
