//! In-process bus client.

use std::sync::{Arc, Mutex};

use xsense_core::CoreError;

use crate::host::BusClient;

#[derive(Debug, Default)]
struct BusState {
    connected: bool,
    subscriptions: Vec<String>,
    published: Vec<(String, String)>,
}

/// Bus client that records subscriptions and publications.
///
/// Clones share state, so a handle kept outside the runtime can toggle the
/// connection and inspect what the roles did.
#[derive(Debug, Clone, Default)]
pub struct MemoryBus {
    state: Arc<Mutex<BusState>>,
}

impl MemoryBus {
    pub fn connected() -> Self {
        let bus = Self::default();
        bus.set_connected(true);
        bus
    }

    pub fn set_connected(&self, connected: bool) {
        if let Ok(mut state) = self.state.lock() {
            state.connected = connected;
        }
    }

    pub fn subscriptions(&self) -> Vec<String> {
        self.state
            .lock()
            .map(|s| s.subscriptions.clone())
            .unwrap_or_default()
    }

    pub fn published(&self) -> Vec<(String, String)> {
        self.state
            .lock()
            .map(|s| s.published.clone())
            .unwrap_or_default()
    }
}

impl BusClient for MemoryBus {
    fn is_connected(&self) -> bool {
        self.state.lock().map(|s| s.connected).unwrap_or(false)
    }

    fn subscribe(&mut self, filter: &str) -> Result<(), CoreError> {
        let mut state = self
            .state
            .lock()
            .map_err(|e| CoreError::unavailable(e.to_string()))?;
        if !state.connected {
            return Err(CoreError::unavailable("bus not connected"));
        }
        if !state.subscriptions.iter().any(|s| s == filter) {
            state.subscriptions.push(filter.to_string());
        }
        Ok(())
    }

    fn publish(&mut self, topic: &str, payload: &str) -> Result<(), CoreError> {
        let mut state = self
            .state
            .lock()
            .map_err(|e| CoreError::unavailable(e.to_string()))?;
        if !state.connected {
            return Err(CoreError::unavailable("bus not connected"));
        }
        state.published.push((topic.to_string(), payload.to_string()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disconnected_bus_rejects() {
        let mut bus = MemoryBus::default();
        assert!(!bus.is_connected());
        assert!(bus.subscribe("a/#").is_err());
    }

    #[test]
    fn test_shared_state() {
        let handle = MemoryBus::connected();
        let mut bus = handle.clone();
        bus.subscribe("a/+/config").unwrap();
        bus.subscribe("a/+/config").unwrap();
        bus.publish("a/b", "{}").unwrap();
        assert_eq!(handle.subscriptions(), vec!["a/+/config".to_string()]);
        assert_eq!(handle.published().len(), 1);
    }
}
