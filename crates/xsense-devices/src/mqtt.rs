//! MQTT bus client backed by `rumqttc`.
//!
//! The client side is synchronous (`try_subscribe` / `try_publish` queue
//! requests); the event loop is driven by the caller, which feeds incoming
//! publishes into the runtime and tracks the connection state.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use serde::{Deserialize, Serialize};
use xsense_core::CoreError;

use crate::host::BusClient;

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    1883
}

fn default_keep_alive() -> u64 {
    60
}

/// Broker connection settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MqttBusConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Client id; a random one is generated when unset.
    #[serde(default)]
    pub client_id: Option<String>,

    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,
}

impl Default for MqttBusConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            client_id: None,
            keep_alive_secs: default_keep_alive(),
        }
    }
}

impl MqttBusConfig {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            ..Default::default()
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }
}

/// What the event loop produced, reduced to what the runtime cares about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusEvent {
    Connected,
    Message { topic: String, payload: Vec<u8> },
    Other,
}

/// `rumqttc` implementation of [`BusClient`].
pub struct MqttBus {
    client: AsyncClient,
    connected: Arc<AtomicBool>,
}

impl MqttBus {
    /// Build the client and the event loop the caller must poll.
    pub fn new(config: &MqttBusConfig) -> (Self, EventLoop) {
        let client_id = config
            .client_id
            .clone()
            .unwrap_or_else(|| format!("xsense-{}", uuid::Uuid::new_v4()));
        let mut options = MqttOptions::new(client_id, &config.host, config.port);
        options.set_keep_alive(Duration::from_secs(config.keep_alive_secs.max(5)));

        let (client, eventloop) = AsyncClient::new(options, 64);
        let bus = Self {
            client,
            connected: Arc::new(AtomicBool::new(false)),
        };
        (bus, eventloop)
    }

    /// Shared connection flag, updated through [`MqttBus::track`].
    pub fn connection_flag(&self) -> Arc<AtomicBool> {
        self.connected.clone()
    }

    /// Update the connection flag from an event loop result and classify it.
    pub fn track(flag: &AtomicBool, event: &Result<Event, rumqttc::ConnectionError>) -> BusEvent {
        match event {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                flag.store(true, Ordering::SeqCst);
                BusEvent::Connected
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => BusEvent::Message {
                topic: publish.topic.clone(),
                payload: publish.payload.to_vec(),
            },
            Ok(_) => BusEvent::Other,
            Err(_) => {
                flag.store(false, Ordering::SeqCst);
                BusEvent::Other
            }
        }
    }
}

impl BusClient for MqttBus {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn subscribe(&mut self, filter: &str) -> Result<(), CoreError> {
        self.client
            .try_subscribe(filter, QoS::AtLeastOnce)
            .map_err(|e| CoreError::unavailable(format!("subscribe {}: {}", filter, e)))
    }

    fn publish(&mut self, topic: &str, payload: &str) -> Result<(), CoreError> {
        self.client
            .try_publish(topic, QoS::AtLeastOnce, false, payload.as_bytes().to_vec())
            .map_err(|e| CoreError::unavailable(format!("publish {}: {}", topic, e)))
    }
}
