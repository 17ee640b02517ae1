//! Shared defaults and constants.
//!
//! Every role reads its defaults from here so the values stay in one place.

use std::time::Duration;

/// Default topic root the Bridge listens under.
pub const DEFAULT_TOPIC_ROOT: &str = "homeassistant/binary_sensor";

/// Retry policy for attaching an instance to its upstream Bridge.
pub mod retry {
    use super::Duration;

    /// Maximum number of timed attach attempts.
    pub const MAX_ATTEMPTS: u32 = 12;

    /// Interval between two attempts.
    pub const INTERVAL: Duration = Duration::from_secs(1);
}

/// Timer names registered by the roles.
pub mod timers {
    /// Device retry timer.
    pub const AUTO_CONNECT: &str = "AutoConnect";
    /// Konfigurator retry timer.
    pub const RETRY_CONNECT: &str = "RetryConnect";
}

/// Attribute names used in the durable store.
pub mod attributes {
    /// Bridge discovery cache, keyed by topic.
    pub const DISCOVERY_CACHE: &str = "DiscoveryCache";
    /// Device entity cache, keyed by unique id.
    pub const ENTITIES: &str = "Entities";
    /// Device retry counter.
    pub const AUTO_CONNECT_TRIES: &str = "AutoConnectTries";
    /// Konfigurator retry counter.
    pub const RETRY_TRIES: &str = "RetryTries";
    /// Initial encoding of every cache attribute.
    pub const EMPTY_OBJECT: &str = "{}";
}

/// Status codes reported by instances.
pub mod status {
    /// Instance is being created.
    pub const CREATING: u16 = 101;
    /// Instance is active.
    pub const ACTIVE: u16 = 102;
    /// Instance has no usable upstream.
    pub const INACTIVE: u16 = 104;
    /// Automatic attach attempts exhausted.
    pub const RETRIES_EXHAUSTED: u16 = 201;
}

/// Environment variable names.
pub mod env_vars {
    pub const CONFIG_PATH: &str = "XSENSE_CONFIG";
    pub const MQTT_HOST: &str = "XSENSE_MQTT_HOST";
    pub const MQTT_PORT: &str = "XSENSE_MQTT_PORT";
    pub const TOPIC_ROOT: &str = "XSENSE_TOPIC_ROOT";
    pub const STORAGE_PATH: &str = "XSENSE_STORAGE_PATH";
    pub const LOG_JSON: &str = "XSENSE_LOG_JSON";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_defaults() {
        assert_eq!(retry::MAX_ATTEMPTS, 12);
        assert_eq!(retry::INTERVAL, Duration::from_secs(1));
    }
}
