//! Bridge, Device and Konfigurator roles and their in-process host.
//!
//! ```no_run
//! use std::sync::Arc;
//! use xsense_devices::{BridgeConfig, InstanceConfig, MemoryBus, Runtime};
//! use xsense_storage::MemoryBackend;
//!
//! # fn main() -> xsense_devices::Result<()> {
//! let bus = MemoryBus::connected();
//! let mut runtime = Runtime::new(Arc::new(MemoryBackend::default())).with_bus(bus);
//! let bridge = runtime.spawn(InstanceConfig::Bridge(BridgeConfig::default()))?;
//! runtime.deliver_bus_message(
//!     "homeassistant/binary_sensor/SBS1/E1/config",
//!     br#"{"unique_id":"SBS1_E1_online","state_topic":"SBS1/E1/state"}"#,
//! );
//! # let _ = bridge;
//! # Ok(())
//! # }
//! ```

pub mod bridge;
pub mod bus;
pub mod device;
pub mod error;
pub mod host;
pub mod konfigurator;
#[cfg(feature = "mqtt")]
pub mod mqtt;
pub mod registry;
pub mod runtime;

pub use bridge::{Bridge, BridgeConfig};
pub use bus::MemoryBus;
pub use device::{Device, DeviceConfig};
pub use error::{Result, RoleError};
pub use host::{
    BusClient, Host, Instance, InstanceConfig, InstanceDirectory, InstanceId, InstanceKind,
    PeerCall, PeerReply, VariableRegistry,
};
pub use konfigurator::{format_instance_name, InventoryRow, Konfigurator, KonfiguratorConfig};
pub use registry::{MemoryVariableRegistry, Variable};
pub use runtime::Runtime;

#[cfg(feature = "mqtt")]
pub use mqtt::{BusEvent, MqttBus, MqttBusConfig};
