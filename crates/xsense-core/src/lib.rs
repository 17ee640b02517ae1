//! Core engine of the X-Sense MQTT discovery bridge.
//!
//! Pure, I/O-free building blocks shared by the Bridge, Device and
//! Konfigurator roles: topic codec, entity model, discovery parser, state
//! interpreter, type resolver, receive filters and the connection supervisor.

pub mod config;
pub mod discovery;
pub mod entity;
pub mod envelope;
pub mod error;
pub mod filter;
pub mod resolver;
pub mod state;
pub mod storage;
pub mod supervisor;
pub mod topic;

pub use discovery::{parse_discovery, parse_discovery_with, parse_entry, Discovery};
pub use entity::{DeviceInfo, EntityDescriptor};
pub use envelope::{DataKind, Envelope};
pub use error::{CoreError, Result};
pub use filter::{FilterScope, TopicFilter};
pub use resolver::{IdentPolicy, VariableSpec, VariableType, VariableValue};
pub use state::Projection;
pub use storage::{SharedBackend, StorageBackend, StorageError};
pub use supervisor::{ConnectionState, ConnectionSupervisor, TimerCommand, Transition};

/// Re-exports commonly used types.
pub mod prelude {
    pub use crate::config::{attributes, retry, status, timers};
    pub use crate::discovery::{parse_discovery, Discovery};
    pub use crate::entity::{DeviceInfo, EntityDescriptor};
    pub use crate::envelope::{DataKind, Envelope};
    pub use crate::error::{CoreError, Result};
    pub use crate::resolver::{VariableType, VariableValue};
    pub use crate::storage::{StorageBackend, StorageError};
    pub use crate::supervisor::{ConnectionState, ConnectionSupervisor};
}
