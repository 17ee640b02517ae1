//! Storage layer for the X-Sense bridge.
//!
//! Provides the storage backends, per-instance attribute access and the
//! durable discovery cache used by every role.

pub mod attributes;
pub mod backends;
pub mod discovery_cache;
pub mod error;

pub use attributes::AttributeStore;
pub use backends::{available_backends, create_backend};
pub use discovery_cache::{CacheLookup, CacheRecord, DiscoveryCache, RawAnnouncement};
pub use error::{Error, Result};

#[cfg(feature = "memory")]
pub use backends::{MemoryBackend, MemoryBackendConfig};

#[cfg(feature = "redb")]
pub use backends::{RedbBackend, RedbBackendConfig};
