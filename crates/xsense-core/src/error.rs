//! Error taxonomy shared by every role.
//!
//! None of these conditions is fatal to the process. Roles log them and drop
//! the offending message; the worst outcome is an instance left in a
//! degraded status.

use thiserror::Error;

/// Result type for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Core error types.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoreError {
    /// Payload is not valid JSON, not an object, or misses required fields.
    #[error("Malformed input: {0}")]
    MalformedInput(String),

    /// A state topic or template field has no known counterpart.
    #[error("Unresolved reference: {0}")]
    UnresolvedReference(String),

    /// The required upstream peer is missing, busy or unhealthy.
    #[error("Upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    /// Configured device id disagrees with the one inferred from a message.
    #[error("Inconsistent identity: configured {configured}, announced {announced}")]
    InconsistentIdentity {
        configured: String,
        announced: String,
    },

    /// Storage error.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl CoreError {
    /// Shorthand for [`CoreError::MalformedInput`].
    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::MalformedInput(msg.into())
    }

    /// Shorthand for [`CoreError::UpstreamUnavailable`].
    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::UpstreamUnavailable(msg.into())
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(e: serde_json::Error) -> Self {
        CoreError::Serialization(e.to_string())
    }
}

impl From<crate::storage::StorageError> for CoreError {
    fn from(e: crate::storage::StorageError) -> Self {
        CoreError::Storage(e.to_string())
    }
}
