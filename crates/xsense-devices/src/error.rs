//! Error types for the role runtime.

use thiserror::Error;
use xsense_core::CoreError;

use crate::host::InstanceId;

/// Result type for runtime operations.
pub type Result<T> = std::result::Result<T, RoleError>;

/// Runtime error types.
#[derive(Debug, Error)]
pub enum RoleError {
    #[error(transparent)]
    Core(#[from] CoreError),

    #[error(transparent)]
    Storage(#[from] xsense_storage::Error),

    #[error("Instance not found: {0}")]
    NotFound(InstanceId),

    #[error("Instance busy: {0}")]
    Busy(InstanceId),

    #[error("Bus error: {0}")]
    Bus(String),
}

impl From<xsense_core::StorageError> for RoleError {
    fn from(e: xsense_core::StorageError) -> Self {
        RoleError::Storage(e.into())
    }
}

impl From<RoleError> for CoreError {
    fn from(e: RoleError) -> Self {
        match e {
            RoleError::Core(e) => e,
            RoleError::Storage(e) => e.into(),
            RoleError::NotFound(id) => CoreError::unavailable(format!("instance {} not found", id)),
            RoleError::Busy(id) => CoreError::unavailable(format!("instance {} busy", id)),
            RoleError::Bus(msg) => CoreError::unavailable(msg),
        }
    }
}
