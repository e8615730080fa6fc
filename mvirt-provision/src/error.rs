//! Provisioning errors.

use thiserror::Error;

use crate::hypervisor::HypervisorError;
use crate::store::StoreError;

/// Errors surfaced by provisioning commands. Nothing is retried.
#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("attempting to create a machine with no storage")]
    NoStorage,

    #[error("attempting to create a machine with no network")]
    NoNetwork,

    #[error("storage volume '{name}' ({id}) is already active")]
    StorageAlreadyActive { id: String, name: String },

    #[error("persistence: {0}")]
    Persistence(#[from] StoreError),

    #[error("hypervisor: {0}")]
    Hypervisor(#[from] HypervisorError),
}

/// Coarse error classes callers branch on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    Conflict,
    Persistence,
    Hypervisor,
}

impl ProvisionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidArgument(_) | Self::NoStorage | Self::NoNetwork => ErrorKind::Validation,
            Self::StorageAlreadyActive { .. } | Self::Persistence(StoreError::Conflict(_)) => {
                ErrorKind::Conflict
            }
            Self::Persistence(_) => ErrorKind::Persistence,
            Self::Hypervisor(_) => ErrorKind::Hypervisor,
        }
    }
}

pub type Result<T> = std::result::Result<T, ProvisionError>;
