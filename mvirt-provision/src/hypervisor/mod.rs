//! Hypervisor gateway.
//!
//! The provisioning commands only see [`HypervisorGateway`]. A gateway
//! instance is the bound connection: everything it does happens against one
//! hypervisor. [`CloudHypervisor`] drives local cloud-hypervisor processes.

mod cloud_hypervisor;

use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use cloud_hypervisor::CloudHypervisor;

#[derive(Debug, Error)]
pub enum HypervisorError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("{command} failed: {stderr}")]
    CommandFailed { command: String, stderr: String },

    #[error("storage volume not found: {0}")]
    VolumeNotFound(String),

    #[error("storage volume '{name}' already exists at {existing}")]
    VolumeExists { name: String, existing: String },

    #[error("unsupported: {0}")]
    Unsupported(String),
}

pub type Result<T> = std::result::Result<T, HypervisorError>;

/// What the hypervisor needs to materialize a storage volume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeDescriptor {
    pub name: String,
    pub path: String,
    pub format: String,
    pub size_mb: u64,
}

/// A materialized volume as reported by the hypervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeHandle {
    pub name: String,
    pub path: PathBuf,
    pub size_bytes: u64,
}

/// Virtual NIC description handed to domain creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkCard {
    pub mac: String,
    pub network: String,
    pub model: String,
}

/// Everything needed to define and boot a domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainSpec {
    /// Machine record ID. Host resources (TAP device, runtime directory) are
    /// keyed on it since names are only unique per type.
    pub id: String,
    pub name: String,
    pub arch: String,
    pub memory_mb: u64,
    pub max_memory_mb: u64,
    pub vcpus: u32,
    /// Install medium, attached ahead of the disks.
    pub boot_image: String,
    pub disks: Vec<VolumeHandle>,
    pub nic: NetworkCard,
}

/// A created domain. Held by the caller, not persisted.
#[derive(Debug, Clone)]
pub struct DomainHandle {
    pub name: String,
    pub pid: Option<u32>,
    pub api_socket: PathBuf,
}

/// Capability interface to a hypervisor.
#[async_trait]
pub trait HypervisorGateway: Send + Sync {
    /// Define and start a domain.
    async fn create_domain(&self, spec: &DomainSpec) -> Result<DomainHandle>;

    /// Materialize the backing image of a storage volume.
    async fn create_storage_volume(&self, volume: &VolumeDescriptor) -> Result<()>;

    /// Look up a materialized volume by name.
    async fn lookup_storage_volume_by_name(&self, name: &str) -> Result<VolumeHandle>;
}
