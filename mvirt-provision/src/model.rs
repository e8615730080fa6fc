//! Resource records: machines, storage volumes and networks.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::hypervisor::{NetworkCard, VolumeDescriptor};

/// Machine type used when a request does not name one.
pub const DEFAULT_MACHINE_TYPE: &str = "nix";

/// Lifecycle tag of a machine record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MachineStatus {
    Installing,
    Running,
    Stopped,
    /// Provisioning aborted after the record was written.
    Failed,
}

impl MachineStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Installing => "installing",
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for MachineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MachineStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "installing" => Ok(Self::Installing),
            "running" => Ok(Self::Running),
            "stopped" => Ok(Self::Stopped),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown machine status: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Machine {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub machine_type: String,
    pub arch: String,
    pub memory_mb: u64,
    pub cpus: u32,
    pub status: MachineStatus,
    pub started_at: Option<String>,
    pub stopped_at: Option<String>,
    /// Attached storage, boot image first.
    pub storage_ids: Vec<String>,
    pub network_id: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// A disk image record. `active` means some machine is using it,
/// `initialized` means the backing volume exists on the hypervisor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Storage {
    pub id: String,
    pub name: String,
    pub location: String,
    /// Backing format tag, e.g. `qcow2` or `raw`.
    pub format: String,
    pub size_mb: u64,
    pub active: bool,
    pub initialized: bool,
    pub created_at: String,
    pub updated_at: String,
}

impl Storage {
    pub fn volume_descriptor(&self) -> VolumeDescriptor {
        VolumeDescriptor {
            name: self.name.clone(),
            path: self.location.clone(),
            format: self.format.clone(),
            size_mb: self.size_mb,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Network {
    pub id: String,
    pub mac: String,
    /// Bridge or logical network the NIC is plugged into.
    pub network: String,
    /// Virtual NIC model, e.g. `virtio`.
    pub model: String,
    pub created_at: String,
}

impl From<&Network> for NetworkCard {
    fn from(network: &Network) -> Self {
        NetworkCard {
            mac: network.mac.clone(),
            network: network.network.clone(),
            model: network.model.clone(),
        }
    }
}
