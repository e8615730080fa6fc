//! RecordStore trait definitions.

use async_trait::async_trait;

use crate::model::{Machine, MachineStatus, Network, Storage};

use super::error::Result;

// =============================================================================
// Request DTOs
// =============================================================================

/// Request to create a machine record.
#[derive(Debug, Clone)]
pub struct CreateMachineRecord {
    pub name: String,
    pub machine_type: String,
    pub arch: String,
    pub memory_mb: u64,
    pub cpus: u32,
    pub status: MachineStatus,
}

/// Request to create a storage record.
#[derive(Debug, Clone)]
pub struct CreateStorageRecord {
    pub name: String,
    pub location: String,
    pub format: String,
    pub size_mb: u64,
}

/// Request to create a network record.
#[derive(Debug, Clone)]
pub struct CreateNetworkRecord {
    pub mac: String,
    pub network: String,
    pub model: String,
}

// =============================================================================
// Entity Store Traits
// =============================================================================

/// Store trait for machine records.
#[async_trait]
pub trait MachineStore: Send + Sync {
    /// Create a machine. Fails with `Conflict` if the name is taken for its type.
    async fn create_machine(&self, req: CreateMachineRecord) -> Result<Machine>;

    /// Get a machine by ID.
    async fn get_machine(&self, id: &str) -> Result<Option<Machine>>;

    /// Get a machine by type and name.
    async fn get_machine_by_name(&self, machine_type: &str, name: &str)
    -> Result<Option<Machine>>;

    /// List all machines.
    async fn list_machines(&self) -> Result<Vec<Machine>>;

    /// Count machines of one type.
    async fn count_machines_by_type(&self, machine_type: &str) -> Result<u64>;

    /// Attach storage to a machine, keeping the given order.
    async fn attach_storage(&self, machine_id: &str, storage_ids: &[String]) -> Result<()>;

    /// Attach a network to a machine.
    async fn attach_network(&self, machine_id: &str, network_id: &str) -> Result<()>;

    /// Set a machine's status.
    async fn update_machine_status(&self, id: &str, status: MachineStatus) -> Result<Machine>;
}

/// Store trait for storage records.
///
/// `active` is only written through [`StorageStore::activate_storage`] and
/// [`StorageStore::deactivate_storage`]; `save_storage` leaves it alone.
#[async_trait]
pub trait StorageStore: Send + Sync {
    /// Create an inactive, uninitialized storage record.
    async fn create_storage(&self, req: CreateStorageRecord) -> Result<Storage>;

    /// Get a storage record by ID.
    async fn get_storage(&self, id: &str) -> Result<Option<Storage>>;

    /// List all storage records.
    async fn list_storage(&self) -> Result<Vec<Storage>>;

    /// List storage records sharing a location.
    async fn list_storage_by_location(&self, location: &str) -> Result<Vec<Storage>>;

    /// Write every field except `active`.
    async fn save_storage(&self, storage: &Storage) -> Result<()>;

    /// Set `active` if it is currently unset. Returns false if it was already set.
    async fn activate_storage(&self, id: &str) -> Result<bool>;

    /// Clear `active`.
    async fn deactivate_storage(&self, id: &str) -> Result<()>;
}

/// Store trait for network records.
#[async_trait]
pub trait NetworkStore: Send + Sync {
    /// Create a network record.
    async fn create_network(&self, req: CreateNetworkRecord) -> Result<Network>;

    /// Get a network by ID.
    async fn get_network(&self, id: &str) -> Result<Option<Network>>;

    /// List all networks.
    async fn list_networks(&self) -> Result<Vec<Network>>;
}

// =============================================================================
// Composite RecordStore Trait
// =============================================================================

/// Composite store combining all entity stores.
pub trait RecordStore: MachineStore + StorageStore + NetworkStore + Send + Sync {}

impl<T> RecordStore for T where T: MachineStore + StorageStore + NetworkStore + Send + Sync {}
