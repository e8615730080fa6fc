use std::iter;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, error, info, warn};

use super::{Command, ProvisionContext};
use crate::error::{ProvisionError, Result};
use crate::hypervisor::{DomainHandle, DomainSpec, HypervisorGateway, NetworkCard, VolumeHandle};
use crate::lock::ResourceLocks;
use crate::model::{DEFAULT_MACHINE_TYPE, Machine, MachineStatus, Network, Storage};
use crate::store::{CreateMachineRecord, StoreError};

/// Name for an unnamed machine: `<type>Machine<existing + 1>`.
pub fn generate_machine_name(machine_type: &str, existing: u64) -> String {
    format!("{machine_type}Machine{}", existing + 1)
}

/// Storage handed to a new machine.
///
/// The boot image is the install medium. It is attached to the domain as-is
/// and never activated. Data disks are materialized and activated in order.
#[derive(Debug, Clone)]
pub struct StorageSet {
    pub boot_image: Storage,
    pub data_disks: Vec<Storage>,
}

impl StorageSet {
    pub fn new(boot_image: Storage, data_disks: Vec<Storage>) -> Self {
        Self {
            boot_image,
            data_disks,
        }
    }

    /// Split a list whose first entry is the boot image.
    pub fn from_list(storage: Vec<Storage>) -> Result<Self> {
        let mut storage = storage.into_iter();
        let boot_image = storage.next().ok_or(ProvisionError::NoStorage)?;
        Ok(Self::new(boot_image, storage.collect()))
    }

    /// All storage IDs, boot image first.
    pub fn ids(&self) -> Vec<String> {
        iter::once(&self.boot_image)
            .chain(&self.data_disks)
            .map(|s| s.id.clone())
            .collect()
    }
}

/// Requested machine attributes.
#[derive(Debug, Clone)]
pub struct MachineSpec {
    /// Generated from the type when absent or empty.
    pub name: Option<String>,
    /// Defaults to `nix` when absent or empty.
    pub machine_type: Option<String>,
    pub arch: String,
    pub memory_mb: u64,
    pub cpus: u32,
}

/// Creates a machine record, activates its storage and creates the domain.
///
/// A failure after the record is written marks the machine `failed` and
/// deactivates any storage this run activated. Volumes already materialized
/// on the hypervisor stay in place.
pub struct CreateMachine {
    storage: StorageSet,
    network: Network,
    name: Option<String>,
    machine_type: String,
    arch: String,
    memory_mb: u64,
    cpus: u32,
    ctx: ProvisionContext,
}

impl CreateMachine {
    /// `storage[0]` is the boot image; the rest are data disks.
    pub fn new(
        storage: Vec<Storage>,
        network: Option<Network>,
        spec: MachineSpec,
        ctx: ProvisionContext,
    ) -> Result<Self> {
        let storage = StorageSet::from_list(storage)?;
        let network = network.ok_or(ProvisionError::NoNetwork)?;
        Self::with_storage(storage, network, spec, ctx)
    }

    pub fn with_storage(
        storage: StorageSet,
        network: Network,
        spec: MachineSpec,
        ctx: ProvisionContext,
    ) -> Result<Self> {
        if spec.arch.is_empty() {
            return Err(ProvisionError::InvalidArgument(
                "architecture must not be empty".to_string(),
            ));
        }
        if spec.memory_mb == 0 {
            return Err(ProvisionError::InvalidArgument(
                "memory must be positive".to_string(),
            ));
        }
        if spec.cpus == 0 {
            return Err(ProvisionError::InvalidArgument(
                "cpu count must be positive".to_string(),
            ));
        }

        let machine_type = spec
            .machine_type
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| DEFAULT_MACHINE_TYPE.to_string());

        Ok(Self {
            storage,
            network,
            name: spec.name.filter(|n| !n.is_empty()),
            machine_type,
            arch: spec.arch,
            memory_mb: spec.memory_mb,
            cpus: spec.cpus,
            ctx,
        })
    }

    pub fn machine_type(&self) -> &str {
        &self.machine_type
    }

    fn record(&self, name: String) -> CreateMachineRecord {
        CreateMachineRecord {
            name,
            machine_type: self.machine_type.clone(),
            arch: self.arch.clone(),
            memory_mb: self.memory_mb,
            cpus: self.cpus,
            status: MachineStatus::Installing,
        }
    }

    async fn create_record(&self) -> Result<Machine> {
        if let Some(name) = &self.name {
            return Ok(self.ctx.store.create_machine(self.record(name.clone())).await?);
        }

        // Count and insert under one lock so concurrent runs get distinct names
        let _guard = self
            .ctx
            .locks
            .acquire(&ResourceLocks::machine_name_key(&self.machine_type))
            .await;
        let existing = self
            .ctx
            .store
            .count_machines_by_type(&self.machine_type)
            .await?;
        let name = generate_machine_name(&self.machine_type, existing);
        debug!(machine_type = %self.machine_type, existing, name = %name, "Generated machine name");

        Ok(self.ctx.store.create_machine(self.record(name)).await?)
    }

    async fn attach(&self, machine: &mut Machine) -> Result<()> {
        let ids = self.storage.ids();
        self.ctx.store.attach_storage(&machine.id, &ids).await?;
        self.ctx
            .store
            .attach_network(&machine.id, &self.network.id)
            .await?;

        machine.storage_ids = ids;
        machine.network_id = Some(self.network.id.clone());
        Ok(())
    }

    /// Materialize (if needed), look up and activate one data disk.
    async fn activate_disk(&self, disk: &Storage) -> Result<VolumeHandle> {
        let _guard = self
            .ctx
            .locks
            .acquire(&ResourceLocks::storage_key(&disk.id))
            .await;

        let mut current = self
            .ctx
            .store
            .get_storage(&disk.id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("storage {}", disk.id)))?;

        if disk.active || current.active {
            return Err(already_active(&current));
        }

        if !current.initialized {
            info!(storage_id = %current.id, name = %current.name, location = %current.location, "Materializing storage volume");
            self.ctx
                .hypervisor
                .create_storage_volume(&current.volume_descriptor())
                .await?;
            current.initialized = true;
            self.ctx.store.save_storage(&current).await?;
        }

        let handle = self
            .ctx
            .hypervisor
            .lookup_storage_volume_by_name(&current.name)
            .await?;

        if !self.ctx.store.activate_storage(&current.id).await? {
            return Err(already_active(&current));
        }

        debug!(storage_id = %current.id, path = %handle.path.display(), "Storage activated");
        Ok(handle)
    }

    async fn create_domain(
        &self,
        machine: &Machine,
        activated: &mut Vec<String>,
    ) -> Result<DomainHandle> {
        let mut disks = Vec::with_capacity(self.storage.data_disks.len());
        for disk in &self.storage.data_disks {
            disks.push(self.activate_disk(disk).await?);
            activated.push(disk.id.clone());
        }

        let spec = DomainSpec {
            id: machine.id.clone(),
            name: machine.name.clone(),
            arch: self.arch.clone(),
            memory_mb: self.memory_mb,
            max_memory_mb: self.memory_mb,
            vcpus: self.cpus,
            boot_image: self.storage.boot_image.location.clone(),
            disks,
            nic: NetworkCard::from(&self.network),
        };

        Ok(self.ctx.hypervisor.create_domain(&spec).await?)
    }

    async fn compensate(&self, machine: &Machine, activated: &[String]) {
        for id in activated.iter().rev() {
            if let Err(e) = self.ctx.store.deactivate_storage(id).await {
                warn!(machine = %machine.name, storage_id = %id, error = %e, "Failed to deactivate storage");
            }
        }

        if let Err(e) = self
            .ctx
            .store
            .update_machine_status(&machine.id, MachineStatus::Failed)
            .await
        {
            warn!(machine = %machine.name, error = %e, "Failed to mark machine as failed");
        }
    }
}

fn already_active(storage: &Storage) -> ProvisionError {
    ProvisionError::StorageAlreadyActive {
        id: storage.id.clone(),
        name: storage.name.clone(),
    }
}

#[async_trait]
impl Command for CreateMachine {
    type Output = Machine;

    fn name(&self) -> &'static str {
        "create_machine"
    }

    fn connection(&self) -> &Arc<dyn HypervisorGateway> {
        &self.ctx.hypervisor
    }

    async fn run(&self) -> Result<Machine> {
        let mut machine = self.create_record().await?;
        info!(op = self.name(), machine = %machine.name, machine_id = %machine.id, "Machine record created");

        let mut activated = Vec::new();
        let result = match self.attach(&mut machine).await {
            Ok(()) => self.create_domain(&machine, &mut activated).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(domain) => {
                info!(
                    machine = %machine.name,
                    pid = ?domain.pid,
                    api_socket = %domain.api_socket.display(),
                    "Domain created"
                );
                Ok(machine)
            }
            Err(e) => {
                error!(machine = %machine.name, error = %e, "Provisioning failed, rolling back");
                self.compensate(&machine, &activated).await;
                Err(e)
            }
        }
    }
}
