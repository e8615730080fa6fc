//! Shared fixtures for provisioning tests.
#![allow(dead_code)]

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;

use async_trait::async_trait;
use tempfile::TempDir;

use mvirt_provision::config::StorageConfig;
use mvirt_provision::hypervisor::{
    self, DomainHandle, DomainSpec, HypervisorError, HypervisorGateway, VolumeDescriptor,
    VolumeHandle,
};
use mvirt_provision::model::{Machine, MachineStatus, Network, Storage};
use mvirt_provision::store::{
    self, CreateMachineRecord, CreateNetworkRecord, CreateStorageRecord, MachineStore,
    NetworkStore, SqliteStore, StorageStore,
};
use mvirt_provision::{Command, CreateStorage, MachineSpec, ProvisionContext};

// =============================================================================
// Fake hypervisor
// =============================================================================

#[derive(Default)]
struct FakeState {
    domains: Vec<DomainSpec>,
    volumes: HashMap<String, VolumeDescriptor>,
    created_volumes: Vec<String>,
    lookups: Vec<String>,
}

/// In-memory gateway that records every call.
#[derive(Default)]
pub struct FakeHypervisor {
    state: Mutex<FakeState>,
    fail_domains: bool,
}

impl FakeHypervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every `create_domain` call fails.
    pub fn failing_domains() -> Self {
        Self {
            fail_domains: true,
            ..Self::default()
        }
    }

    /// Pretend a volume was materialized earlier.
    pub fn seed_volume(&self, storage: &Storage) {
        let mut state = self.state.lock().unwrap();
        state
            .volumes
            .insert(storage.name.clone(), storage.volume_descriptor());
    }

    pub fn domains(&self) -> Vec<DomainSpec> {
        self.state.lock().unwrap().domains.clone()
    }

    pub fn created_volumes(&self) -> Vec<String> {
        self.state.lock().unwrap().created_volumes.clone()
    }

    pub fn lookups(&self) -> Vec<String> {
        self.state.lock().unwrap().lookups.clone()
    }
}

#[async_trait]
impl HypervisorGateway for FakeHypervisor {
    async fn create_domain(&self, spec: &DomainSpec) -> hypervisor::Result<DomainHandle> {
        if self.fail_domains {
            return Err(HypervisorError::CommandFailed {
                command: "create domain".to_string(),
                stderr: "boom".to_string(),
            });
        }

        let mut state = self.state.lock().unwrap();
        state.domains.push(spec.clone());
        Ok(DomainHandle {
            name: spec.name.clone(),
            pid: Some(4242),
            api_socket: PathBuf::from(format!("/run/fake/{}.sock", spec.id)),
        })
    }

    async fn create_storage_volume(&self, volume: &VolumeDescriptor) -> hypervisor::Result<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(existing) = state.volumes.get(&volume.name)
            && existing.path != volume.path
        {
            return Err(HypervisorError::VolumeExists {
                name: volume.name.clone(),
                existing: existing.path.clone(),
            });
        }
        state.created_volumes.push(volume.name.clone());
        state.volumes.insert(volume.name.clone(), volume.clone());
        Ok(())
    }

    async fn lookup_storage_volume_by_name(&self, name: &str) -> hypervisor::Result<VolumeHandle> {
        let mut state = self.state.lock().unwrap();
        state.lookups.push(name.to_string());
        let volume = state
            .volumes
            .get(name)
            .ok_or_else(|| HypervisorError::VolumeNotFound(name.to_string()))?;
        Ok(VolumeHandle {
            name: volume.name.clone(),
            path: PathBuf::from(&volume.path),
            size_bytes: volume.size_mb * 1024 * 1024,
        })
    }
}

// =============================================================================
// Counting store
// =============================================================================

/// SQLite store that counts `activate_storage` calls per storage ID.
pub struct CountingStore {
    inner: SqliteStore,
    activations: Mutex<HashMap<String, usize>>,
}

impl CountingStore {
    pub fn new(inner: SqliteStore) -> Self {
        Self {
            inner,
            activations: Mutex::new(HashMap::new()),
        }
    }

    pub fn activations(&self, storage_id: &str) -> usize {
        self.activations
            .lock()
            .unwrap()
            .get(storage_id)
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait]
impl MachineStore for CountingStore {
    async fn create_machine(&self, req: CreateMachineRecord) -> store::Result<Machine> {
        self.inner.create_machine(req).await
    }

    async fn get_machine(&self, id: &str) -> store::Result<Option<Machine>> {
        self.inner.get_machine(id).await
    }

    async fn get_machine_by_name(
        &self,
        machine_type: &str,
        name: &str,
    ) -> store::Result<Option<Machine>> {
        self.inner.get_machine_by_name(machine_type, name).await
    }

    async fn list_machines(&self) -> store::Result<Vec<Machine>> {
        self.inner.list_machines().await
    }

    async fn count_machines_by_type(&self, machine_type: &str) -> store::Result<u64> {
        self.inner.count_machines_by_type(machine_type).await
    }

    async fn attach_storage(&self, machine_id: &str, storage_ids: &[String]) -> store::Result<()> {
        self.inner.attach_storage(machine_id, storage_ids).await
    }

    async fn attach_network(&self, machine_id: &str, network_id: &str) -> store::Result<()> {
        self.inner.attach_network(machine_id, network_id).await
    }

    async fn update_machine_status(
        &self,
        id: &str,
        status: MachineStatus,
    ) -> store::Result<Machine> {
        self.inner.update_machine_status(id, status).await
    }
}

#[async_trait]
impl StorageStore for CountingStore {
    async fn create_storage(&self, req: CreateStorageRecord) -> store::Result<Storage> {
        self.inner.create_storage(req).await
    }

    async fn get_storage(&self, id: &str) -> store::Result<Option<Storage>> {
        self.inner.get_storage(id).await
    }

    async fn list_storage(&self) -> store::Result<Vec<Storage>> {
        self.inner.list_storage().await
    }

    async fn list_storage_by_location(&self, location: &str) -> store::Result<Vec<Storage>> {
        self.inner.list_storage_by_location(location).await
    }

    async fn save_storage(&self, storage: &Storage) -> store::Result<()> {
        self.inner.save_storage(storage).await
    }

    async fn activate_storage(&self, id: &str) -> store::Result<bool> {
        *self
            .activations
            .lock()
            .unwrap()
            .entry(id.to_string())
            .or_default() += 1;
        self.inner.activate_storage(id).await
    }

    async fn deactivate_storage(&self, id: &str) -> store::Result<()> {
        self.inner.deactivate_storage(id).await
    }
}

#[async_trait]
impl NetworkStore for CountingStore {
    async fn create_network(&self, req: CreateNetworkRecord) -> store::Result<Network> {
        self.inner.create_network(req).await
    }

    async fn get_network(&self, id: &str) -> store::Result<Option<Network>> {
        self.inner.get_network(id).await
    }

    async fn list_networks(&self) -> store::Result<Vec<Network>> {
        self.inner.list_networks().await
    }
}

// =============================================================================
// Fixture
// =============================================================================

pub struct Fixture {
    pub ctx: ProvisionContext,
    pub store: Arc<CountingStore>,
    pub hypervisor: Arc<FakeHypervisor>,
    pub config: StorageConfig,
    _dir: TempDir,
}

pub async fn setup() -> Fixture {
    setup_with(FakeHypervisor::new()).await
}

pub async fn setup_with(hypervisor: FakeHypervisor) -> Fixture {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(CountingStore::new(
        SqliteStore::new(dir.path()).await.unwrap(),
    ));
    let hypervisor = Arc::new(hypervisor);
    let ctx = ProvisionContext::new(store.clone(), hypervisor.clone());

    Fixture {
        ctx,
        store,
        hypervisor,
        config: StorageConfig::new("/vm/images"),
        _dir: dir,
    }
}

impl Fixture {
    /// A fresh, inactive storage record.
    pub async fn storage(&self, name: &str, size_mb: u64) -> Storage {
        CreateStorage::new(name, size_mb, "qcow2", &self.config, self.ctx.clone())
            .unwrap()
            .run()
            .await
            .unwrap()
    }

    /// A storage record whose volume already exists on the hypervisor.
    pub async fn initialized_storage(&self, name: &str, size_mb: u64) -> Storage {
        let mut storage = self.storage(name, size_mb).await;
        storage.initialized = true;
        self.store.save_storage(&storage).await.unwrap();
        self.hypervisor.seed_volume(&storage);
        storage
    }

    pub async fn network(&self) -> Network {
        self.store
            .create_network(CreateNetworkRecord {
                mac: "52:54:00:12:34:56".to_string(),
                network: "br0".to_string(),
                model: "virtio".to_string(),
            })
            .await
            .unwrap()
    }

    pub async fn reload(&self, storage: &Storage) -> Storage {
        self.store.get_storage(&storage.id).await.unwrap().unwrap()
    }
}

pub fn spec(name: Option<&str>) -> MachineSpec {
    MachineSpec {
        name: name.map(str::to_string),
        machine_type: None,
        arch: std::env::consts::ARCH.to_string(),
        memory_mb: 1024,
        cpus: 2,
    }
}
