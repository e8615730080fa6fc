//! Provisioning commands.
//!
//! Each command validates its arguments when constructed and does its work
//! in [`Command::run`]. Commands share a [`ProvisionContext`]: the record
//! store, the hypervisor connection and the advisory locks that make
//! check-then-write sequences safe between concurrent commands.

mod create_machine;
mod create_storage;

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::hypervisor::HypervisorGateway;
use crate::lock::ResourceLocks;
use crate::store::RecordStore;

pub use create_machine::{CreateMachine, MachineSpec, StorageSet, generate_machine_name};
pub use create_storage::{CreateStorage, storage_location};

/// Uniform execution contract for provisioning operations.
#[async_trait]
pub trait Command: Send + Sync {
    type Output: Send;

    /// Operation name, used in logs.
    fn name(&self) -> &'static str;

    /// The hypervisor connection this command is bound to.
    fn connection(&self) -> &Arc<dyn HypervisorGateway>;

    async fn run(&self) -> Result<Self::Output>;
}

/// Collaborators shared by all commands.
#[derive(Clone)]
pub struct ProvisionContext {
    pub store: Arc<dyn RecordStore>,
    pub hypervisor: Arc<dyn HypervisorGateway>,
    pub locks: Arc<ResourceLocks>,
}

impl ProvisionContext {
    pub fn new(store: Arc<dyn RecordStore>, hypervisor: Arc<dyn HypervisorGateway>) -> Self {
        Self {
            store,
            hypervisor,
            locks: Arc::new(ResourceLocks::new()),
        }
    }
}
