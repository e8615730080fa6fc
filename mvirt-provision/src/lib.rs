//! mvirt-provision - VM provisioning library.
//!
//! Creates storage records, activates their backing volumes and asks the
//! hypervisor for a new domain. The [`command`] module holds the two
//! operations; [`store`] and [`hypervisor`] are the collaborators they are
//! written against.

pub mod command;
pub mod config;
pub mod error;
pub mod hypervisor;
pub mod lock;
pub mod model;
pub mod store;

pub use command::{
    Command, CreateMachine, CreateStorage, MachineSpec, ProvisionContext, StorageSet,
};
pub use error::{ErrorKind, ProvisionError, Result};
