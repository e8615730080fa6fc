//! Record store for machines, storage volumes and networks.
//!
//! Operations depend on the traits in [`traits`] only; [`SqliteStore`] is
//! the implementation the binary uses.
//!
//! ```text
//! CreateMachine → Arc<dyn RecordStore>
//!                      ↓
//!                store.count_machines_by_type("nix")   // name generation
//!                store.activate_storage(id)            // compare-and-swap
//! ```

mod error;
mod sqlite;
mod traits;

pub use error::{Result, StoreError};
pub use sqlite::SqliteStore;
pub use traits::*;
