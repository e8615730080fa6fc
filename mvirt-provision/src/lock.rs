//! Advisory locks keyed by resource.
//!
//! A provisioning step that reads a record, decides, and writes it back
//! holds the key's lock for the whole sequence. Keys look like
//! `storage/<id>` or `machine-name/<type>`.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};

#[derive(Default)]
pub struct ResourceLocks {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl ResourceLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for and take the lock for `key`. Released when the guard drops.
    pub async fn acquire(&self, key: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().await;
            // Drop entries nobody holds or waits on
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            locks
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }

    pub fn storage_key(storage_id: &str) -> String {
        format!("storage/{storage_id}")
    }

    pub fn machine_name_key(machine_type: &str) -> String {
        format!("machine-name/{machine_type}")
    }
}
