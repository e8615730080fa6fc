use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use super::{Command, ProvisionContext};
use crate::config::StorageConfig;
use crate::error::{ProvisionError, Result};
use crate::hypervisor::HypervisorGateway;
use crate::model::Storage;
use crate::store::CreateStorageRecord;

/// Image path for a storage volume: `<base>/<name><size>MB<format>`.
///
/// Identical name, size and format map to the same path. Callers that need
/// distinct images must pick distinct names.
pub fn storage_location(config: &StorageConfig, name: &str, size_mb: u64, format: &str) -> String {
    format!("{}/{}{}MB{}", config.base_location, name, size_mb, format)
}

/// Creates a storage record for a disk image that does not exist yet.
///
/// No hypervisor call is made here; the image is materialized when a
/// machine first attaches the storage.
pub struct CreateStorage {
    name: String,
    size_mb: u64,
    format: String,
    location: String,
    ctx: ProvisionContext,
}

impl CreateStorage {
    pub fn new(
        name: impl Into<String>,
        size_mb: u64,
        format: impl Into<String>,
        config: &StorageConfig,
        ctx: ProvisionContext,
    ) -> Result<Self> {
        let name = name.into();
        let format = format.into();

        if name.is_empty() {
            return Err(ProvisionError::InvalidArgument(
                "storage name must not be empty".to_string(),
            ));
        }
        if name.contains('/') {
            return Err(ProvisionError::InvalidArgument(format!(
                "storage name '{name}' must not contain '/'"
            )));
        }
        if size_mb == 0 {
            return Err(ProvisionError::InvalidArgument(
                "storage size must be positive".to_string(),
            ));
        }
        if format.is_empty() {
            return Err(ProvisionError::InvalidArgument(
                "storage format must not be empty".to_string(),
            ));
        }

        let location = storage_location(config, &name, size_mb, &format);

        Ok(Self {
            name,
            size_mb,
            format,
            location,
            ctx,
        })
    }

    pub fn location(&self) -> &str {
        &self.location
    }
}

#[async_trait]
impl Command for CreateStorage {
    type Output = Storage;

    fn name(&self) -> &'static str {
        "create_storage"
    }

    fn connection(&self) -> &Arc<dyn HypervisorGateway> {
        &self.ctx.hypervisor
    }

    async fn run(&self) -> Result<Storage> {
        let existing = self
            .ctx
            .store
            .list_storage_by_location(&self.location)
            .await?;
        if !existing.is_empty() {
            warn!(
                location = %self.location,
                existing = existing.len(),
                "Storage location already used by another record, images will collide"
            );
        }

        let storage = self
            .ctx
            .store
            .create_storage(CreateStorageRecord {
                name: self.name.clone(),
                location: self.location.clone(),
                format: self.format.clone(),
                size_mb: self.size_mb,
            })
            .await?;

        info!(
            op = self.name(),
            storage_id = %storage.id,
            name = %storage.name,
            location = %storage.location,
            "Storage record created"
        );
        Ok(storage)
    }
}
