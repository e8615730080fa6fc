//! Configuration lookup.
//!
//! Values are read through [`ConfigSource`] and turned into typed config
//! once, at startup, then passed into the operations that need them. The
//! binary fills the source from its flags and their `MVIRT_*` environment
//! fallbacks.

use std::collections::HashMap;

use crate::error::{ProvisionError, Result};

/// Key holding the directory new storage images are placed in.
pub const STORAGE_LOCATION_KEY: &str = "storage_location";

pub trait ConfigSource: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
}

impl ConfigSource for HashMap<String, String> {
    fn get(&self, key: &str) -> Option<String> {
        HashMap::get(self, key).cloned()
    }
}

/// Where storage images live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageConfig {
    pub base_location: String,
}

impl StorageConfig {
    pub fn new(base_location: impl Into<String>) -> Self {
        let base_location: String = base_location.into();
        let base_location = match base_location.strip_suffix('/') {
            Some(trimmed) if !trimmed.is_empty() => trimmed.to_string(),
            _ => base_location,
        };
        Self { base_location }
    }

    pub fn from_source(source: &dyn ConfigSource) -> Result<Self> {
        let base = source
            .get(STORAGE_LOCATION_KEY)
            .filter(|value| !value.trim().is_empty())
            .ok_or_else(|| {
                ProvisionError::InvalidArgument(format!(
                    "missing configuration value '{STORAGE_LOCATION_KEY}'"
                ))
            })?;
        Ok(Self::new(base))
    }
}
