//! Backend registry.
//!
//! Maps a configuration discriminator (`type: webdav`) to the pair of
//! constructors needed to build a backend from its `data` section. The
//! registry is an ordinary value built once at startup and handed to
//! whatever assembles the configured storages.

use std::collections::HashMap;

use serde::de::DeserializeOwned;

use super::backend::{Storage, StorageOptions};
use super::{local, s3, webdav};
use crate::config::StorageEntry;
use crate::error::{StorageError, StorageResult};

pub const STORAGE_LOCAL: &str = "local";
pub const STORAGE_WEBDAV: &str = "webdav";
pub const STORAGE_S3: &str = "s3";

/// Constructors for one backend type.
#[derive(Clone, Copy)]
pub struct StorageFactory {
    /// A backend with default options, not yet initialised.
    pub new: fn() -> Box<dyn Storage>,
    /// Parse the backend's options from a storage entry's `data`.
    pub new_config: fn(serde_yaml::Value) -> StorageResult<Box<dyn StorageOptions>>,
}

/// Parse `T` from a YAML value; a missing section yields `T`'s defaults.
pub fn parse_options<T>(value: serde_yaml::Value) -> StorageResult<Box<dyn StorageOptions>>
where
    T: DeserializeOwned + StorageOptions,
{
    let value = if value.is_null() {
        serde_yaml::Value::Mapping(Default::default())
    } else {
        value
    };
    let opts: T = serde_yaml::from_value(value).map_err(|e| StorageError::Config(e.to_string()))?;
    Ok(Box::new(opts))
}

#[derive(Default)]
pub struct StorageRegistry {
    factories: HashMap<String, StorageFactory>,
}

impl StorageRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with the backends shipped in this crate.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register(STORAGE_LOCAL, local::factory());
        registry.register(STORAGE_WEBDAV, webdav::factory());
        registry.register(STORAGE_S3, s3::factory());
        registry
    }

    pub fn register(&mut self, name: &str, factory: StorageFactory) {
        if self.factories.insert(name.to_string(), factory).is_some() {
            tracing::warn!(storage_type = name, "storage factory replaced");
        }
    }

    pub fn get(&self, name: &str) -> Option<&StorageFactory> {
        self.factories.get(name)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Build the (uninitialised) backend described by `entry`.
    pub fn build(&self, entry: &StorageEntry) -> StorageResult<Box<dyn Storage>> {
        let factory = self.get(&entry.kind).ok_or_else(|| {
            StorageError::Config(format!(
                "unknown storage type {:?} (known: {})",
                entry.kind,
                self.names().join(", ")
            ))
        })?;
        let opts = (factory.new_config)(entry.data.clone())
            .map_err(|e| StorageError::Config(format!("storage {:?}: {}", entry.id, e)))?;
        let mut storage = (factory.new)();
        storage.set_options(opts)?;
        Ok(storage)
    }
}
