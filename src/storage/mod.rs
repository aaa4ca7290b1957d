//! Storage backend abstraction.
//!
//! Provides a pluggable storage layer that can be backed by:
//! - Local filesystem
//! - A remote WebDAV server
//! - S3-compatible object storage (AWS S3, MinIO, R2, etc.)
//!
//! Backends are created through a [`StorageRegistry`] from the `storages`
//! section of the cluster configuration and initialised once at startup.

pub mod addressing;
mod backend;
mod local;
pub mod measure;
mod registry;
mod s3;
mod webdav;

use std::sync::Arc;

pub use backend::{
    cancellable, downcast_options, BlobReader, BlobWriter, HashVisitor, InitContext, Storage,
    StorageOptions, UploadStream,
};
pub use local::{LocalStorage, LocalStorageOption};
pub use registry::{parse_options, StorageFactory, StorageRegistry, STORAGE_LOCAL, STORAGE_S3, STORAGE_WEBDAV};
pub use s3::{S3Storage, S3StorageOption};
pub use webdav::{WebDavStorage, WebDavStorageOption, WebDavUser};

use crate::config::ClusterConfig;
use crate::error::StorageResult;

/// Build and initialise every storage listed in `config`, in order.
pub async fn open_storages(
    registry: &StorageRegistry,
    config: &ClusterConfig,
    ctx: &InitContext,
) -> StorageResult<Vec<Arc<dyn Storage>>> {
    let mut storages = Vec::with_capacity(config.storages.len());
    for entry in &config.storages {
        let mut storage = registry.build(entry)?;
        storage.init(ctx).await.map_err(|e| {
            tracing::error!(id = %entry.id, storage = %storage, error = %e, "storage init failed");
            e
        })?;
        tracing::info!(id = %entry.id, weight = entry.weight, storage = %storage, "storage ready");
        storages.push(Arc::from(storage));
    }
    Ok(storages)
}
