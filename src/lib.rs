//! Node-side blob storage for a content-addressed file-caching cluster.
//!
//! A node keeps its blobs on one or more storage media (local disk, a
//! WebDAV server, an S3 bucket), addressed by content hash and sharded by
//! the hash's first byte. The same media serve downloads and the synthetic
//! bandwidth probes ("measure files") the cluster uses to rate nodes.

pub mod config;
pub mod error;
pub mod storage;
pub mod transfer;

pub use config::{ClusterConfig, StorageEntry};
pub use error::{StorageError, StorageResult};
pub use storage::{open_storages, Storage, StorageRegistry};

/// User agent sent on every outbound request to a network-backed medium.
pub const USER_AGENT: &str = concat!("cluster-storage/", env!("CARGO_PKG_VERSION"));
