//! Cluster node configuration.
//!
//! ```yaml
//! webdav-users:
//!   main:
//!     endpoint: https://dav.example.com/root/
//!     username: node
//!     password: secret
//! storages:
//!   - type: webdav
//!     id: dav-0
//!     weight: 100
//!     data:
//!       alias: main
//!       endpoint: cluster-a/
//! ```

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{StorageError, StorageResult};
use crate::storage::{InitContext, WebDavUser};

fn default_weight() -> u32 {
    100
}

/// One entry of the `storages` list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageEntry {
    /// Registry discriminator (`local`, `webdav`, `s3`, ...).
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub id: String,
    #[serde(default = "default_weight")]
    pub weight: u32,
    /// Backend-specific options, parsed by the backend's factory.
    #[serde(default)]
    pub data: serde_yaml::Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct ClusterConfig {
    pub storages: Vec<StorageEntry>,
    pub webdav_users: HashMap<String, WebDavUser>,
}

impl ClusterConfig {
    pub fn from_yaml(text: &str) -> StorageResult<Self> {
        let mut config: ClusterConfig =
            serde_yaml::from_str(text).map_err(|e| StorageError::Config(e.to_string()))?;
        for (i, entry) in config.storages.iter_mut().enumerate() {
            if entry.id.is_empty() {
                entry.id = format!("{}-{}", entry.kind, i);
            }
        }
        Ok(config)
    }

    pub async fn load(path: impl AsRef<Path>) -> StorageResult<Self> {
        let path = path.as_ref();
        let text = tokio::fs::read_to_string(path).await.map_err(|e| {
            StorageError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_yaml(&text)
    }

    /// Context handed to every storage's `init`.
    pub fn init_context(&self) -> InitContext {
        InitContext {
            webdav_users: self.webdav_users.clone(),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EXAMPLE: &str = r#"
webdav-users:
  main:
    endpoint: https://dav.example.com/root/
    username: node
    password: secret
storages:
  - type: webdav
    id: dav-0
    weight: 50
    data:
      alias: main
      endpoint: cluster-a/
  - type: local
    data:
      cache-path: /var/cache/node
"#;

    #[test]
    fn test_parse_config() {
        let config = ClusterConfig::from_yaml(EXAMPLE).unwrap();
        assert_eq!(config.storages.len(), 2);

        let dav = &config.storages[0];
        assert_eq!(dav.kind, "webdav");
        assert_eq!(dav.id, "dav-0");
        assert_eq!(dav.weight, 50);
        assert_eq!(dav.data["alias"], "main");

        let local = &config.storages[1];
        assert_eq!(local.id, "local-1");
        assert_eq!(local.weight, 100);

        let ctx = config.init_context();
        assert_eq!(ctx.webdav_users["main"].username, "node");
        assert!(!ctx.cancel.is_cancelled());
    }

    #[test]
    fn test_empty_config() {
        let config = ClusterConfig::from_yaml("{}").unwrap();
        assert!(config.storages.is_empty());
        assert!(config.webdav_users.is_empty());
    }

    #[test]
    fn test_invalid_config() {
        let err = ClusterConfig::from_yaml("storages:\n  - id: no-type\n").unwrap_err();
        assert!(matches!(err, StorageError::Config(_)));
        assert_eq!(err.exit_code(), 1);
    }

    #[tokio::test]
    async fn test_load_missing_file() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let err = ClusterConfig::load(temp_dir.path().join("absent.yaml"))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Config(_)));
    }
}
