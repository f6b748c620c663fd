//! Replica configuration.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use rowsync_sync::SyncConfig;

use crate::error::{ReplicaError, Result};

/// Configuration for a [`crate::Replica`].
///
/// Loadable from JSON; missing fields take their defaults:
///
/// ```json
/// {
///   "serviceName": "todo-server",
///   "dbsDir": "/var/lib/todo",
///   "sync": { "topology": "client_server", "ackTimeoutInMs": 5000 }
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ReplicaConfig {
    /// Names the SQLite file holding this replica's databases.
    pub service_name: String,
    /// Directory for database files.
    pub dbs_dir: PathBuf,
    /// Sync configuration.
    pub sync: SyncConfig,
}

impl Default for ReplicaConfig {
    fn default() -> Self {
        Self {
            service_name: "rowsync".to_string(),
            dbs_dir: PathBuf::from("dbs"),
            sync: SyncConfig::default(),
        }
    }
}

impl ReplicaConfig {
    /// Read a JSON config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        serde_json::from_str(&text)
            .map_err(|e| ReplicaError::Config(format!("{}: {}", path.display(), e)))
    }

    pub fn with_service_name(mut self, name: impl Into<String>) -> Self {
        self.service_name = name.into();
        self
    }

    pub fn with_dbs_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.dbs_dir = dir.into();
        self
    }

    pub fn with_sync(mut self, sync: SyncConfig) -> Self {
        self.sync = sync;
        self
    }

    /// Path of the SQLite file for this service.
    pub fn db_path(&self) -> PathBuf {
        self.dbs_dir.join(format!("{}.db", self.service_name))
    }
}
