//! Configuration for storage backends.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use log::info;

use crate::storage::mock_store::MockBlockStore;
use crate::storage::remote_store::RemoteBlockStore;
use crate::storage::sqlite_store::SqliteBlockStore;
use crate::storage::{Storage, StorageError};

/// Available storage backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackend {
    Sqlite,
    Remote,
    Mock,
}

impl Default for StorageBackend {
    fn default() -> Self {
        StorageBackend::Sqlite
    }
}

impl std::str::FromStr for StorageBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "sqlite" | "local" | "embedded" => Ok(StorageBackend::Sqlite),
            "remote" | "object" | "s3" => Ok(StorageBackend::Remote),
            "mock" => Ok(StorageBackend::Mock),
            _ => Err(format!(
                "Unknown storage backend: {}. Valid options: sqlite, remote, mock",
                s
            )),
        }
    }
}

/// Configuration for the storage service.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    /// Data folder for the embedded backend, `bucket/prefix` for the
    /// remote one.
    pub path: String,
    pub ttl: Duration,
    pub read_only: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::default(),
            path: "storage.data".to_string(),
            ttl: Duration::from_secs(600),
            read_only: false,
        }
    }
}

impl StorageConfig {
    /// Create a storage instance based on the configuration.
    pub fn create_store(&self) -> Result<Arc<dyn Storage>, StorageError> {
        info!("using {:?} storage backend at {}", self.backend, self.path);
        match self.backend {
            StorageBackend::Sqlite => Ok(Arc::new(SqliteBlockStore::open(
                Path::new(&self.path),
                self.read_only,
                self.ttl,
            )?)),
            StorageBackend::Remote => Ok(Arc::new(RemoteBlockStore::open(&self.path, self.ttl)?)),
            StorageBackend::Mock => Ok(Arc::new(MockBlockStore::new(self.ttl))),
        }
    }
}
