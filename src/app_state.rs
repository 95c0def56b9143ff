//! Application state shared by all request handlers.

use std::sync::Arc;
use std::time::Duration;

use log::info;

use crate::config::AppConfig;
use crate::storage::mock_store::MockBlockStore;
use crate::storage::{Storage, StorageError};

/// Shared state: one storage handle for the whole process, injected into
/// every handler.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Storage>,
    pub config: AppConfig,
}

impl AppState {
    /// Create the application state from configuration, opening the
    /// configured storage backend.
    pub fn from_config(config: AppConfig) -> Result<Self, StorageError> {
        let store = config.storage.create_store()?;
        info!("application state initialized");
        Ok(Self { store, config })
    }

    /// State with an in-memory store, for tests.
    pub fn new_for_testing() -> Self {
        Self::with_store(Arc::new(MockBlockStore::new(Duration::from_secs(600))))
    }

    /// State wrapping an already opened store.
    pub fn with_store(store: Arc<dyn Storage>) -> Self {
        Self {
            store,
            config: AppConfig::default(),
        }
    }
}
