//! Application configuration from the environment.

use std::env;
use std::time::Duration;

use log::warn;

use crate::storage::config::{StorageBackend, StorageConfig};

/// Top-level service configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Listen address of the HTTP façade.
    pub bind: String,
    pub storage: StorageConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:1999".to_string(),
            storage: StorageConfig::default(),
        }
    }
}

impl AppConfig {
    /// Create configuration from environment variables, falling back to
    /// defaults for anything unset.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(bind) = env::var("CASHIER_BIND") {
            config.bind = bind;
        }
        if let Ok(path) = env::var("CASHIER_PATH") {
            config.storage.path = path;
        }
        if let Ok(ttl) = env::var("CASHIER_TTL_SECS") {
            match ttl.parse::<u64>() {
                Ok(secs) => config.storage.ttl = Duration::from_secs(secs),
                Err(_) => warn!("Invalid CASHIER_TTL_SECS value: {}. Using default.", ttl),
            }
        }
        if let Ok(read_only) = env::var("CASHIER_READ_ONLY") {
            config.storage.read_only = matches!(read_only.as_str(), "1" | "true" | "yes");
        }
        if let Ok(backend) = env::var("STORAGE_BACKEND") {
            match backend.parse::<StorageBackend>() {
                Ok(backend) => config.storage.backend = backend,
                Err(e) => warn!("{}. Using default backend.", e),
            }
        }

        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.bind, "0.0.0.0:1999");
        assert_eq!(config.storage.backend, StorageBackend::Sqlite);
        assert_eq!(config.storage.ttl, Duration::from_secs(600));
    }
}
