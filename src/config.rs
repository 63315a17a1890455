/// Runtime configuration for the background services
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Config {
    pub storage: StorageConfig,
    pub tabs: TabStoreConfig,
    /// How long a caller waits for a router response
    pub request_timeout_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            storage: StorageConfig::default(),
            tabs: TabStoreConfig::default(),
            request_timeout_ms: 3000,
        }
    }
}

impl Config {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct StorageConfig {
    pub debounce_ms: u64,
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
    /// Usage ratio at which quota status becomes a warning
    pub warning_ratio: f64,
    /// Usage ratio above which quota status becomes critical
    pub critical_ratio: f64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig {
            debounce_ms: 500,
            max_retries: 3,
            retry_base_delay_ms: 1000,
            warning_ratio: 0.80,
            critical_ratio: 0.95,
        }
    }
}

impl StorageConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    /// Backoff before retry number `attempt` (0-based): base, 2x base, 4x base...
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms.saturating_mul(1u64 << attempt.min(16)))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TabStoreConfig {
    pub refresh_batch_size: usize,
}

impl Default for TabStoreConfig {
    fn default() -> Self {
        TabStoreConfig { refresh_batch_size: 50 }
    }
}
