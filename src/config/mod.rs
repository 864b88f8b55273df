//! Unified configuration for the storage layer.
//!
//! Configuration is loaded with precedence: overrides > Env vars > Config file > Defaults
//!
//! # Example config file (tablerust.toml)
//! ```toml
//! max_batch_size = 100
//!
//! [parallel]
//! max_workers = 8
//! timeout_ms = 30000
//!
//! [table_creation]
//! attempts = 10
//! base_delay_ms = 3000
//! jitter_ms = 3000
//! ```
//!
//! Environment variables use the `TABLERUST_` prefix with `__` separating
//! nested keys, e.g. `TABLERUST_PARALLEL__MAX_WORKERS=8`.

mod defaults;

pub use defaults::*;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Main configuration for [`crate::TableStorage`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Entities per backend batch, clamped to `1..=MAX_BATCH_SIZE`
    pub max_batch_size: usize,
    /// Bulk parallel dispatch
    pub parallel: ParallelConfig,
    /// Table materialization retry loop
    pub table_creation: RetryPolicy,
    /// Cached handle eviction retry loop
    pub cache_eviction: RetryPolicy,
    /// Query paging
    pub query: QueryConfig,
    /// Seed for the backoff jitter source; random when unset
    pub jitter_seed: Option<u64>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            max_batch_size: MAX_BATCH_SIZE,
            parallel: ParallelConfig::default(),
            table_creation: RetryPolicy {
                attempts: DEFAULT_CREATE_ATTEMPTS,
                base_delay_ms: DEFAULT_CREATE_BASE_DELAY_MS,
                jitter_ms: DEFAULT_CREATE_JITTER_MS,
            },
            cache_eviction: RetryPolicy {
                attempts: DEFAULT_EVICT_ATTEMPTS,
                base_delay_ms: DEFAULT_EVICT_BASE_DELAY_MS,
                jitter_ms: DEFAULT_EVICT_JITTER_MS,
            },
            query: QueryConfig::default(),
            jitter_seed: None,
        }
    }
}

impl StorageConfig {
    /// Load configuration with precedence: overrides > Env > File > Defaults
    ///
    /// # Arguments
    /// * `config_path` - Optional path to TOML config file
    /// * `overrides` - Programmatic overrides to apply on top
    pub fn load(
        config_path: Option<&Path>,
        overrides: ConfigOverrides,
    ) -> Result<Self, ConfigError> {
        let mut figment = Figment::new().merge(Serialized::defaults(StorageConfig::default()));

        // Layer 1: Config file (if provided)
        if let Some(path) = config_path {
            figment = figment.merge(Toml::file(path));
        }

        // Layer 2: Environment variables with TABLERUST_ prefix
        figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));

        // Layer 3: Programmatic overrides
        figment = figment.merge(Serialized::defaults(overrides));

        let config: StorageConfig = figment.extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Load from environment and optional config file only
    pub fn from_env(config_path: Option<&Path>) -> Result<Self, ConfigError> {
        Self::load(config_path, ConfigOverrides::default())
    }

    /// Batch size actually used when paging partition groups.
    pub fn effective_batch_size(&self) -> usize {
        self.max_batch_size.clamp(1, MAX_BATCH_SIZE)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.parallel.max_workers == 0 {
            return Err(ConfigError::new("parallel.max_workers must be at least 1"));
        }
        if self.table_creation.attempts == 0 {
            return Err(ConfigError::new("table_creation.attempts must be at least 1"));
        }
        if self.cache_eviction.attempts == 0 {
            return Err(ConfigError::new("cache_eviction.attempts must be at least 1"));
        }
        if self.query.page_size == 0 {
            return Err(ConfigError::new("query.page_size must be at least 1"));
        }
        Ok(())
    }
}

/// Bulk parallel dispatch configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParallelConfig {
    pub max_workers: usize,
    /// Join timeout in milliseconds; unbounded when unset
    pub timeout_ms: Option<u64>,
}

impl Default for ParallelConfig {
    fn default() -> Self {
        Self {
            max_workers: DEFAULT_MAX_WORKERS,
            timeout_ms: None,
        }
    }
}

impl ParallelConfig {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}

/// Bounded retry with a fixed delay plus uniform random jitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base_delay_ms: u64,
    pub jitter_ms: u64,
}

impl RetryPolicy {
    /// Retry without sleeping; used by tests and in-process backends.
    pub fn immediate(attempts: u32) -> Self {
        Self {
            attempts,
            base_delay_ms: 0,
            jitter_ms: 0,
        }
    }

    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }
}

/// Query paging configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryConfig {
    /// Entities requested per query page
    pub page_size: usize,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_QUERY_PAGE_SIZE,
        }
    }
}

/// Programmatic overrides that take precedence over file and env config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_batch_size: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parallel: Option<ParallelOverrides>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jitter_seed: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ParallelOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_workers: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
#[error("configuration error: {message}")]
pub struct ConfigError {
    pub message: String,
}

impl ConfigError {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<figment::Error> for ConfigError {
    fn from(e: figment::Error) -> Self {
        Self::new(e.to_string())
    }
}
