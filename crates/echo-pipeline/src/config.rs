// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>

//! Pipeline configuration and the config storage port.
//!
//! Storage adapters (filesystem, in-memory) implement [`ConfigStore`];
//! [`ConfigService`] handles (de)serialization on top of them.

use std::time::Duration;

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;

/// Key under which [`PipelineConfig`] is stored.
pub const PIPELINE_CONFIG_KEY: &str = "pipeline";

/// Storage port for raw config blobs (keyed by logical name).
pub trait ConfigStore {
    /// Load a raw config blob. Returns `NotFound` when missing.
    fn load_raw(&self, key: &str) -> Result<Vec<u8>, ConfigError>;
    /// Persist a raw config blob.
    fn save_raw(&self, key: &str, data: &[u8]) -> Result<(), ConfigError>;
}

/// Error type for config operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Key not present in store.
    #[error("not found")]
    NotFound,
    /// I/O error while reading/writing.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Serialization/deserialization failure.
    #[error("serde error: {0}")]
    Serde(#[from] serde_json::Error),
    /// A loaded value is out of range.
    #[error("invalid config: {0}")]
    Invalid(String),
    /// Catch-all error variant.
    #[error("other: {0}")]
    Other(String),
}

/// Serializes config values and delegates storage to a [`ConfigStore`].
#[derive(Debug)]
pub struct ConfigService<S> {
    store: S,
}

impl<S> ConfigService<S> {
    /// Create a new service using the given store.
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Borrow the inner store.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Consume the service and return the inner store.
    pub fn into_inner(self) -> S {
        self.store
    }
}

impl<S> ConfigService<S>
where
    S: ConfigStore,
{
    /// Load and deserialize a config value for `key`. Returns `Ok(None)` if missing.
    pub fn load<T>(&self, key: &str) -> Result<Option<T>, ConfigError>
    where
        T: DeserializeOwned,
    {
        match self.store.load_raw(key) {
            Ok(bytes) if bytes.is_empty() => Ok(None),
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(ConfigError::NotFound) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Serialize and persist a config value for `key`.
    pub fn save<T>(&self, key: &str, value: &T) -> Result<(), ConfigError>
    where
        T: Serialize,
    {
        let data = serde_json::to_vec_pretty(value)?;
        self.store.save_raw(key, &data)
    }
}

/// Tunables of one pipeline instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Maximum number of instructions in `Issued`/`Executing` at once.
    pub concurrency_cap: usize,
    /// Period of the fallback scheduling tick in milliseconds; `0` disables it.
    pub safety_tick_ms: u64,
    /// How long finalized instruction records stay queryable.
    pub retention_ms: u64,
    /// Maximum number of retained records.
    pub retention_capacity: usize,
    /// Buffer size of the lifecycle event channel.
    pub event_capacity: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            concurrency_cap: 10,
            safety_tick_ms: 250,
            retention_ms: 30_000,
            retention_capacity: 256,
            event_capacity: 1024,
        }
    }
}

impl PipelineConfig {
    /// Default config with a different concurrency cap.
    pub fn with_concurrency_cap(concurrency_cap: usize) -> Self {
        Self {
            concurrency_cap,
            ..Self::default()
        }
    }

    /// Rejects values the pipeline cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.concurrency_cap == 0 {
            return Err(ConfigError::Invalid("concurrency_cap must be at least 1".into()));
        }
        if self.event_capacity == 0 {
            return Err(ConfigError::Invalid("event_capacity must be at least 1".into()));
        }
        Ok(())
    }

    /// Safety tick period, `None` when disabled.
    pub fn safety_tick(&self) -> Option<Duration> {
        (self.safety_tick_ms > 0).then(|| Duration::from_millis(self.safety_tick_ms))
    }

    /// Loads the stored config, falling back to defaults when absent.
    pub fn load_or_default<S: ConfigStore>(service: &ConfigService<S>) -> Result<Self, ConfigError> {
        let config = service
            .load::<Self>(PIPELINE_CONFIG_KEY)?
            .unwrap_or_default();
        config.validate()?;
        Ok(config)
    }

    /// Persists this config under [`PIPELINE_CONFIG_KEY`].
    pub fn save<S: ConfigStore>(&self, service: &ConfigService<S>) -> Result<(), ConfigError> {
        self.validate()?;
        service.save(PIPELINE_CONFIG_KEY, self)
    }
}
