//! Tunables for the sync engine, the background coordinator and the store.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::gesture::ShakeConfig;
use crate::offline_store::DEFAULT_CACHE_CAPACITY;
use crate::outbox::DEFAULT_MAX_ENTRIES;
use crate::safe_zone::SafeZone;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("could not parse configuration: {0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Failed attempts before an action is dropped.
    pub max_retries: u32,
    pub dispatch_timeout_ms: u64,
    /// Fallback drain tick while online with work queued.
    pub fallback_interval_ms: u64,
    pub max_queue_entries: usize,
    pub cache_capacity: usize,
    /// Ids remembered after delivery, for duplicate rejection.
    pub delivered_id_cache: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            dispatch_timeout_ms: 12_000,
            fallback_interval_ms: 30_000,
            max_queue_entries: DEFAULT_MAX_ENTRIES,
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            delivered_id_cache: 1_024,
        }
    }
}

impl SyncConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_retries == 0 {
            return Err(ConfigError::Invalid("max_retries must be at least 1".into()));
        }
        if self.dispatch_timeout_ms == 0 {
            return Err(ConfigError::Invalid("dispatch_timeout_ms must be non-zero".into()));
        }
        if self.fallback_interval_ms < 1_000 {
            return Err(ConfigError::Invalid(
                "fallback_interval_ms must be at least 1000".into(),
            ));
        }
        if self.max_queue_entries == 0 || self.cache_capacity == 0 || self.delivered_id_cache == 0
        {
            return Err(ConfigError::Invalid(
                "queue, cache and delivered-id capacities must be non-zero".into(),
            ));
        }
        Ok(())
    }

    pub fn dispatch_timeout(&self) -> Duration {
        Duration::from_millis(self.dispatch_timeout_ms)
    }

    pub fn fallback_interval(&self) -> Duration {
        Duration::from_millis(self.fallback_interval_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    pub heartbeat_interval_ms: u64,
    pub watch_backoff_base_ms: u64,
    pub watch_backoff_max_ms: u64,
    pub watch_backoff_jitter_ms: u64,
    pub shake: ShakeConfig,
    pub safe_zone: Option<SafeZone>,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 30_000,
            watch_backoff_base_ms: 1_000,
            watch_backoff_max_ms: 60_000,
            watch_backoff_jitter_ms: 500,
            shake: ShakeConfig::default(),
            safe_zone: None,
        }
    }
}

impl CoordinatorConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.heartbeat_interval_ms < 1_000 {
            return Err(ConfigError::Invalid(
                "heartbeat_interval_ms must be at least 1000".into(),
            ));
        }
        if self.watch_backoff_base_ms == 0
            || self.watch_backoff_max_ms < self.watch_backoff_base_ms
        {
            return Err(ConfigError::Invalid(
                "watch backoff must have 0 < base <= max".into(),
            ));
        }
        self.shake.validate().map_err(ConfigError::Invalid)?;
        if let Some(zone) = &self.safe_zone {
            zone.validate()
                .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        }
        Ok(())
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }
}

/// Where durable blobs live and how they are bound to this device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSettings {
    pub store_name: String,
    pub device_id: String,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            store_name: "haven".to_string(),
            device_id: "local".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HavenConfig {
    pub sync: SyncConfig,
    pub coordinator: CoordinatorConfig,
    pub store: StoreSettings,
}

impl HavenConfig {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.sync.validate()?;
        self.coordinator.validate()?;
        if self.store.store_name.is_empty() || self.store.device_id.is_empty() {
            return Err(ConfigError::Invalid(
                "store_name and device_id must be non-empty".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = HavenConfig::default();
        config.validate().unwrap();
        assert_eq!(config.sync.max_retries, 3);
        assert_eq!(config.sync.cache_capacity, 100);
        assert_eq!(config.coordinator.heartbeat_interval(), Duration::from_secs(30));
        assert_eq!(config.sync.fallback_interval(), Duration::from_secs(30));
    }

    #[test]
    fn partial_json_fills_defaults() {
        let config = HavenConfig::from_json(
            r#"{
                "sync": { "max_retries": 5 },
                "coordinator": {
                    "shake": { "threshold": 18.0 },
                    "safe_zone": { "center": { "lat": 10.0, "lon": 20.0 }, "radius_m": 150.0 }
                }
            }"#,
        )
        .unwrap();
        assert_eq!(config.sync.max_retries, 5);
        assert_eq!(config.sync.dispatch_timeout_ms, 12_000);
        assert_eq!(config.coordinator.shake.threshold, 18.0);
        assert_eq!(config.coordinator.shake.debounce_ms, 500);
        assert_eq!(config.coordinator.safe_zone.unwrap().radius_m, 150.0);
    }

    #[test]
    fn invalid_values_are_rejected() {
        assert!(HavenConfig::from_json(r#"{ "sync": { "max_retries": 0 } }"#).is_err());
        assert!(HavenConfig::from_json(
            r#"{ "coordinator": { "safe_zone": { "center": { "lat": 0.0, "lon": 0.0 }, "radius_m": 1.0 } } }"#
        )
        .is_err());
        assert!(matches!(
            HavenConfig::from_json("not json"),
            Err(ConfigError::Parse(_))
        ));
    }
}
