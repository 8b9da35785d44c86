//! Configuration for the storage core.
//!
//! Loaded once at startup from an optional `tally.toml` plus `TALLY_`
//! environment overrides (e.g. `TALLY_DATABASE__ENGINE=sqlite`). Every
//! field has a default so a bare install works with no file at all.

use serde::{Deserialize, Serialize};

use crate::error::{Result, TallyError};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// "sqlite" (embedded) or "mysql" (remote).
    pub engine: String,
    /// Path of the database file; ":memory:" for a throwaway database.
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            engine: "sqlite".into(),
            path: "tally.db".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MaintenanceConfig {
    /// Minutes between maintenance runs.
    pub interval_minutes: u64,
    /// Performance samples older than this are deleted.
    pub sample_retention_days: u32,
    /// Write-back entries idle longer than this are evicted.
    pub inactive_threshold_minutes: u32,
    /// Idle eviction runs every Kth maintenance cycle.
    pub eviction_cycle: u32,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            interval_minutes: 5,
            sample_retention_days: 30,
            inactive_threshold_minutes: 30,
            eviction_cycle: 4,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Lifetime of one inspection-cache snapshot, in seconds.
    pub inspection_lifetime_seconds: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            inspection_lifetime_seconds: 180,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub database: DatabaseConfig,
    pub maintenance: MaintenanceConfig,
    pub cache: CacheConfig,
}

impl StorageConfig {
    /// Layer the optional config file under `TALLY_` environment
    /// overrides.
    pub fn load(path: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path).required(false))
            .add_source(config::Environment::with_prefix("TALLY").separator("__"))
            .build()
            .map_err(|e| TallyError::Config(e.to_string()))?;
        settings
            .try_deserialize()
            .map_err(|e| TallyError::Config(e.to_string()))
    }

    /// A throwaway in-memory database with default settings.
    pub fn in_memory() -> Self {
        let mut config = Self::default();
        config.database.path = ":memory:".into();
        config
    }
}
