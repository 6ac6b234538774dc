use serde::Deserialize;
use std::path::PathBuf;

use crate::error::{Result, StoreError};
use crate::source::{SourceSet, UploadSource};
use crate::store::record::RecordKind;

/// Top-level configuration loaded from a TOML file.
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Storage configuration.
    pub storage: StorageConfig,
    /// Background maintenance configuration (optional).
    #[serde(default)]
    pub maintenance: MaintenanceConfig,
    /// List of sensors the gateway buffers.
    pub sensors: Vec<SensorConfig>,
}

/// Storage parameters for the RAM sector pool and the disk spool.
#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    /// Base directory where spool files are stored.
    pub base_path: PathBuf,
    /// Number of fixed-size sectors in the RAM pool.
    #[serde(default = "default_sector_count")]
    pub sector_count: u32,
    /// Free-sector percentage below which migration to disk starts.
    #[serde(default = "default_pressure_free_pct")]
    pub pressure_free_pct: u32,
}

/// Background maintenance cadence.
#[derive(Debug, Deserialize, Clone)]
pub struct MaintenanceConfig {
    /// Periodic pressure check interval in milliseconds.
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    /// Maximum sectors migrated per maintenance pass.
    #[serde(default = "default_migration_batch")]
    pub migration_batch: u32,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_interval_ms(),
            migration_batch: default_migration_batch(),
        }
    }
}

/// Per-sensor configuration row.
#[derive(Debug, Deserialize, Clone)]
pub struct SensorConfig {
    /// Numeric sensor id used for spool file naming.
    pub id: u32,
    /// Human-readable label shown in status output.
    pub name: String,
    /// Record layout: time-series (`tsd`) or event (`evt`).
    pub kind: RecordKind,
    /// Upload sources this sensor feeds. A sector stays live until the
    /// slowest of these has acknowledged past it.
    pub sources: Vec<UploadSource>,
}

impl SensorConfig {
    pub fn source_set(&self) -> SourceSet {
        self.sources.iter().copied().collect()
    }
}

fn default_sector_count() -> u32 { 4096 }
fn default_pressure_free_pct() -> u32 { 20 }
fn default_interval_ms() -> u64 { 1000 }
fn default_migration_batch() -> u32 { 8 }

impl Config {
    /// Load configuration from a TOML file at `path`.
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| StoreError::Config(format!("Cannot read config file: {e}")))?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| StoreError::Config(format!("Invalid TOML: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.sensors.is_empty() {
            return Err(StoreError::Config("No sensors defined".into()));
        }
        if self.storage.sector_count == 0 {
            return Err(StoreError::Config("sector_count must be > 0".into()));
        }
        if self.storage.pressure_free_pct >= 100 {
            return Err(StoreError::Config("pressure_free_pct must be < 100".into()));
        }
        if self.maintenance.migration_batch == 0 {
            return Err(StoreError::Config("migration_batch must be > 0".into()));
        }
        let mut seen = std::collections::HashSet::new();
        for sensor in &self.sensors {
            if !seen.insert(sensor.id) {
                return Err(StoreError::Config(format!(
                    "Duplicate sensor id {}", sensor.id
                )));
            }
            if sensor.sources.is_empty() {
                return Err(StoreError::Config(format!(
                    "Sensor {} declares no upload sources", sensor.id
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal_config() {
        let toml = r#"
            [storage]
            base_path = "/tmp/telem"

            [[sensors]]
            id = 1
            name = "coolant_temp"
            kind = "tsd"
            sources = ["gateway"]

            [[sensors]]
            id = 2
            name = "door_open"
            kind = "evt"
            sources = ["gateway", "hosted"]
        "#;
        let cfg: Config = toml::from_str(toml).expect("parse");
        cfg.validate().expect("validate");
        assert_eq!(cfg.storage.sector_count, 4096);
        assert_eq!(cfg.storage.pressure_free_pct, 20);
        assert_eq!(cfg.sensors.len(), 2);
        assert_eq!(cfg.sensors[0].kind, RecordKind::Tsd);
        assert!(cfg.sensors[1].source_set().contains(UploadSource::Hosted));
    }

    #[test]
    fn test_duplicate_sensor_id_rejected() {
        let toml = r#"
            [storage]
            base_path = "/tmp/telem"

            [[sensors]]
            id = 7
            name = "a"
            kind = "evt"
            sources = ["gateway"]

            [[sensors]]
            id = 7
            name = "b"
            kind = "evt"
            sources = ["hosted"]
        "#;
        let cfg: Config = toml::from_str(toml).expect("parse");
        assert!(cfg.validate().is_err());
    }
}
