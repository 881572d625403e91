//! Top-level configuration file.
//!
//! Loaded from an explicit path, ~/.config/timeslicer/timeslicer.yml or ./timeslicer.yml

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use super::process::{FreerunEntryConfig, ProcessEntry, TreeEntry};

/// Configuration for Timeslicer.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct TimeslicerConfig {
    /// Scheduler-wide tunables.
    pub settings: SchedulerSettings,

    /// Garbage collector tunables.
    pub gc: GcConfig,

    /// Storage settings.
    pub storage: StorageConfig,

    /// Managed processes.
    pub processes: Vec<ProcessEntry>,

    /// Timetable trees over the managed processes.
    pub trees: Vec<TreeEntry>,

    /// Freerun schedulables.
    pub freerun: Vec<FreerunEntryConfig>,
}

impl TimeslicerConfig {
    /// Load configuration with fallback chain.
    ///
    /// Search order:
    /// 1. Explicit path if provided
    /// 2. ~/.config/timeslicer/timeslicer.yml
    /// 3. ./timeslicer.yml
    /// 4. Defaults
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("timeslicer").join("timeslicer.yml");
            if user_config.exists() {
                match Self::load_from_file(&user_config) {
                    Ok(config) => {
                        log::info!("Loaded config from {}", user_config.display());
                        return Ok(config);
                    }
                    Err(e) => {
                        log::warn!("Failed to load {}: {}", user_config.display(), e);
                    }
                }
            }
        }

        let local_config = PathBuf::from("timeslicer.yml");
        if local_config.exists() {
            match Self::load_from_file(&local_config) {
                Ok(config) => {
                    log::info!("Loaded config from timeslicer.yml");
                    return Ok(config);
                }
                Err(e) => {
                    log::warn!("Failed to load timeslicer.yml: {}", e);
                }
            }
        }

        log::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;
        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;
        Ok(config)
    }

    /// Validate the scalar tunables; process and tree entries are checked by the registry.
    pub fn validate(&self) -> Result<()> {
        crate::time::parse_timeperiod(&self.settings.start_timeperiod)
            .map_err(|e| eyre::eyre!("settings.start-timeperiod: {}", e))?;
        if self.gc.run_interval_secs == 0 {
            eyre::bail!("gc.run-interval-secs must be > 0");
        }
        if self.gc.release_lag_minutes < 0 {
            eyre::bail!("gc.release-lag-minutes must be >= 0");
        }
        Ok(())
    }
}

/// Scheduler-wide tunables.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SchedulerSettings {
    /// System start boundary; trees grow from here.
    #[serde(rename = "start-timeperiod")]
    pub start_timeperiod: String,

    /// Delay after a period closes before historical processes run on it.
    #[serde(rename = "trigger-lag-minutes")]
    pub trigger_lag_minutes: i64,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            start_timeperiod: "2020010100".to_string(),
            trigger_lag_minutes: 5,
        }
    }
}

/// Garbage collector tunables.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct GcConfig {
    /// Seconds between collector ticks.
    #[serde(rename = "run-interval-secs")]
    pub run_interval_secs: u64,

    /// Age after which unresolved work is canceled.
    #[serde(rename = "life-support-hours")]
    pub life_support_hours: i64,

    /// Staleness since the last submission required for cancellation.
    #[serde(rename = "resubmit-after-hours")]
    pub resubmit_after_hours: i64,

    /// Grace period before enlisted work is reposted.
    #[serde(rename = "release-lag-minutes")]
    pub release_lag_minutes: i64,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            run_interval_secs: 60,
            life_support_hours: 48,
            resubmit_after_hours: 1,
            release_lag_minutes: 15,
        }
    }
}

/// Storage backend selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Jsonl,
    Memory,
}

/// Storage settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,

    /// JSONL data directory.
    #[serde(rename = "data-dir")]
    pub data_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        let default_dir = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("timeslicer");

        Self {
            backend: StorageBackend::Jsonl,
            data_dir: default_dir,
        }
    }
}
