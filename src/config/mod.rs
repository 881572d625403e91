//! Configuration system for Timeslicer.
//!
//! One YAML file carries the scheduler tunables and the process, tree and freerun
//! declarations. `ProcessRegistry` turns the declarations into the validated,
//! read-only view every component is constructed with.

use eyre::Result;
use std::path::PathBuf;

pub use self::process::{BlockingType, FreerunEntryConfig, ProcessEntry, TreeEntry};
pub use self::registry::{FreerunContext, ProcessContext, ProcessRegistry, Rejection, TreeContext};
pub use self::settings::{GcConfig, SchedulerSettings, StorageBackend, StorageConfig, TimeslicerConfig};

mod process;
mod registry;
mod settings;

/// Load configuration from the standard search paths.
///
/// Search order:
/// 1. Explicit path if provided
/// 2. ~/.config/timeslicer/timeslicer.yml (user config)
/// 3. ./timeslicer.yml (local config)
/// 4. Default values
pub fn load_config(explicit_path: Option<&PathBuf>) -> Result<TimeslicerConfig> {
    let config = TimeslicerConfig::load(explicit_path)?;
    config.validate()?;
    Ok(config)
}
