//! CLI subcommands.

pub mod track;
pub mod trips;

use std::path::PathBuf;

use fleettrack::TrackerConfig;

use crate::error::CliError;

/// Resolve the tracker configuration: explicit path > user config dir >
/// built-in defaults.
pub fn load_config(explicit: Option<&PathBuf>) -> Result<TrackerConfig, CliError> {
    if let Some(path) = explicit {
        return Ok(TrackerConfig::from_file(path)?);
    }

    if let Some(config_dir) = dirs::config_dir() {
        let default_path = config_dir.join("fleettrack").join("config.ini");
        if default_path.exists() {
            return Ok(TrackerConfig::from_file(&default_path)?);
        }
    }

    Ok(TrackerConfig::default())
}
