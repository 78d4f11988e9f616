//! Tracker configuration.
//!
//! All tunables in one place, loadable from an INI file. Every value has
//! a default matching the reference deployment, so a missing file or a
//! sparse one is fine; only malformed values are errors.
//!
//! ```ini
//! [broker]
//! url = wss://broker.example:8084/ws
//! username = fleet
//! password = secret
//!
//! [tracking]
//! stale_after_secs = 10
//! evict_interval_secs = 1
//! trend_window = 5
//! trend_min_interval_secs = 3
//! trend_threshold_m = 20.0
//! geocode_interval_secs = 30
//!
//! [trips]
//! terminal_radius_m = 100.0
//! ```

use std::path::Path;
use std::time::Duration;

use ini::Ini;
use thiserror::Error;

use crate::fleet::{DEFAULT_EVICT_INTERVAL, DEFAULT_STALE_AFTER};
use crate::geocode::DEFAULT_GEOCODE_INTERVAL;
use crate::ingest::transport::BrokerConfig;
use crate::proximity::ProximityConfig;
use crate::trips::SegmenterConfig;

/// Broker URL used when none is configured.
const DEFAULT_BROKER_URL: &str = "ws://localhost:8083/ws";

/// Errors loading or interpreting a config file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Read(#[from] ini::Error),

    #[error("invalid value for {key}: {value:?}")]
    InvalidValue { key: String, value: String },
}

/// Complete tracker configuration.
#[derive(Debug, Clone)]
pub struct TrackerConfig {
    pub broker: BrokerConfig,
    /// Silence window before a device is evicted.
    pub stale_after: Duration,
    /// Cadence of the eviction scan.
    pub evict_interval: Duration,
    pub proximity: ProximityConfig,
    /// Minimum interval between reverse-geocode lookups per device.
    pub geocode_interval: Duration,
    pub segmenter: SegmenterConfig,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            broker: BrokerConfig {
                url: DEFAULT_BROKER_URL.to_string(),
                username: None,
                password: None,
            },
            stale_after: DEFAULT_STALE_AFTER,
            evict_interval: DEFAULT_EVICT_INTERVAL,
            proximity: ProximityConfig::default(),
            geocode_interval: DEFAULT_GEOCODE_INTERVAL,
            segmenter: SegmenterConfig::default(),
        }
    }
}

impl TrackerConfig {
    /// Load configuration from an INI file, falling back to defaults for
    /// anything the file does not set.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let ini = Ini::load_from_file(path)?;
        Self::from_ini(&ini)
    }

    /// Parse configuration from INI text (primarily for tests).
    pub fn from_ini_str(text: &str) -> Result<Self, ConfigError> {
        let ini = Ini::load_from_str(text).map_err(ini::Error::Parse)?;
        Self::from_ini(&ini)
    }

    fn from_ini(ini: &Ini) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(broker) = ini.section(Some("broker")) {
            if let Some(url) = broker.get("url") {
                config.broker.url = url.to_string();
            }
            config.broker.username = broker.get("username").map(str::to_string);
            config.broker.password = broker.get("password").map(str::to_string);
        }

        if let Some(tracking) = ini.section(Some("tracking")) {
            if let Some(secs) = parse_opt::<u64>(tracking.get("stale_after_secs"), "stale_after_secs")? {
                config.stale_after = Duration::from_secs(secs);
            }
            if let Some(secs) =
                parse_opt::<u64>(tracking.get("evict_interval_secs"), "evict_interval_secs")?
            {
                config.evict_interval = Duration::from_secs(secs);
            }
            if let Some(window) = parse_opt::<usize>(tracking.get("trend_window"), "trend_window")? {
                config.proximity.window = window;
            }
            if let Some(secs) = parse_opt::<u64>(
                tracking.get("trend_min_interval_secs"),
                "trend_min_interval_secs",
            )? {
                config.proximity.min_interval = Duration::from_secs(secs);
            }
            if let Some(metres) =
                parse_opt::<f64>(tracking.get("trend_threshold_m"), "trend_threshold_m")?
            {
                config.proximity.threshold_m = metres;
            }
            if let Some(secs) = parse_opt::<u64>(
                tracking.get("geocode_interval_secs"),
                "geocode_interval_secs",
            )? {
                config.geocode_interval = Duration::from_secs(secs);
            }
        }

        if let Some(trips) = ini.section(Some("trips")) {
            if let Some(metres) =
                parse_opt::<f64>(trips.get("terminal_radius_m"), "terminal_radius_m")?
            {
                config.segmenter.terminal_radius_m = metres;
            }
        }

        Ok(config)
    }
}

fn parse_opt<T: std::str::FromStr>(
    value: Option<&str>,
    key: &str,
) -> Result<Option<T>, ConfigError> {
    match value {
        None => Ok(None),
        Some(raw) => raw.parse::<T>().map(Some).map_err(|_| ConfigError::InvalidValue {
            key: key.to_string(),
            value: raw.to_string(),
        }),
    }
}
