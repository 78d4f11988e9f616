//! Throttled reverse geocoding.
//!
//! Resolving coordinates to a display address is an external network
//! round trip (Nominatim), so it must never sit on the telemetry path: a
//! slow lookup for one device cannot be allowed to delay position updates
//! for another. Lookups are dispatched to the blocking pool and results
//! come back over a channel; the dispatch loop folds them into the fleet
//! registry whenever they arrive.
//!
//! The backend sits behind a trait so tests can swap in a canned
//! implementation without any network.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::catalog::DeviceId;

/// Minimum interval between lookups for the same device.
pub const DEFAULT_GEOCODE_INTERVAL: Duration = Duration::from_secs(30);

/// Nominatim reverse endpoint.
const NOMINATIM_URL: &str = "https://nominatim.openstreetmap.org/reverse";

/// Nominatim requires an identifying User-Agent.
const USER_AGENT: &str = "fleettrack/0.2 (+https://github.com/fleettrack/fleettrack)";

/// Errors from a reverse-geocode lookup.
#[derive(Debug, Clone, Error)]
pub enum GeocodeError {
    /// Request construction or transport failure.
    #[error("geocode request failed: {0}")]
    Http(String),

    /// Well-formed response without a usable display name.
    #[error("geocode response had no display name")]
    MissingDisplayName,
}

/// Reverse-geocode provider.
///
/// Implementations may block; callers dispatch them on the blocking pool.
pub trait GeocodeBackend: Send + Sync {
    /// Resolve coordinates to a human-readable place description.
    fn display_name(&self, lat: f64, lon: f64) -> Result<String, GeocodeError>;
}

/// Wire shape of a Nominatim `jsonv2` reverse response.
#[derive(Debug, Deserialize)]
struct NominatimResponse {
    display_name: Option<String>,
}

/// Production backend calling the public Nominatim instance.
pub struct NominatimBackend {
    client: reqwest::blocking::Client,
}

impl NominatimBackend {
    pub fn new() -> Result<Self, GeocodeError> {
        let client = reqwest::blocking::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| GeocodeError::Http(format!("failed to create HTTP client: {}", e)))?;
        Ok(Self { client })
    }
}

impl GeocodeBackend for NominatimBackend {
    fn display_name(&self, lat: f64, lon: f64) -> Result<String, GeocodeError> {
        let response = self
            .client
            .get(NOMINATIM_URL)
            .query(&[
                ("format", "jsonv2"),
                ("lat", &lat.to_string()),
                ("lon", &lon.to_string()),
            ])
            .send()
            .map_err(|e| GeocodeError::Http(format!("request failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(GeocodeError::Http(format!(
                "HTTP {} from geocoder",
                response.status()
            )));
        }

        let parsed: NominatimResponse = response
            .json()
            .map_err(|e| GeocodeError::Http(format!("invalid response body: {}", e)))?;

        parsed.display_name.ok_or(GeocodeError::MissingDisplayName)
    }
}

/// A resolved lookup, delivered back to the dispatch loop.
#[derive(Debug, Clone, PartialEq)]
pub struct GeocodeUpdate {
    pub device_id: DeviceId,
    pub text: String,
}

/// Rate-limits lookups per device and keeps them off the telemetry path.
///
/// On failure no update is emitted, so the registry retains the previous
/// location text (or its "never resolved" state).
pub struct ThrottledGeocoder {
    backend: Arc<dyn GeocodeBackend>,
    min_interval: Duration,
    last_lookup: DashMap<DeviceId, Instant>,
    updates: mpsc::Sender<GeocodeUpdate>,
}

impl ThrottledGeocoder {
    pub fn new(
        backend: Arc<dyn GeocodeBackend>,
        min_interval: Duration,
        updates: mpsc::Sender<GeocodeUpdate>,
    ) -> Self {
        Self {
            backend,
            min_interval,
            last_lookup: DashMap::new(),
            updates,
        }
    }

    /// Dispatch a background lookup if this device is due for one.
    ///
    /// Returns whether a lookup was dispatched. The throttle stamp is
    /// taken up front, so a lookup that ultimately fails still counts
    /// against the interval - one broken device cannot hammer the
    /// geocoder.
    pub fn maybe_lookup(&self, device_id: &DeviceId, lat: f64, lon: f64, now: Instant) -> bool {
        use dashmap::mapref::entry::Entry;

        let due = match self.last_lookup.entry(device_id.clone()) {
            Entry::Occupied(mut occupied) => {
                if now.duration_since(*occupied.get()) >= self.min_interval {
                    occupied.insert(now);
                    true
                } else {
                    false
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(now);
                true
            }
        };
        if !due {
            return false;
        }

        let backend = Arc::clone(&self.backend);
        let updates = self.updates.clone();
        let device_id = device_id.clone();
        tokio::task::spawn_blocking(move || match backend.display_name(lat, lon) {
            Ok(text) => {
                if updates
                    .blocking_send(GeocodeUpdate { device_id, text })
                    .is_err()
                {
                    debug!("Geocode update channel closed");
                }
            }
            Err(e) => {
                warn!(device = %device_id, error = %e, "Reverse geocode failed");
            }
        });
        true
    }

    /// Drop the throttle stamp for an evicted device.
    pub fn forget(&self, device_id: &DeviceId) {
        self.last_lookup.remove(device_id);
    }
}
