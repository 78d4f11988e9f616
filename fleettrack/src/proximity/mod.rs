//! Approach/departure estimation relative to a moving observer.
//!
//! Raw distance-to-observer series are noisy: GPS jitter of a few metres
//! flips a naive "closer than last time?" comparison on almost every
//! message. This module smooths the series with a small bounded history
//! and only declares a trend when the whole window agrees.
//!
//! # Design
//!
//! - Per device, the last 5 observer distances are kept in a FIFO ring.
//! - A new distance is recorded at most once per minimum interval (3 s
//!   default), so the trend is re-evaluated on a slower clock than the
//!   telemetry stream itself.
//! - With a full window, consecutive deltas must *all* clear the
//!   configured threshold in the same direction; a single outlier keeps
//!   the verdict at `Unknown`.
//! - ETA is an explicit tri-state: minutes, stopped, or unavailable.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::Serialize;

use crate::catalog::DeviceId;
use crate::geo::{self, MOVEMENT_THRESHOLD_KMH};

/// Default number of distances retained per device.
const DEFAULT_WINDOW: usize = 5;

/// Default minimum interval between recorded distances.
const DEFAULT_MIN_INTERVAL: Duration = Duration::from_secs(3);

/// Default delta threshold in metres; deltas smaller than this are noise.
const DEFAULT_THRESHOLD_M: f64 = 20.0;

/// The consumer's own position, supplied externally.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ObserverPosition {
    pub lat: f64,
    pub lon: f64,
}

/// Smoothed motion classification for one device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Trend {
    /// Every recent delta moved the device closer to the observer.
    Approaching,
    /// Every recent delta moved the device away.
    MovingAway,
    /// Window not yet full, or the series disagrees with itself.
    #[default]
    Unknown,
}

/// Arrival estimate for one device.
///
/// Deliberately a tri-state rather than `Option<f64>`: a stopped bus and
/// a bus with no known observer distance are different situations and the
/// presentation layer renders them differently.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum EtaEstimate {
    /// Estimated minutes until arrival at the observer.
    Minutes(f64),
    /// Vehicle is at or below the movement threshold; no meaningful ETA.
    Stopped,
    /// No observer position or distance available.
    #[default]
    Unavailable,
}

/// Outcome of evaluating one position sample.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MotionVerdict {
    pub trend: Trend,
    pub eta: EtaEstimate,
    /// Distance to the observer, when one could be computed.
    pub distance_km: Option<f64>,
}

impl MotionVerdict {
    fn unavailable() -> Self {
        Self {
            trend: Trend::Unknown,
            eta: EtaEstimate::Unavailable,
            distance_km: None,
        }
    }
}

/// Tuning for the estimator.
#[derive(Debug, Clone)]
pub struct ProximityConfig {
    /// Distances retained per device before a trend can be declared.
    pub window: usize,
    /// Minimum interval between recorded distances.
    pub min_interval: Duration,
    /// Per-delta noise threshold in metres (10–30 m is sensible).
    pub threshold_m: f64,
}

impl Default for ProximityConfig {
    fn default() -> Self {
        Self {
            window: DEFAULT_WINDOW,
            min_interval: DEFAULT_MIN_INTERVAL,
            threshold_m: DEFAULT_THRESHOLD_M,
        }
    }
}

/// Bounded FIFO of observer distances for one device.
#[derive(Debug)]
struct DistanceHistory {
    /// Recorded distances in metres, oldest first.
    distances: VecDeque<f64>,
    /// When the most recent distance was recorded.
    last_recorded: Option<Instant>,
    /// Verdict from the last time the window was evaluated.
    last_trend: Trend,
}

impl DistanceHistory {
    fn new(window: usize) -> Self {
        Self {
            distances: VecDeque::with_capacity(window),
            last_recorded: None,
            last_trend: Trend::Unknown,
        }
    }

    /// Record a distance, honoring the minimum interval.
    ///
    /// Returns true if the sample was recorded (and the trend
    /// re-evaluated), false if it arrived too soon and was skipped.
    fn record(&mut self, distance_m: f64, now: Instant, config: &ProximityConfig) -> bool {
        if let Some(last) = self.last_recorded {
            if now.duration_since(last) < config.min_interval {
                return false;
            }
        }

        self.distances.push_back(distance_m);
        while self.distances.len() > config.window {
            self.distances.pop_front();
        }
        self.last_recorded = Some(now);
        self.last_trend = self.evaluate(config);
        true
    }

    /// Unanimity rule over consecutive deltas of a full window.
    fn evaluate(&self, config: &ProximityConfig) -> Trend {
        if self.distances.len() < config.window {
            return Trend::Unknown;
        }

        let deltas: Vec<f64> = self
            .distances
            .iter()
            .zip(self.distances.iter().skip(1))
            .map(|(prev, next)| next - prev)
            .collect();

        if deltas.iter().all(|d| *d < -config.threshold_m) {
            Trend::Approaching
        } else if deltas.iter().all(|d| *d > config.threshold_m) {
            Trend::MovingAway
        } else {
            Trend::Unknown
        }
    }
}

/// Derives approach/departure trend and ETA per device.
///
/// Owns only the per-device distance histories; everything else is a pure
/// function of its inputs. [`forget`](Self::forget) must be called when a
/// device is evicted from the fleet registry so histories cannot
/// accumulate for dead devices.
#[derive(Debug, Default)]
pub struct ProximityEstimator {
    config: ProximityConfig,
    histories: DashMap<DeviceId, DistanceHistory>,
}

impl ProximityEstimator {
    pub fn new(config: ProximityConfig) -> Self {
        Self {
            config,
            histories: DashMap::new(),
        }
    }

    /// Evaluate one position sample against the observer.
    ///
    /// Non-blocking and safe to call on every telemetry message; the
    /// minimum-interval gate inside the history decides whether the trend
    /// window actually advances.
    pub fn observe(
        &self,
        device_id: &DeviceId,
        lat: f64,
        lon: f64,
        speed_kmh: f64,
        observer: Option<ObserverPosition>,
        now: Instant,
    ) -> MotionVerdict {
        let observer = match observer {
            Some(o) => o,
            None => return MotionVerdict::unavailable(),
        };

        let distance_km = match geo::haversine_km(observer.lat, observer.lon, lat, lon) {
            Some(d) => d,
            None => return MotionVerdict::unavailable(),
        };

        let mut history = self
            .histories
            .entry(device_id.clone())
            .or_insert_with(|| DistanceHistory::new(self.config.window));
        history.record(distance_km * 1000.0, now, &self.config);
        let trend = history.last_trend;
        drop(history);

        let eta = if speed_kmh <= MOVEMENT_THRESHOLD_KMH {
            EtaEstimate::Stopped
        } else {
            match geo::eta_minutes(distance_km, speed_kmh) {
                Some(minutes) => EtaEstimate::Minutes(minutes),
                None => EtaEstimate::Unavailable,
            }
        };

        MotionVerdict {
            trend,
            eta,
            distance_km: Some(distance_km),
        }
    }

    /// Drop all history for a device (call on eviction).
    pub fn forget(&self, device_id: &DeviceId) {
        self.histories.remove(device_id);
    }

    /// Number of devices with live history.
    pub fn tracked_devices(&self) -> usize {
        self.histories.len()
    }
}
