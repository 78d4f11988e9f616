//! Live fleet registry - one mutable record per device currently on air.
//!
//! The registry is the single shared-state surface of the tracking core.
//! All mutation flows through its public operations, guarded by one short
//! critical section so sample application and stale eviction for the same
//! device can never interleave (an evicted record must not be resurrected
//! with a stale timestamp).
//!
//! Presence is governed by position samples only: passenger-count and
//! battery updates mutate an existing record but never refresh freshness
//! and never create a record.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

use crate::catalog::DeviceId;
use crate::decoder::TelemetrySample;
use crate::geo;
use crate::proximity::{EtaEstimate, ObserverPosition, Trend};

/// Silence window after which a device is considered offline.
pub const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(10);

/// Cadence of the periodic eviction scan.
///
/// A single scan over tens-to-hundreds of records is cheap, and a 1 s tick
/// against a 10 s window keeps detection latency well under the window
/// itself, so per-device timers are unnecessary.
pub const DEFAULT_EVICT_INTERVAL: Duration = Duration::from_secs(1);

/// Live state for one device.
#[derive(Debug, Clone)]
pub struct LiveBusState {
    pub device_id: DeviceId,
    pub lat: f64,
    pub lon: f64,
    pub speed_kmh: f64,
    pub direction_deg: f64,
    pub passenger_count: Option<u32>,
    pub battery_percent: Option<u8>,
    /// Throttled reverse-geocode result; `None` until the first lookup
    /// resolves.
    pub location_text: Option<String>,
    pub trend: Trend,
    pub eta: EtaEstimate,
    /// Wall-clock time of the last applied position sample.
    pub last_update_wall: DateTime<Utc>,
    /// Monotonic freshness stamp; drives eviction.
    last_update: Instant,
    /// Insertion sequence for stable snapshot ordering.
    seq: u64,
}

/// One row of the queryable output snapshot.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BusSnapshot {
    pub device_id: DeviceId,
    pub lat: f64,
    pub lon: f64,
    pub speed_kmh: f64,
    pub direction_deg: f64,
    pub passenger_count: Option<u32>,
    pub battery_percent: Option<u8>,
    pub trend: Trend,
    pub eta: EtaEstimate,
    pub location_text: Option<String>,
    pub last_update: DateTime<Utc>,
}

impl BusSnapshot {
    fn from_record(record: &LiveBusState) -> Self {
        Self {
            device_id: record.device_id.clone(),
            lat: record.lat,
            lon: record.lon,
            speed_kmh: record.speed_kmh,
            direction_deg: record.direction_deg,
            passenger_count: record.passenger_count,
            battery_percent: record.battery_percent,
            trend: record.trend,
            eta: record.eta,
            location_text: record.location_text.clone(),
            last_update: record.last_update_wall,
        }
    }
}

#[derive(Debug, Default)]
struct RegistryInner {
    records: HashMap<DeviceId, LiveBusState>,
    next_seq: u64,
}

/// In-memory registry of all devices currently reporting.
///
/// Records are created on the first position sample for a device, mutated
/// on every subsequent one, and destroyed only by [`evict_stale`]
/// (there is no unsubscribe signal from the broker side).
///
/// [`evict_stale`]: Self::evict_stale
#[derive(Debug, Default)]
pub struct LiveFleetState {
    inner: Mutex<RegistryInner>,
}

impl LiveFleetState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Upsert the record for a position sample.
    ///
    /// Overwrites position and motion inputs, refreshes freshness, and
    /// preserves passenger count, battery, and location text.
    pub fn apply_sample(&self, sample: &TelemetrySample, now: Instant) {
        use std::collections::hash_map::Entry;

        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        match inner.records.entry(sample.device_id.clone()) {
            Entry::Occupied(mut occupied) => {
                let record = occupied.get_mut();
                record.lat = sample.lat;
                record.lon = sample.lon;
                record.speed_kmh = sample.speed_kmh;
                record.direction_deg = sample.direction_deg;
                record.last_update_wall = sample.received_at;
                // Freshness never moves backwards while the record exists.
                record.last_update = record.last_update.max(now);
            }
            Entry::Vacant(vacant) => {
                vacant.insert(LiveBusState {
                    device_id: sample.device_id.clone(),
                    lat: sample.lat,
                    lon: sample.lon,
                    speed_kmh: sample.speed_kmh,
                    direction_deg: sample.direction_deg,
                    passenger_count: None,
                    battery_percent: None,
                    location_text: None,
                    trend: Trend::Unknown,
                    eta: EtaEstimate::Unavailable,
                    last_update_wall: sample.received_at,
                    last_update: now,
                    seq: inner.next_seq,
                });
                inner.next_seq += 1;
            }
        }
    }

    /// Update the passenger count of a live record.
    ///
    /// Does not refresh freshness; a device reporting only passenger
    /// counts will still be evicted. Counts for unknown devices are
    /// dropped.
    pub fn apply_passenger_count(&self, device_id: &DeviceId, count: u32) {
        let mut inner = self.inner.lock();
        if let Some(record) = inner.records.get_mut(device_id) {
            record.passenger_count = Some(count);
        }
    }

    /// Update the battery charge of a live record; same freshness policy
    /// as passenger counts.
    pub fn apply_battery(&self, device_id: &DeviceId, percent: u8) {
        let mut inner = self.inner.lock();
        if let Some(record) = inner.records.get_mut(device_id) {
            record.battery_percent = Some(percent);
        }
    }

    /// Fill in a resolved reverse-geocode result.
    pub fn set_location_text(&self, device_id: &DeviceId, text: String) {
        let mut inner = self.inner.lock();
        if let Some(record) = inner.records.get_mut(device_id) {
            record.location_text = Some(text);
        }
    }

    /// Record the latest estimator verdict for a device.
    pub fn set_motion(&self, device_id: &DeviceId, trend: Trend, eta: EtaEstimate) {
        let mut inner = self.inner.lock();
        if let Some(record) = inner.records.get_mut(device_id) {
            record.trend = trend;
            record.eta = eta;
        }
    }

    /// Remove every record silent for longer than `stale_after`.
    ///
    /// This is the sole removal path. Returns the evicted ids so the
    /// caller can forget the matching proximity histories.
    pub fn evict_stale(&self, now: Instant, stale_after: Duration) -> Vec<DeviceId> {
        let mut inner = self.inner.lock();
        let evicted: Vec<DeviceId> = inner
            .records
            .iter()
            .filter(|(_, r)| now.duration_since(r.last_update) > stale_after)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &evicted {
            inner.records.remove(id);
        }
        evicted
    }

    /// Defensive copy of all live records.
    ///
    /// Sorted by distance to the observer when one is supplied (records
    /// whose distance cannot be computed sort last), otherwise in
    /// insertion order.
    pub fn snapshot(&self, observer: Option<ObserverPosition>) -> Vec<BusSnapshot> {
        let mut rows: Vec<(u64, BusSnapshot)> = {
            let inner = self.inner.lock();
            inner
                .records
                .values()
                .map(|r| (r.seq, BusSnapshot::from_record(r)))
                .collect()
        };

        match observer {
            Some(obs) => rows.sort_by(|(_, a), (_, b)| {
                let da = geo::haversine_km(obs.lat, obs.lon, a.lat, a.lon);
                let db = geo::haversine_km(obs.lat, obs.lon, b.lat, b.lon);
                match (da, db) {
                    (Some(da), Some(db)) => da.total_cmp(&db),
                    (Some(_), None) => std::cmp::Ordering::Less,
                    (None, Some(_)) => std::cmp::Ordering::Greater,
                    (None, None) => std::cmp::Ordering::Equal,
                }
            }),
            None => rows.sort_by_key(|(seq, _)| *seq),
        }

        rows.into_iter().map(|(_, snap)| snap).collect()
    }

    /// Current record for one device, if live.
    pub fn get(&self, device_id: &DeviceId) -> Option<BusSnapshot> {
        let inner = self.inner.lock();
        inner.records.get(device_id).map(BusSnapshot::from_record)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(device_id: &str, lat: f64, lon: f64, speed: f64) -> TelemetrySample {
        TelemetrySample {
            device_id: device_id.to_string(),
            lat,
            lon,
            speed_kmh: speed,
            direction_deg: 90.0,
            received_at: Utc::now(),
        }
    }

    #[test]
    fn test_first_sample_creates_one_record() {
        let fleet = LiveFleetState::new();
        fleet.apply_sample(&sample("d1", 14.68, 121.11, 20.0), Instant::now());
        assert_eq!(fleet.len(), 1);
        let snap = fleet.get(&"d1".to_string()).unwrap();
        assert_eq!(snap.lat, 14.68);
        assert_eq!(snap.passenger_count, None);
    }

    #[test]
    fn test_repeated_samples_keep_one_record_with_latest_values() {
        let fleet = LiveFleetState::new();
        let now = Instant::now();
        for i in 0..100 {
            fleet.apply_sample(
                &sample("d1", 14.0 + i as f64 * 0.001, 121.0, i as f64),
                now + Duration::from_millis(i),
            );
        }
        assert_eq!(fleet.len(), 1);
        let snap = fleet.get(&"d1".to_string()).unwrap();
        assert!((snap.lat - 14.099).abs() < 1e-9);
        assert_eq!(snap.speed_kmh, 99.0);
    }

    #[test]
    fn test_sample_preserves_sidecar_fields() {
        let fleet = LiveFleetState::new();
        let d1 = "d1".to_string();
        let now = Instant::now();
        fleet.apply_sample(&sample("d1", 14.0, 121.0, 20.0), now);
        fleet.apply_passenger_count(&d1, 12);
        fleet.apply_battery(&d1, 80);
        fleet.set_location_text(&d1, "Rodriguez, Rizal".to_string());

        fleet.apply_sample(&sample("d1", 14.1, 121.1, 25.0), now + Duration::from_secs(1));

        let snap = fleet.get(&d1).unwrap();
        assert_eq!(snap.passenger_count, Some(12));
        assert_eq!(snap.battery_percent, Some(80));
        assert_eq!(snap.location_text.as_deref(), Some("Rodriguez, Rizal"));
        assert_eq!(snap.lat, 14.1);
    }

    #[test]
    fn test_passenger_count_ignored_for_unknown_device() {
        let fleet = LiveFleetState::new();
        fleet.apply_passenger_count(&"ghost".to_string(), 5);
        assert!(fleet.is_empty());
    }

    #[test]
    fn test_stale_record_evicted() {
        let fleet = LiveFleetState::new();
        let now = Instant::now();
        fleet.apply_sample(&sample("d1", 14.0, 121.0, 20.0), now);
        fleet.apply_sample(&sample("d2", 14.1, 121.0, 20.0), now + Duration::from_secs(8));

        let evicted = fleet.evict_stale(now + Duration::from_secs(11), DEFAULT_STALE_AFTER);
        assert_eq!(evicted, vec!["d1".to_string()]);
        assert_eq!(fleet.len(), 1);
        assert!(fleet.get(&"d1".to_string()).is_none());
        assert!(fleet.get(&"d2".to_string()).is_some());
    }

    #[test]
    fn test_fresh_records_survive_eviction() {
        let fleet = LiveFleetState::new();
        let now = Instant::now();
        fleet.apply_sample(&sample("d1", 14.0, 121.0, 20.0), now);
        let evicted = fleet.evict_stale(now + Duration::from_secs(5), DEFAULT_STALE_AFTER);
        assert!(evicted.is_empty());
        assert_eq!(fleet.len(), 1);
    }

    #[test]
    fn test_passenger_count_does_not_refresh_freshness() {
        let fleet = LiveFleetState::new();
        let d1 = "d1".to_string();
        let now = Instant::now();
        fleet.apply_sample(&sample("d1", 14.0, 121.0, 20.0), now);

        // Counts keep arriving, but no position samples do.
        fleet.apply_passenger_count(&d1, 10);
        fleet.apply_passenger_count(&d1, 11);

        let evicted = fleet.evict_stale(now + Duration::from_secs(11), DEFAULT_STALE_AFTER);
        assert_eq!(evicted, vec![d1]);
    }

    #[test]
    fn test_snapshot_insertion_order_without_observer() {
        let fleet = LiveFleetState::new();
        let now = Instant::now();
        fleet.apply_sample(&sample("far", 14.9, 121.0, 20.0), now);
        fleet.apply_sample(&sample("near", 14.1, 121.0, 20.0), now);

        let ids: Vec<_> = fleet
            .snapshot(None)
            .into_iter()
            .map(|s| s.device_id)
            .collect();
        assert_eq!(ids, vec!["far".to_string(), "near".to_string()]);
    }

    #[test]
    fn test_snapshot_distance_sorted_with_observer() {
        let fleet = LiveFleetState::new();
        let now = Instant::now();
        fleet.apply_sample(&sample("far", 14.9, 121.0, 20.0), now);
        fleet.apply_sample(&sample("near", 14.1, 121.0, 20.0), now);

        let observer = ObserverPosition {
            lat: 14.0,
            lon: 121.0,
        };
        let ids: Vec<_> = fleet
            .snapshot(Some(observer))
            .into_iter()
            .map(|s| s.device_id)
            .collect();
        assert_eq!(ids, vec!["near".to_string(), "far".to_string()]);
    }

    #[test]
    fn test_motion_verdict_stored() {
        let fleet = LiveFleetState::new();
        let d1 = "d1".to_string();
        fleet.apply_sample(&sample("d1", 14.0, 121.0, 20.0), Instant::now());
        fleet.set_motion(&d1, Trend::Approaching, EtaEstimate::Minutes(4.5));

        let snap = fleet.get(&d1).unwrap();
        assert_eq!(snap.trend, Trend::Approaching);
        assert_eq!(snap.eta, EtaEstimate::Minutes(4.5));
    }
}
