//! Service composition root.
//!
//! `TrackerService` wires the broker transport, dispatch loop, eviction
//! ticker, and geocoder together and owns their lifetimes. All background
//! work hangs off one master `CancellationToken`, so shutdown is
//! deterministic on every exit path: cancel, then await every task.
//!
//! # Startup sequence
//!
//! 1. Channels are created (broker events/commands, geocode updates,
//!    catalog and observer watches).
//! 2. The broker client task starts connecting.
//! 3. The dispatch loop starts consuming events.
//! 4. The eviction ticker starts scanning.
//!
//! # Example
//!
//! ```ignore
//! use fleettrack::service::TrackerService;
//!
//! let service = TrackerService::start(config, catalog)?;
//! service.set_observer_position(Some((14.68, 121.11)));
//!
//! // Hand snapshots to any presentation layer.
//! let buses = service.snapshot();
//!
//! service.shutdown().await;
//! ```

use std::sync::Arc;
use std::time::Instant;

use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::catalog::DeviceCatalog;
use crate::config::TrackerConfig;
use crate::fleet::{BusSnapshot, LiveFleetState};
use crate::geocode::{GeocodeBackend, GeocodeError, NominatimBackend, ThrottledGeocoder};
use crate::ingest::transport::spawn_broker_client;
use crate::ingest::{IngestorChannels, TelemetryIngestor};
use crate::proximity::{ObserverPosition, ProximityEstimator};

/// Broker event channel depth; a burst of one message per device per
/// second for a few hundred devices fits comfortably.
const EVENT_CHANNEL_DEPTH: usize = 256;

/// Command channel depth; sized for a full re-subscription sweep.
const COMMAND_CHANNEL_DEPTH: usize = 1024;

/// Geocode update channel depth.
const GEOCODE_CHANNEL_DEPTH: usize = 64;

/// Errors starting the tracker service.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("failed to initialize geocoder: {0}")]
    Geocoder(#[from] GeocodeError),
}

/// Running tracking session.
///
/// Dropping the service without calling [`shutdown`](Self::shutdown)
/// cancels the background tasks but does not wait for them.
pub struct TrackerService {
    fleet: Arc<LiveFleetState>,
    proximity: Arc<ProximityEstimator>,
    observer_tx: watch::Sender<Option<ObserverPosition>>,
    catalog_tx: watch::Sender<DeviceCatalog>,
    cancellation: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl TrackerService {
    /// Start a session against the real Nominatim geocoder.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(config: TrackerConfig, catalog: DeviceCatalog) -> Result<Self, ServiceError> {
        let backend = Arc::new(NominatimBackend::new()?);
        Ok(Self::start_with_backend(config, catalog, backend))
    }

    /// Start a session with a custom geocode backend (tests, offline
    /// deployments).
    pub fn start_with_backend(
        config: TrackerConfig,
        catalog: DeviceCatalog,
        geocode_backend: Arc<dyn GeocodeBackend>,
    ) -> Self {
        info!(devices = catalog.len(), broker = %config.broker.url, "Starting tracker service");

        let cancellation = CancellationToken::new();
        let fleet = Arc::new(LiveFleetState::new());
        let proximity = Arc::new(ProximityEstimator::new(config.proximity.clone()));

        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_DEPTH);
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_CHANNEL_DEPTH);
        let (geocode_tx, geocode_rx) = mpsc::channel(GEOCODE_CHANNEL_DEPTH);
        let (catalog_tx, catalog_rx) = watch::channel(catalog);
        let (observer_tx, observer_rx) = watch::channel(None);

        let geocoder = Arc::new(ThrottledGeocoder::new(
            geocode_backend,
            config.geocode_interval,
            geocode_tx,
        ));

        let transport_task = spawn_broker_client(
            config.broker.clone(),
            events_tx,
            commands_rx,
            cancellation.clone(),
        );

        let ingestor = TelemetryIngestor::new(
            Arc::clone(&fleet),
            Arc::clone(&proximity),
            Arc::clone(&geocoder),
            IngestorChannels {
                events: events_rx,
                commands: commands_tx,
                geocode_updates: geocode_rx,
                catalog_updates: catalog_rx,
                observer: observer_rx,
            },
        );
        let dispatch_task = tokio::spawn(ingestor.run(cancellation.clone()));

        let ticker_task = tokio::spawn(run_eviction_ticker(
            Arc::clone(&fleet),
            Arc::clone(&proximity),
            Arc::clone(&geocoder),
            config.clone(),
            cancellation.clone(),
        ));

        Self {
            fleet,
            proximity,
            observer_tx,
            catalog_tx,
            cancellation,
            tasks: vec![transport_task, dispatch_task, ticker_task],
        }
    }

    /// Update the consumer's own position (`None` clears it).
    pub fn set_observer_position(&self, position: Option<(f64, f64)>) {
        let observer = position.map(|(lat, lon)| ObserverPosition { lat, lon });
        let _ = self.observer_tx.send(observer);
    }

    /// Replace the device catalog; the ingestor re-subscribes the diff.
    pub fn update_catalog(&self, catalog: DeviceCatalog) {
        let _ = self.catalog_tx.send(catalog);
    }

    /// Ordered snapshot of the live fleet for a presentation layer.
    ///
    /// Distance-sorted when an observer position is set, insertion order
    /// otherwise.
    pub fn snapshot(&self) -> Vec<BusSnapshot> {
        let observer = *self.observer_tx.borrow();
        self.fleet.snapshot(observer)
    }

    /// Direct access to the fleet registry.
    pub fn fleet(&self) -> Arc<LiveFleetState> {
        Arc::clone(&self.fleet)
    }

    /// Number of devices with live proximity history.
    pub fn tracked_histories(&self) -> usize {
        self.proximity.tracked_devices()
    }

    /// Cancel all background tasks and wait for them to finish.
    ///
    /// The ingestor queues unsubscribes for every topic and the transport
    /// flushes them before closing the connection.
    pub async fn shutdown(mut self) {
        info!("Shutting down tracker service");
        self.cancellation.cancel();
        for task in std::mem::take(&mut self.tasks) {
            let _ = task.await;
        }
        info!("Tracker service stopped");
    }
}

impl Drop for TrackerService {
    fn drop(&mut self) {
        self.cancellation.cancel();
    }
}

/// Periodic stale-device scan.
///
/// Every evicted device also loses its proximity history and geocode
/// throttle stamp, so no per-device side map outlives the registry entry.
async fn run_eviction_ticker(
    fleet: Arc<LiveFleetState>,
    proximity: Arc<ProximityEstimator>,
    geocoder: Arc<ThrottledGeocoder>,
    config: TrackerConfig,
    cancellation: CancellationToken,
) {
    let mut ticker = tokio::time::interval(config.evict_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancellation.cancelled() => {
                debug!("Eviction ticker cancelled");
                return;
            }
            _ = ticker.tick() => {
                let evicted = fleet.evict_stale(Instant::now(), config.stale_after);
                for device_id in &evicted {
                    proximity.forget(device_id);
                    geocoder.forget(device_id);
                }
                if !evicted.is_empty() {
                    info!(count = evicted.len(), devices = ?evicted, "Evicted stale devices");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::test_device;
    use crate::decoder::TelemetrySample;
    use crate::geocode::GeocodeError;
    use chrono::Utc;
    use std::time::Duration;

    struct OfflineBackend;

    impl GeocodeBackend for OfflineBackend {
        fn display_name(&self, _lat: f64, _lon: f64) -> Result<String, GeocodeError> {
            Err(GeocodeError::Http("offline".to_string()))
        }
    }

    fn short_lived_config() -> TrackerConfig {
        let mut config = TrackerConfig::default();
        // Unroutable broker; the transport just retries in the background.
        config.broker.url = "ws://127.0.0.1:9".to_string();
        config.stale_after = Duration::from_millis(150);
        config.evict_interval = Duration::from_millis(50);
        config
    }

    fn sample(device_id: &str) -> TelemetrySample {
        TelemetrySample {
            device_id: device_id.to_string(),
            lat: 14.68,
            lon: 121.11,
            speed_kmh: 20.0,
            direction_deg: 0.0,
            received_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_ticker_evicts_silent_devices() {
        let service = TrackerService::start_with_backend(
            short_lived_config(),
            DeviceCatalog::new(vec![test_device("d1")]),
            Arc::new(OfflineBackend),
        );

        service.fleet().apply_sample(&sample("d1"), Instant::now());
        assert_eq!(service.snapshot().len(), 1);

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(service.snapshot().is_empty(), "stale record should be gone");

        service.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_completes() {
        let service = TrackerService::start_with_backend(
            short_lived_config(),
            DeviceCatalog::new(vec![test_device("d1")]),
            Arc::new(OfflineBackend),
        );

        tokio::time::timeout(Duration::from_secs(5), service.shutdown())
            .await
            .expect("shutdown should not hang");
    }

    #[tokio::test]
    async fn test_snapshot_orders_by_observer_distance() {
        let service = TrackerService::start_with_backend(
            short_lived_config(),
            DeviceCatalog::new(vec![test_device("near"), test_device("far")]),
            Arc::new(OfflineBackend),
        );

        let now = Instant::now();
        let mut near = sample("near");
        near.lat = 14.1;
        let mut far = sample("far");
        far.lat = 14.9;
        service.fleet().apply_sample(&far, now);
        service.fleet().apply_sample(&near, now);

        service.set_observer_position(Some((14.0, 121.11)));
        let ids: Vec<_> = service
            .snapshot()
            .into_iter()
            .map(|s| s.device_id)
            .collect();
        assert_eq!(ids, vec!["near".to_string(), "far".to_string()]);

        service.shutdown().await;
    }
}
