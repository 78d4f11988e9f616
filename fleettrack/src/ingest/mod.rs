//! Telemetry ingestion: broker events in, fleet state out.
//!
//! The broker client and the business logic are decoupled by a channel
//! pair: the transport task emits [`BrokerEvent`]s and consumes
//! [`BrokerCommand`]s, while the [`TelemetryIngestor`] dispatch loop owns
//! every decision about what a message means. This keeps the
//! message-application path testable with nothing but channels - no live
//! broker anywhere near the tests.
//!
//! # Ordering
//!
//! The broker preserves order per topic but not across topics. The
//! dispatch loop applies messages in arrival order; per-device state
//! therefore reflects the most recently *applied* sample, and no
//! cross-device assumptions are made anywhere downstream.

pub mod transport;

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::catalog::DeviceCatalog;
use crate::decoder::{self, Decoded};
use crate::fleet::LiveFleetState;
use crate::geocode::{GeocodeUpdate, ThrottledGeocoder};
use crate::proximity::{ObserverPosition, ProximityEstimator};

/// Event emitted by a broker transport.
#[derive(Debug, Clone, PartialEq)]
pub enum BrokerEvent {
    /// Transport (re-)established its connection; subscriptions must be
    /// replayed.
    Connected,
    /// One pub/sub message.
    Message { topic: String, payload: Vec<u8> },
    /// Transport lost its connection; it will reconnect on its own.
    Disconnected { reason: String },
}

/// Command sent to a broker transport.
#[derive(Debug, Clone, PartialEq)]
pub enum BrokerCommand {
    Subscribe(String),
    Unsubscribe(String),
}

/// Connection lifecycle as seen by the dispatch loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

/// Channel ends the ingestor consumes and produces.
pub struct IngestorChannels {
    /// Events from the broker transport.
    pub events: mpsc::Receiver<BrokerEvent>,
    /// Commands to the broker transport.
    pub commands: mpsc::Sender<BrokerCommand>,
    /// Resolved reverse-geocode lookups.
    pub geocode_updates: mpsc::Receiver<GeocodeUpdate>,
    /// Replacement device catalogs from the external system.
    pub catalog_updates: watch::Receiver<DeviceCatalog>,
    /// The consumer's own position, refreshed externally.
    pub observer: watch::Receiver<Option<ObserverPosition>>,
}

/// Routes decoded broker messages into the live fleet state.
///
/// Owns the subscription lifecycle: subscribes every catalog device's
/// topics on (re)connect, and diffs topic sets when the catalog is
/// replaced so obsolete topics are unsubscribed rather than leaked.
pub struct TelemetryIngestor {
    fleet: Arc<LiveFleetState>,
    proximity: Arc<ProximityEstimator>,
    geocoder: Arc<ThrottledGeocoder>,
    catalog: DeviceCatalog,
    state: ConnectionState,
    channels: IngestorChannels,
}

impl TelemetryIngestor {
    pub fn new(
        fleet: Arc<LiveFleetState>,
        proximity: Arc<ProximityEstimator>,
        geocoder: Arc<ThrottledGeocoder>,
        channels: IngestorChannels,
    ) -> Self {
        let catalog = channels.catalog_updates.borrow().clone();
        Self {
            fleet,
            proximity,
            geocoder,
            catalog,
            state: ConnectionState::Connecting,
            channels,
        }
    }

    /// Run the dispatch loop until cancelled or the transport goes away.
    ///
    /// On exit every subscribed topic is unsubscribed (best effort) before
    /// the command channel is released, so the transport can flush the
    /// unsubscribes ahead of closing the connection.
    pub async fn run(mut self, cancellation: CancellationToken) {
        info!(devices = self.catalog.len(), "Telemetry ingestor started");

        let mut catalog_feed_open = true;
        loop {
            tokio::select! {
                biased;

                _ = cancellation.cancelled() => {
                    debug!("Ingestor cancelled");
                    break;
                }

                event = self.channels.events.recv() => {
                    match event {
                        Some(event) => self.handle_event(event),
                        None => {
                            debug!("Broker event channel closed");
                            break;
                        }
                    }
                }

                update = self.channels.geocode_updates.recv() => {
                    if let Some(GeocodeUpdate { device_id, text }) = update {
                        self.fleet.set_location_text(&device_id, text);
                    }
                }

                changed = self.channels.catalog_updates.changed(), if catalog_feed_open => {
                    match changed {
                        Ok(()) => {
                            let next = self.channels.catalog_updates.borrow_and_update().clone();
                            self.apply_catalog(next);
                        }
                        Err(_) => {
                            // Catalog source gone; keep tracking the last
                            // known device set.
                            catalog_feed_open = false;
                        }
                    }
                }
            }
        }

        self.unsubscribe_all();
        info!("Telemetry ingestor stopped");
    }

    fn handle_event(&mut self, event: BrokerEvent) {
        match event {
            BrokerEvent::Connected => {
                self.state = ConnectionState::Connected;
                info!(devices = self.catalog.len(), "Broker connected; subscribing topics");
                for topic in self.catalog.all_topics() {
                    self.send_command(BrokerCommand::Subscribe(topic));
                }
            }
            BrokerEvent::Disconnected { reason } => {
                self.state = ConnectionState::Disconnected;
                warn!(reason = %reason, "Broker disconnected; transport will retry");
            }
            BrokerEvent::Message { topic, payload } => self.handle_message(&topic, &payload),
        }
    }

    fn handle_message(&mut self, topic: &str, payload: &[u8]) {
        let (device_id, kind) = match self.catalog.resolve_topic(topic) {
            Some((id, kind)) => (id.clone(), kind),
            None => {
                debug!(topic = %topic, "Message on unknown topic dropped");
                return;
            }
        };

        match decoder::decode(&device_id, kind, payload, Utc::now()) {
            Decoded::Position(sample) => {
                let now = Instant::now();
                self.fleet.apply_sample(&sample, now);

                let observer = *self.channels.observer.borrow();
                let verdict = self.proximity.observe(
                    &sample.device_id,
                    sample.lat,
                    sample.lon,
                    sample.speed_kmh,
                    observer,
                    now,
                );
                self.fleet
                    .set_motion(&sample.device_id, verdict.trend, verdict.eta);

                self.geocoder
                    .maybe_lookup(&sample.device_id, sample.lat, sample.lon, now);
            }
            Decoded::PassengerCount { device_id, count } => {
                self.fleet.apply_passenger_count(&device_id, count);
            }
            Decoded::Battery {
                device_id, percent, ..
            } => {
                self.fleet.apply_battery(&device_id, percent);
            }
            Decoded::Unrecognized { reason } => {
                warn!(topic = %topic, reason = %reason, "Dropped malformed payload");
            }
        }
    }

    /// Swap in a replacement catalog, re-subscribing the difference.
    fn apply_catalog(&mut self, next: DeviceCatalog) {
        let old_topics = self.catalog.all_topics();
        let new_topics = next.all_topics();

        for topic in old_topics.iter().filter(|t| !new_topics.contains(t)) {
            self.send_command(BrokerCommand::Unsubscribe(topic.clone()));
        }
        if self.state == ConnectionState::Connected {
            for topic in new_topics.iter().filter(|t| !old_topics.contains(t)) {
                self.send_command(BrokerCommand::Subscribe(topic.clone()));
            }
        }

        info!(
            devices = next.len(),
            "Device catalog replaced; subscriptions updated"
        );
        self.catalog = next;
    }

    fn unsubscribe_all(&mut self) {
        for topic in self.catalog.all_topics() {
            self.send_command(BrokerCommand::Unsubscribe(topic));
        }
    }

    fn send_command(&self, command: BrokerCommand) {
        if self.channels.commands.try_send(command).is_err() {
            debug!("Broker command channel full or closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{test_device, DeviceCatalog};
    use crate::geocode::{GeocodeBackend, GeocodeError};
    use crate::proximity::{ProximityConfig, Trend};
    use std::time::Duration;

    struct SilentBackend;

    impl GeocodeBackend for SilentBackend {
        fn display_name(&self, _lat: f64, _lon: f64) -> Result<String, GeocodeError> {
            Ok("somewhere".to_string())
        }
    }

    /// Everything a dispatch-loop test needs, wired with bare channels.
    struct Harness {
        fleet: Arc<LiveFleetState>,
        events: mpsc::Sender<BrokerEvent>,
        commands: mpsc::Receiver<BrokerCommand>,
        catalog_tx: watch::Sender<DeviceCatalog>,
        observer_tx: watch::Sender<Option<ObserverPosition>>,
        task: tokio::task::JoinHandle<()>,
        cancellation: CancellationToken,
    }

    fn start(catalog: DeviceCatalog) -> Harness {
        let fleet = Arc::new(LiveFleetState::new());
        let proximity = Arc::new(ProximityEstimator::new(ProximityConfig::default()));

        let (events_tx, events_rx) = mpsc::channel(64);
        let (commands_tx, commands_rx) = mpsc::channel(64);
        let (geocode_tx, geocode_rx) = mpsc::channel(64);
        let (catalog_tx, catalog_rx) = watch::channel(catalog);
        let (observer_tx, observer_rx) = watch::channel(None);

        let geocoder = Arc::new(ThrottledGeocoder::new(
            Arc::new(SilentBackend),
            Duration::from_secs(30),
            geocode_tx,
        ));

        let ingestor = TelemetryIngestor::new(
            Arc::clone(&fleet),
            proximity,
            geocoder,
            IngestorChannels {
                events: events_rx,
                commands: commands_tx,
                geocode_updates: geocode_rx,
                catalog_updates: catalog_rx,
                observer: observer_rx,
            },
        );

        let cancellation = CancellationToken::new();
        let task = tokio::spawn(ingestor.run(cancellation.clone()));

        Harness {
            fleet,
            events: events_tx,
            commands: commands_rx,
            catalog_tx,
            observer_tx,
            task,
            cancellation,
        }
    }

    impl Harness {
        /// Close the event stream and wait for the loop to finish.
        async fn finish(self) -> (Arc<LiveFleetState>, Vec<BrokerCommand>) {
            drop(self.events);
            self.task.await.unwrap();
            let mut commands = Vec::new();
            let mut rx = self.commands;
            while let Ok(cmd) = rx.try_recv() {
                commands.push(cmd);
            }
            (self.fleet, commands)
        }
    }

    fn position_message(device: &str, lat: f64, lon: f64) -> BrokerEvent {
        BrokerEvent::Message {
            topic: format!("fleet/{}/gps", device),
            payload: format!(r#"{{"lat": {}, "lon": {}, "speed": 25.0}}"#, lat, lon).into_bytes(),
        }
    }

    #[tokio::test]
    async fn test_connect_subscribes_all_topics() {
        let harness = start(DeviceCatalog::new(vec![test_device("d1"), test_device("d2")]));
        harness.events.send(BrokerEvent::Connected).await.unwrap();

        let (_, commands) = harness.finish().await;
        let subscribes: Vec<_> = commands
            .iter()
            .filter(|c| matches!(c, BrokerCommand::Subscribe(_)))
            .collect();
        assert_eq!(subscribes.len(), 6);
        assert!(commands.contains(&BrokerCommand::Subscribe("fleet/d1/gps".to_string())));
        assert!(commands.contains(&BrokerCommand::Subscribe("fleet/d2/battery".to_string())));
    }

    #[tokio::test]
    async fn test_position_message_creates_record() {
        let harness = start(DeviceCatalog::new(vec![test_device("d1")]));
        harness
            .events
            .send(position_message("d1", 14.68, 121.11))
            .await
            .unwrap();

        let (fleet, _) = harness.finish().await;
        let snap = fleet.get(&"d1".to_string()).unwrap();
        assert_eq!(snap.lat, 14.68);
        assert_eq!(snap.speed_kmh, 25.0);
    }

    #[tokio::test]
    async fn test_motion_verdict_attached_with_observer() {
        let harness = start(DeviceCatalog::new(vec![test_device("d1")]));
        harness
            .observer_tx
            .send(Some(ObserverPosition {
                lat: 14.0,
                lon: 121.0,
            }))
            .unwrap();
        harness
            .events
            .send(position_message("d1", 14.68, 121.11))
            .await
            .unwrap();

        let (fleet, _) = harness.finish().await;
        let snap = fleet.get(&"d1".to_string()).unwrap();
        // One sample cannot fill the trend window.
        assert_eq!(snap.trend, Trend::Unknown);
        assert!(matches!(
            snap.eta,
            crate::proximity::EtaEstimate::Minutes(_)
        ));
    }

    #[tokio::test]
    async fn test_passenger_count_updates_live_record() {
        let harness = start(DeviceCatalog::new(vec![test_device("d1")]));
        harness
            .events
            .send(position_message("d1", 14.68, 121.11))
            .await
            .unwrap();
        harness
            .events
            .send(BrokerEvent::Message {
                topic: "fleet/d1/passengers".to_string(),
                payload: br#"{"devId": "d1", "count": 17}"#.to_vec(),
            })
            .await
            .unwrap();

        let (fleet, _) = harness.finish().await;
        assert_eq!(fleet.get(&"d1".to_string()).unwrap().passenger_count, Some(17));
    }

    #[tokio::test]
    async fn test_battery_updates_live_record() {
        let harness = start(DeviceCatalog::new(vec![test_device("d1")]));
        harness
            .events
            .send(position_message("d1", 14.68, 121.11))
            .await
            .unwrap();
        harness
            .events
            .send(BrokerEvent::Message {
                topic: "fleet/d1/battery".to_string(),
                payload: b"12.6".to_vec(),
            })
            .await
            .unwrap();

        let (fleet, _) = harness.finish().await;
        assert_eq!(fleet.get(&"d1".to_string()).unwrap().battery_percent, Some(100));
    }

    #[tokio::test]
    async fn test_malformed_payload_dropped_without_effect() {
        let harness = start(DeviceCatalog::new(vec![test_device("d1")]));
        harness
            .events
            .send(BrokerEvent::Message {
                topic: "fleet/d1/gps".to_string(),
                payload: b"not json at all".to_vec(),
            })
            .await
            .unwrap();

        let (fleet, _) = harness.finish().await;
        assert!(fleet.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_topic_dropped() {
        let harness = start(DeviceCatalog::new(vec![test_device("d1")]));
        harness
            .events
            .send(BrokerEvent::Message {
                topic: "fleet/stranger/gps".to_string(),
                payload: br#"{"lat": 1.0, "lon": 2.0}"#.to_vec(),
            })
            .await
            .unwrap();

        let (fleet, _) = harness.finish().await;
        assert!(fleet.is_empty());
    }

    #[tokio::test]
    async fn test_catalog_replacement_resubscribes_diff() {
        let harness = start(DeviceCatalog::new(vec![test_device("d1")]));
        harness.events.send(BrokerEvent::Connected).await.unwrap();

        // Give the loop a beat to process the connect before the swap.
        tokio::time::sleep(Duration::from_millis(20)).await;
        harness
            .catalog_tx
            .send(DeviceCatalog::new(vec![test_device("d2")]))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let (_, commands) = harness.finish().await;
        assert!(commands.contains(&BrokerCommand::Unsubscribe("fleet/d1/gps".to_string())));
        assert!(commands.contains(&BrokerCommand::Subscribe("fleet/d2/gps".to_string())));
    }

    #[tokio::test]
    async fn test_reconnect_replays_subscriptions() {
        let harness = start(DeviceCatalog::new(vec![test_device("d1")]));
        harness.events.send(BrokerEvent::Connected).await.unwrap();
        harness
            .events
            .send(BrokerEvent::Disconnected {
                reason: "broker restart".to_string(),
            })
            .await
            .unwrap();
        harness.events.send(BrokerEvent::Connected).await.unwrap();

        let (_, commands) = harness.finish().await;
        let gps_subscribes = commands
            .iter()
            .filter(|c| **c == BrokerCommand::Subscribe("fleet/d1/gps".to_string()))
            .count();
        assert_eq!(gps_subscribes, 2);
    }

    #[tokio::test]
    async fn test_cancellation_unsubscribes_all() {
        let harness = start(DeviceCatalog::new(vec![test_device("d1")]));
        harness.events.send(BrokerEvent::Connected).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        harness.cancellation.cancel();
        harness.task.await.unwrap();

        let mut commands = Vec::new();
        let mut rx = harness.commands;
        while let Ok(cmd) = rx.try_recv() {
            commands.push(cmd);
        }
        assert!(commands.contains(&BrokerCommand::Unsubscribe("fleet/d1/gps".to_string())));
        assert!(commands.contains(&BrokerCommand::Unsubscribe("fleet/d1/passengers".to_string())));
        assert!(commands.contains(&BrokerCommand::Unsubscribe("fleet/d1/battery".to_string())));
    }
}
