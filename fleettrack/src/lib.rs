//! FleetTrack - real-time mini-bus fleet tracking.
//!
//! This library tracks a small fleet of vehicles from streamed GPS and
//! telemetry messages and reconstructs historical trips from stored
//! location logs. The two stateful cores are the live fleet-state engine
//! (per-device freshness, position, and derived motion from an unordered,
//! unreliable message stream) and the trip segmenter (offline
//! partitioning of a day's GPS points into terminal-to-terminal trips).
//!
//! # Architecture
//!
//! ```text
//! broker ──► transport ──► TelemetryIngestor ──► LiveFleetState ──► snapshot()
//!                              │                      ▲
//!                              ├──► ProximityEstimator┘
//!                              └──► ThrottledGeocoder (background)
//!
//! stored samples ──► trips::segment_trips ──► Vec<Trip>
//! ```

pub mod catalog;
pub mod config;
pub mod decoder;
pub mod fleet;
pub mod geo;
pub mod geocode;
pub mod ingest;
pub mod log;
pub mod proximity;
pub mod service;
pub mod trips;

pub use catalog::{AssignedBus, Device, DeviceCatalog, DeviceId, TopicKind};
pub use config::{ConfigError, TrackerConfig};
pub use decoder::{Decoded, TelemetrySample};
pub use fleet::{BusSnapshot, LiveFleetState};
pub use proximity::{EtaEstimate, ObserverPosition, ProximityEstimator, Trend};
pub use service::{ServiceError, TrackerService};
pub use trips::{segment_trips, Route, Trip, TripDirection, TripPoint};

/// Crate version, for banners and diagnostics.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
