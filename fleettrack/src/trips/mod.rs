//! Offline trip segmentation over stored GPS logs.
//!
//! Given one device's chronological samples for a day and the two
//! terminals of its assigned route, partition the stream into discrete
//! point-to-point trips. A trip opens when the vehicle passes within the
//! terminal radius of either terminal and closes the moment it reaches
//! the opposite one. Samples seen outside any open trip are discarded,
//! and a trip still open when the input ends is dropped rather than
//! emitted - partial trips are not surfaced.

use chrono::{DateTime, Days, Utc};
use serde::{Deserialize, Serialize};

use crate::geo;

/// Radius around a terminal that counts as "at the terminal".
pub const DEFAULT_TERMINAL_RADIUS_M: f64 = 100.0;

/// The two fixed endpoints of a device's assigned path.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Route {
    pub start_lat: f64,
    pub start_lng: f64,
    pub end_lat: f64,
    pub end_lng: f64,
}

/// One stored GPS sample, as returned by the historical query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TripPoint {
    pub lat: f64,
    pub lon: f64,
    #[serde(default)]
    pub speed: f64,
    #[serde(default)]
    pub direction: f64,
    pub timestamp: DateTime<Utc>,
}

/// Which terminal a trip departed from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TripDirection {
    /// Start terminal → end terminal.
    Forward,
    /// End terminal → start terminal.
    Reverse,
}

/// A completed point-to-point trip.
///
/// Always contains at least 2 samples and is never mutated after
/// emission.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Trip {
    pub direction: TripDirection,
    pub points: Vec<TripPoint>,
}

impl Trip {
    pub fn started_at(&self) -> DateTime<Utc> {
        self.points[0].timestamp
    }

    pub fn ended_at(&self) -> DateTime<Utc> {
        self.points[self.points.len() - 1].timestamp
    }
}

/// Segmenter tuning.
#[derive(Debug, Clone)]
pub struct SegmenterConfig {
    pub terminal_radius_m: f64,
}

impl Default for SegmenterConfig {
    fn default() -> Self {
        Self {
            terminal_radius_m: DEFAULT_TERMINAL_RADIUS_M,
        }
    }
}

/// Scan state while walking the sample stream.
struct OpenTrip {
    direction: TripDirection,
    points: Vec<TripPoint>,
}

/// Partition a day of samples into completed trips.
///
/// Samples are re-sorted by timestamp before scanning (storage order is
/// not trusted). Without a route there are no terminals to detect, so the
/// result is empty regardless of input - as is an empty or degenerate
/// input window.
pub fn segment_trips(
    mut points: Vec<TripPoint>,
    route: Option<&Route>,
    config: &SegmenterConfig,
) -> Vec<Trip> {
    let route = match route {
        Some(r) => r,
        None => return Vec::new(),
    };

    points.sort_by_key(|p| p.timestamp);

    let mut trips = Vec::new();
    let mut current: Option<OpenTrip> = None;

    for point in points {
        let near_start = within_radius(
            point.lat,
            point.lon,
            route.start_lat,
            route.start_lng,
            config.terminal_radius_m,
        );
        let near_end = within_radius(
            point.lat,
            point.lon,
            route.end_lat,
            route.end_lng,
            config.terminal_radius_m,
        );

        match current.as_mut() {
            None => {
                // Not in a trip: a terminal passage opens one, anything
                // else is between-trips noise.
                if near_start {
                    current = Some(OpenTrip {
                        direction: TripDirection::Forward,
                        points: vec![point],
                    });
                } else if near_end {
                    current = Some(OpenTrip {
                        direction: TripDirection::Reverse,
                        points: vec![point],
                    });
                }
            }
            Some(open) => {
                open.points.push(point);

                let reached_opposite = match open.direction {
                    TripDirection::Forward => near_end,
                    TripDirection::Reverse => near_start,
                };
                if reached_opposite {
                    let open = current.take().expect("open trip present");
                    // A single point can never be a trip; with terminals
                    // further apart than the radius this cannot trigger,
                    // but degenerate routes must not emit one-point trips.
                    if open.points.len() >= 2 {
                        trips.push(Trip {
                            direction: open.direction,
                            points: open.points,
                        });
                    }
                }
            }
        }
    }

    // A trip that never reached its closing terminal stays in `current`
    // and is dropped here.
    trips
}

/// Haversine test against a radius in metres; non-finite coordinates
/// never match.
fn within_radius(lat: f64, lon: f64, ref_lat: f64, ref_lon: f64, radius_m: f64) -> bool {
    geo::haversine_m(lat, lon, ref_lat, ref_lon)
        .map(|d| d < radius_m)
        .unwrap_or(false)
}

/// Inclusive day boundaries for a historical query, `day_offset` days
/// before `now` (0 = today). Matches the storage layer's
/// midnight-to-midnight UTC window.
pub fn day_window_from(
    now: DateTime<Utc>,
    day_offset: u32,
) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
    let day = now.date_naive().checked_sub_days(Days::new(day_offset as u64))?;
    let start = day.and_hms_opt(0, 0, 0)?.and_utc();
    let end = day.and_hms_milli_opt(23, 59, 59, 999)?.and_utc();
    Some((start, end))
}

/// Day boundaries relative to the current time.
pub fn day_window(day_offset: u32) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
    day_window_from(Utc::now(), day_offset)
}
