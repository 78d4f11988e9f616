//! Trips command - reconstruct a day's trips from a GPS log file.

use std::fs;
use std::path::PathBuf;

use fleettrack::trips::{day_window, segment_trips, TripPoint};
use fleettrack::{Route, TrackerConfig, TripDirection};

use crate::error::CliError;

/// Arguments for the trips command.
pub struct TripsArgs {
    /// Path to a JSON array of GPS log points.
    pub logs: PathBuf,
    /// Route terminals; without all four, no trips can be detected.
    pub start_lat: Option<f64>,
    pub start_lng: Option<f64>,
    pub end_lat: Option<f64>,
    pub end_lng: Option<f64>,
    /// Days back from today (0 = today); `None` keeps the whole file.
    pub day: Option<u32>,
}

/// Segment the log file and print a trip report.
pub fn run(config: TrackerConfig, args: TripsArgs) -> Result<(), CliError> {
    let mut points = load_points(&args.logs)?;

    if let Some(day_offset) = args.day {
        let (start, end) = day_window(day_offset)
            .ok_or_else(|| CliError::Input(format!("invalid day offset {}", day_offset)))?;
        points.retain(|p| p.timestamp >= start && p.timestamp <= end);
    }

    let route = match (args.start_lat, args.start_lng, args.end_lat, args.end_lng) {
        (Some(start_lat), Some(start_lng), Some(end_lat), Some(end_lng)) => Some(Route {
            start_lat,
            start_lng,
            end_lat,
            end_lng,
        }),
        _ => None,
    };
    if route.is_none() {
        println!("No route terminals supplied; no trips can be detected.");
    }

    let trips = segment_trips(points, route.as_ref(), &config.segmenter);

    println!("Total trips: {}", trips.len());
    for (index, trip) in trips.iter().enumerate() {
        let direction = match trip.direction {
            TripDirection::Forward => "forward",
            TripDirection::Reverse => "reverse",
        };
        println!(
            "Trip #{}: {} | {} samples | {} -> {}",
            index + 1,
            direction,
            trip.points.len(),
            trip.started_at().format("%Y-%m-%d %H:%M:%S"),
            trip.ended_at().format("%H:%M:%S"),
        );
    }

    Ok(())
}

fn load_points(path: &PathBuf) -> Result<Vec<TripPoint>, CliError> {
    let raw = fs::read_to_string(path)?;
    serde_json::from_str(&raw)
        .map_err(|e| CliError::Input(format!("invalid log file {}: {}", path.display(), e)))
}
