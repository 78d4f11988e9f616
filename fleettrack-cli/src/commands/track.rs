//! Track command - live fleet view in the terminal.

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use fleettrack::{Device, DeviceCatalog, EtaEstimate, TrackerConfig, TrackerService, Trend};
use tracing::info;

use crate::error::CliError;

/// Arguments for the track command.
pub struct TrackArgs {
    /// Path to a JSON file with the device catalog.
    pub devices: PathBuf,
    /// Observer latitude (with `lon`, enables distance sorting and ETAs).
    pub lat: Option<f64>,
    /// Observer longitude.
    pub lon: Option<f64>,
    /// Seconds between snapshot prints.
    pub refresh_secs: u64,
}

/// Run the live tracker until Ctrl-C.
pub async fn run(config: TrackerConfig, args: TrackArgs) -> Result<(), CliError> {
    let devices = load_devices(&args.devices)?;
    if devices.is_empty() {
        return Err(CliError::Input(
            "device catalog is empty; nothing to track".to_string(),
        ));
    }

    println!("FleetTrack v{}", fleettrack::VERSION);
    println!("==========");
    println!();
    println!("Broker:  {}", config.broker.url);
    println!("Devices: {}", devices.len());
    println!();

    info!(devices = devices.len(), "Starting live tracking session");
    let service = TrackerService::start(config, DeviceCatalog::new(devices))?;

    if let (Some(lat), Some(lon)) = (args.lat, args.lon) {
        service.set_observer_position(Some((lat, lon)));
        println!("Observer: {:.5}, {:.5} (snapshots distance-sorted)", lat, lon);
    }

    let mut refresh = tokio::time::interval(Duration::from_secs(args.refresh_secs.max(1)));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                println!();
                println!("Stopping...");
                break;
            }
            _ = refresh.tick() => {
                print_snapshot(&service);
            }
        }
    }

    service.shutdown().await;
    info!("Live tracking session ended");
    Ok(())
}

fn load_devices(path: &PathBuf) -> Result<Vec<Device>, CliError> {
    let raw = fs::read_to_string(path)?;
    serde_json::from_str(&raw)
        .map_err(|e| CliError::Input(format!("invalid device catalog {}: {}", path.display(), e)))
}

fn print_snapshot(service: &TrackerService) {
    let buses = service.snapshot();
    if buses.is_empty() {
        println!("-- no buses on air --");
        return;
    }

    for bus in buses {
        let trend = match bus.trend {
            Trend::Approaching => "approaching",
            Trend::MovingAway => "moving away",
            Trend::Unknown => "-",
        };
        let eta = match bus.eta {
            EtaEstimate::Minutes(m) => format!("{:.2} min", m),
            EtaEstimate::Stopped => "stopped".to_string(),
            EtaEstimate::Unavailable => "-".to_string(),
        };
        println!(
            "{}  ({:.5}, {:.5})  {:>5.1} km/h  pax {}  batt {}  {}  ETA {}  {}",
            bus.device_id,
            bus.lat,
            bus.lon,
            bus.speed_kmh,
            bus.passenger_count
                .map(|c| c.to_string())
                .unwrap_or_else(|| "-".to_string()),
            bus.battery_percent
                .map(|p| format!("{}%", p))
                .unwrap_or_else(|| "-".to_string()),
            trend,
            eta,
            bus.location_text.as_deref().unwrap_or("Fetching..."),
        );
    }
    println!();
}
