//! FleetTrack CLI - command-line interface.
//!
//! Two subcommands: `track` runs the live fleet view against the broker,
//! `trips` reconstructs trips from a stored GPS log file.

mod commands;
mod error;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

use commands::{track, trips};

#[derive(Parser)]
#[command(name = "fleettrack")]
#[command(version = fleettrack::VERSION)]
#[command(about = "Real-time mini-bus fleet tracking and trip reconstruction")]
struct Cli {
    /// Path to config.ini (default: user config dir).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Write logs to this directory instead of the console.
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Track the fleet live from the broker.
    Track {
        /// JSON file with the device catalog.
        #[arg(long)]
        devices: PathBuf,

        /// Observer latitude (enables distance sorting and ETAs).
        #[arg(long, requires = "lon")]
        lat: Option<f64>,

        /// Observer longitude.
        #[arg(long, requires = "lat")]
        lon: Option<f64>,

        /// Seconds between snapshot prints.
        #[arg(long, default_value = "2")]
        refresh: u64,
    },

    /// Reconstruct trips from a GPS log file.
    Trips {
        /// JSON file with an array of GPS log points.
        #[arg(long)]
        logs: PathBuf,

        #[arg(long)]
        start_lat: Option<f64>,

        #[arg(long)]
        start_lng: Option<f64>,

        #[arg(long)]
        end_lat: Option<f64>,

        #[arg(long)]
        end_lng: Option<f64>,

        /// Days back from today (0 = today). Omit to keep the whole file.
        #[arg(long)]
        day: Option<u32>,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let _log_guard = fleettrack::log::init_logging(cli.log_dir.as_deref());

    let config = match commands::load_config(cli.config.as_ref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}", e);
            return ExitCode::FAILURE;
        }
    };

    let result = match cli.command {
        Command::Track {
            devices,
            lat,
            lon,
            refresh,
        } => {
            let runtime = match tokio::runtime::Runtime::new() {
                Ok(rt) => rt,
                Err(e) => {
                    eprintln!("Failed to create runtime: {}", e);
                    return ExitCode::FAILURE;
                }
            };
            runtime.block_on(track::run(
                config,
                track::TrackArgs {
                    devices,
                    lat,
                    lon,
                    refresh_secs: refresh,
                },
            ))
        }
        Command::Trips {
            logs,
            start_lat,
            start_lng,
            end_lat,
            end_lng,
            day,
        } => trips::run(
            config,
            trips::TripsArgs {
                logs,
                start_lat,
                start_lng,
                end_lat,
                end_lng,
                day,
            },
        ),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}", e);
            ExitCode::FAILURE
        }
    }
}
