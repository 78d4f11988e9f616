//! CLI error type.

use std::fmt;

/// Errors surfaced to the terminal user.
#[derive(Debug)]
pub enum CliError {
    /// Configuration file problem.
    Config(String),
    /// Input file (devices, logs) problem.
    Input(String),
    /// Service startup failure.
    Service(String),
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CliError::Config(msg) => write!(f, "Configuration error: {}", msg),
            CliError::Input(msg) => write!(f, "Input error: {}", msg),
            CliError::Service(msg) => write!(f, "Service error: {}", msg),
        }
    }
}

impl std::error::Error for CliError {}

impl From<fleettrack::ConfigError> for CliError {
    fn from(e: fleettrack::ConfigError) -> Self {
        CliError::Config(e.to_string())
    }
}

impl From<fleettrack::ServiceError> for CliError {
    fn from(e: fleettrack::ServiceError) -> Self {
        CliError::Service(e.to_string())
    }
}

impl From<std::io::Error> for CliError {
    fn from(e: std::io::Error) -> Self {
        CliError::Input(e.to_string())
    }
}
