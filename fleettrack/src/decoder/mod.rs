//! Telemetry payload decoding.
//!
//! Turns raw broker payloads into typed samples. This is the trust
//! boundary for device-originated data: malformed JSON, missing fields, or
//! non-numeric coordinates yield [`Decoded::Unrecognized`] - nothing a
//! device sends can produce an error that escapes past this module. The
//! ingestor logs unrecognized payloads and drops them without side effects.

use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::catalog::{DeviceId, TopicKind};

/// Battery voltage at or below which charge reads 0 %.
const BATTERY_EMPTY_VOLTS: f64 = 9.0;

/// Battery voltage at or above which charge reads 100 %.
const BATTERY_FULL_VOLTS: f64 = 12.6;

/// One decoded GPS fix.
///
/// Ephemeral: produced from a single broker message and consumed
/// immediately by the fleet registry and proximity estimator.
#[derive(Debug, Clone, PartialEq)]
pub struct TelemetrySample {
    pub device_id: DeviceId,
    pub lat: f64,
    pub lon: f64,
    pub speed_kmh: f64,
    pub direction_deg: f64,
    pub received_at: DateTime<Utc>,
}

/// Result of decoding one broker message.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    /// A well-formed GPS position sample.
    Position(TelemetrySample),
    /// A passenger counter reading.
    PassengerCount { device_id: DeviceId, count: u32 },
    /// A battery voltage report, mapped to a charge percentage.
    Battery {
        device_id: DeviceId,
        percent: u8,
        voltage: f64,
    },
    /// Anything that failed to parse. Log and drop.
    Unrecognized { reason: String },
}

/// Wire shape of a position payload: `{lat, lon, speed?, direction?}`.
#[derive(Debug, Deserialize)]
struct PositionPayload {
    lat: f64,
    lon: f64,
    #[serde(default)]
    speed: f64,
    #[serde(default)]
    direction: f64,
}

/// Wire shape of a passenger-count payload: `{devId, count}`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PassengerCountPayload {
    #[allow(dead_code)]
    dev_id: String,
    count: u32,
}

/// Decode a raw payload from a known device topic.
///
/// `device_id` and `kind` come from the catalog's topic lookup; the
/// payload bytes come straight off the wire.
pub fn decode(
    device_id: &DeviceId,
    kind: TopicKind,
    payload: &[u8],
    received_at: DateTime<Utc>,
) -> Decoded {
    match kind {
        TopicKind::Position => decode_position(device_id, payload, received_at),
        TopicKind::PassengerCount => decode_passenger_count(device_id, payload),
        TopicKind::Battery => decode_battery(device_id, payload),
    }
}

fn decode_position(device_id: &DeviceId, payload: &[u8], received_at: DateTime<Utc>) -> Decoded {
    let parsed: PositionPayload = match serde_json::from_slice(payload) {
        Ok(p) => p,
        Err(e) => {
            return Decoded::Unrecognized {
                reason: format!("invalid position JSON: {}", e),
            }
        }
    };

    if !parsed.lat.is_finite() || !parsed.lon.is_finite() {
        return Decoded::Unrecognized {
            reason: format!(
                "non-finite coordinates: lat={}, lon={}",
                parsed.lat, parsed.lon
            ),
        };
    }

    Decoded::Position(TelemetrySample {
        device_id: device_id.clone(),
        lat: parsed.lat,
        lon: parsed.lon,
        speed_kmh: if parsed.speed.is_finite() {
            parsed.speed
        } else {
            0.0
        },
        direction_deg: if parsed.direction.is_finite() {
            parsed.direction
        } else {
            0.0
        },
        received_at,
    })
}

fn decode_passenger_count(device_id: &DeviceId, payload: &[u8]) -> Decoded {
    match serde_json::from_slice::<PassengerCountPayload>(payload) {
        Ok(p) => Decoded::PassengerCount {
            device_id: device_id.clone(),
            count: p.count,
        },
        Err(e) => Decoded::Unrecognized {
            reason: format!("invalid passenger-count JSON: {}", e),
        },
    }
}

/// Battery reports are plain decimal voltage text, not JSON.
fn decode_battery(device_id: &DeviceId, payload: &[u8]) -> Decoded {
    let text = match std::str::from_utf8(payload) {
        Ok(t) => t.trim(),
        Err(_) => {
            return Decoded::Unrecognized {
                reason: "battery payload is not UTF-8".to_string(),
            }
        }
    };

    match text.parse::<f64>() {
        Ok(voltage) if voltage.is_finite() => {
            let clamped = voltage.clamp(BATTERY_EMPTY_VOLTS, BATTERY_FULL_VOLTS);
            let percent = (clamped - BATTERY_EMPTY_VOLTS)
                / (BATTERY_FULL_VOLTS - BATTERY_EMPTY_VOLTS)
                * 100.0;
            Decoded::Battery {
                device_id: device_id.clone(),
                percent: percent.round() as u8,
                voltage: clamped,
            }
        }
        _ => Decoded::Unrecognized {
            reason: format!("battery payload is not a voltage: {:?}", text),
        },
    }
}
