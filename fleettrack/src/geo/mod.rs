//! Geodesic helpers for distance, bearing, and ETA arithmetic.
//!
//! All functions are pure and fail closed: invalid input yields `None`
//! rather than a panic, so a single corrupt GPS fix can never take down a
//! message-handling loop.

/// Mean Earth radius in kilometres.
const EARTH_RADIUS_KM: f64 = 6371.0;

/// Speed at or below which a vehicle is treated as stopped.
///
/// Callers must skip ETA computation entirely below this threshold instead
/// of reporting near-infinite arrival times for a parked bus.
pub const MOVEMENT_THRESHOLD_KMH: f64 = 2.0;

/// Great-circle distance between two points in kilometres.
///
/// Returns `None` if any coordinate is non-finite (NaN or infinite).
/// Symmetric in its arguments; identical points yield `Some(0.0)`.
pub fn haversine_km(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> Option<f64> {
    if ![lat1, lon1, lat2, lon2].iter().all(|v| v.is_finite()) {
        return None;
    }

    let d_lat = (lat2 - lat1).to_radians();
    let d_lon = (lon2 - lon1).to_radians();

    let a = (d_lat / 2.0).sin().powi(2)
        + lat1.to_radians().cos() * lat2.to_radians().cos() * (d_lon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());

    Some(EARTH_RADIUS_KM * c)
}

/// Great-circle distance in metres.
///
/// Convenience wrapper for callers working at terminal-radius scale.
pub fn haversine_m(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> Option<f64> {
    haversine_km(lat1, lon1, lat2, lon2).map(|km| km * 1000.0)
}

/// Estimated time of arrival in minutes, rounded to 2 decimals.
///
/// Returns `None` when `speed_kmh` is zero or negative - the division is
/// undefined and the caller should report the ETA as unavailable. Callers
/// are additionally expected to treat speeds at or below
/// [`MOVEMENT_THRESHOLD_KMH`] as stopped and not ask for an ETA at all.
pub fn eta_minutes(distance_km: f64, speed_kmh: f64) -> Option<f64> {
    if speed_kmh <= 0.0 || !distance_km.is_finite() || !speed_kmh.is_finite() {
        return None;
    }

    let minutes = distance_km / (speed_kmh / 60.0);
    Some((minutes * 100.0).round() / 100.0)
}

/// Initial great-circle bearing from point 1 to point 2.
///
/// Degrees in [0, 360), where 0 = North and 90 = East.
pub fn bearing_deg(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let lat1_rad = lat1.to_radians();
    let lat2_rad = lat2.to_radians();
    let d_lon = (lon2 - lon1).to_radians();

    let y = d_lon.sin() * lat2_rad.cos();
    let x = lat1_rad.cos() * lat2_rad.sin() - lat1_rad.sin() * lat2_rad.cos() * d_lon.cos();

    let bearing = y.atan2(x).to_degrees();
    (bearing + 360.0) % 360.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_identical_points_zero_distance() {
        let d = haversine_km(14.6810, 121.1124, 14.6810, 121.1124).unwrap();
        assert!(d.abs() < 1e-9, "Expected 0, got {}", d);
    }

    #[test]
    fn test_known_fixture_distance() {
        // Two points ~9.1 km apart (±1%).
        let d = haversine_km(14.6810, 121.1124, 14.7607, 121.1568).unwrap();
        assert!(
            (d - 9.1).abs() / 9.1 < 0.01,
            "Expected ~9.1 km, got {} km",
            d
        );
    }

    #[test]
    fn test_symmetry() {
        let ab = haversine_km(14.68, 121.11, 14.76, 121.15).unwrap();
        let ba = haversine_km(14.76, 121.15, 14.68, 121.11).unwrap();
        assert!((ab - ba).abs() < 1e-12);
    }

    #[test]
    fn test_non_finite_input_fails_closed() {
        assert!(haversine_km(f64::NAN, 121.0, 14.0, 121.0).is_none());
        assert!(haversine_km(14.0, f64::INFINITY, 14.0, 121.0).is_none());
        assert!(haversine_m(14.0, 121.0, f64::NEG_INFINITY, 121.0).is_none());
    }

    #[test]
    fn test_metres_variant_scales() {
        let km = haversine_km(0.0, 0.0, 0.0, 0.01).unwrap();
        let m = haversine_m(0.0, 0.0, 0.0, 0.01).unwrap();
        assert!((m - km * 1000.0).abs() < 1e-9);
        // 0.01 degrees of longitude at the equator is ~1.1 km
        assert!((m - 1113.0).abs() < 10.0, "Expected ~1113 m, got {} m", m);
    }

    #[test]
    fn test_eta_basic() {
        assert_eq!(eta_minutes(10.0, 60.0), Some(10.0));
        assert_eq!(eta_minutes(5.0, 30.0), Some(10.0));
    }

    #[test]
    fn test_eta_rounding() {
        // 1 km at 7 km/h = 8.5714... minutes
        assert_eq!(eta_minutes(1.0, 7.0), Some(8.57));
    }

    #[test]
    fn test_eta_undefined_for_stopped() {
        assert_eq!(eta_minutes(10.0, 0.0), None);
        assert_eq!(eta_minutes(10.0, -5.0), None);
    }

    #[test]
    fn test_bearing_cardinal_directions() {
        assert!((bearing_deg(0.0, 0.0, 1.0, 0.0) - 0.0).abs() < 0.1);
        assert!((bearing_deg(0.0, 0.0, 0.0, 1.0) - 90.0).abs() < 0.1);
        assert!((bearing_deg(0.0, 0.0, -1.0, 0.0) - 180.0).abs() < 0.1);
        assert!((bearing_deg(0.0, 0.0, 0.0, -1.0) - 270.0).abs() < 0.1);
    }

    proptest! {
        #[test]
        fn prop_distance_symmetric(
            lat1 in -85.0f64..85.0, lon1 in -180.0f64..180.0,
            lat2 in -85.0f64..85.0, lon2 in -180.0f64..180.0,
        ) {
            let ab = haversine_km(lat1, lon1, lat2, lon2).unwrap();
            let ba = haversine_km(lat2, lon2, lat1, lon1).unwrap();
            prop_assert!((ab - ba).abs() < 1e-9);
        }

        #[test]
        fn prop_distance_non_negative(
            lat1 in -85.0f64..85.0, lon1 in -180.0f64..180.0,
            lat2 in -85.0f64..85.0, lon2 in -180.0f64..180.0,
        ) {
            prop_assert!(haversine_km(lat1, lon1, lat2, lon2).unwrap() >= 0.0);
        }

        #[test]
        fn prop_self_distance_zero(lat in -85.0f64..85.0, lon in -180.0f64..180.0) {
            prop_assert!(haversine_km(lat, lon, lat, lon).unwrap().abs() < 1e-9);
        }
    }
}
