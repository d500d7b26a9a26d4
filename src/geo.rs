//! Shared coordinate-conversion helpers used by every fusion estimator.
//!
//! The donor repeats this exact trio (`latlon_to_meters`, `meters_to_latlon`,
//! `haversine_distance`) verbatim in `complementary.rs`, `ekf_13d.rs`, and
//! `es_ekf.rs`. Section 4.6 calls the same technique "equirectangular
//! linearization around origin" for the EKF's GPS update, so one shared
//! module is used here instead of three private copies.

const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Equirectangular-project `(lat, lon)` to local east/north meters around
/// `(origin_lat, origin_lon)`. Valid for the scale of a single driving
/// session; not a general-purpose projection.
pub fn latlon_to_meters(lat: f64, lon: f64, origin_lat: f64, origin_lon: f64) -> (f64, f64) {
    let lat_rad = origin_lat.to_radians();
    let east = (lon - origin_lon).to_radians() * EARTH_RADIUS_M * lat_rad.cos();
    let north = (lat - origin_lat).to_radians() * EARTH_RADIUS_M;
    (east, north)
}

pub fn meters_to_latlon(east: f64, north: f64, origin_lat: f64, origin_lon: f64) -> (f64, f64) {
    let lat_rad = origin_lat.to_radians();
    let lat = origin_lat + (north / EARTH_RADIUS_M).to_degrees();
    let lon = origin_lon + (east / (EARTH_RADIUS_M * lat_rad.cos())).to_degrees();
    (lat, lon)
}

pub fn haversine_distance(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let (lat1, lon1, lat2, lon2) = (
        lat1.to_radians(),
        lon1.to_radians(),
        lat2.to_radians(),
        lon2.to_radians(),
    );
    let dlat = lat2 - lat1;
    let dlon = lon2 - lon1;
    let a = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().asin();
    EARTH_RADIUS_M * c
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn round_trip_through_local_meters() {
        let (lat0, lon0) = (37.7749, -122.4194);
        let (lat, lon) = (37.7760, -122.4200);
        let (e, n) = latlon_to_meters(lat, lon, lat0, lon0);
        let (lat2, lon2) = meters_to_latlon(e, n, lat0, lon0);
        assert_abs_diff_eq!(lat, lat2, epsilon = 1e-7);
        assert_abs_diff_eq!(lon, lon2, epsilon = 1e-7);
    }

    #[test]
    fn haversine_matches_known_short_distance() {
        // Roughly 111m per 0.001 degree of latitude.
        let d = haversine_distance(37.0, -122.0, 37.001, -122.0);
        assert!((d - 111.0).abs() < 2.0);
    }
}
