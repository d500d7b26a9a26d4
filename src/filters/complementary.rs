//! Complementary filter (C5): GPS-only distance, GPS/accel weighted
//! velocity.
//!
//! Grounded on the donor's `ComplementaryFilter` (`filters/complementary.rs`)
//! for the 0.7/0.3 GPS/accel blend and the lesson already baked into its
//! comments ("accel integration was proven to double-integrate and was
//! removed" — distance here is GPS-haversine only, never accel-integrated).
//! Generalized to section 4.5's exact velocity blend (using C3's
//! `motion_magnitude` rather than raw accel) and stationary-detection rule.

use crate::geo::haversine_distance;
use crate::types::{AccelSample, FilterKind, FilteredOutput, GpsFix, GyroSample};

const GPS_WEIGHT: f64 = 0.7;
const ACCEL_WEIGHT: f64 = 0.3;
const STATIONARY_GPS_VELOCITY_MS: f64 = 0.1;
const STATIONARY_DISPLACEMENT_FLOOR_M: f64 = 5.0;
const STATIONARY_ACCURACY_FACTOR: f64 = 1.5;

#[derive(Clone, Copy, Debug, Default)]
pub struct ComplementaryState {
    pub velocity: f64,
    pub distance: f64,
    pub is_stationary: bool,
    pub last_gps_lat: Option<f64>,
    pub last_gps_lon: Option<f64>,
    pub last_gps_t: Option<f64>,
}

/// GPS-only distance, GPS/accel-blended velocity. Does not consume gyro:
/// section 4.5 names only GPS fixes and accel samples as inputs.
pub struct ComplementaryFilter {
    state: ComplementaryState,
    gps_velocity: f64,
}

impl ComplementaryFilter {
    pub fn new() -> Self {
        Self {
            state: ComplementaryState::default(),
            gps_velocity: 0.0,
        }
    }

    pub fn on_accel(&mut self, sample: AccelSample, motion_magnitude: f64, dt: f64) {
        let accel_branch = self.state.velocity + motion_magnitude * dt;
        self.state.velocity = (GPS_WEIGHT * self.gps_velocity + ACCEL_WEIGHT * accel_branch).max(0.0);
        self.update_stationary(sample.t);
    }

    pub fn on_gyro(&mut self, _sample: GyroSample, _is_stationary: bool) {}

    pub fn on_gps(&mut self, fix: GpsFix) {
        self.gps_velocity = fix.speed.max(0.0);
        self.state.velocity = self.gps_velocity;

        if let (Some(lat0), Some(lon0)) = (self.state.last_gps_lat, self.state.last_gps_lon) {
            self.state.distance += haversine_distance(lat0, lon0, fix.latitude, fix.longitude);
        }
        self.state.last_gps_lat = Some(fix.latitude);
        self.state.last_gps_lon = Some(fix.longitude);
        self.state.last_gps_t = Some(fix.t);
        self.update_stationary(fix.t);
    }

    fn update_stationary(&mut self, _now: f64) {
        self.state.is_stationary = self.gps_velocity < STATIONARY_GPS_VELOCITY_MS;
    }

    /// Stationary per section 4.5: low GPS velocity AND little recent
    /// displacement relative to the fix's own accuracy.
    pub fn note_gps_accuracy(&mut self, accuracy: f64, recent_displacement_m: f64) {
        let displacement_floor = STATIONARY_DISPLACEMENT_FLOOR_M.max(STATIONARY_ACCURACY_FACTOR * accuracy);
        self.state.is_stationary =
            self.gps_velocity < STATIONARY_GPS_VELOCITY_MS && recent_displacement_m < displacement_floor;
    }

    pub fn snapshot(&self) -> ComplementaryState {
        self.state
    }

    pub fn filtered_output(&self, t: f64) -> FilteredOutput {
        FilteredOutput {
            t,
            source_filter: FilterKind::Complementary,
            velocity: self.state.velocity,
            distance: self.state.distance,
            latitude: self.state.last_gps_lat,
            longitude: self.state.last_gps_lon,
            uncertainty: None,
            quaternion_norm: None,
        }
    }
}

impl Default for ComplementaryFilter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn velocity_blends_gps_and_motion_magnitude() {
        let mut f = ComplementaryFilter::new();
        f.on_gps(GpsFix {
            t: 0.0,
            latitude: 37.0,
            longitude: -122.0,
            altitude: 0.0,
            accuracy: 5.0,
            speed: 10.0,
            bearing: 0.0,
            provider: crate::types::GpsProvider::Gps,
        });
        f.on_accel(
            AccelSample { t: 0.02, x: 0.0, y: 0.0, z: 9.81 },
            2.0,
            0.02,
        );
        // 0.7*10.0 + 0.3*(10.0 + 2.0*0.02) = 7.0 + 3.012 = 10.012
        assert!((f.snapshot().velocity - 10.012).abs() < 1e-6);
    }

    #[test]
    fn velocity_never_goes_negative() {
        let mut f = ComplementaryFilter::new();
        f.on_accel(AccelSample { t: 0.0, x: 0.0, y: 0.0, z: 9.81 }, 0.0, 0.02);
        assert!(f.snapshot().velocity >= 0.0);
    }

    #[test]
    fn distance_accumulates_from_gps_only() {
        let mut f = ComplementaryFilter::new();
        f.on_gps(GpsFix {
            t: 0.0,
            latitude: 37.0,
            longitude: -122.0,
            altitude: 0.0,
            accuracy: 5.0,
            speed: 0.0,
            bearing: 0.0,
            provider: crate::types::GpsProvider::Gps,
        });
        f.on_gps(GpsFix {
            t: 1.0,
            latitude: 37.001,
            longitude: -122.0,
            altitude: 0.0,
            accuracy: 5.0,
            speed: 10.0,
            bearing: 0.0,
            provider: crate::types::GpsProvider::Gps,
        });
        assert!(f.snapshot().distance > 100.0 && f.snapshot().distance < 120.0);
    }

    #[test]
    fn stationary_requires_low_velocity_and_small_displacement() {
        let mut f = ComplementaryFilter::new();
        f.on_gps(GpsFix {
            t: 0.0,
            latitude: 37.0,
            longitude: -122.0,
            altitude: 0.0,
            accuracy: 5.0,
            speed: 0.05,
            bearing: 0.0,
            provider: crate::types::GpsProvider::Gps,
        });
        f.note_gps_accuracy(5.0, 1.0);
        assert!(f.snapshot().is_stationary);
        f.note_gps_accuracy(5.0, 20.0);
        assert!(!f.snapshot().is_stationary);
    }
}
