//! Live status snapshot: a small JSON file the session coordinator (C12)
//! rewrites periodically so an external viewer (a phone's notification
//! tray, a companion app) can show progress without parsing the session
//! directory. Grounded on the donor's `LiveStatus` (`live_status.rs`);
//! fields are re-sourced from the new pipeline's actual owners (C1's
//! daemons, C3's calibrator, C8's filter outputs, C11's health monitor)
//! instead of the donor's dashboard-era globals.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FilterStatus {
    pub velocity: f64,
    pub distance: f64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LiveStatus {
    pub timestamp: f64,
    pub uptime_seconds: f64,
    pub accel_samples: u64,
    pub gyro_samples: u64,
    pub gps_samples: u64,
    pub incidents_detected: u64,
    pub filters: HashMap<String, FilterStatus>,
    pub calibration_complete: bool,
    pub gravity_magnitude: f64,
    pub imu_silence_secs: f64,
    pub gps_silence_secs: f64,
    pub imu_restart_attempts: u32,
    pub gps_restart_attempts: u32,
    pub imu_circuit_open: bool,
    pub gps_circuit_open: bool,
}

impl LiveStatus {
    pub fn new(uptime_seconds: f64) -> Self {
        Self {
            timestamp: current_timestamp(),
            uptime_seconds,
            accel_samples: 0,
            gyro_samples: 0,
            gps_samples: 0,
            incidents_detected: 0,
            filters: HashMap::new(),
            calibration_complete: false,
            gravity_magnitude: 9.81,
            imu_silence_secs: 0.0,
            gps_silence_secs: 0.0,
            imu_restart_attempts: 0,
            gps_restart_attempts: 0,
            imu_circuit_open: false,
            gps_circuit_open: false,
        }
    }

    pub async fn save(&self, path: &Path) -> std::io::Result<()> {
        let json = serde_json::to_vec_pretty(self)?;
        tokio::fs::write(path, json).await
    }
}

pub fn current_timestamp() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}
