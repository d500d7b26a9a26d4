//! Filter worker (C8): one task per active estimator, reading its own
//! per-filter queues and appending `FilteredOutput` under `save_lock`.
//!
//! `FilterInstance` is the tagged variant replacing the donor's dynamic
//! dispatch (factory returning a boxed common interface), per section 9's
//! re-architecture note: a small trait defines the per-sample hooks, and
//! workers are parameterized by the variant rather than a trait object.

use crate::calibration::Calibrator;
use crate::fanout::FanoutQueue;
use crate::filters::complementary::ComplementaryFilter;
use crate::filters::ekf::Ekf13d;
use crate::filters::es_ekf::EsEkf;
use crate::persistence::SaveLock;
use crate::rotation::RotationDetector;
use crate::types::{AccelSample, FilterKind, FilteredOutput, GpsFix, GyroSample};
use nalgebra::Vector3;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::Duration;

const POLL_TIMEOUT: Duration = Duration::from_millis(10);
const IDLE_YIELD: Duration = Duration::from_millis(1);
const STATIONARY_GYRO_STD: f64 = 0.01;
const RSS_CHECK_PERIOD: u32 = 200;

/// Resident set size in MB, read from `/proc/self/status`. Feeds the
/// ES-EKF's memory-pressure pause/resume hysteresis; zero on platforms
/// without a `/proc` (the filter just never pauses for memory there).
pub fn read_rss_mb() -> f64 {
    let status = match std::fs::read_to_string("/proc/self/status") {
        Ok(s) => s,
        Err(_) => return 0.0,
    };
    for line in status.lines() {
        if let Some(rest) = line.strip_prefix("VmRSS:") {
            let kb: f64 = rest.trim().trim_end_matches(" kB").trim().parse().unwrap_or(0.0);
            return kb / 1024.0;
        }
    }
    0.0
}

/// Per-sample hooks common to every estimator. A trait, not a trait
/// object: `FilterInstance` dispatches to it by matching the variant, so
/// no `Box<dyn FusionEstimator>` exists anywhere in the worker.
pub trait FusionEstimator {
    fn on_accel(&mut self, sample: AccelSample, motion_magnitude: f64, dt: f64);
    fn on_gyro(&mut self, sample: GyroSample, dt: f64, is_stationary: bool);
    fn on_gps(&mut self, fix: GpsFix);
    fn filtered_output(&self, t: f64) -> FilteredOutput;
}

pub enum FilterInstance {
    Complementary { filter: ComplementaryFilter, last_accel_t: Option<f64> },
    Ekf { filter: Ekf13d, last_accel_t: Option<f64>, last_gyro: Vector3<f64> },
    EsEkf { filter: EsEkf, last_accel_t: Option<f64>, last_gyro: Vector3<f64>, rss_mb: f64 },
}

impl FilterInstance {
    pub fn new(kind: FilterKind) -> Self {
        match kind {
            FilterKind::Complementary => FilterInstance::Complementary {
                filter: ComplementaryFilter::new(),
                last_accel_t: None,
            },
            FilterKind::Ekf => FilterInstance::Ekf {
                filter: Ekf13d::new(),
                last_accel_t: None,
                last_gyro: Vector3::zeros(),
            },
            FilterKind::EsEkf => FilterInstance::EsEkf {
                filter: EsEkf::new(),
                last_accel_t: None,
                last_gyro: Vector3::zeros(),
                rss_mb: 0.0,
            },
        }
    }

    pub fn kind(&self) -> FilterKind {
        match self {
            FilterInstance::Complementary { .. } => FilterKind::Complementary,
            FilterInstance::Ekf { .. } => FilterKind::Ekf,
            FilterInstance::EsEkf { .. } => FilterKind::EsEkf,
        }
    }

    pub fn set_origin(&mut self, lat: f64, lon: f64) {
        match self {
            FilterInstance::Complementary { .. } => {}
            FilterInstance::Ekf { filter, .. } => filter.set_origin(lat, lon),
            FilterInstance::EsEkf { filter, .. } => filter.set_origin(lat, lon),
        }
    }

    pub fn note_rss_mb(&mut self, rss_mb: f64) {
        if let FilterInstance::EsEkf { filter, rss_mb: cached, .. } = self {
            *cached = rss_mb;
            filter.note_rss_mb(rss_mb);
        }
    }
}

impl FusionEstimator for FilterInstance {
    fn on_accel(&mut self, sample: AccelSample, motion_magnitude: f64, dt: f64) {
        match self {
            FilterInstance::Complementary { filter, last_accel_t } => {
                filter.on_accel(sample, motion_magnitude, dt);
                *last_accel_t = Some(sample.t);
            }
            FilterInstance::Ekf { filter, last_accel_t, last_gyro } => {
                let accel_body = Vector3::new(sample.x, sample.y, sample.z);
                let _ = filter.predict(accel_body, *last_gyro, dt);
                *last_accel_t = Some(sample.t);
            }
            FilterInstance::EsEkf { filter, last_accel_t, last_gyro, .. } => {
                let accel_body = Vector3::new(sample.x, sample.y, sample.z);
                let _ = filter.predict(accel_body, *last_gyro, dt);
                *last_accel_t = Some(sample.t);
            }
        }
    }

    fn on_gyro(&mut self, sample: GyroSample, _dt: f64, is_stationary: bool) {
        match self {
            FilterInstance::Complementary { filter, .. } => {
                filter.on_gyro(sample, is_stationary);
            }
            FilterInstance::Ekf { filter, last_gyro, .. } => {
                *last_gyro = Vector3::new(sample.x, sample.y, sample.z);
                if is_stationary {
                    let _ = filter.update_gyro_bias_pseudo_measurement(*last_gyro, STATIONARY_GYRO_STD);
                }
            }
            FilterInstance::EsEkf { last_gyro, .. } => {
                *last_gyro = Vector3::new(sample.x, sample.y, sample.z);
            }
        }
    }

    fn on_gps(&mut self, fix: GpsFix) {
        match self {
            FilterInstance::Complementary { filter, .. } => filter.on_gps(fix),
            FilterInstance::Ekf { filter, .. } => {
                let _ = filter.update_gps(fix.latitude, fix.longitude, fix.accuracy);
            }
            FilterInstance::EsEkf { filter, .. } => {
                let _ = filter.update_gps(fix.latitude, fix.longitude, fix.accuracy);
            }
        }
    }

    fn filtered_output(&self, t: f64) -> FilteredOutput {
        match self {
            FilterInstance::Complementary { filter, .. } => filter.filtered_output(t),
            FilterInstance::Ekf { filter, .. } => {
                let s = filter.get_state();
                let pos = s.position();
                let vel = s.velocity();
                let (latitude, longitude) = match filter.origin() {
                    Some((lat0, lon0)) => {
                        let (lat, lon) = crate::geo::meters_to_latlon(pos.x, pos.y, lat0, lon0);
                        (Some(lat), Some(lon))
                    }
                    None => (None, None),
                };
                FilteredOutput {
                    t,
                    source_filter: FilterKind::Ekf,
                    velocity: vel.norm(),
                    distance: 0.0, // accumulated by the caller from successive positions
                    latitude,
                    longitude,
                    uncertainty: Some(s.p.trace()),
                    quaternion_norm: Some(s.quaternion_norm()),
                }
            }
            FilterInstance::EsEkf { filter, .. } => {
                let s = filter.get_state();
                let vel = s.velocity();
                let pos = s.position();
                let (latitude, longitude) = match filter.origin() {
                    Some((lat0, lon0)) => {
                        let (lat, lon) = crate::geo::meters_to_latlon(pos.x, pos.y, lat0, lon0);
                        (Some(lat), Some(lon))
                    }
                    None => (None, None),
                };
                FilteredOutput {
                    t,
                    source_filter: FilterKind::EsEkf,
                    velocity: vel.norm(),
                    distance: 0.0,
                    latitude,
                    longitude,
                    uncertainty: Some(s.p_err.trace()),
                    quaternion_norm: Some(s.quaternion().norm()),
                }
            }
        }
    }
}

pub struct FilterWorker {
    pub instance: FilterInstance,
    filter_name: &'static str,
    accel_queue: Arc<FanoutQueue<AccelSample>>,
    gyro_queue: Arc<FanoutQueue<GyroSample>>,
    gps_queue: Arc<FanoutQueue<GpsFix>>,
    calibrator: Arc<Mutex<Calibrator>>,
    rotation: Arc<Mutex<RotationDetector>>,
    save_lock: SaveLock,
    stop_signal: Arc<AtomicBool>,
    failure_count: AtomicU32,
}

impl FilterWorker {
    pub fn new(
        kind: FilterKind,
        accel_queue: Arc<FanoutQueue<AccelSample>>,
        gyro_queue: Arc<FanoutQueue<GyroSample>>,
        gps_queue: Arc<FanoutQueue<GpsFix>>,
        calibrator: Arc<Mutex<Calibrator>>,
        rotation: Arc<Mutex<RotationDetector>>,
        save_lock: SaveLock,
        stop_signal: Arc<AtomicBool>,
    ) -> Self {
        Self {
            filter_name: kind.name(),
            instance: FilterInstance::new(kind),
            accel_queue,
            gyro_queue,
            gps_queue,
            calibrator,
            rotation,
            save_lock,
            stop_signal,
            failure_count: AtomicU32::new(0),
        }
    }

    pub fn failure_count(&self) -> u32 {
        self.failure_count.load(Ordering::Relaxed)
    }

    /// Section 4.8's worker loop: try each queue in turn with a short
    /// timeout, apply updates, append one output, yield briefly when idle.
    /// Never calls into another worker; its own failures never escape.
    pub async fn run(&mut self) {
        let mut last_accel_t: Option<f64> = None;
        let mut last_gyro_t: Option<f64> = None;
        let mut tick: u32 = 0;

        while !self.stop_signal.load(Ordering::Relaxed) {
            tick = tick.wrapping_add(1);
            if tick % RSS_CHECK_PERIOD == 0 {
                self.instance.note_rss_mb(read_rss_mb());
            }

            let mut did_work = false;

            if let Some(sample) = tokio::time::timeout(POLL_TIMEOUT, self.accel_queue.try_pop())
                .await
                .ok()
                .flatten()
            {
                did_work = true;
                let motion_magnitude = self.calibrator.lock().await.motion_magnitude(&sample);
                let dt = last_accel_t.map(|t0| sample.t - t0).unwrap_or(0.0);
                last_accel_t = Some(sample.t);
                self.instance.on_accel(sample, motion_magnitude, dt);
                self.append_output(sample.t).await;
            }

            if let Some(sample) = self.gyro_queue.try_pop().await {
                did_work = true;
                let is_stationary = self.rotation.lock().await.state().total_rotation_magnitude < 0.01;
                let dt = last_gyro_t.map(|t0| sample.t - t0).unwrap_or(0.0);
                last_gyro_t = Some(sample.t);
                self.instance.on_gyro(sample, dt, is_stationary);
            }

            if let Some(fix) = self.gps_queue.try_pop().await {
                did_work = true;
                self.instance.on_gps(fix);
                self.append_output(fix.t).await;
            }

            if !did_work {
                tokio::time::sleep(IDLE_YIELD).await;
            }
        }
    }

    async fn append_output(&mut self, t: f64) {
        let output = self.instance.filtered_output(t);
        self.save_lock.lock().await.push_trajectory(self.filter_name, output);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::GpsProvider;

    fn accel(t: f64) -> AccelSample {
        AccelSample { t, x: 0.0, y: 0.0, z: 9.81 }
    }

    fn gps(t: f64, speed: f64) -> GpsFix {
        GpsFix {
            t,
            latitude: 37.0,
            longitude: -122.0,
            altitude: 0.0,
            accuracy: 5.0,
            speed,
            bearing: 0.0,
            provider: GpsProvider::Gps,
        }
    }

    #[test]
    fn complementary_instance_produces_its_own_kind() {
        let inst = FilterInstance::new(FilterKind::Complementary);
        assert_eq!(inst.kind(), FilterKind::Complementary);
    }

    #[test]
    fn ekf_instance_tracks_velocity_through_accel() {
        let mut inst = FilterInstance::new(FilterKind::Ekf);
        inst.set_origin(37.0, -122.0);
        inst.on_accel(accel(0.0), 0.0, 0.0);
        inst.on_accel(accel(0.02), 0.0, 0.02);
        let out = inst.filtered_output(0.02);
        assert_eq!(out.source_filter, FilterKind::Ekf);
    }

    #[test]
    fn complementary_instance_updates_on_gps() {
        let mut inst = FilterInstance::new(FilterKind::Complementary);
        inst.on_gps(gps(0.0, 12.0));
        let out = inst.filtered_output(0.0);
        assert!((out.velocity - 12.0).abs() < 1e-9);
    }
}
