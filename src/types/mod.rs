//! Core data model shared across the pipeline (DATA MODEL, section 3).
//!
//! These are plain, immutable value types for the three raw sensor streams
//! plus the mutable-by-replacement state owned by individual components.
//! Ownership rules live with the owning component, not here: `Calibration`
//! is exclusively mutated by the calibrator (C3), `RotationState` by the
//! rotation detector (C4), and so on.

pub mod linalg;

pub use linalg::*;

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// One accelerometer sample. `t` is seconds since session start, monotonic.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct AccelSample {
    pub t: f64,
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl AccelSample {
    pub fn magnitude(&self) -> f64 {
        (self.x * self.x + self.y * self.y + self.z * self.z).sqrt()
    }
}

/// One gyroscope sample, paired with the accelerometer in the same IMU
/// stream. Angular rates in rad/s.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct GyroSample {
    pub t: f64,
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

/// One location fix from the platform's GPS/network location provider.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct GpsFix {
    pub t: f64,
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: f64,
    pub accuracy: f64,
    pub speed: f64,
    pub bearing: f64,
    pub provider: GpsProvider,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GpsProvider {
    Gps,
    Network,
    Passive,
}

/// Gravity/bias reference, exclusively owned and atomically replaced by C3.
///
/// Invariants: `9.5 <= gravity_magnitude <= 10.1` when `valid`; `|bias_*| <
/// 15`; only ever replaced wholesale, never mutated field-by-field, so a
/// reader holding a cloned snapshot never observes a half-updated value.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct Calibration {
    pub bias_x: f64,
    pub bias_y: f64,
    pub bias_z: f64,
    pub gravity_magnitude: f64,
    pub sample_count: u32,
    pub valid: bool,
}

impl Calibration {
    pub fn unvalidated() -> Self {
        Self {
            bias_x: 0.0,
            bias_y: 0.0,
            bias_z: 0.0,
            gravity_magnitude: 9.81,
            sample_count: 0,
            valid: false,
        }
    }
}

/// Euler-angle accumulator owned by C4.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct RotationState {
    pub pitch: f64,
    pub roll: f64,
    pub yaw: f64,
    pub total_rotation_magnitude: f64,
    pub primary_axis: PrimaryAxis,
    pub sample_count: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PrimaryAxis {
    X,
    Y,
    Z,
    None,
}

/// Which fusion estimator produced a `FilteredOutput` or ran in a filter
/// worker (C8). A tagged variant, not dynamic dispatch, per REDESIGN FLAGS.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum FilterKind {
    Complementary,
    Ekf,
    EsEkf,
}

impl FilterKind {
    pub fn name(&self) -> &'static str {
        match self {
            FilterKind::Complementary => "complementary",
            FilterKind::Ekf => "ekf",
            FilterKind::EsEkf => "es_ekf",
        }
    }
}

/// One row appended to the shared filtered-output deques by a filter worker.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct FilteredOutput {
    pub t: f64,
    pub source_filter: FilterKind,
    pub velocity: f64,
    pub distance: f64,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub uncertainty: Option<f64>,
    pub quaternion_norm: Option<f64>,
}

/// Incident kinds detected by C9.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IncidentKind {
    HardBrake,
    Impact,
    Swerve,
}

impl IncidentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            IncidentKind::HardBrake => "hard_brake",
            IncidentKind::Impact => "impact",
            IncidentKind::Swerve => "swerve",
        }
    }
}

/// A raw sample captured in an incident's pre/post context window. Raw,
/// not filtered output — see DESIGN.md for the Open Question resolution.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct ContextSample {
    pub t: f64,
    pub accel_magnitude: f64,
    pub gyro_z: f64,
    pub gps_speed: Option<f64>,
}

/// A single detected incident, persisted exactly once.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IncidentRecord {
    pub id: String,
    pub kind: IncidentKind,
    pub t: f64,
    pub peak_magnitude: f64,
    pub pre_context: Vec<ContextSample>,
    pub post_context: Vec<ContextSample>,
    pub gps_speed_at_event: Option<f64>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub saved_at: f64,
}

/// Growable, bounded-by-construction store of everything a session has
/// produced so far. Owned exclusively by C10; mutated only during an
/// auto-save or the final save.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SessionAccumulator {
    pub accel_chunks: Vec<Vec<AccelSample>>,
    pub gyro_chunks: Vec<Vec<GyroSample>>,
    pub gps_chunks: Vec<Vec<GpsFix>>,
    pub trajectory_chunks: std::collections::HashMap<String, Vec<FilteredOutput>>,
    pub incidents: Vec<IncidentRecord>,
}

impl SessionAccumulator {
    pub fn accel_sample_count(&self) -> usize {
        self.accel_chunks.iter().map(Vec::len).sum()
    }

    pub fn gyro_sample_count(&self) -> usize {
        self.gyro_chunks.iter().map(Vec::len).sum()
    }

    pub fn gps_sample_count(&self) -> usize {
        self.gps_chunks.iter().map(Vec::len).sum()
    }
}

/// A fixed-capacity FIFO with drop-oldest semantics and a drop counter.
/// Backs both the daemon output queues (C1) and the per-filter fanout
/// queues (C2): pushing into a full queue pops the oldest entry first
/// rather than rejecting the new one, matching the "never block producers"
/// requirement in section 5.
#[derive(Debug)]
pub struct BoundedDeque<T> {
    inner: VecDeque<T>,
    capacity: usize,
    dropped: u64,
}

impl<T> BoundedDeque<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: VecDeque::with_capacity(capacity),
            capacity,
            dropped: 0,
        }
    }

    /// Push, dropping the oldest element first if already at capacity.
    pub fn push(&mut self, item: T) {
        if self.inner.len() >= self.capacity {
            self.inner.pop_front();
            self.dropped += 1;
        }
        self.inner.push_back(item);
    }

    pub fn pop(&mut self) -> Option<T> {
        self.inner.pop_front()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Drain and clear, returning everything currently buffered. Used by
    /// auto-save/final-save to snapshot-and-clear under `save_lock`.
    pub fn drain_all(&mut self) -> Vec<T> {
        self.inner.drain(..).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.inner.iter()
    }
}
