//! Calibration & motion extractor (C3).
//!
//! Gravity is removed by magnitude subtraction rather than per-axis
//! subtraction, so the result is orientation-independent: a phone lying
//! flat and a phone propped in a dashboard mount calibrate to the same
//! `gravity_magnitude` even though their per-axis bias differs completely.
//! Grounded on the donor's `DynamicCalibration` (`sensor_fusion.rs`) and
//! `calculate_biases` (`main.rs`), generalized to the explicit
//! recalibration-eligibility and validation-gate rules in section 4.3.

use crate::types::{AccelSample, Calibration};

const MIN_GRAVITY: f64 = 9.5;
const MAX_GRAVITY: f64 = 10.1;
const MAX_BIAS: f64 = 15.0;
const DEFAULT_RECAL_MIN_INTERVAL_S: f64 = 30.0;
const STATIONARY_WINDOW_S: f64 = 30.0;
const ROTATION_EVENT_THRESHOLD_RAD: f64 = 0.5;

pub struct Calibrator {
    current: Calibration,
    last_recalibration_t: f64,
    recal_min_interval_s: f64,
    stationary_since: Option<f64>,
}

impl Calibrator {
    pub fn new() -> Self {
        Self {
            current: Calibration::unvalidated(),
            last_recalibration_t: f64::NEG_INFINITY,
            recal_min_interval_s: DEFAULT_RECAL_MIN_INTERVAL_S,
            stationary_since: None,
        }
    }

    pub fn snapshot(&self) -> Calibration {
        self.current
    }

    /// `motion_magnitude = max(0, |a| - gravity_magnitude)`: the
    /// orientation-independent proxy for linear acceleration.
    pub fn motion_magnitude(&self, sample: &AccelSample) -> f64 {
        (sample.magnitude() - self.current.gravity_magnitude).max(0.0)
    }

    /// Compute a candidate calibration from a stationary window of
    /// samples (N ~= 50) and, if it passes validation, install it.
    /// Returns `true` if the candidate was accepted.
    pub fn calibrate(&mut self, samples: &[AccelSample], now: f64) -> bool {
        if samples.is_empty() {
            return false;
        }
        let n = samples.len() as f64;
        let mean_x = samples.iter().map(|s| s.x).sum::<f64>() / n;
        let mean_y = samples.iter().map(|s| s.y).sum::<f64>() / n;
        let mean_z = samples.iter().map(|s| s.z).sum::<f64>() / n;
        let gravity_magnitude = (mean_x * mean_x + mean_y * mean_y + mean_z * mean_z).sqrt();

        let candidate = Calibration {
            bias_x: mean_x,
            bias_y: mean_y,
            bias_z: mean_z,
            gravity_magnitude,
            sample_count: samples.len() as u32,
            valid: true,
        };
        self.accept_if_valid(candidate, now)
    }

    fn accept_if_valid(&mut self, candidate: Calibration, now: f64) -> bool {
        let gravity_ok =
            candidate.gravity_magnitude >= MIN_GRAVITY && candidate.gravity_magnitude <= MAX_GRAVITY;
        let bias_ok = candidate.bias_x.abs() < MAX_BIAS
            && candidate.bias_y.abs() < MAX_BIAS
            && candidate.bias_z.abs() < MAX_BIAS;

        if !gravity_ok || !bias_ok {
            eprintln!(
                "[CALIB] rejected candidate (gravity={:.3}, bias=({:.2},{:.2},{:.2})): retaining previous calibration",
                candidate.gravity_magnitude, candidate.bias_x, candidate.bias_y, candidate.bias_z
            );
            return false;
        }

        self.current = candidate;
        self.last_recalibration_t = now;
        eprintln!(
            "[CALIB] recalibrated: gravity={:.3} bias=({:.3},{:.3},{:.3})",
            candidate.gravity_magnitude, candidate.bias_x, candidate.bias_y, candidate.bias_z
        );
        true
    }

    /// Track a stationary streak; feed every accel sample so the
    /// calibrator can tell when 30 s of stillness has elapsed.
    pub fn note_sample(&mut self, is_stationary: bool, now: f64) {
        if is_stationary {
            if self.stationary_since.is_none() {
                self.stationary_since = Some(now);
            }
        } else {
            self.stationary_since = None;
        }
    }

    fn stationary_streak_s(&self, now: f64) -> f64 {
        self.stationary_since.map(|t0| now - t0).unwrap_or(0.0)
    }

    /// Recalibration is only permitted when the caller asserts a
    /// stationary >= 30 s condition or a rotation >= 0.5 rad event, and
    /// only if the minimum recalibration interval has elapsed.
    pub fn recalibrate_if_eligible(
        &mut self,
        samples: &[AccelSample],
        is_stationary: bool,
        rotation_event_magnitude: f64,
        now: f64,
    ) -> bool {
        if now - self.last_recalibration_t < self.recal_min_interval_s {
            return false;
        }
        let stationary_eligible = is_stationary && self.stationary_streak_s(now) >= STATIONARY_WINDOW_S;
        let rotation_eligible = rotation_event_magnitude >= ROTATION_EVENT_THRESHOLD_RAD;
        if !stationary_eligible && !rotation_eligible {
            return false;
        }
        self.calibrate(samples, now)
    }
}

impl Default for Calibrator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn stationary_samples(n: usize) -> Vec<AccelSample> {
        (0..n)
            .map(|i| AccelSample {
                t: i as f64 * 0.02,
                x: 0.0,
                y: 0.0,
                z: 9.81,
            })
            .collect()
    }

    #[test]
    fn calibrate_accepts_valid_stationary_window() {
        let mut c = Calibrator::new();
        let accepted = c.calibrate(&stationary_samples(50), 10.0);
        assert!(accepted);
        assert_abs_diff_eq!(c.snapshot().gravity_magnitude, 9.81, epsilon = 1e-9);
        assert!(c.snapshot().valid);
    }

    #[test]
    fn p4_motion_magnitude_of_stationary_stream_is_near_zero() {
        let mut c = Calibrator::new();
        c.calibrate(&stationary_samples(50), 0.0);
        let noisy = AccelSample {
            t: 1.0,
            x: 0.0,
            y: 0.0,
            z: 9.81,
        };
        assert!(c.motion_magnitude(&noisy) < 0.05);
    }

    #[test]
    fn p5_invalid_calibration_window_is_rejected_and_retains_previous() {
        let mut c = Calibrator::new();
        c.calibrate(&stationary_samples(50), 0.0);
        let previous = c.snapshot();

        // A "moving" window whose magnitude averages to 7.0 m/s^2 fails
        // the [9.5, 10.1] gravity gate.
        let moving: Vec<AccelSample> = (0..50)
            .map(|i| AccelSample {
                t: i as f64 * 0.02,
                x: 7.0,
                y: 0.0,
                z: 0.0,
            })
            .collect();
        let accepted = c.calibrate(&moving, 100.0);
        assert!(!accepted);
        assert_eq!(c.snapshot().gravity_magnitude, previous.gravity_magnitude);
    }

    #[test]
    fn recalibration_requires_minimum_interval() {
        let mut c = Calibrator::new();
        // Establish a qualifying >=30s stationary streak starting at t=0.
        c.note_sample(true, 0.0);
        assert!(c.recalibrate_if_eligible(&stationary_samples(50), true, 0.0, 30.0));
        // Too soon since the recalibration above, even though still stationary.
        c.stationary_since = Some(30.0);
        assert!(!c.recalibrate_if_eligible(&stationary_samples(50), true, 0.0, 35.0));
    }

    #[test]
    fn recalibration_needs_stationary_streak_or_rotation_event() {
        let mut c = Calibrator::new();
        c.last_recalibration_t = f64::NEG_INFINITY;
        // Stationary flag true but streak hasn't reached 30s yet.
        c.note_sample(true, 0.0);
        assert!(!c.recalibrate_if_eligible(&stationary_samples(50), true, 0.0, 5.0));
        // A rotation event alone is sufficient.
        assert!(c.recalibrate_if_eligible(&stationary_samples(50), false, 0.6, 5.0));
    }
}
