//! Rotation detector (C4): integrates gyro into bounded Euler angles and
//! signals "significant rotation" events for C3's recalibration trigger.
//!
//! The per-axis integration loses accuracy past ~60 degrees of rotation
//! (it isn't a proper attitude filter) — acceptable because its only
//! consumer is a >=30 degree threshold recalibration trigger, not attitude
//! estimation (that's the EKF's job).

use crate::types::{PrimaryAxis, RotationState};

const MAX_DT_S: f64 = 0.1;

fn normalize_angle(angle: f64) -> f64 {
    let mut a = angle;
    while a > std::f64::consts::PI {
        a -= 2.0 * std::f64::consts::PI;
    }
    while a < -std::f64::consts::PI {
        a += 2.0 * std::f64::consts::PI;
    }
    a
}

pub struct RotationDetector {
    pitch: f64,
    roll: f64,
    yaw: f64,
    sample_count: u64,
}

impl RotationDetector {
    pub fn new() -> Self {
        Self {
            pitch: 0.0,
            roll: 0.0,
            yaw: 0.0,
            sample_count: 0,
        }
    }

    /// Integrate one gyro sample. Returns `true` if integrated, `false`
    /// if skipped because `dt > 100 ms` (skipped, never clamped — a
    /// clamp would silently fabricate rotation that didn't happen).
    pub fn update(&mut self, omega_x: f64, omega_y: f64, omega_z: f64, dt: f64) -> bool {
        if dt > MAX_DT_S || dt < 0.0 {
            return false;
        }
        self.roll = normalize_angle(self.roll + omega_x * dt);
        self.pitch = normalize_angle(self.pitch + omega_y * dt);
        self.yaw = normalize_angle(self.yaw + omega_z * dt);
        self.sample_count += 1;
        true
    }

    pub fn state(&self) -> RotationState {
        let total = (self.pitch * self.pitch + self.roll * self.roll + self.yaw * self.yaw).sqrt();
        let primary_axis = {
            let angles = [
                (self.roll.abs(), PrimaryAxis::X),
                (self.pitch.abs(), PrimaryAxis::Y),
                (self.yaw.abs(), PrimaryAxis::Z),
            ];
            let (max_mag, axis) = angles
                .into_iter()
                .fold((0.0, PrimaryAxis::None), |acc, (mag, ax)| {
                    if mag > acc.0 {
                        (mag, ax)
                    } else {
                        acc
                    }
                });
            if max_mag < 1e-6 {
                PrimaryAxis::None
            } else {
                axis
            }
        };
        RotationState {
            pitch: self.pitch,
            roll: self.roll,
            yaw: self.yaw,
            total_rotation_magnitude: total,
            primary_axis,
            sample_count: self.sample_count,
        }
    }

    /// Zero the angles but keep sample-count history.
    pub fn reset_angles(&mut self) {
        self.pitch = 0.0;
        self.roll = 0.0;
        self.yaw = 0.0;
    }

    /// Clear angles and history together.
    pub fn reset_all(&mut self) {
        self.reset_angles();
        self.sample_count = 0;
    }
}

impl Default for RotationDetector {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn p6_angles_stay_normalized_after_many_integrations() {
        let mut r = RotationDetector::new();
        for _ in 0..1000 {
            r.update(0.0, 0.0, 10.0, 0.05);
        }
        let s = r.state();
        assert!(s.pitch >= -std::f64::consts::PI && s.pitch <= std::f64::consts::PI);
        assert!(s.roll >= -std::f64::consts::PI && s.roll <= std::f64::consts::PI);
        assert!(s.yaw >= -std::f64::consts::PI && s.yaw <= std::f64::consts::PI);
    }

    #[test]
    fn p7_large_dt_is_skipped_not_clamped() {
        let mut r = RotationDetector::new();
        r.update(1.0, 1.0, 1.0, 0.05);
        let before = r.state();
        let integrated = r.update(1.0, 1.0, 1.0, 0.15);
        assert!(!integrated);
        let after = r.state();
        assert_eq!(before.pitch, after.pitch);
        assert_eq!(before.roll, after.roll);
        assert_eq!(before.yaw, after.yaw);
    }

    #[test]
    fn p8_reset_semantics() {
        let mut r = RotationDetector::new();
        r.update(0.1, 0.2, 0.3, 0.05);
        r.update(0.1, 0.2, 0.3, 0.05);
        let count_before = r.state().sample_count;

        r.reset_angles();
        let s = r.state();
        assert_eq!(s.pitch, 0.0);
        assert_eq!(s.roll, 0.0);
        assert_eq!(s.yaw, 0.0);
        assert_eq!(s.sample_count, count_before);

        r.reset_all();
        assert_eq!(r.state().sample_count, 0);
    }

    #[test]
    fn negative_dt_is_also_skipped() {
        let mut r = RotationDetector::new();
        assert!(!r.update(1.0, 0.0, 0.0, -0.01));
    }
}
