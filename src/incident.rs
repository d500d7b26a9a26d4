//! Incident detector (C9): sliding pre/post context windows around
//! gated trigger conditions.
//!
//! The donor's `IncidentDetector` (`incident.rs`) checked impact, then hard
//! braking with no motion-context gate at all, then swerve with a gate and
//! cooldown — and kept no context buffers whatsoever, returning a bare
//! magnitude/timestamp struct the instant a threshold crossed. Section 4.9
//! asks for pre/post ring buffers and a motion-context gate on hard_brake
//! too; this rewrite keeps the donor's threshold constants and swerve
//! cooldown, adds the missing gate, and adds the ring-buffer windows.

use crate::types::{ContextSample, IncidentKind, IncidentRecord};
use std::collections::VecDeque;

const G: f64 = 9.81;
const HARD_BRAKE_THRESHOLD_MS2: f64 = 0.8 * G;
const IMPACT_THRESHOLD_MS2: f64 = 1.5 * G;
const SWERVE_THRESHOLD_RAD_S: f64 = 1.047; // ~60 deg/s
const MOTION_GATE_SPEED_MS: f64 = 2.0;

const PRE_WINDOW_S: f64 = 30.0;
const POST_WINDOW_S: f64 = 30.0;
const SWERVE_COOLDOWN_S: f64 = 5.0;
const HARD_BRAKE_COOLDOWN_S: f64 = 5.0;
const IMPACT_COOLDOWN_S: f64 = 5.0;

struct ActiveIncident {
    kind: IncidentKind,
    t: f64,
    peak_magnitude: f64,
    pre_context: Vec<ContextSample>,
    post_context: Vec<ContextSample>,
    gps_speed_at_event: Option<f64>,
    latitude: Option<f64>,
    longitude: Option<f64>,
}

pub struct IncidentDetector {
    pre_window: VecDeque<ContextSample>,
    active: Option<ActiveIncident>,
    last_trigger_t: [f64; 3], // indexed by IncidentKind as usize
    next_id: u64,
}

fn kind_index(kind: IncidentKind) -> usize {
    match kind {
        IncidentKind::HardBrake => 0,
        IncidentKind::Impact => 1,
        IncidentKind::Swerve => 2,
    }
}

fn cooldown_for(kind: IncidentKind) -> f64 {
    match kind {
        IncidentKind::HardBrake => HARD_BRAKE_COOLDOWN_S,
        IncidentKind::Impact => IMPACT_COOLDOWN_S,
        IncidentKind::Swerve => SWERVE_COOLDOWN_S,
    }
}

impl IncidentDetector {
    pub fn new() -> Self {
        Self {
            pre_window: VecDeque::new(),
            active: None,
            last_trigger_t: [f64::NEG_INFINITY; 3],
            next_id: 0,
        }
    }

    fn push_pre_window(&mut self, sample: ContextSample) {
        self.pre_window.push_back(sample);
        while let Some(front) = self.pre_window.front() {
            if sample.t - front.t > PRE_WINDOW_S {
                self.pre_window.pop_front();
            } else {
                break;
            }
        }
    }

    fn eligible(&self, kind: IncidentKind, now: f64) -> bool {
        now - self.last_trigger_t[kind_index(kind)] >= cooldown_for(kind)
    }

    fn detect_kind(&self, motion_magnitude: f64, gyro_z: f64, gps_speed: Option<f64>) -> Option<(IncidentKind, f64)> {
        if motion_magnitude > IMPACT_THRESHOLD_MS2 {
            return Some((IncidentKind::Impact, motion_magnitude));
        }
        let moving = gps_speed.map(|s| s > MOTION_GATE_SPEED_MS).unwrap_or(false);
        if motion_magnitude > HARD_BRAKE_THRESHOLD_MS2 && moving {
            return Some((IncidentKind::HardBrake, motion_magnitude));
        }
        if gyro_z.abs() > SWERVE_THRESHOLD_RAD_S && moving {
            return Some((IncidentKind::Swerve, gyro_z.abs()));
        }
        None
    }

    /// Feed one raw sample (always raw, never filtered output — see
    /// DESIGN.md). `motion_magnitude` is `calibration::Calibrator`'s
    /// orientation-independent proxy; `gyro_z` is the raw angular rate.
    /// Returns a completed `IncidentRecord` once a triggered incident's
    /// post-window finishes.
    pub fn on_sample(
        &mut self,
        sample: ContextSample,
        motion_magnitude: f64,
        gyro_z: f64,
        now: f64,
    ) -> Option<IncidentRecord> {
        self.push_pre_window(sample);

        if let Some(active) = &mut self.active {
            active.post_context.push(sample);
            if now - active.t >= POST_WINDOW_S {
                return Some(self.finalize_active());
            }
            return None;
        }

        if let Some((kind, magnitude)) = self.detect_kind(motion_magnitude, gyro_z, sample.gps_speed) {
            if self.eligible(kind, now) {
                self.last_trigger_t[kind_index(kind)] = now;
                self.active = Some(ActiveIncident {
                    kind,
                    t: now,
                    peak_magnitude: magnitude,
                    pre_context: self.pre_window.iter().cloned().collect(),
                    post_context: Vec::new(),
                    gps_speed_at_event: sample.gps_speed,
                    latitude: None,
                    longitude: None,
                });
            }
        }
        None
    }

    /// Record the latest known position so it can be attached to the next
    /// triggered incident.
    pub fn note_position(&mut self, lat: f64, lon: f64) {
        if let Some(active) = &mut self.active {
            active.latitude = Some(lat);
            active.longitude = Some(lon);
        }
    }

    /// Close an in-flight incident with whatever context it has collected
    /// so far. Section 9's Open Question decision: `stop()` does not wait
    /// for the post-window to fill; it closes with what it has and the
    /// record is annotated by its `post_context.len()` being short of a
    /// full window.
    pub fn force_close(&mut self) -> Option<IncidentRecord> {
        if self.active.is_some() {
            Some(self.finalize_active())
        } else {
            None
        }
    }

    fn finalize_active(&mut self) -> IncidentRecord {
        let active = self.active.take().expect("finalize_active called with no active incident");
        let id = format!("{}_{}", active.kind.as_str(), self.next_id);
        self.next_id += 1;
        IncidentRecord {
            id,
            kind: active.kind,
            t: active.t,
            peak_magnitude: active.peak_magnitude,
            pre_context: active.pre_context,
            post_context: active.post_context,
            gps_speed_at_event: active.gps_speed_at_event,
            latitude: active.latitude,
            longitude: active.longitude,
            saved_at: active.t + POST_WINDOW_S,
        }
    }
}

impl Default for IncidentDetector {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(t: f64, accel_mag: f64, gyro_z: f64, gps_speed: Option<f64>) -> ContextSample {
        ContextSample { t, accel_magnitude: accel_mag, gyro_z, gps_speed }
    }

    #[test]
    fn p13_swerve_is_gated_by_speed() {
        let mut d = IncidentDetector::new();
        // Low speed: gated out entirely.
        assert!(d.on_sample(ctx(0.0, 0.0, 1.2, Some(0.5)), 0.0, 1.2, 0.0).is_none());
        assert!(d.active.is_none());

        // High speed: triggers.
        let mut d = IncidentDetector::new();
        d.on_sample(ctx(0.0, 0.0, 1.2, Some(3.0)), 0.0, 1.2, 0.0);
        assert!(d.active.is_some());
    }

    #[test]
    fn swerve_cooldown_prevents_duplicate_within_5s() {
        let mut d = IncidentDetector::new();
        d.on_sample(ctx(0.0, 0.0, 1.2, Some(3.0)), 0.0, 1.2, 0.0);
        d.force_close();
        // Still within cooldown.
        d.on_sample(ctx(1.0, 0.0, 1.2, Some(3.0)), 0.0, 1.2, 1.0);
        assert!(d.active.is_none());
        // Cooldown elapsed.
        d.on_sample(ctx(6.0, 0.0, 1.2, Some(3.0)), 0.0, 1.2, 6.0);
        assert!(d.active.is_some());
    }

    #[test]
    fn hard_brake_requires_motion_gate() {
        let mut d = IncidentDetector::new();
        assert!(d.on_sample(ctx(0.0, 9.0, 0.0, Some(0.5)), 9.0, 0.0, 0.0).is_none());
        assert!(d.active.is_none());

        d.on_sample(ctx(1.0, 9.0, 0.0, Some(5.0)), 9.0, 0.0, 1.0);
        assert!(d.active.is_some());
    }

    #[test]
    fn impact_has_no_motion_gate() {
        let mut d = IncidentDetector::new();
        d.on_sample(ctx(0.0, 15.0, 0.0, None), 15.0, 0.0, 0.0);
        assert!(d.active.is_some());
    }

    #[test]
    fn post_window_completes_and_emits_record() {
        let mut d = IncidentDetector::new();
        d.on_sample(ctx(0.0, 15.0, 0.0, None), 15.0, 0.0, 0.0);
        assert!(d.active.is_some());
        let record = d.on_sample(ctx(30.0, 0.0, 0.0, None), 0.0, 0.0, 30.0);
        assert!(record.is_some());
        let record = record.unwrap();
        assert_eq!(record.kind, IncidentKind::Impact);
        assert!(!record.post_context.is_empty());
    }

    #[test]
    fn force_close_finishes_with_partial_post_context() {
        let mut d = IncidentDetector::new();
        d.on_sample(ctx(0.0, 15.0, 0.0, None), 15.0, 0.0, 0.0);
        let record = d.force_close().unwrap();
        assert!(record.post_context.is_empty());
        assert!(d.force_close().is_none());
    }
}
