//! Full 13-state extended Kalman filter (C6): position, velocity,
//! attitude quaternion, gyro bias.
//!
//! The donor's `Ekf13d` (`filters/ekf_13d.rs`) carried this exact state
//! layout but ran it in "shadow mode": `predict()` propagated the mean only
//! and left the comment "Simplified: P += Q (full F matrix omitted for
//! shadow mode)", and `update_gyro()` was a literal no-op. Section 4.6 asks
//! for the real thing: a full state-transition Jacobian, a Joseph-form
//! covariance update, and a gyro bias pseudo-measurement. The state layout,
//! `rotate_body_to_world`, and `default_covariance` below are kept from the
//! donor; everything involving `F` and `K` is new.

use crate::error::FilterError;
use crate::types::{GpsPosNoise, GpsPosVec, StateMat13, StateVec13};
use nalgebra::{Matrix3, Matrix3x4, Matrix4, Vector3, Vector4};

// Tuning defaults per section 4.6.
pub const SIGMA_GPS_POS: f64 = 8.0;
pub const SIGMA_ACCEL_PROCESS: f64 = 0.3;
pub const SIGMA_GYRO: f64 = 5e-4;
pub const SIGMA_BIAS_RW: f64 = 3e-4;
const GYRO_BIAS_BOUND: f64 = 0.1;
const GRAVITY_MS2: f64 = 9.81;
const DIVERGENCE_TRACE_LIMIT: f64 = 1.0e6;

const I_POS: usize = 0;
const I_VEL: usize = 3;
const I_QUAT: usize = 6;
const I_BIAS: usize = 10;

#[derive(Clone, Copy, Debug)]
pub struct Ekf13dState {
    pub x: StateVec13,
    pub p: StateMat13,
}

impl Ekf13dState {
    pub fn position(&self) -> Vector3<f64> {
        self.x.fixed_rows::<3>(I_POS).into_owned()
    }

    pub fn velocity(&self) -> Vector3<f64> {
        self.x.fixed_rows::<3>(I_VEL).into_owned()
    }

    pub fn quaternion(&self) -> Vector4<f64> {
        self.x.fixed_rows::<4>(I_QUAT).into_owned()
    }

    pub fn gyro_bias(&self) -> Vector3<f64> {
        self.x.fixed_rows::<3>(I_BIAS).into_owned()
    }

    pub fn quaternion_norm(&self) -> f64 {
        self.quaternion().norm()
    }
}

/// Default covariance: generous uncertainty on position/velocity/bias,
/// tight on attitude since the initial quaternion is usually close to
/// identity (phone resting flat).
fn default_covariance() -> StateMat13 {
    let mut p = StateMat13::zeros();
    for i in I_POS..I_POS + 3 {
        p[(i, i)] = 25.0;
    }
    for i in I_VEL..I_VEL + 3 {
        p[(i, i)] = 4.0;
    }
    for i in I_QUAT..I_QUAT + 4 {
        p[(i, i)] = 0.01;
    }
    for i in I_BIAS..I_BIAS + 3 {
        p[(i, i)] = 0.001;
    }
    p
}

fn normalize_quat(mut x: StateVec13) -> StateVec13 {
    let q = x.fixed_rows::<4>(I_QUAT).into_owned();
    let n = q.norm();
    if n > 1e-9 {
        x.fixed_rows_mut::<4>(I_QUAT).copy_from(&(q / n));
    }
    x
}

fn skew(v: Vector3<f64>) -> Matrix3<f64> {
    Matrix3::new(0.0, -v.z, v.y, v.z, 0.0, -v.x, -v.y, v.x, 0.0)
}

/// Rotation matrix from a body->world unit quaternion `[qw, qx, qy, qz]`.
pub fn rotate_body_to_world(q: Vector4<f64>, v: Vector3<f64>) -> Vector3<f64> {
    let (qw, qv) = (q[0], Vector3::new(q[1], q[2], q[3]));
    v + 2.0 * qw * qv.cross(&v) + 2.0 * qv.cross(&qv.cross(&v))
}

/// Analytic Jacobian of `rotate_body_to_world(q, v)` w.r.t. `q`, a 3x4
/// matrix, following the standard quaternion-rotation partials (Sola,
/// "Quaternion kinematics for the error-state Kalman filter", eq. 161-162).
fn drotate_dq(q: Vector4<f64>, v: Vector3<f64>) -> Matrix3x4<f64> {
    let (qw, qv) = (q[0], Vector3::new(q[1], q[2], q[3]));
    let dqw = 2.0 * qw * v + 2.0 * qv.cross(&v);
    let dqv = 2.0 * qv.dot(&v) * Matrix3::identity() + 2.0 * qv * v.transpose()
        - 2.0 * v * qv.transpose()
        - 2.0 * qw * skew(v);
    let mut out = Matrix3x4::zeros();
    out.fixed_columns_mut::<1>(0).copy_from(&dqw);
    out.fixed_columns_mut::<3>(1).copy_from(&dqv);
    out
}

/// The 4x4 quaternion-kinematics transition matrix for `q_dot = 0.5*Omega(w)*q`.
fn omega_matrix(w: Vector3<f64>) -> Matrix4<f64> {
    Matrix4::new(
        0.0, -w.x, -w.y, -w.z,
        w.x, 0.0, w.z, -w.y,
        w.y, -w.z, 0.0, w.x,
        w.z, w.y, -w.x, 0.0,
    )
}

/// `Xi(q)`, used for `dq_dot/d(omega) = 0.5*Xi(q)`.
fn xi_matrix(q: Vector4<f64>) -> nalgebra::Matrix4x3<f64> {
    let (qw, qx, qy, qz) = (q[0], q[1], q[2], q[3]);
    nalgebra::Matrix4x3::new(
        -qx, -qy, -qz,
        qw, -qz, qy,
        qz, qw, -qx,
        -qy, qx, qw,
    )
}

/// 13-state EKF: position, velocity, attitude quaternion, gyro bias.
pub struct Ekf13d {
    state: Ekf13dState,
    origin: Option<(f64, f64)>,
}

impl Ekf13d {
    pub fn new() -> Self {
        let mut x = StateVec13::zeros();
        x[I_QUAT] = 1.0; // identity quaternion
        Self {
            state: Ekf13dState { x, p: default_covariance() },
            origin: None,
        }
    }

    pub fn set_origin(&mut self, lat: f64, lon: f64) {
        self.origin = Some((lat, lon));
    }

    pub fn origin(&self) -> Option<(f64, f64)> {
        self.origin
    }

    pub fn set_initial_quaternion(&mut self, q: [f64; 4]) {
        self.state.x[I_QUAT] = q[0];
        self.state.x[I_QUAT + 1] = q[1];
        self.state.x[I_QUAT + 2] = q[2];
        self.state.x[I_QUAT + 3] = q[3];
        self.state.x = normalize_quat(self.state.x);
    }

    pub fn get_state(&self) -> &Ekf13dState {
        &self.state
    }

    /// Predict using one accel/gyro pair over `dt` seconds.
    pub fn predict(&mut self, accel_body: Vector3<f64>, gyro_meas: Vector3<f64>, dt: f64) -> Result<(), FilterError> {
        if dt <= 0.0 {
            return Ok(());
        }
        let q = self.state.quaternion();
        let bias = self.state.gyro_bias();
        let omega = gyro_meas - bias;

        let a_world = rotate_body_to_world(q, accel_body) - Vector3::new(0.0, 0.0, GRAVITY_MS2);
        let pos = self.state.position();
        let vel = self.state.velocity();

        let new_pos = pos + vel * dt + 0.5 * a_world * dt * dt;
        let new_vel = vel + a_world * dt;
        let q_dot = 0.5 * omega_matrix(omega) * q;
        let new_q = q + q_dot * dt;

        let mut x = self.state.x;
        x.fixed_rows_mut::<3>(I_POS).copy_from(&new_pos);
        x.fixed_rows_mut::<3>(I_VEL).copy_from(&new_vel);
        x.fixed_rows_mut::<4>(I_QUAT).copy_from(&new_q);
        let x = normalize_quat(x);

        let f = self.build_f(q, accel_body, omega, dt);
        let q_proc = self.build_process_noise(dt);
        let p = f * self.state.p * f.transpose() + q_proc;

        self.state.x = x;
        self.state.p = 0.5 * (p + p.transpose());

        self.check_divergence()
    }

    fn build_f(&self, q: Vector4<f64>, accel_body: Vector3<f64>, omega: Vector3<f64>, dt: f64) -> StateMat13 {
        let mut f = StateMat13::identity();

        // d(pos)/d(vel)
        for i in 0..3 {
            f[(I_POS + i, I_VEL + i)] = dt;
        }

        // d(vel)/d(q): d(a_world)/dq * dt
        let dadq = drotate_dq(q, accel_body);
        f.fixed_view_mut::<3, 4>(I_VEL, I_QUAT).copy_from(&(dadq * dt));

        // d(q)/d(q): first-order quaternion transition
        let dqdq = Matrix4::identity() + 0.5 * omega_matrix(omega) * dt;
        f.fixed_view_mut::<4, 4>(I_QUAT, I_QUAT).copy_from(&dqdq);

        // d(q)/d(bias): omega = gyro_meas - bias, so d(omega)/d(bias) = -I
        let dqdb = -0.5 * xi_matrix(q) * dt;
        f.fixed_view_mut::<4, 3>(I_QUAT, I_BIAS).copy_from(&dqdb);

        f
    }

    fn build_process_noise(&self, dt: f64) -> StateMat13 {
        let mut q = StateMat13::zeros();
        let accel_var = (SIGMA_ACCEL_PROCESS * dt).powi(2);
        for i in I_VEL..I_VEL + 3 {
            q[(i, i)] = accel_var;
        }
        let gyro_var = (SIGMA_GYRO * dt).powi(2);
        for i in I_QUAT..I_QUAT + 4 {
            q[(i, i)] = gyro_var;
        }
        let bias_var = (SIGMA_BIAS_RW * dt.sqrt()).powi(2);
        for i in I_BIAS..I_BIAS + 3 {
            q[(i, i)] = bias_var;
        }
        q
    }

    /// GPS position update, full Joseph-form covariance update (not the
    /// donor's 2x2-only `invert_2x2` shortcut).
    pub fn update_gps(&mut self, lat: f64, lon: f64, accuracy: f64) -> Result<(), FilterError> {
        let origin = match self.origin {
            Some(o) => o,
            None => {
                self.origin = Some((lat, lon));
                return Ok(());
            }
        };
        let (east, north) = crate::geo::latlon_to_meters(lat, lon, origin.0, origin.1);
        let z = GpsPosVec::new(east, north);

        let mut h = nalgebra::SMatrix::<f64, 2, 13>::zeros();
        h[(0, I_POS)] = 1.0;
        h[(1, I_POS + 1)] = 1.0;

        let r_std = accuracy.max(1.0).min(SIGMA_GPS_POS * 3.0);
        let r = GpsPosNoise::from_diagonal(&GpsPosVec::new(r_std * r_std, r_std * r_std));

        let pos = self.state.position();
        let y = z - GpsPosVec::new(pos.x, pos.y);
        let s = h * self.state.p * h.transpose() + r;
        let s_inv = match s.try_inverse() {
            Some(inv) => inv,
            None => return Ok(()),
        };
        let k = self.state.p * h.transpose() * s_inv;

        self.state.x += k * y;
        self.state.x = normalize_quat(self.state.x);

        let i = StateMat13::identity();
        let ikh = i - k * h;
        self.state.p = ikh * self.state.p * ikh.transpose() + k * r * k.transpose();
        self.state.p = 0.5 * (self.state.p + self.state.p.transpose());

        self.check_divergence()
    }

    /// Zero-motion pseudo-measurement on the gyro bias: when the rotation
    /// detector reports stationary, the true angular rate is zero, so the
    /// measured rate is pure bias. This is the update the donor's
    /// `update_gyro()` left as a no-op.
    pub fn update_gyro_bias_pseudo_measurement(&mut self, gyro_meas: Vector3<f64>, r_std: f64) -> Result<(), FilterError> {
        let mut h = nalgebra::SMatrix::<f64, 3, 13>::zeros();
        for i in 0..3 {
            h[(i, I_BIAS + i)] = 1.0;
        }
        let r = Matrix3::from_diagonal(&Vector3::new(r_std * r_std, r_std * r_std, r_std * r_std));

        let bias = self.state.gyro_bias();
        let y = gyro_meas - bias;
        let s = h * self.state.p * h.transpose() + r;
        let s_inv = match s.try_inverse() {
            Some(inv) => inv,
            None => return Ok(()),
        };
        let k = self.state.p * h.transpose() * s_inv;

        self.state.x += k * y;
        self.state.x = normalize_quat(self.state.x);
        self.bound_gyro_bias();

        let i = StateMat13::identity();
        let ikh = i - k * h;
        self.state.p = ikh * self.state.p * ikh.transpose() + k * r * k.transpose();
        self.state.p = 0.5 * (self.state.p + self.state.p.transpose());

        self.check_divergence()
    }

    fn bound_gyro_bias(&mut self) {
        for i in I_BIAS..I_BIAS + 3 {
            self.state.x[i] = self.state.x[i].clamp(-GYRO_BIAS_BOUND, GYRO_BIAS_BOUND);
        }
    }

    fn check_divergence(&mut self) -> Result<(), FilterError> {
        if !self.state.x.iter().all(|v| v.is_finite()) || !self.state.p.iter().all(|v| v.is_finite()) {
            self.reset();
            return Err(FilterError::NonFinite);
        }
        let trace = self.state.p.trace();
        if trace > DIVERGENCE_TRACE_LIMIT {
            self.reset();
            return Err(FilterError::Diverged { trace });
        }
        Ok(())
    }

    /// Reset covariance to the default prior, keeping the mean (position and
    /// attitude are still the best available estimate; only confidence was
    /// lost).
    fn reset(&mut self) {
        self.state.p = default_covariance();
    }
}

impl Default for Ekf13d {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn predict_keeps_quaternion_normalized() {
        let mut ekf = Ekf13d::new();
        for _ in 0..200 {
            ekf.predict(Vector3::new(0.1, 0.0, 9.81), Vector3::new(0.01, 0.02, 0.0), 0.02)
                .unwrap();
        }
        assert!((ekf.get_state().quaternion_norm() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn stationary_accel_produces_no_drift_in_velocity() {
        let mut ekf = Ekf13d::new();
        for _ in 0..100 {
            ekf.predict(Vector3::new(0.0, 0.0, 9.81), Vector3::zeros(), 0.02).unwrap();
        }
        assert!(ekf.get_state().velocity().norm() < 1e-6);
    }

    #[test]
    fn gps_update_pulls_position_toward_fix() {
        let mut ekf = Ekf13d::new();
        ekf.set_origin(37.0, -122.0);
        ekf.update_gps(37.0, -122.0, 5.0).unwrap();
        ekf.update_gps(37.001, -122.0, 5.0).unwrap();
        assert!(ekf.get_state().position().y > 0.0);
    }

    #[test]
    fn gyro_bias_pseudo_measurement_is_bounded() {
        let mut ekf = Ekf13d::new();
        for _ in 0..50 {
            ekf.update_gyro_bias_pseudo_measurement(Vector3::new(5.0, 0.0, 0.0), 0.01).unwrap();
        }
        assert!(ekf.get_state().gyro_bias().x <= GYRO_BIAS_BOUND + 1e-9);
    }

    #[test]
    fn covariance_stays_symmetric_after_updates() {
        let mut ekf = Ekf13d::new();
        ekf.set_origin(37.0, -122.0);
        ekf.predict(Vector3::new(0.0, 0.0, 9.81), Vector3::zeros(), 0.02).unwrap();
        ekf.update_gps(37.0001, -122.0001, 5.0).unwrap();
        let p = ekf.get_state().p;
        assert!((p - p.transpose()).abs().max() < 1e-8);
    }
}
