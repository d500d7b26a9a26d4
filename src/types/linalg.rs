//! Linear algebra type aliases for the Kalman filter implementations.
//!
//! Compile-time-dimensioned vector/matrix types for the parts of the
//! pipeline that work with small fixed-size quantities (quaternions,
//! 3-vectors). The EKF's 13-state and the ES-EKF's 9-dim error state are
//! each a fixed compile-time size, so both use `nalgebra`'s `SVector`/
//! `SMatrix` fixed-size types directly (see `filters::ekf`,
//! `filters::es_ekf`) rather than a runtime-dimensioned array type.

use nalgebra::{SMatrix, SVector};

pub const STATE_DIM_13: usize = 13;
pub const ERROR_STATE_DIM: usize = 9;

pub type StateVec13 = SVector<f64, STATE_DIM_13>;
pub type StateMat13 = SMatrix<f64, STATE_DIM_13, STATE_DIM_13>;

pub type ErrorStateVec = SVector<f64, ERROR_STATE_DIM>;
pub type ErrorStateMat = SMatrix<f64, ERROR_STATE_DIM, ERROR_STATE_DIM>;

pub const MEASURE_DIM_GPS_POS: usize = 2;
pub type GpsPosVec = SVector<f64, MEASURE_DIM_GPS_POS>;
pub type GpsPosNoise = SMatrix<f64, MEASURE_DIM_GPS_POS, MEASURE_DIM_GPS_POS>;
