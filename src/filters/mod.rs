//! The three fusion estimators named in section 4: complementary (C5),
//! full EKF (C6), error-state EKF (C7). The donor also carried a 15-state
//! EKF/UKF pair and a factor-graph optimizer; section 1 names exactly
//! these three, so the rest were dropped rather than generalized.

pub mod complementary;
pub mod ekf;
pub mod es_ekf;
