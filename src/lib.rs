//! Sensor-fusion and incident-logging pipeline core.
//!
//! See `session` for the coordinator (C12) that wires every other module
//! together; the binary entry point is `main.rs`, which only parses the
//! CLI surface and hands off to `session::run`.

pub mod calibration;
pub mod daemon;
pub mod error;
pub mod fanout;
pub mod filter_worker;
pub mod filters;
pub mod geo;
pub mod health_monitor;
pub mod incident;
pub mod live_status;
pub mod persistence;
pub mod rotation;
pub mod session;
pub mod types;
