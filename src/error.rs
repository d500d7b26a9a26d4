//! Typed error taxonomy for the pipeline's components.
//!
//! Replaces the bare `except: pass` / boolean-return control flow the
//! source used to hide a documented daemon-liveness race: every fallible
//! operation here returns a specific variant instead of `Option<T>` or a
//! swallowed exception.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("sensor daemon '{name}' failed to start: {reason}")]
    StartFailed { name: String, reason: String },
    #[error("queue empty")]
    Empty,
    #[error("record malformed: {0}")]
    Malformed(String),
    #[error("subprocess exited")]
    SubprocessExited,
}

#[derive(Debug, Error)]
pub enum FilterError {
    #[error("filter state contains a non-finite value")]
    NonFinite,
    #[error("covariance diverged: trace = {trace}")]
    Diverged { trace: f64 },
}

#[derive(Debug, Error)]
pub enum PersistError {
    #[error("io error writing {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("serialize error: {0}")]
    Serialize(#[from] serde_json::Error),
}
