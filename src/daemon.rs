//! Sensor daemon (C1): owns one long-lived sensor subprocess, reassembles
//! its streaming brace-delimited JSON output, and exposes a bounded queue
//! of typed samples.
//!
//! Two concrete daemons exist because the accelerometer and gyroscope
//! share a single IMU subprocess and stream (section 1, section 6), while
//! GPS is its own subprocess: `ImuDaemon` demultiplexes one reader task
//! into two output queues; `GpsDaemon` has one queue. Both share the
//! subprocess spawn/reassembly/stop machinery below.
//!
//! CRITICAL DESIGN RULE: `last_sample_t()` only reads an atomic; it never
//! touches the output queue. The production bug this avoids: if liveness
//! checks drained the same queue the filter worker polls, the health
//! monitor would race the real consumer and could observe false silence
//! or steal a sample meant for fusion.

use crate::error::DaemonError;
use crate::types::BoundedDeque;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;

/// Grace period after spawn within which an immediate exit is treated as
/// a start failure rather than a transient daemon death.
const START_GRACE: Duration = Duration::from_millis(300);

/// Safety valve: if a record hasn't balanced its braces within this many
/// bytes, the buffer is malformed and is discarded rather than growing
/// without bound.
const MAX_RECORD_BYTES: usize = 16_384;

const SIGTERM_GRACE: Duration = Duration::from_secs(1);

fn case_insensitive_contains(haystack: &str, needle: &str) -> bool {
    haystack.to_ascii_lowercase().contains(needle)
}

/// Spawn `command` with `args`, verifying it survives the start grace
/// period. Returns the child's pid alongside the child itself so the pid
/// can be retained for signaling after the child is moved into a reader
/// task.
async fn spawn_checked(name: &str, command: &str, args: &[String]) -> Result<Child, DaemonError> {
    let mut child = Command::new(command)
        .args(args)
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .map_err(|e| DaemonError::StartFailed {
            name: name.to_string(),
            reason: e.to_string(),
        })?;

    tokio::time::sleep(START_GRACE).await;
    if let Ok(Some(status)) = child.try_wait() {
        return Err(DaemonError::StartFailed {
            name: name.to_string(),
            reason: format!("exited immediately with {status}"),
        });
    }
    Ok(child)
}

#[cfg(unix)]
fn send_sigterm(pid: u32) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;
    let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
}

#[cfg(not(unix))]
fn send_sigterm(_pid: u32) {}

/// Stop a running child: SIGTERM, wait up to `SIGTERM_GRACE`, SIGKILL if
/// it hasn't exited by then.
async fn stop_child(mut child: Child) {
    if let Some(pid) = child.id() {
        send_sigterm(pid);
    }
    let waited = tokio::time::timeout(SIGTERM_GRACE, child.wait()).await;
    if waited.is_err() {
        let _ = child.start_kill();
        let _ = child.wait().await;
    }
}

/// Reassembles a byte stream into brace-delimited JSON records. Tracks
/// brace depth (not line boundaries) so multi-line records are handled.
struct RecordReassembler {
    buf: Vec<u8>,
    depth: i32,
}

impl RecordReassembler {
    fn new() -> Self {
        Self {
            buf: Vec::new(),
            depth: 0,
        }
    }

    /// Feed one byte; returns `Some(record)` when a complete, balanced
    /// JSON object has been accumulated.
    fn feed(&mut self, byte: u8) -> Option<String> {
        if self.depth == 0 && byte != b'{' {
            // Not yet inside a record; ignore stray whitespace/newlines.
            return None;
        }
        self.buf.push(byte);
        match byte {
            b'{' => self.depth += 1,
            b'}' => self.depth -= 1,
            _ => {}
        }
        if self.depth == 0 && !self.buf.is_empty() {
            let record = String::from_utf8_lossy(&self.buf).into_owned();
            self.buf.clear();
            return Some(record);
        }
        if self.buf.len() > MAX_RECORD_BYTES {
            self.buf.clear();
            self.depth = 0;
        }
        None
    }
}

/// Parsed accelerometer or gyroscope payload extracted from one IMU
/// record, tagged by which sensor it belongs to.
enum ImuPayload {
    Accel { x: f64, y: f64, z: f64 },
    Gyro { x: f64, y: f64, z: f64 },
}

/// Scan a JSON object's top-level keys for one matching `accel`/`gyro`
/// (case-insensitive) with a `values: [x, y, z]` array. Returns every
/// payload found, since a record may carry both in the same line.
fn parse_imu_record(text: &str) -> Result<Vec<ImuPayload>, DaemonError> {
    let v: serde_json::Value =
        serde_json::from_str(text).map_err(|e| DaemonError::Malformed(e.to_string()))?;
    let obj = v
        .as_object()
        .ok_or_else(|| DaemonError::Malformed("record is not a JSON object".into()))?;

    let mut out = Vec::new();
    for (key, value) in obj {
        let values = value
            .get("values")
            .and_then(|v| v.as_array())
            .or_else(|| value.as_array());
        let Some(values) = values else { continue };
        if values.len() < 3 {
            continue;
        }
        let x = values[0].as_f64().unwrap_or(0.0);
        let y = values[1].as_f64().unwrap_or(0.0);
        let z = values[2].as_f64().unwrap_or(0.0);

        if case_insensitive_contains(key, "accel") {
            out.push(ImuPayload::Accel { x, y, z });
        } else if case_insensitive_contains(key, "gyro") {
            out.push(ImuPayload::Gyro { x, y, z });
        }
    }
    if out.is_empty() {
        return Err(DaemonError::Malformed(
            "no accel/gyro key recognized in record".into(),
        ));
    }
    Ok(out)
}

fn parse_gps_record(text: &str) -> Result<(f64, f64, f64, f64, f64, f64), DaemonError> {
    let v: serde_json::Value =
        serde_json::from_str(text).map_err(|e| DaemonError::Malformed(e.to_string()))?;
    let get = |k: &str| v.get(k).and_then(|x| x.as_f64());
    let latitude = get("latitude").ok_or_else(|| DaemonError::Malformed("missing latitude".into()))?;
    let longitude =
        get("longitude").ok_or_else(|| DaemonError::Malformed("missing longitude".into()))?;
    let altitude = get("altitude").unwrap_or(0.0);
    let accuracy = get("accuracy").unwrap_or(50.0);
    let speed = get("speed").unwrap_or(0.0);
    let bearing = get("bearing").unwrap_or(0.0);
    Ok((latitude, longitude, altitude, accuracy, speed, bearing))
}

/// Monotonic session clock: `now()` returns seconds since the clock was
/// created. Shared by every component so samples share one timebase
/// (DESIGN NOTES, "session clock" open question: monotonic from session
/// start, never wall time, by decision — see DESIGN.md).
#[derive(Clone)]
pub struct SessionClock {
    start: std::time::Instant,
}

impl SessionClock {
    pub fn new() -> Self {
        Self {
            start: std::time::Instant::now(),
        }
    }

    pub fn now(&self) -> f64 {
        self.start.elapsed().as_secs_f64()
    }
}

impl Default for SessionClock {
    fn default() -> Self {
        Self::new()
    }
}

/// Common liveness/queue handle shared by `ImuDaemon` and `GpsDaemon`.
struct DaemonCore {
    last_sample_t: Arc<AtomicU64>,
    malformed_count: Arc<AtomicU64>,
    stop_signal: Arc<AtomicBool>,
}

impl DaemonCore {
    fn new() -> Self {
        Self {
            last_sample_t: Arc::new(AtomicU64::new(0)),
            malformed_count: Arc::new(AtomicU64::new(0)),
            stop_signal: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Observation-only: reads the atomic, never the queue.
    fn last_sample_t(&self) -> f64 {
        f64::from_bits(self.last_sample_t.load(Ordering::Relaxed))
    }
}

pub struct ImuDaemon {
    core: DaemonCore,
    accel_queue: Arc<Mutex<BoundedDeque<crate::types::AccelSample>>>,
    gyro_queue: Arc<Mutex<BoundedDeque<crate::types::GyroSample>>>,
    reader_handle: Option<tokio::task::JoinHandle<()>>,
    pid: Option<u32>,
}

impl ImuDaemon {
    pub async fn start(
        command: &str,
        args: &[String],
        capacity: usize,
        clock: SessionClock,
    ) -> Result<Self, DaemonError> {
        let child = spawn_checked("imu", command, args).await?;
        let pid = child.id();
        let core = DaemonCore::new();
        let accel_queue = Arc::new(Mutex::new(BoundedDeque::new(capacity)));
        let gyro_queue = Arc::new(Mutex::new(BoundedDeque::new(capacity)));

        let stop_signal = core.stop_signal.clone();
        let last_sample_t = core.last_sample_t.clone();
        let malformed_count = core.malformed_count.clone();
        let accel_q = accel_queue.clone();
        let gyro_q = gyro_queue.clone();

        let reader_handle = tokio::spawn(async move {
            let mut child = child;
            let Some(stdout) = child.stdout.take() else {
                return;
            };
            let mut reader = BufReader::new(stdout);
            let mut reassembler = RecordReassembler::new();
            let mut byte = [0u8; 1];
            loop {
                if stop_signal.load(Ordering::Relaxed) {
                    break;
                }
                match reader.read(&mut byte).await {
                    Ok(0) => break, // EOF: subprocess exited.
                    Ok(_) => {
                        if let Some(record) = reassembler.feed(byte[0]) {
                            let now = clock.now();
                            match parse_imu_record(&record) {
                                Ok(payloads) => {
                                    for payload in payloads {
                                        match payload {
                                            ImuPayload::Accel { x, y, z } => {
                                                accel_q.lock().await.push(
                                                    crate::types::AccelSample { t: now, x, y, z },
                                                );
                                            }
                                            ImuPayload::Gyro { x, y, z } => {
                                                gyro_q.lock().await.push(
                                                    crate::types::GyroSample { t: now, x, y, z },
                                                );
                                            }
                                        }
                                    }
                                    last_sample_t.store(now.to_bits(), Ordering::Relaxed);
                                }
                                Err(_) => {
                                    malformed_count.fetch_add(1, Ordering::Relaxed);
                                }
                            }
                        }
                    }
                    Err(_) => break,
                }
            }
        });

        Ok(Self {
            core,
            accel_queue,
            gyro_queue,
            reader_handle: Some(reader_handle),
            pid,
        })
    }

    pub fn last_sample_t(&self) -> f64 {
        self.core.last_sample_t()
    }

    pub fn malformed_count(&self) -> u64 {
        self.core.malformed_count.load(Ordering::Relaxed)
    }

    pub async fn try_pop_accel(&self) -> Option<crate::types::AccelSample> {
        self.accel_queue.lock().await.pop()
    }

    pub async fn try_pop_gyro(&self) -> Option<crate::types::GyroSample> {
        self.gyro_queue.lock().await.pop()
    }

    pub async fn accel_drop_count(&self) -> u64 {
        self.accel_queue.lock().await.dropped()
    }

    pub async fn gyro_drop_count(&self) -> u64 {
        self.gyro_queue.lock().await.dropped()
    }

    pub async fn stop(mut self) {
        self.core.stop_signal.store(true, Ordering::Relaxed);
        if let Some(pid) = self.pid {
            send_sigterm(pid);
        }
        if let Some(handle) = self.reader_handle.take() {
            let _ = tokio::time::timeout(SIGTERM_GRACE + Duration::from_millis(200), handle).await;
        }
    }
}

pub struct GpsDaemon {
    core: DaemonCore,
    queue: Arc<Mutex<BoundedDeque<crate::types::GpsFix>>>,
    reader_handle: Option<tokio::task::JoinHandle<()>>,
    pid: Option<u32>,
}

impl GpsDaemon {
    pub async fn start(
        command: &str,
        args: &[String],
        capacity: usize,
        clock: SessionClock,
    ) -> Result<Self, DaemonError> {
        let child = spawn_checked("gps", command, args).await?;
        let pid = child.id();
        let core = DaemonCore::new();
        let queue = Arc::new(Mutex::new(BoundedDeque::new(capacity)));

        let stop_signal = core.stop_signal.clone();
        let last_sample_t = core.last_sample_t.clone();
        let malformed_count = core.malformed_count.clone();
        let q = queue.clone();

        let reader_handle = tokio::spawn(async move {
            let mut child = child;
            let Some(stdout) = child.stdout.take() else {
                return;
            };
            let mut reader = BufReader::new(stdout);
            let mut reassembler = RecordReassembler::new();
            let mut byte = [0u8; 1];
            loop {
                if stop_signal.load(Ordering::Relaxed) {
                    break;
                }
                match reader.read(&mut byte).await {
                    Ok(0) => break,
                    Ok(_) => {
                        if let Some(record) = reassembler.feed(byte[0]) {
                            let now = clock.now();
                            match parse_gps_record(&record) {
                                Ok((latitude, longitude, altitude, accuracy, speed, bearing)) => {
                                    q.lock().await.push(crate::types::GpsFix {
                                        t: now,
                                        latitude,
                                        longitude,
                                        altitude,
                                        accuracy,
                                        speed,
                                        bearing,
                                        provider: crate::types::GpsProvider::Gps,
                                    });
                                    last_sample_t.store(now.to_bits(), Ordering::Relaxed);
                                }
                                Err(_) => {
                                    malformed_count.fetch_add(1, Ordering::Relaxed);
                                }
                            }
                        }
                    }
                    Err(_) => break,
                }
            }
        });

        Ok(Self {
            core,
            queue,
            reader_handle: Some(reader_handle),
            pid,
        })
    }

    pub fn last_sample_t(&self) -> f64 {
        self.core.last_sample_t()
    }

    pub async fn try_pop(&self) -> Option<crate::types::GpsFix> {
        self.queue.lock().await.pop()
    }

    pub async fn drop_count(&self) -> u64 {
        self.queue.lock().await.dropped()
    }

    pub async fn stop(mut self) {
        self.core.stop_signal.store(true, Ordering::Relaxed);
        if let Some(pid) = self.pid {
            send_sigterm(pid);
        }
        if let Some(handle) = self.reader_handle.take() {
            let _ = tokio::time::timeout(SIGTERM_GRACE + Duration::from_millis(200), handle).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reassembler_handles_multiline_record() {
        let mut r = RecordReassembler::new();
        let text = "{\n  \"Accelerometer\": {\"values\": [0.1, 0.2, 9.8]}\n}\n";
        let mut got = None;
        for b in text.bytes() {
            if let Some(rec) = r.feed(b) {
                got = Some(rec);
            }
        }
        assert!(got.is_some());
        assert!(parse_imu_record(&got.unwrap()).is_ok());
    }

    #[test]
    fn reassembler_safety_valve_resets_on_unbalanced_input() {
        let mut r = RecordReassembler::new();
        for _ in 0..(MAX_RECORD_BYTES + 10) {
            assert!(r.feed(b'{').is_none());
        }
        assert_eq!(r.depth, 0);
        assert!(r.buf.is_empty());
    }

    #[test]
    fn case_insensitive_sensor_key_matching() {
        let text = r#"{"ACCELEROMETER": {"values": [0.0, 0.0, 9.81]}}"#;
        let payloads = parse_imu_record(text).expect("should parse");
        assert_eq!(payloads.len(), 1);
        assert!(matches!(payloads[0], ImuPayload::Accel { .. }));
    }

    #[test]
    fn malformed_record_is_rejected() {
        let text = r#"{"Magnetometer": {"values": [1.0, 2.0, 3.0]}}"#;
        assert!(parse_imu_record(text).is_err());
    }

    #[test]
    fn gps_record_parses_expected_fields() {
        let text = r#"{"latitude": 37.7749, "longitude": -122.4194, "accuracy": 5.0, "speed": 1.2, "bearing": 90.0}"#;
        let (lat, lon, _alt, acc, speed, bearing) = parse_gps_record(text).unwrap();
        assert!((lat - 37.7749).abs() < 1e-9);
        assert!((lon + 122.4194).abs() < 1e-9);
        assert!((acc - 5.0).abs() < 1e-9);
        assert!((speed - 1.2).abs() < 1e-9);
        assert!((bearing - 90.0).abs() < 1e-9);
    }
}
