//! Health monitor (C11): periodic liveness checks per sensor stream,
//! exponential-backoff restart of dead daemons, circuit-open once a
//! sensor has exhausted its restart budget.
//!
//! The donor split this concern across two files: `health_monitor.rs`
//! (silence detection, never actually restarting anything) and
//! `restart_manager.rs` (a 1.5x-backoff-capped-at-30s circuit breaker that
//! nothing wired to the first file). Section 4.11 asks for one component
//! that does both with a specific backoff sequence (`min(2^(n-1), 16s)`,
//! `MAX_ATTEMPTS = 10`); this file replaces both donor files and corrects
//! the backoff formula and cap accordingly. The accel and gyro streams
//! share one `ImuDaemon` subprocess (C1), so they share one restart
//! tracker here too — restarting the IMU daemon once recovers both.
//!
//! CRITICAL DESIGN RULE inherited from C1: every liveness check reads
//! `last_sample_t()`, never the sample queue itself.

use crate::daemon::{GpsDaemon, ImuDaemon, SessionClock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{RwLock, Semaphore};
use tokio::time::Duration;

pub const DEFAULT_CHECK_INTERVAL_S: u64 = 2;
const DEFAULT_SILENCE_THRESHOLD_S: f64 = 5.0;
const MAX_RESTART_ATTEMPTS: u32 = 10;
const MAX_BACKOFF_S: f64 = 16.0;
const RESTART_CONCURRENCY: usize = 2;
const POST_STOP_PAUSE: Duration = Duration::from_millis(500);

/// Pure restart-attempt bookkeeping: exponential backoff capped at 16s,
/// circuit-open once `MAX_RESTART_ATTEMPTS` is reached. Kept separate from
/// the async daemon-swap machinery below so the sequence itself (P10) is
/// unit-testable without spawning anything.
#[derive(Debug, Clone, Copy)]
pub struct RestartTracker {
    attempts: u32,
    circuit_open: bool,
}

impl RestartTracker {
    pub fn new() -> Self {
        Self { attempts: 0, circuit_open: false }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn is_circuit_open(&self) -> bool {
        self.circuit_open
    }

    pub fn can_restart(&self) -> bool {
        !self.circuit_open && self.attempts < MAX_RESTART_ATTEMPTS
    }

    /// Record one more restart attempt and return how long to wait before
    /// making it. Section 4.11 step 2: `backoff = min(2^(failures-1) s, 16
    /// s)`, using the post-increment attempt count as `failures`.
    pub fn record_attempt(&mut self) -> Duration {
        self.attempts += 1;
        if self.attempts >= MAX_RESTART_ATTEMPTS {
            self.circuit_open = true;
        }
        let secs = 2f64.powi(self.attempts as i32 - 1).min(MAX_BACKOFF_S);
        Duration::from_secs_f64(secs)
    }

    /// A restarted daemon producing a sample resets both the attempt
    /// counter and any tripped circuit (section 4.11 step 3).
    pub fn record_recovery(&mut self) {
        self.attempts = 0;
        self.circuit_open = false;
    }
}

impl Default for RestartTracker {
    fn default() -> Self {
        Self::new()
    }
}

struct RespawnSpec {
    command: String,
    args: Vec<String>,
    capacity: usize,
}

/// Monitors one sensor stream's liveness and drives its daemon-swap
/// restarts. Generic over which concrete daemon type it restarts via the
/// two inherent impls below (IMU, GPS) rather than a trait object, in
/// keeping with this crate's no-dynamic-dispatch convention.
pub struct SensorWatch<D> {
    pub name: &'static str,
    daemon: Arc<RwLock<Option<D>>>,
    tracker: std::sync::Mutex<RestartTracker>,
    spec: RespawnSpec,
    silence_threshold_s: f64,
}

impl ImuWatch {
    pub fn new(daemon: Arc<RwLock<Option<ImuDaemon>>>, command: &str, args: &[String], capacity: usize) -> Self {
        Self {
            name: "imu",
            daemon,
            tracker: std::sync::Mutex::new(RestartTracker::new()),
            spec: RespawnSpec { command: command.to_string(), args: args.to_vec(), capacity },
            silence_threshold_s: DEFAULT_SILENCE_THRESHOLD_S,
        }
    }

    /// `None` silence means "no daemon currently installed" (a restart is
    /// already in flight) rather than "healthy": the caller should skip
    /// this tick rather than alarm or restart again.
    async fn silence(&self, now: f64) -> Option<f64> {
        let guard = self.daemon.read().await;
        guard.as_ref().map(|d| now - d.last_sample_t())
    }

    async fn check(&self, now: f64, permits: &Arc<Semaphore>, clock: SessionClock) {
        let Some(silence) = self.silence(now).await else { return };
        if silence <= self.silence_threshold_s {
            return;
        }
        let should_restart = {
            let tracker = self.tracker.lock().unwrap();
            tracker.can_restart()
        };
        if !should_restart {
            let tracker = self.tracker.lock().unwrap();
            if tracker.is_circuit_open() {
                eprintln!("[HEALTH] {} circuit-open after {} attempts; no longer auto-restarting", self.name, tracker.attempts());
            }
            return;
        }

        let backoff = {
            let mut tracker = self.tracker.lock().unwrap();
            tracker.record_attempt()
        };
        eprintln!("[HEALTH] {} silent for {:.1}s, restarting in {:.1}s", self.name, silence, backoff.as_secs_f64());

        let daemon = self.daemon.clone();
        let permits = permits.clone();
        let command = self.spec.command.clone();
        let args = self.spec.args.clone();
        let capacity = self.spec.capacity;
        let name = self.name;
        tokio::spawn(async move {
            tokio::time::sleep(backoff).await;
            let Ok(_permit) = permits.acquire().await else { return };
            let old = daemon.write().await.take();
            if let Some(old) = old {
                old.stop().await;
            }
            tokio::time::sleep(POST_STOP_PAUSE).await;
            match ImuDaemon::start(&command, &args, capacity, clock).await {
                Ok(fresh) => {
                    *daemon.write().await = Some(fresh);
                    eprintln!("[HEALTH] {} restarted successfully", name);
                }
                Err(e) => {
                    eprintln!("[HEALTH] {} restart failed: {}", name, e);
                }
            }
        });
    }

    /// Called once per tick after `check`: if the daemon is present and has
    /// produced a sample since its last restart, clears the backoff state.
    async fn note_recovery_if_alive(&self, now: f64) {
        let silence = self.silence(now).await;
        let healthy = silence.map(|s| s <= self.silence_threshold_s).unwrap_or(false);
        if healthy {
            let mut tracker = self.tracker.lock().unwrap();
            if tracker.attempts() > 0 {
                tracker.record_recovery();
                eprintln!("[HEALTH] {} recovered", self.name);
            }
        }
    }

    pub fn attempts(&self) -> u32 {
        self.tracker.lock().unwrap().attempts()
    }

    pub fn is_circuit_open(&self) -> bool {
        self.tracker.lock().unwrap().is_circuit_open()
    }
}

pub type ImuWatch = SensorWatch<ImuDaemon>;
pub type GpsWatch = SensorWatch<GpsDaemon>;

impl GpsWatch {
    pub fn new(daemon: Arc<RwLock<Option<GpsDaemon>>>, command: &str, args: &[String], capacity: usize) -> Self {
        Self {
            name: "gps",
            daemon,
            tracker: std::sync::Mutex::new(RestartTracker::new()),
            spec: RespawnSpec { command: command.to_string(), args: args.to_vec(), capacity },
            silence_threshold_s: DEFAULT_SILENCE_THRESHOLD_S,
        }
    }

    async fn silence(&self, now: f64) -> Option<f64> {
        let guard = self.daemon.read().await;
        guard.as_ref().map(|d| now - d.last_sample_t())
    }

    async fn check(&self, now: f64, permits: &Arc<Semaphore>, clock: SessionClock) {
        let Some(silence) = self.silence(now).await else { return };
        if silence <= self.silence_threshold_s {
            return;
        }
        let should_restart = self.tracker.lock().unwrap().can_restart();
        if !should_restart {
            let tracker = self.tracker.lock().unwrap();
            if tracker.is_circuit_open() {
                eprintln!("[HEALTH] gps circuit-open after {} attempts; no longer auto-restarting", tracker.attempts());
            }
            return;
        }

        let backoff = self.tracker.lock().unwrap().record_attempt();
        eprintln!("[HEALTH] gps silent for {:.1}s, restarting in {:.1}s", silence, backoff.as_secs_f64());

        let daemon = self.daemon.clone();
        let permits = permits.clone();
        let command = self.spec.command.clone();
        let args = self.spec.args.clone();
        let capacity = self.spec.capacity;
        tokio::spawn(async move {
            tokio::time::sleep(backoff).await;
            let Ok(_permit) = permits.acquire().await else { return };
            let old = daemon.write().await.take();
            if let Some(old) = old {
                old.stop().await;
            }
            tokio::time::sleep(POST_STOP_PAUSE).await;
            match GpsDaemon::start(&command, &args, capacity, clock).await {
                Ok(fresh) => {
                    *daemon.write().await = Some(fresh);
                    eprintln!("[HEALTH] gps restarted successfully");
                }
                Err(e) => {
                    eprintln!("[HEALTH] gps restart failed: {}", e);
                }
            }
        });
    }

    async fn note_recovery_if_alive(&self, now: f64) {
        let silence = self.silence(now).await;
        let healthy = silence.map(|s| s <= self.silence_threshold_s).unwrap_or(false);
        if healthy {
            let mut tracker = self.tracker.lock().unwrap();
            if tracker.attempts() > 0 {
                tracker.record_recovery();
                eprintln!("[HEALTH] gps recovered");
            }
        }
    }

    pub fn attempts(&self) -> u32 {
        self.tracker.lock().unwrap().attempts()
    }

    pub fn is_circuit_open(&self) -> bool {
        self.tracker.lock().unwrap().is_circuit_open()
    }
}

/// Owns both sensor watches and runs the section-4.11 check loop on a
/// fixed interval until `stop_signal` is set. Restart tasks run on their
/// own spawned tasks (never blocking this loop) through a 2-slot
/// semaphore, matching section 5's "bounded pool of 2" restart executor.
pub struct HealthMonitor {
    clock: SessionClock,
    imu: ImuWatch,
    gps: GpsWatch,
    stop_signal: Arc<AtomicBool>,
    check_interval: Duration,
    permits: Arc<Semaphore>,
}

impl HealthMonitor {
    pub fn new(
        clock: SessionClock,
        imu_daemon: Arc<RwLock<Option<ImuDaemon>>>,
        gps_daemon: Arc<RwLock<Option<GpsDaemon>>>,
        imu_command: &str,
        imu_args: &[String],
        imu_capacity: usize,
        gps_command: &str,
        gps_args: &[String],
        gps_capacity: usize,
        stop_signal: Arc<AtomicBool>,
    ) -> Self {
        Self {
            clock,
            imu: ImuWatch::new(imu_daemon, imu_command, imu_args, imu_capacity),
            gps: GpsWatch::new(gps_daemon, gps_command, gps_args, gps_capacity),
            stop_signal,
            check_interval: Duration::from_secs(DEFAULT_CHECK_INTERVAL_S),
            permits: Arc::new(Semaphore::new(RESTART_CONCURRENCY)),
        }
    }

    pub fn imu_attempts(&self) -> u32 {
        self.imu.attempts()
    }

    pub fn gps_attempts(&self) -> u32 {
        self.gps.attempts()
    }

    pub fn imu_circuit_open(&self) -> bool {
        self.imu.is_circuit_open()
    }

    pub fn gps_circuit_open(&self) -> bool {
        self.gps.is_circuit_open()
    }

    pub async fn run(&self) {
        let mut interval = tokio::time::interval(self.check_interval);
        loop {
            interval.tick().await;
            if self.stop_signal.load(Ordering::Relaxed) {
                break;
            }
            let now = self.clock.now();
            self.imu.note_recovery_if_alive(now).await;
            self.gps.note_recovery_if_alive(now).await;
            self.imu.check(now, &self.permits, self.clock.clone()).await;
            self.gps.check(now, &self.permits, self.clock.clone()).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn p10_backoff_sequence_is_1_2_4_seconds() {
        let mut t = RestartTracker::new();
        let d1 = t.record_attempt();
        let d2 = t.record_attempt();
        let d3 = t.record_attempt();
        assert!((d1.as_secs_f64() - 1.0).abs() < 1e-9);
        assert!((d2.as_secs_f64() - 2.0).abs() < 1e-9);
        assert!((d3.as_secs_f64() - 4.0).abs() < 1e-9);
    }

    #[test]
    fn p10_backoff_caps_at_sixteen_seconds() {
        let mut t = RestartTracker::new();
        for _ in 0..8 {
            t.record_attempt();
        }
        let d = t.record_attempt();
        assert!(d.as_secs_f64() <= 16.0);
    }

    #[test]
    fn p10_circuit_opens_after_ten_attempts() {
        let mut t = RestartTracker::new();
        for _ in 0..9 {
            assert!(t.can_restart());
            t.record_attempt();
        }
        assert!(!t.is_circuit_open());
        t.record_attempt();
        assert!(t.is_circuit_open());
        assert!(!t.can_restart());
    }

    #[test]
    fn recovery_resets_attempts_and_circuit() {
        let mut t = RestartTracker::new();
        for _ in 0..10 {
            t.record_attempt();
        }
        assert!(t.is_circuit_open());
        t.record_recovery();
        assert!(!t.is_circuit_open());
        assert_eq!(t.attempts(), 0);
        assert!(t.can_restart());
    }
}
