//! Session coordinator (C12): owns the Idle/Recording/Paused lifecycle,
//! spawns every other component, and enforces shutdown ordering.
//!
//! The donor has no equivalent: `main.rs` wired daemons, the dashboard,
//! and the filters together inline in `main()`, with no reusable
//! coordinator type and no pause/resume at all (section 9's "global
//! mutable state and singletons" re-architecture note applies here most
//! directly). The sibling Android crate's `session.rs` has the closer
//! shape — an explicit `SessionState` enum and one struct owning bounded
//! queues — and is the structural model for the state machine below; the
//! actual daemon/fanout/filter/incident/persistence wiring is generalized
//! from the donor's `main.rs` and `health_monitor.rs`. Per this crate's
//! no-dynamic-dispatch convention (already used in `health_monitor.rs`'s
//! `ImuWatch`/`GpsWatch`), the three fanout pump tasks below are written
//! concretely per stream rather than behind one generic/trait-object
//! helper.

use crate::calibration::Calibrator;
use crate::daemon::{GpsDaemon, ImuDaemon, SessionClock};
use crate::fanout::Fanout;
use crate::filter_worker::{read_rss_mb, FilterWorker};
use crate::health_monitor::HealthMonitor;
use crate::incident::IncidentDetector;
use crate::live_status::{FilterStatus, LiveStatus};
use crate::persistence::{Persistence, SaveLock, SharedState};
use crate::rotation::RotationDetector;
use crate::types::{AccelSample, ContextSample, FilterKind, GpsFix, GyroSample};

use anyhow::{Context as _, Result};
use chrono::Utc;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::time::Duration;

const CORE_QUEUE_NAME: &str = "core";
const CALIBRATION_WINDOW: usize = 50;
const BOOTSTRAP_CALIBRATION_S: f64 = 2.5;
const ROTATION_EVENT_THRESHOLD_RAD: f64 = 0.5;
const INSTANT_STATIONARY_MOTION_MS2: f64 = 0.3;
const STATUS_INTERVAL_S: u64 = crate::health_monitor::DEFAULT_CHECK_INTERVAL_S;
const RSS_POLL_INTERVAL_S: u64 = 2;
const JOIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Section 4.12's state machine. `Paused` is reachable but not exercised
/// by the plain `motion-tracker <minutes>` CLI surface, which only ever
/// drives Idle -> Recording -> Idle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Recording,
    Paused,
}

#[derive(Clone, Debug)]
pub struct SessionConfig {
    pub filters: Vec<FilterKind>,
    pub enable_gyro: bool,
    pub rate_ms: u64,
    pub save_interval_s: u64,
    pub out_dir: PathBuf,
    pub imu_command: String,
    pub imu_args: Vec<String>,
    pub gps_command: String,
    pub gps_args: Vec<String>,
    pub imu_queue_capacity: usize,
    pub gps_queue_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            filters: vec![FilterKind::Complementary, FilterKind::Ekf, FilterKind::EsEkf],
            enable_gyro: false,
            rate_ms: 20,
            save_interval_s: crate::persistence::DEFAULT_SAVE_INTERVAL_S,
            out_dir: PathBuf::from("./sessions"),
            imu_command: "termux-sensor".to_string(),
            imu_args: vec![
                "-s".to_string(),
                "accelerometer gyroscope".to_string(),
                "-d".to_string(),
                "20".to_string(),
            ],
            gps_command: "termux-location".to_string(),
            gps_args: vec!["-p".to_string(), "gps".to_string(), "-r".to_string(), "always".to_string()],
            imu_queue_capacity: 100,
            gps_queue_capacity: 100,
        }
    }
}

/// Aggregate counters reported at `stop()`, mirrored into
/// `metadata.json`'s calibration block and the CLI's final printout.
struct Counters {
    accel_total: AtomicU64,
    gyro_total: AtomicU64,
    gps_total: AtomicU64,
    incidents: [AtomicU64; 3],
    peak_rss_mb_bits: AtomicU64,
}

impl Counters {
    fn new() -> Self {
        Self {
            accel_total: AtomicU64::new(0),
            gyro_total: AtomicU64::new(0),
            gps_total: AtomicU64::new(0),
            incidents: [AtomicU64::new(0), AtomicU64::new(0), AtomicU64::new(0)],
            peak_rss_mb_bits: AtomicU64::new(0u64),
        }
    }

    fn note_peak_rss(&self, rss_mb: f64) {
        let mut current = f64::from_bits(self.peak_rss_mb_bits.load(Ordering::Relaxed));
        while rss_mb > current {
            match self.peak_rss_mb_bits.compare_exchange_weak(
                current.to_bits(),
                rss_mb.to_bits(),
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(observed) => current = f64::from_bits(observed),
            }
        }
    }

    fn note_incident(&self, kind: crate::types::IncidentKind) {
        let idx = match kind {
            crate::types::IncidentKind::HardBrake => 0,
            crate::types::IncidentKind::Impact => 1,
            crate::types::IncidentKind::Swerve => 2,
        };
        self.incidents[idx].fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct FinalStats {
    pub accel_samples: u64,
    pub gyro_samples: u64,
    pub gps_samples: u64,
    pub hard_brake_incidents: u64,
    pub impact_incidents: u64,
    pub swerve_incidents: u64,
    pub imu_restart_attempts: u32,
    pub gps_restart_attempts: u32,
    pub imu_circuit_open: bool,
    pub gps_circuit_open: bool,
    pub peak_rss_mb: f64,
    pub abnormal_shutdown: bool,
}

struct RunningTasks {
    fanout_accel: tokio::task::JoinHandle<()>,
    fanout_gyro: tokio::task::JoinHandle<()>,
    fanout_gps: tokio::task::JoinHandle<()>,
    filter_workers: Vec<(Arc<AtomicBool>, tokio::task::JoinHandle<()>)>,
    core: tokio::task::JoinHandle<()>,
    health_monitor: tokio::task::JoinHandle<()>,
    live_status: tokio::task::JoinHandle<()>,
    rss_tracker: tokio::task::JoinHandle<()>,
}

/// A live session: every task is spawned by `start()` and torn down by
/// `stop()` in the order section 4.12/5 require. Persistence is owned by
/// the caller (see `run()`), not by `Coordinator`, because its periodic
/// auto-save task needs to keep running independently of anything here
/// and must still be reachable for the final save after every other task
/// has already joined.
pub struct Coordinator {
    state: SessionState,
    config: SessionConfig,
    recording: watch::Sender<bool>,
    imu_daemon: Arc<RwLock<Option<ImuDaemon>>>,
    gps_daemon: Arc<RwLock<Option<GpsDaemon>>>,
    calibrator: Arc<Mutex<Calibrator>>,
    save_lock: SaveLock,
    health_monitor_handle: Arc<HealthMonitor>,
    counters: Arc<Counters>,
    stop_signal: Arc<AtomicBool>,
    session_dir: PathBuf,
    started_at: chrono::DateTime<Utc>,
    tasks: Option<RunningTasks>,
}

impl Coordinator {
    /// Idle -> Recording. Fatal init failures (no sensors, unwritable
    /// output directory) surface here and only here, per section 7.
    pub async fn start(config: SessionConfig) -> Result<(Self, Persistence)> {
        let clock = SessionClock::new();
        let started_at = Utc::now();
        let session_dir = config.out_dir.join(format!("session_{}", started_at.format("%Y%m%d-%H%M%S")));

        let persistence = Persistence::new(session_dir.clone())
            .await
            .context("fatal init failure: could not create session directory")?;

        let imu = ImuDaemon::start(&config.imu_command, &config.imu_args, config.imu_queue_capacity, clock.clone())
            .await
            .context("fatal init failure: accel/gyro daemon did not start")?;
        let gps = match GpsDaemon::start(&config.gps_command, &config.gps_args, config.gps_queue_capacity, clock.clone()).await {
            Ok(d) => Some(d),
            Err(e) => {
                eprintln!("[SESSION] gps daemon failed to start ({e}); continuing IMU-only");
                None
            }
        };

        let calibrator = Arc::new(Mutex::new(Calibrator::new()));
        bootstrap_calibration(&imu, &calibrator, clock.clone()).await;

        let filter_names: Vec<&str> = config.filters.iter().map(|f| f.name()).collect();
        let save_lock: SaveLock = Arc::new(Mutex::new(SharedState::new(&filter_names)));

        let stop_signal = Arc::new(AtomicBool::new(false));
        let (recording_tx, _) = watch::channel(true);

        let imu_daemon = Arc::new(RwLock::new(Some(imu)));
        let gps_daemon = Arc::new(RwLock::new(gps));

        let rotation = Arc::new(Mutex::new(RotationDetector::new()));
        let counters = Arc::new(Counters::new());

        let health_monitor_handle = Arc::new(HealthMonitor::new(
            clock.clone(),
            imu_daemon.clone(),
            gps_daemon.clone(),
            &config.imu_command,
            &config.imu_args,
            config.imu_queue_capacity,
            &config.gps_command,
            &config.gps_args,
            config.gps_queue_capacity,
            stop_signal.clone(),
        ));

        let mut consumer_names: Vec<&'static str> = config.filters.iter().map(|f| f.name()).collect();
        consumer_names.push(CORE_QUEUE_NAME);

        let accel_fanout = Arc::new(Fanout::<AccelSample>::new(&consumer_names, crate::fanout::IMU_FILTER_QUEUE_CAPACITY));
        let gyro_fanout = Arc::new(Fanout::<GyroSample>::new(&consumer_names, crate::fanout::IMU_FILTER_QUEUE_CAPACITY));
        let gps_fanout = Arc::new(Fanout::<GpsFix>::new(&consumer_names, crate::fanout::GPS_FILTER_QUEUE_CAPACITY));

        let fanout_accel = spawn_accel_fanout_task(imu_daemon.clone(), accel_fanout.clone(), stop_signal.clone(), recording_tx.subscribe());
        let fanout_gyro = spawn_gyro_fanout_task(imu_daemon.clone(), gyro_fanout.clone(), stop_signal.clone(), recording_tx.subscribe(), config.enable_gyro);
        let fanout_gps = spawn_gps_fanout_task(gps_daemon.clone(), gps_fanout.clone(), stop_signal.clone(), recording_tx.subscribe());

        let mut filter_workers = Vec::new();
        for kind in &config.filters {
            let accel_q = accel_fanout.queue(kind.name()).expect("queue registered above");
            let gyro_q = gyro_fanout.queue(kind.name()).expect("queue registered above");
            let gps_q = gps_fanout.queue(kind.name()).expect("queue registered above");
            let worker_stop = Arc::new(AtomicBool::new(false));
            let mut worker = FilterWorker::new(
                *kind,
                accel_q,
                gyro_q,
                gps_q,
                calibrator.clone(),
                rotation.clone(),
                save_lock.clone(),
                worker_stop.clone(),
            );
            let handle = tokio::spawn(async move { worker.run().await });
            filter_workers.push((worker_stop, handle));
        }

        let core_accel = accel_fanout.queue(CORE_QUEUE_NAME).expect("core queue registered");
        let core_gyro = gyro_fanout.queue(CORE_QUEUE_NAME).expect("core queue registered");
        let core_gps = gps_fanout.queue(CORE_QUEUE_NAME).expect("core queue registered");
        let core = tokio::spawn(run_core_task(
            core_accel,
            core_gyro,
            core_gps,
            calibrator.clone(),
            rotation.clone(),
            save_lock.clone(),
            counters.clone(),
            stop_signal.clone(),
        ));

        let hm = health_monitor_handle.clone();
        let health_monitor = tokio::spawn(async move { hm.run().await });

        let live_status = tokio::spawn(run_live_status_task(
            session_dir.clone(),
            clock.clone(),
            calibrator.clone(),
            save_lock.clone(),
            health_monitor_handle.clone(),
            counters.clone(),
            imu_daemon.clone(),
            gps_daemon.clone(),
            stop_signal.clone(),
        ));

        let counters_rss = counters.clone();
        let rss_stop = stop_signal.clone();
        let rss_tracker = tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(RSS_POLL_INTERVAL_S));
            while !rss_stop.load(Ordering::Relaxed) {
                interval.tick().await;
                counters_rss.note_peak_rss(read_rss_mb());
            }
        });

        let coordinator = Self {
            state: SessionState::Recording,
            config,
            recording: recording_tx,
            imu_daemon,
            gps_daemon,
            calibrator,
            save_lock,
            health_monitor_handle,
            counters,
            stop_signal,
            session_dir,
            started_at,
            tasks: Some(RunningTasks {
                fanout_accel,
                fanout_gyro,
                fanout_gps,
                filter_workers,
                core,
                health_monitor,
                live_status,
                rss_tracker,
            }),
        };

        Ok((coordinator, persistence))
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn session_dir(&self) -> &std::path::Path {
        &self.session_dir
    }

    pub fn save_lock(&self) -> SaveLock {
        self.save_lock.clone()
    }

    /// Recording -> Paused: daemons and the health monitor keep running
    /// so the sample timebase stays aligned; only fanout delivery to
    /// filter/core queues is suspended (section 4.12).
    pub fn pause(&mut self) {
        if self.state == SessionState::Recording {
            let _ = self.recording.send(false);
            self.state = SessionState::Paused;
        }
    }

    pub fn resume(&mut self) {
        if self.state == SessionState::Paused {
            let _ = self.recording.send(true);
            self.state = SessionState::Recording;
        }
    }

    /// Recording/Paused -> Idle. Shutdown ordering per section 4.12:
    /// stop fanout -> drain filter workers -> stop persistence (after
    /// final save) -> stop health monitor -> stop daemons.
    pub async fn stop(mut self, persistence: &mut Persistence) -> FinalStats {
        let tasks = self.tasks.take().expect("stop called once");
        let mut abnormal = false;

        self.stop_signal.store(true, Ordering::Relaxed);
        let _ = self.recording.send(false);

        if tokio::time::timeout(JOIN_TIMEOUT, tasks.fanout_accel).await.is_err() {
            abnormal = true;
        }
        if tokio::time::timeout(JOIN_TIMEOUT, tasks.fanout_gyro).await.is_err() {
            abnormal = true;
        }
        if tokio::time::timeout(JOIN_TIMEOUT, tasks.fanout_gps).await.is_err() {
            abnormal = true;
        }

        for (worker_stop, handle) in tasks.filter_workers {
            worker_stop.store(true, Ordering::Relaxed);
            if tokio::time::timeout(JOIN_TIMEOUT, handle).await.is_err() {
                abnormal = true;
            }
        }
        if tokio::time::timeout(JOIN_TIMEOUT, tasks.core).await.is_err() {
            abnormal = true;
        }

        let metadata = self.build_metadata_json().await;
        if persistence.final_save(&self.save_lock, &metadata).await.is_err() {
            abnormal = true;
        }

        if tokio::time::timeout(JOIN_TIMEOUT, tasks.health_monitor).await.is_err() {
            abnormal = true;
        }
        if tokio::time::timeout(JOIN_TIMEOUT, tasks.live_status).await.is_err() {
            abnormal = true;
        }
        let _ = tokio::time::timeout(JOIN_TIMEOUT, tasks.rss_tracker).await;

        if let Some(imu) = self.imu_daemon.write().await.take() {
            imu.stop().await;
        }
        if let Some(gps) = self.gps_daemon.write().await.take() {
            gps.stop().await;
        }

        self.state = SessionState::Idle;
        self.finalize_stats(abnormal)
    }

    async fn build_metadata_json(&self) -> serde_json::Value {
        let calibration = self.calibrator.lock().await.snapshot();
        serde_json::json!({
            "started_at": self.started_at.to_rfc3339(),
            "stopped_at": Utc::now().to_rfc3339(),
            "filters": self.config.filters.iter().map(|f| f.name()).collect::<Vec<_>>(),
            "rate_ms": self.config.rate_ms,
            "save_interval_s": self.config.save_interval_s,
            "calibration": calibration,
        })
    }

    fn finalize_stats(&self, abnormal: bool) -> FinalStats {
        FinalStats {
            accel_samples: self.counters.accel_total.load(Ordering::Relaxed),
            gyro_samples: self.counters.gyro_total.load(Ordering::Relaxed),
            gps_samples: self.counters.gps_total.load(Ordering::Relaxed),
            hard_brake_incidents: self.counters.incidents[0].load(Ordering::Relaxed),
            impact_incidents: self.counters.incidents[1].load(Ordering::Relaxed),
            swerve_incidents: self.counters.incidents[2].load(Ordering::Relaxed),
            imu_restart_attempts: self.health_monitor_handle.imu_attempts(),
            gps_restart_attempts: self.health_monitor_handle.gps_attempts(),
            imu_circuit_open: self.health_monitor_handle.imu_circuit_open(),
            gps_circuit_open: self.health_monitor_handle.gps_circuit_open(),
            peak_rss_mb: f64::from_bits(self.counters.peak_rss_mb_bits.load(Ordering::Relaxed)),
            abnormal_shutdown: abnormal,
        }
    }
}

/// Brief synchronous calibration phase on Idle->Recording entry: collect
/// accel samples straight from the daemon's own queue (fanout has not
/// started yet, so this is still single-consumer) and seed the first
/// `Calibration`. Subsequent updates go through `recalibrate_if_eligible`
/// and its 30s/0.5rad gate; this bootstrap window only needs to produce
/// *a* usable gravity reference before the fusion estimators start.
async fn bootstrap_calibration(imu: &ImuDaemon, calibrator: &Arc<Mutex<Calibrator>>, clock: SessionClock) {
    let deadline = clock.now() + BOOTSTRAP_CALIBRATION_S;
    let mut samples = Vec::with_capacity(CALIBRATION_WINDOW * 2);
    while clock.now() < deadline {
        if let Some(sample) = imu.try_pop_accel().await {
            samples.push(sample);
        } else {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
    if samples.len() > CALIBRATION_WINDOW {
        samples = samples.split_off(samples.len() - CALIBRATION_WINDOW);
    }
    let mut c = calibrator.lock().await;
    if !c.calibrate(&samples, clock.now()) {
        eprintln!("[SESSION] bootstrap calibration window was rejected; starting with default gravity");
    }
}

/// Drains `ImuDaemon`'s accel output (its only consumer) and broadcasts
/// into every named per-filter/core queue, unless paused.
fn spawn_accel_fanout_task(
    daemon: Arc<RwLock<Option<ImuDaemon>>>,
    fanout: Arc<Fanout<AccelSample>>,
    stop_signal: Arc<AtomicBool>,
    mut recording: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while !stop_signal.load(Ordering::Relaxed) {
            let item = {
                let guard = daemon.read().await;
                match guard.as_ref() {
                    Some(d) => d.try_pop_accel().await,
                    None => None,
                }
            };
            match item {
                Some(sample) => {
                    if *recording.borrow() {
                        fanout.broadcast(sample).await;
                    }
                }
                None => tokio::time::sleep(Duration::from_millis(5)).await,
            }
        }
    })
}

/// `--enable-gyro=false` disables C4 and gyro EKF updates (section 6)
/// by never forwarding gyro samples past this point: the daemon still
/// drains its own queue (so it doesn't back up), but nothing downstream
/// ever sees a gyro sample, so the rotation detector and filters' gyro
/// paths simply never fire.
fn spawn_gyro_fanout_task(
    daemon: Arc<RwLock<Option<ImuDaemon>>>,
    fanout: Arc<Fanout<GyroSample>>,
    stop_signal: Arc<AtomicBool>,
    mut recording: watch::Receiver<bool>,
    enable_gyro: bool,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while !stop_signal.load(Ordering::Relaxed) {
            let item = {
                let guard = daemon.read().await;
                match guard.as_ref() {
                    Some(d) => d.try_pop_gyro().await,
                    None => None,
                }
            };
            match item {
                Some(sample) => {
                    if enable_gyro && *recording.borrow() {
                        fanout.broadcast(sample).await;
                    }
                }
                None => tokio::time::sleep(Duration::from_millis(5)).await,
            }
        }
    })
}

fn spawn_gps_fanout_task(
    daemon: Arc<RwLock<Option<GpsDaemon>>>,
    fanout: Arc<Fanout<GpsFix>>,
    stop_signal: Arc<AtomicBool>,
    mut recording: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while !stop_signal.load(Ordering::Relaxed) {
            let item = {
                let guard = daemon.read().await;
                match guard.as_ref() {
                    Some(d) => d.try_pop().await,
                    None => None,
                }
            };
            match item {
                Some(fix) => {
                    if *recording.borrow() {
                        fanout.broadcast(fix).await;
                    }
                }
                None => tokio::time::sleep(Duration::from_millis(20)).await,
            }
        }
    })
}

/// The "core" consumer of the fanout (section 5: the incident detector
/// and raw archive need their own tap on every raw stream). Archives
/// samples into the shared deques under `save_lock`, drives the incident
/// detector on raw samples (section 9's Open Question: raw, not
/// filtered — see DESIGN.md), and drives C3/C4's ongoing recalibration
/// trigger.
#[allow(clippy::too_many_arguments)]
async fn run_core_task(
    accel_queue: Arc<crate::fanout::FanoutQueue<AccelSample>>,
    gyro_queue: Arc<crate::fanout::FanoutQueue<GyroSample>>,
    gps_queue: Arc<crate::fanout::FanoutQueue<GpsFix>>,
    calibrator: Arc<Mutex<Calibrator>>,
    rotation: Arc<Mutex<RotationDetector>>,
    save_lock: SaveLock,
    counters: Arc<Counters>,
    stop_signal: Arc<AtomicBool>,
) {
    let mut detector = IncidentDetector::new();
    let mut calib_window: std::collections::VecDeque<AccelSample> = std::collections::VecDeque::with_capacity(CALIBRATION_WINDOW * 2);
    let mut last_rotation_checkpoint = 0.0;
    let mut last_gyro_t: Option<f64> = None;
    let mut last_gyro_z = 0.0;
    let mut latest_gps_speed: Option<f64> = None;
    let mut latest_gps_pos: Option<(f64, f64)> = None;

    while !stop_signal.load(Ordering::Relaxed) {
        let mut did_work = false;

        if let Some(sample) = accel_queue.try_pop().await {
            did_work = true;
            counters.accel_total.fetch_add(1, Ordering::Relaxed);
            save_lock.lock().await.accel.push(sample);

            calib_window.push_back(sample);
            while calib_window.len() > CALIBRATION_WINDOW {
                calib_window.pop_front();
            }

            let motion_magnitude = calibrator.lock().await.motion_magnitude(&sample);
            let is_instant_stationary = motion_magnitude < INSTANT_STATIONARY_MOTION_MS2;
            calibrator.lock().await.note_sample(is_instant_stationary, sample.t);

            let rotation_total = rotation.lock().await.state().total_rotation_magnitude;
            let rotation_delta = rotation_total - last_rotation_checkpoint;
            let recalibrated = {
                let snapshot: Vec<AccelSample> = calib_window.iter().copied().collect();
                calibrator
                    .lock()
                    .await
                    .recalibrate_if_eligible(&snapshot, is_instant_stationary, rotation_delta, sample.t)
            };
            if recalibrated {
                last_rotation_checkpoint = rotation_total;
                if rotation_delta >= ROTATION_EVENT_THRESHOLD_RAD {
                    rotation.lock().await.reset_angles();
                    last_rotation_checkpoint = 0.0;
                }
            }

            let ctx = ContextSample {
                t: sample.t,
                accel_magnitude: sample.magnitude(),
                gyro_z: last_gyro_z,
                gps_speed: latest_gps_speed,
            };
            if let Some(record) = detector.on_sample(ctx, motion_magnitude, last_gyro_z, sample.t) {
                counters.note_incident(record.kind);
                save_lock.lock().await.push_incident(record);
            }
            if let Some((lat, lon)) = latest_gps_pos {
                detector.note_position(lat, lon);
            }
        }

        if let Some(sample) = gyro_queue.try_pop().await {
            did_work = true;
            counters.gyro_total.fetch_add(1, Ordering::Relaxed);
            save_lock.lock().await.gyro.push(sample);

            let dt = last_gyro_t.map(|t0| sample.t - t0).unwrap_or(0.0);
            last_gyro_t = Some(sample.t);
            last_gyro_z = sample.z;
            rotation.lock().await.update(sample.x, sample.y, sample.z, dt);
        }

        if let Some(fix) = gps_queue.try_pop().await {
            did_work = true;
            counters.gps_total.fetch_add(1, Ordering::Relaxed);
            save_lock.lock().await.gps.push(fix);
            latest_gps_speed = Some(fix.speed);
            latest_gps_pos = Some((fix.latitude, fix.longitude));
        }

        if !did_work {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }

    if let Some(record) = detector.force_close() {
        counters.note_incident(record.kind);
        save_lock.lock().await.push_incident(record);
    }
}

/// Periodically rewrites the live-status file an external viewer can
/// poll (section 7's "status line ... every T_hc").
#[allow(clippy::too_many_arguments)]
async fn run_live_status_task(
    session_dir: PathBuf,
    clock: SessionClock,
    calibrator: Arc<Mutex<Calibrator>>,
    save_lock: SaveLock,
    health_monitor: Arc<HealthMonitor>,
    counters: Arc<Counters>,
    imu_daemon: Arc<RwLock<Option<ImuDaemon>>>,
    gps_daemon: Arc<RwLock<Option<GpsDaemon>>>,
    stop_signal: Arc<AtomicBool>,
) {
    let path = session_dir.join("status.json");
    let mut interval = tokio::time::interval(Duration::from_secs(STATUS_INTERVAL_S));
    while !stop_signal.load(Ordering::Relaxed) {
        interval.tick().await;
        let calib = calibrator.lock().await.snapshot();
        let now = clock.now();
        let mut status = LiveStatus::new(now);
        status.accel_samples = counters.accel_total.load(Ordering::Relaxed);
        status.gyro_samples = counters.gyro_total.load(Ordering::Relaxed);
        status.gps_samples = counters.gps_total.load(Ordering::Relaxed);
        status.incidents_detected = counters.incidents.iter().map(|c| c.load(Ordering::Relaxed)).sum();
        status.calibration_complete = calib.valid;
        status.gravity_magnitude = calib.gravity_magnitude;
        status.imu_restart_attempts = health_monitor.imu_attempts();
        status.gps_restart_attempts = health_monitor.gps_attempts();
        status.imu_circuit_open = health_monitor.imu_circuit_open();
        status.gps_circuit_open = health_monitor.gps_circuit_open();
        status.imu_silence_secs = imu_daemon.read().await.as_ref().map(|d| now - d.last_sample_t()).unwrap_or(0.0);
        status.gps_silence_secs = gps_daemon.read().await.as_ref().map(|d| now - d.last_sample_t()).unwrap_or(0.0);

        let mut filters = HashMap::new();
        {
            let state = save_lock.lock().await;
            for (name, deque) in state.trajectories.iter() {
                if let Some(last) = deque.iter().last() {
                    filters.insert(name.clone(), FilterStatus { velocity: last.velocity, distance: last.distance });
                }
            }
        }
        status.filters = filters;

        let _ = status.save(&path).await;
    }
}

/// Runs persistence's auto-save on a fixed interval until `stop_signal`
/// fires. Owns the `Persistence` handle exclusively while it runs so no
/// other task ever touches chunk numbering; `run()` takes it back once
/// this loop exits, for the final save.
pub async fn run_persistence_task(mut persistence: Persistence, save_lock: SaveLock, interval_s: u64, stop_signal: Arc<AtomicBool>) -> Persistence {
    let mut interval = tokio::time::interval(Duration::from_secs(interval_s.max(1)));
    interval.tick().await; // first tick fires immediately; skip it
    while !stop_signal.load(Ordering::Relaxed) {
        interval.tick().await;
        if stop_signal.load(Ordering::Relaxed) {
            break;
        }
        if let Err(e) = persistence.auto_save(&save_lock).await {
            eprintln!("[PERSIST] auto-save failed, will retry next cycle: {e}");
        }
    }
    persistence
}

/// Top-level entry point used by `main`: start a session, run it for
/// `minutes` (0 = run until `ctrl_c`), then stop and return the final
/// stats. This is the only place that decides between the CLI's exit
/// codes 0/1/2: init failures propagate as `Err` (exit 1); a completed
/// run with `abnormal_shutdown` reports exit 2 to the caller.
pub async fn run(config: SessionConfig, minutes: u64) -> Result<FinalStats> {
    let (coordinator, persistence) = Coordinator::start(config.clone()).await?;

    let save_lock = coordinator.save_lock();
    let persistence_stop = Arc::new(AtomicBool::new(false));
    let persistence_handle = tokio::spawn(run_persistence_task(persistence, save_lock, config.save_interval_s, persistence_stop.clone()));

    if minutes == 0 {
        let _ = tokio::signal::ctrl_c().await;
    } else {
        tokio::time::sleep(Duration::from_secs(minutes * 60)).await;
    }

    persistence_stop.store(true, Ordering::Relaxed);
    let mut persistence = persistence_handle.await.context("persistence task panicked")?;

    Ok(coordinator.stop(&mut persistence).await)
}
