//! Persistence / auto-save (C10): periodic snapshot-and-clear of the
//! shared deques into the session accumulator, serialized to disk with an
//! atomic temp-file-then-rename.
//!
//! `SharedState` is the single structure behind `save_lock` (section 5):
//! raw archive deques, per-filter trajectory deques, and the accumulator
//! all live here so a filter worker's append and the persistence task's
//! snapshot never need more than one lock at a time.

use crate::error::PersistError;
use crate::types::{
    AccelSample, BoundedDeque, FilteredOutput, GpsFix, GyroSample, IncidentRecord, SessionAccumulator,
};
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;

pub const DEFAULT_SAVE_INTERVAL_S: u64 = 120;
const MAX_TRAJECTORY_POINTS: usize = 1000;
const RAW_ARCHIVE_CAPACITY: usize = 10_000;

pub struct SharedState {
    pub accel: BoundedDeque<AccelSample>,
    pub gyro: BoundedDeque<GyroSample>,
    pub gps: BoundedDeque<GpsFix>,
    pub trajectories: HashMap<String, BoundedDeque<FilteredOutput>>,
    pub accumulator: SessionAccumulator,
}

impl SharedState {
    pub fn new(filter_names: &[&str]) -> Self {
        let mut trajectories = HashMap::new();
        for name in filter_names {
            trajectories.insert(name.to_string(), BoundedDeque::new(MAX_TRAJECTORY_POINTS));
        }
        Self {
            accel: BoundedDeque::new(RAW_ARCHIVE_CAPACITY),
            gyro: BoundedDeque::new(RAW_ARCHIVE_CAPACITY),
            gps: BoundedDeque::new(RAW_ARCHIVE_CAPACITY),
            trajectories,
            accumulator: SessionAccumulator::default(),
        }
    }

    pub fn push_trajectory(&mut self, filter_name: &str, output: FilteredOutput) {
        if let Some(deque) = self.trajectories.get_mut(filter_name) {
            deque.push(output);
        }
    }

    pub fn push_incident(&mut self, record: IncidentRecord) {
        self.accumulator.incidents.push(record);
    }
}

pub type SaveLock = Arc<Mutex<SharedState>>;

async fn write_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), PersistError> {
    let tmp_path = path.with_extension("tmp");
    let json = serde_json::to_vec_pretty(value)?;
    tokio::fs::write(&tmp_path, &json).await.map_err(|e| PersistError::Io {
        path: tmp_path.display().to_string(),
        source: e,
    })?;
    tokio::fs::rename(&tmp_path, path).await.map_err(|e| PersistError::Io {
        path: path.display().to_string(),
        source: e,
    })?;
    Ok(())
}

pub struct Persistence {
    session_dir: PathBuf,
    chunks_dir: PathBuf,
    incidents_dir: PathBuf,
    chunk_index: u64,
}

impl Persistence {
    pub async fn new(session_dir: PathBuf) -> Result<Self, PersistError> {
        let chunks_dir = session_dir.join("chunks");
        let incidents_dir = session_dir.join("incidents");
        for dir in [&session_dir, &chunks_dir, &incidents_dir] {
            tokio::fs::create_dir_all(dir).await.map_err(|e| PersistError::Io {
                path: dir.display().to_string(),
                source: e,
            })?;
        }
        Ok(Self { session_dir, chunks_dir, incidents_dir, chunk_index: 0 })
    }

    /// Section 4.10 steps 1-5: acquire the lock, snapshot-and-clear the
    /// raw/trajectory deques into the accumulator, release, then serialize
    /// to `chunks/chunk_<n>.json` via temp-file-then-rename. Incidents are
    /// written to their own per-incident file and cleared from the
    /// in-memory accumulator once written, so they are never re-saved.
    pub async fn auto_save(&mut self, shared: &SaveLock) -> Result<(), PersistError> {
        let (chunk, incidents) = {
            let mut state = shared.lock().await;
            state.accumulator.accel_chunks.push(state.accel.drain_all());
            state.accumulator.gyro_chunks.push(state.gyro.drain_all());
            state.accumulator.gps_chunks.push(state.gps.drain_all());
            for (name, deque) in state.trajectories.iter_mut() {
                state
                    .accumulator
                    .trajectory_chunks
                    .entry(name.clone())
                    .or_default()
                    .extend(deque.drain_all());
            }
            let incidents = std::mem::take(&mut state.accumulator.incidents);
            (state.accumulator.clone(), incidents)
        };

        for incident in &incidents {
            self.write_incident(incident).await?;
        }

        let chunk_path = self.chunks_dir.join(format!("chunk_{}.json", self.chunk_index));
        self.chunk_index += 1;
        write_atomic(&chunk_path, &chunk).await?;
        eprintln!("[PERSIST] auto-save wrote {}", chunk_path.display());
        Ok(())
    }

    async fn write_incident(&self, record: &IncidentRecord) -> Result<(), PersistError> {
        let path = self
            .incidents_dir
            .join(format!("incident_{:.3}_{}.json", record.t, record.kind.as_str()));
        write_atomic(&path, record).await
    }

    /// Final save on the Recording/Paused -> Idle transition: concatenate
    /// accumulator chunks with whatever residue is still in the deques
    /// (section 4.10's explicit note that the deques may hold post-last-
    /// auto-save residue) and write `final.json`.
    pub async fn final_save(&mut self, shared: &SaveLock, metadata: &serde_json::Value) -> Result<(), PersistError> {
        self.auto_save(shared).await?;
        let accumulator = shared.lock().await.accumulator.clone();

        #[derive(Serialize)]
        struct FinalFile<'a> {
            metadata: &'a serde_json::Value,
            accel_samples: Vec<AccelSample>,
            gyro_samples: Vec<GyroSample>,
            gps_samples: Vec<GpsFix>,
            trajectories: &'a HashMap<String, Vec<FilteredOutput>>,
            incidents: &'a Vec<IncidentRecord>,
        }

        let final_file = FinalFile {
            metadata,
            accel_samples: accumulator.accel_chunks.concat(),
            gyro_samples: accumulator.gyro_chunks.concat(),
            gps_samples: accumulator.gps_chunks.concat(),
            trajectories: &accumulator.trajectory_chunks,
            incidents: &accumulator.incidents,
        };

        let path = self.session_dir.join("final.json");
        write_atomic(&path, &final_file).await?;
        eprintln!("[PERSIST] final save wrote {}", path.display());
        Ok(())
    }

    pub async fn write_metadata(&self, metadata: &serde_json::Value) -> Result<(), PersistError> {
        write_atomic(&self.session_dir.join("metadata.json"), metadata).await
    }

    pub fn session_dir(&self) -> &Path {
        &self.session_dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{FilterKind, GpsProvider};

    fn accel(t: f64) -> AccelSample {
        AccelSample { t, x: 0.0, y: 0.0, z: 9.81 }
    }

    #[tokio::test]
    async fn auto_save_drains_deques_into_accumulator_and_writes_a_chunk() {
        let tmp = std::env::temp_dir().join(format!("motion_tracker_test_{}", std::process::id()));
        let mut persistence = Persistence::new(tmp.clone()).await.unwrap();
        let shared: SaveLock = Arc::new(Mutex::new(SharedState::new(&["ekf"])));
        {
            let mut s = shared.lock().await;
            s.accel.push(accel(0.0));
            s.accel.push(accel(0.02));
            s.push_trajectory(
                "ekf",
                FilteredOutput {
                    t: 0.0,
                    source_filter: FilterKind::Ekf,
                    velocity: 1.0,
                    distance: 2.0,
                    latitude: None,
                    longitude: None,
                    uncertainty: None,
                    quaternion_norm: None,
                },
            );
        }
        persistence.auto_save(&shared).await.unwrap();

        let state = shared.lock().await;
        assert_eq!(state.accel.len(), 0);
        assert_eq!(state.accumulator.accel_sample_count(), 2);
        assert!(state.trajectories["ekf"].is_empty());
        assert_eq!(state.accumulator.trajectory_chunks["ekf"].len(), 1);

        let chunk_path = tmp.join("chunks").join("chunk_0.json");
        assert!(chunk_path.exists());
        let _ = std::fs::remove_dir_all(&tmp);
    }

    #[tokio::test]
    async fn final_save_reports_combined_counts_including_residue() {
        let tmp = std::env::temp_dir().join(format!("motion_tracker_test_final_{}", std::process::id()));
        let mut persistence = Persistence::new(tmp.clone()).await.unwrap();
        let shared: SaveLock = Arc::new(Mutex::new(SharedState::new(&["ekf"])));
        {
            let mut s = shared.lock().await;
            s.accel.push(accel(0.0));
        }
        persistence.auto_save(&shared).await.unwrap(); // first chunk: 1 sample
        {
            let mut s = shared.lock().await;
            s.accel.push(accel(1.0)); // residue not yet auto-saved
        }
        let metadata = serde_json::json!({"filter": "ekf"});
        persistence.final_save(&shared, &metadata).await.unwrap();

        let state = shared.lock().await;
        assert_eq!(state.accumulator.accel_sample_count(), 2); // P11: chunk + residual
        let final_path = tmp.join("final.json");
        assert!(final_path.exists());
        let final_json: serde_json::Value = serde_json::from_slice(&std::fs::read(&final_path).unwrap()).unwrap();
        // P11 against the file itself: `accel_samples` must be the actual
        // flattened samples, not a count, and must include the residual.
        assert_eq!(final_json["accel_samples"].as_array().unwrap().len(), 2);
        let _ = std::fs::remove_dir_all(&tmp);
    }

    #[tokio::test]
    async fn incidents_are_written_once_and_cleared_from_accumulator() {
        let tmp = std::env::temp_dir().join(format!("motion_tracker_test_incidents_{}", std::process::id()));
        let mut persistence = Persistence::new(tmp.clone()).await.unwrap();
        let shared: SaveLock = Arc::new(Mutex::new(SharedState::new(&["ekf"])));
        {
            let mut s = shared.lock().await;
            s.push_incident(IncidentRecord {
                id: "impact_0".into(),
                kind: crate::types::IncidentKind::Impact,
                t: 5.0,
                peak_magnitude: 20.0,
                pre_context: vec![],
                post_context: vec![],
                gps_speed_at_event: None,
                latitude: None,
                longitude: None,
                saved_at: 35.0,
            });
        }
        persistence.auto_save(&shared).await.unwrap();
        let state = shared.lock().await;
        assert!(state.accumulator.incidents.is_empty());
        let incident_path = tmp.join("incidents").join("incident_5.000_impact.json");
        assert!(incident_path.exists());
        let _ = std::fs::remove_dir_all(&tmp);
    }
}
