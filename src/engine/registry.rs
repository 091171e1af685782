//! `TaskRegistry`: a thin seam for tracking per-torrent progress rows.
//!
//! This stands in for an external task-tracking system (a database, a
//! dashboard backend) that a real deployment would plug in. `InMemoryRegistry`
//! is the only implementation shipped here — sufficient for the CLI and for
//! tests, and swappable by anything embedding the engine.
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, SystemTime};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Queued,
    Downloading,
    Paused,
    Stalled,
    Completed,
    Failed,
}

#[derive(Debug, Clone)]
pub struct TaskRow {
    pub info_hash: [u8; 20],
    pub name: String,
    pub state: TaskState,
    /// Percentage complete, in `[0.0, 100.0]` (spec.md §3: `progress_percent`).
    pub progress: f64,
    pub downloaded_bytes: u64,
    pub total_bytes: u64,
    pub connected_peers: usize,
    /// Bytes/second, averaged from session start. Zero until the first pass
    /// with measurable elapsed time.
    pub download_speed: f64,
    /// `(total_bytes - downloaded_bytes) / download_speed`. `None` until
    /// `download_speed` is known, or once the torrent is complete.
    pub eta: Option<Duration>,
    pub completed_at: Option<SystemTime>,
    /// Set whenever `state` transitions to `Failed`; `None` otherwise (§4.9,
    /// §7: e.g. "No peers available" when every tracker tier is exhausted).
    pub error_message: Option<String>,
}

impl TaskRow {
    pub fn new(info_hash: [u8; 20], name: String, total_bytes: u64) -> Self {
        Self {
            info_hash,
            name,
            state: TaskState::Queued,
            progress: 0.0,
            downloaded_bytes: 0,
            total_bytes,
            connected_peers: 0,
            download_speed: 0.0,
            eta: None,
            completed_at: None,
            error_message: None,
        }
    }
}

/// Storage for per-torrent progress rows, keyed by info-hash.
pub trait TaskRegistry: Send + Sync {
    fn create(&self, row: TaskRow);
    fn get(&self, info_hash: &[u8; 20]) -> Option<TaskRow>;
    fn save(&self, row: TaskRow);
    fn delete(&self, info_hash: &[u8; 20]);
    fn list(&self) -> Vec<TaskRow>;
}

#[derive(Debug, Default)]
pub struct InMemoryRegistry {
    rows: Mutex<HashMap<[u8; 20], TaskRow>>,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TaskRegistry for InMemoryRegistry {
    fn create(&self, row: TaskRow) {
        self.rows.lock().unwrap().insert(row.info_hash, row);
    }

    fn get(&self, info_hash: &[u8; 20]) -> Option<TaskRow> {
        self.rows.lock().unwrap().get(info_hash).cloned()
    }

    fn save(&self, row: TaskRow) {
        self.rows.lock().unwrap().insert(row.info_hash, row);
    }

    fn delete(&self, info_hash: &[u8; 20]) {
        self.rows.lock().unwrap().remove(info_hash);
    }

    fn list(&self) -> Vec<TaskRow> {
        self.rows.lock().unwrap().values().cloned().collect()
    }
}
