//! `state.json` model and the atomic write-temp-then-rename persistence
//! used to make every write crash-safe.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{OrchestratorError, Result};
use crate::model_selector::ModelSelection;
use crate::sync_ext::MutexExt;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StageStatus {
    Pending,
    Running,
    Done,
    Failed,
    Cancelled,
    Timeout,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LastError {
    pub kind: String,
    pub message: String,
    #[serde(default)]
    pub tail: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StageState {
    pub status: StageStatus,
    pub attempts: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<LastError>,
}

impl StageState {
    pub fn pending() -> Self {
        Self {
            status: StageStatus::Pending,
            attempts: 0,
            started_at: None,
            finished_at: None,
            last_error: None,
        }
    }
}

/// The full on-disk shape of `<task_root>/state.json`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StateRecord {
    pub task_id: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_selection: Option<ModelSelection>,
    pub targets: Vec<String>,
    pub stages: HashMap<String, StageState>,
}

impl StateRecord {
    pub fn new(task_id: impl Into<String>, created_at: DateTime<Utc>) -> Self {
        Self {
            task_id: task_id.into(),
            created_at,
            model_selection: None,
            targets: Vec::new(),
            stages: HashMap::new(),
        }
    }

    /// On load, any stage found `running` belongs to a crashed process.
    /// Demoting it to `pending` makes it eligible again without discarding
    /// its attempt count, which the retry-policy check still honors.
    pub fn mark_crashed_stages_retryable(&mut self) {
        for stage in self.stages.values_mut() {
            if stage.status == StageStatus::Running {
                stage.status = StageStatus::Pending;
            }
        }
    }
}

fn read_record(path: &Path) -> Result<StateRecord> {
    let bytes = std::fs::read(path).map_err(|source| OrchestratorError::StateWriteFailed {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_slice(&bytes).map_err(|e| OrchestratorError::WorkerOutputMalformed(format!(
        "corrupt state file {}: {e}",
        path.display()
    )))
}

/// Write `record` to `path` via write-temp-then-rename, so a crash mid-write
/// never leaves a half-written `state.json` behind.
fn write_record_atomic(path: &Path, record: &StateRecord) -> Result<()> {
    let tmp_path = path.with_extension("json.tmp");
    let body = serde_json::to_vec_pretty(record).expect("StateRecord always serializes");
    std::fs::write(&tmp_path, &body).map_err(|source| OrchestratorError::StateWriteFailed {
        path: tmp_path.clone(),
        source,
    })?;
    std::fs::rename(&tmp_path, path).map_err(|source| {
        let _ = std::fs::remove_file(&tmp_path);
        OrchestratorError::StateWriteFailed {
            path: path.to_path_buf(),
            source,
        }
    })
}

/// Per-task write serialization: state-file writes are serialized per task
/// by a task-local lock, independent across tasks.
#[derive(Default)]
pub struct StateStore {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl StateStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_for(&self, task_id: &str) -> Arc<Mutex<()>> {
        self.locks
            .lock_unpoisoned()
            .entry(task_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    pub fn load(&self, path: &Path, task_id: &str) -> Result<StateRecord> {
        let lock = self.lock_for(task_id);
        let _guard = lock.lock_unpoisoned();
        read_record(path)
    }

    pub fn save(&self, path: &Path, task_id: &str, record: &StateRecord) -> Result<()> {
        let lock = self.lock_for(task_id);
        let _guard = lock.lock_unpoisoned();
        write_record_atomic(path, record)
    }

    /// Read-modify-write under the task's lock in one critical section, so
    /// concurrent stage completions never clobber each other's updates.
    pub fn update(
        &self,
        path: &Path,
        task_id: &str,
        f: impl FnOnce(&mut StateRecord),
    ) -> Result<StateRecord> {
        let lock = self.lock_for(task_id);
        let _guard = lock.lock_unpoisoned();
        let mut record = read_record(path)?;
        f(&mut record);
        write_record_atomic(path, &record)?;
        Ok(record)
    }
}
