//! The job supervisor. Owns task lifecycle (create, start, cancel, delete)
//! and the resume scan on process start. Holds the process-global worker
//! pool, GPU-exclusive token, and power guard ref-count as a single value
//! rather than scattered global singletons.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use uuid::Uuid;

use crate::error::{OrchestratorError, Result};
use crate::layout::TaskLayout;
use crate::power_guard::PowerGuard;
use crate::progress_bus::ProgressBus;
use crate::scheduler::{ReadyItem, ReadyQueue, StageExecutor, WorkerPool};
use crate::stage_graph::StageId;
use crate::state_persist::{StateRecord, StateStore, StageState};
use crate::sync_ext::MutexExt;
use crate::worker::CancellationToken;

/// A task discovered on disk at startup whose state is not `done`/`failed`
/// on every stage — surfaced to the operator, never auto-resumed.
#[derive(Debug, Clone)]
pub struct ResumableTask {
    pub task_id: String,
    pub state: StateRecord,
}

struct TaskRuntime {
    cancel: CancellationToken,
    bus: ProgressBus,
}

/// Owns every task's runtime bookkeeping plus the process-global pool.
pub struct Supervisor<E: StageExecutor + 'static> {
    layout: TaskLayout,
    state_store: Arc<StateStore>,
    runtimes: Mutex<HashMap<String, TaskRuntime>>,
    queue: Arc<ReadyQueue>,
    gpu_token: Arc<Mutex<()>>,
    pool: Mutex<Option<WorkerPool>>,
    pool_size: usize,
    executor: Arc<E>,
    power_guards: Mutex<HashMap<String, PowerGuard>>,
}

impl<E: StageExecutor + 'static> Supervisor<E> {
    pub fn new(layout: TaskLayout, pool_size: usize, executor: Arc<E>) -> Self {
        Self {
            layout,
            state_store: Arc::new(StateStore::new()),
            runtimes: Mutex::new(HashMap::new()),
            queue: Arc::new(ReadyQueue::new()),
            gpu_token: Arc::new(Mutex::new(())),
            pool: Mutex::new(None),
            pool_size,
            executor,
            power_guards: Mutex::new(HashMap::new()),
        }
    }

    /// Starts the process-global worker pool. Idempotent.
    pub fn ensure_pool_started(&self) {
        let mut pool = self.pool.lock_unpoisoned();
        if pool.is_none() {
            *pool = Some(WorkerPool::spawn(
                self.pool_size,
                self.queue.clone(),
                self.gpu_token.clone(),
                self.executor.clone(),
            ));
        }
    }

    /// Allocates a task id, ensures its layout, and writes the initial
    /// `state.json` with every stage `pending`.
    pub fn create_task(&self, targets: Vec<String>) -> Result<String> {
        let task_id = Uuid::new_v4().to_string();
        self.layout.ensure_structure(&task_id)?;
        for lang in &targets {
            self.layout.ensure_lang_structure(&task_id, lang)?;
        }

        let mut record = StateRecord::new(&task_id, Utc::now());
        record.targets = targets.clone();
        for stage in StageId::all_for_targets(&targets) {
            record.stages.insert(stage.key(), StageState::pending());
        }

        self.state_store
            .save(&self.layout.state_path(&task_id), &task_id, &record)?;

        let mut runtimes = self.runtimes.lock_unpoisoned();
        runtimes.insert(
            task_id.clone(),
            TaskRuntime {
                cancel: CancellationToken::new(),
                bus: ProgressBus::new(),
            },
        );

        Ok(task_id)
    }

    /// Claims every currently-eligible stage for `task_id` (flips it
    /// `pending` -> `running` and bumps its attempt count in the same
    /// persisted update) and pushes it onto the process-global ready queue.
    ///
    /// Claiming before enqueueing, rather than on pickup, is what makes this
    /// method safe to call repeatedly from a polling driver loop: a stage
    /// already sitting in the queue is `running` in `state.json`, so
    /// `eligible_stages` never proposes it a second time.
    pub fn enqueue_eligible(&self, task_id: &str) -> Result<()> {
        self.ensure_pool_started();
        let path = self.layout.state_path(task_id);
        let record = self.state_store.load(&path, task_id)?;
        let eligible = crate::stage_graph::eligible_stages(&record.targets, &record.stages);

        if eligible.is_empty() {
            return Ok(());
        }

        self.power_guards
            .lock_unpoisoned()
            .entry(task_id.to_string())
            .or_insert_with(PowerGuard::acquire);

        let now_instant = std::time::Instant::now();
        let now_wall = Utc::now();
        self.state_store.update(&path, task_id, |record| {
            for stage in &eligible {
                if let Some(state) = record.stages.get_mut(&stage.key()) {
                    state.status = crate::state_persist::StageStatus::Running;
                    state.attempts += 1;
                    state.started_at = Some(now_wall);
                }
            }
        })?;

        for stage in eligible {
            self.queue.push(ReadyItem {
                task_id: task_id.to_string(),
                stage,
                eligible_since: now_instant,
            });
        }
        Ok(())
    }

    /// The task file layout this supervisor was constructed with, so a
    /// caller can place input files before the pipeline starts.
    pub fn layout(&self) -> &TaskLayout {
        &self.layout
    }

    /// Reads `state.json` fresh from disk without mutating it, for a
    /// caller that just wants to know where a task currently stands.
    pub fn state_snapshot(&self, task_id: &str) -> Result<StateRecord> {
        self.state_store
            .load(&self.layout.state_path(task_id), task_id)
    }

    pub fn progress_bus(&self, task_id: &str) -> Option<ProgressBus> {
        self.runtimes
            .lock_unpoisoned()
            .get(task_id)
            .map(|r| r.bus.clone())
    }

    pub fn cancellation_token(&self, task_id: &str) -> Option<CancellationToken> {
        self.runtimes
            .lock_unpoisoned()
            .get(task_id)
            .map(|r| r.cancel.clone())
    }

    /// Cooperative: flips the task's cancellation token so every running
    /// stage's worker receives SIGTERM at its next poll, then drops this
    /// task's power guard.
    pub fn cancel_task(&self, task_id: &str) -> Result<()> {
        if let Some(runtime) = self.runtimes.lock_unpoisoned().get(task_id) {
            runtime.cancel.cancel();
        }
        if let Some(bus) = self.progress_bus(task_id) {
            bus.close();
        }
        self.power_guards.lock_unpoisoned().remove(task_id);
        Ok(())
    }

    /// Cancels, then recursively removes the task's on-disk tree.
    pub fn delete_task(&self, task_id: &str) -> Result<()> {
        self.cancel_task(task_id)?;
        self.layout.delete_task(task_id)?;
        self.runtimes.lock_unpoisoned().remove(task_id);
        Ok(())
    }

    /// Scans the task root for every directory with a `state.json`,
    /// demotes crashed `running` stages to `pending`, persists that
    /// demotion, and returns the list without starting anything.
    pub fn scan_resumable(&self, task_root: &std::path::Path) -> Result<Vec<ResumableTask>> {
        let mut resumable = Vec::new();
        let entries = std::fs::read_dir(task_root).map_err(|source| {
            OrchestratorError::StateWriteFailed {
                path: task_root.to_path_buf(),
                source,
            }
        })?;

        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let Some(task_id) = path.file_name().and_then(|n| n.to_str()).map(str::to_string)
            else {
                continue;
            };
            let state_path = self.layout.state_path(&task_id);
            if !state_path.exists() {
                continue;
            }

            let record = self
                .state_store
                .update(&state_path, &task_id, |record| {
                    record.mark_crashed_stages_retryable();
                })?;

            let all_done = record.stages.values().all(|s| s.status == crate::state_persist::StageStatus::Done);
            if !all_done {
                resumable.push(ResumableTask {
                    task_id: task_id.clone(),
                    state: record,
                });
            }

            self.runtimes.lock_unpoisoned().entry(task_id).or_insert_with(|| TaskRuntime {
                cancel: CancellationToken::new(),
                bus: ProgressBus::new(),
            });
        }

        Ok(resumable)
    }
}
