//! The bounded worker pool, the GPU-exclusive token, fair queuing, and the
//! retry policy that turns [`crate::stage_graph`]'s eligibility computation
//! into actual stage executions.
//!
//! A fixed set of named OS threads pulling from a `Mutex`/`Condvar`-guarded
//! queue, using `CondvarExt::wait_unpoisoned` instead of a raw channel so a
//! panicking worker can never poison the queue for the others.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::stage_graph::{PerLanguageStage, StageId};
use crate::sync_ext::{CondvarExt, MutexExt};

/// Default worker-failure retry budget; parse errors (malformed worker
/// output) get only one attempt since retrying won't change a parser bug.
pub const DEFAULT_MAX_ATTEMPTS_WORKER_FAILURE: u32 = 2;
pub const DEFAULT_MAX_ATTEMPTS_PARSE_ERROR: u32 = 1;

/// Whether a just-failed stage should be retried, given its failure kind
/// and the number of attempts already made (including the one that just
/// failed).
pub fn should_retry(error_kind: &str, attempts_made: u32) -> bool {
    let max_attempts = match error_kind {
        "WORKER_OUTPUT_MALFORMED" => DEFAULT_MAX_ATTEMPTS_PARSE_ERROR,
        _ => DEFAULT_MAX_ATTEMPTS_WORKER_FAILURE,
    };
    attempts_made < max_attempts
}

/// A stage that has become eligible and is waiting for a worker pool slot.
#[derive(Debug, Clone)]
pub struct ReadyItem {
    pub task_id: String,
    pub stage: StageId,
    pub eligible_since: Instant,
}

/// Lower is "closer to completion of its target language" and wins ties in
/// the fairness ordering, favoring finishing one target language over
/// spreading work evenly across several.
fn completion_distance(stage: &StageId) -> u8 {
    match stage {
        StageId::PerLanguage(PerLanguageStage::MuxVideo, _) => 0,
        StageId::PerLanguage(PerLanguageStage::StitchAudio, _) => 1,
        StageId::PerLanguage(PerLanguageStage::CloneVoice, _) => 2,
        StageId::PerLanguage(PerLanguageStage::ValidateLength, _) => 3,
        StageId::PerLanguage(PerLanguageStage::Translate, _) => 4,
        StageId::Shared(_) => 5,
    }
}

/// FIFO by eligibility time; ties broken by completion distance.
fn fairness_key(item: &ReadyItem) -> (Instant, u8) {
    (item.eligible_since, completion_distance(&item.stage))
}

struct QueueState {
    items: VecDeque<ReadyItem>,
    shutdown: bool,
}

/// The process-global ready queue every worker thread pulls from.
pub struct ReadyQueue {
    state: Mutex<QueueState>,
    cv: std::sync::Condvar,
}

impl Default for ReadyQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl ReadyQueue {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::new(),
                shutdown: false,
            }),
            cv: std::sync::Condvar::new(),
        }
    }

    pub fn push(&self, item: ReadyItem) {
        let mut state = self.state.lock_unpoisoned();
        state.items.push_back(item);
        drop(state);
        self.cv.notify_all();
    }

    pub fn shutdown(&self) {
        let mut state = self.state.lock_unpoisoned();
        state.shutdown = true;
        drop(state);
        self.cv.notify_all();
    }

    /// Block until an item can run given the current GPU-exclusive
    /// occupancy, or return `None` once shut down with nothing left
    /// runnable. `gpu_busy` is consulted fresh on every wake so a GPU slot
    /// freeing up elsewhere unblocks a waiting exclusive stage.
    fn pop_ready(&self, gpu_busy: &AtomicBool) -> Option<ReadyItem> {
        let mut state = self.state.lock_unpoisoned();
        loop {
            let items: Vec<_> = state.items.iter().cloned().collect();
            let mut ordered: Vec<(usize, ReadyItem)> = items.into_iter().enumerate().collect();
            ordered.sort_by_key(|(_, item)| fairness_key(item));

            let pick = ordered
                .into_iter()
                .find(|(_, item)| !item.stage.is_gpu_exclusive() || !gpu_busy.load(Ordering::SeqCst));

            if let Some((idx, _)) = pick {
                return Some(state.items.remove(idx).unwrap());
            }

            if state.shutdown && state.items.is_empty() {
                return None;
            }

            state = self.cv.wait_unpoisoned(state);
        }
    }
}

/// Executes one stage. Implemented by the job supervisor, which knows how
/// to turn a [`StageId`] into a worker config and interpret its result; the
/// scheduler only knows how to pick and throttle, never how to run.
pub trait StageExecutor: Send + Sync {
    fn execute(&self, task_id: &str, stage: &StageId);
}

/// A fixed set of OS threads draining `queue`, each acquiring the
/// GPU-exclusive token (a `Mutex<()>` held for the stage's duration, i.e. a
/// semaphore of size 1) before running a GPU-exclusive stage.
pub struct WorkerPool {
    handles: Vec<std::thread::JoinHandle<()>>,
}

impl WorkerPool {
    pub fn spawn(
        size: usize,
        queue: Arc<ReadyQueue>,
        gpu_token: Arc<Mutex<()>>,
        executor: Arc<dyn StageExecutor>,
    ) -> Self {
        let gpu_busy = Arc::new(AtomicBool::new(false));
        let handles = (0..size.max(1))
            .map(|index| {
                let queue = queue.clone();
                let gpu_token = gpu_token.clone();
                let gpu_busy = gpu_busy.clone();
                let executor = executor.clone();
                std::thread::Builder::new()
                    .name(format!("dubctl-worker-{index}"))
                    .spawn(move || worker_loop(&queue, &gpu_token, &gpu_busy, executor.as_ref()))
                    .expect("failed to spawn scheduler worker thread")
            })
            .collect();
        Self { handles }
    }

    pub fn join(self) {
        for handle in self.handles {
            let _ = handle.join();
        }
    }
}

fn worker_loop(
    queue: &ReadyQueue,
    gpu_token: &Mutex<()>,
    gpu_busy: &AtomicBool,
    executor: &dyn StageExecutor,
) {
    while let Some(item) = queue.pop_ready(gpu_busy) {
        if item.stage.is_gpu_exclusive() {
            let _guard = gpu_token.lock_unpoisoned();
            gpu_busy.store(true, Ordering::SeqCst);
            executor.execute(&item.task_id, &item.stage);
            gpu_busy.store(false, Ordering::SeqCst);
        } else {
            executor.execute(&item.task_id, &item.stage);
        }
    }
}

/// Tracks how many GPU-exclusive stages are concurrently mid-execution;
/// exists only to make the single-GPU-exclusive-stage-at-a-time guarantee
/// checkable in tests, not used for control flow (the `Mutex` guard already
/// enforces the limit).
#[derive(Default)]
pub struct GpuConcurrencyGauge(AtomicU32);

impl GpuConcurrencyGauge {
    pub fn enter(&self) -> u32 {
        self.0.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn exit(&self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage_graph::SharedStage;
    use std::sync::mpsc;

    #[test]
    fn retries_worker_failure_up_to_default_budget() {
        assert!(should_retry("WORKER_EXIT_NONZERO", 1));
        assert!(!should_retry("WORKER_EXIT_NONZERO", 2));
    }

    #[test]
    fn parse_errors_get_only_one_attempt() {
        assert!(!should_retry("WORKER_OUTPUT_MALFORMED", 1));
    }

    #[test]
    fn fairness_prefers_earlier_eligibility_time() {
        let now = Instant::now();
        let earlier = ReadyItem {
            task_id: "t1".to_string(),
            stage: StageId::PerLanguage(PerLanguageStage::Translate, "en".to_string()),
            eligible_since: now,
        };
        let later = ReadyItem {
            task_id: "t1".to_string(),
            stage: StageId::PerLanguage(PerLanguageStage::MuxVideo, "ja".to_string()),
            eligible_since: now + Duration::from_millis(1),
        };
        assert!(fairness_key(&earlier) < fairness_key(&later));
    }

    #[test]
    fn fairness_tie_break_prefers_stage_closer_to_completion() {
        let now = Instant::now();
        let translate = ReadyItem {
            task_id: "t1".to_string(),
            stage: StageId::PerLanguage(PerLanguageStage::Translate, "en".to_string()),
            eligible_since: now,
        };
        let mux = ReadyItem {
            task_id: "t1".to_string(),
            stage: StageId::PerLanguage(PerLanguageStage::MuxVideo, "ja".to_string()),
            eligible_since: now,
        };
        assert!(fairness_key(&mux) < fairness_key(&translate));
    }

    struct RecordingExecutor {
        tx: Mutex<mpsc::Sender<(String, StageId)>>,
    }

    impl StageExecutor for RecordingExecutor {
        fn execute(&self, task_id: &str, stage: &StageId) {
            let _ = self
                .tx
                .lock_unpoisoned()
                .send((task_id.to_string(), stage.clone()));
        }
    }

    #[test]
    fn worker_pool_drains_queue_and_shuts_down_cleanly() {
        let queue = Arc::new(ReadyQueue::new());
        let gpu_token = Arc::new(Mutex::new(()));
        let (tx, rx) = mpsc::channel();
        let executor = Arc::new(RecordingExecutor { tx: Mutex::new(tx) });

        queue.push(ReadyItem {
            task_id: "t1".to_string(),
            stage: StageId::Shared(SharedStage::ExtractAudio),
            eligible_since: Instant::now(),
        });

        let pool = WorkerPool::spawn(2, queue.clone(), gpu_token, executor);
        let (task_id, stage) = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(task_id, "t1");
        assert_eq!(stage, StageId::Shared(SharedStage::ExtractAudio));

        queue.shutdown();
        pool.join();
    }

    #[test]
    fn gpu_exclusive_stages_never_run_concurrently() {
        let queue = Arc::new(ReadyQueue::new());
        let gpu_token = Arc::new(Mutex::new(()));
        let gauge = Arc::new(GpuConcurrencyGauge::default());
        let max_seen = Arc::new(AtomicU32::new(0));

        struct GaugeExecutor {
            gauge: Arc<GpuConcurrencyGauge>,
            max_seen: Arc<AtomicU32>,
        }
        impl StageExecutor for GaugeExecutor {
            fn execute(&self, _task_id: &str, stage: &StageId) {
                if stage.is_gpu_exclusive() {
                    let now = self.gauge.enter();
                    self.max_seen.fetch_max(now, Ordering::SeqCst);
                    std::thread::sleep(Duration::from_millis(20));
                    self.gauge.exit();
                }
            }
        }

        let executor = Arc::new(GaugeExecutor {
            gauge: gauge.clone(),
            max_seen: max_seen.clone(),
        });

        for lang in ["en", "ja", "ko"] {
            queue.push(ReadyItem {
                task_id: "t1".to_string(),
                stage: StageId::PerLanguage(PerLanguageStage::Translate, lang.to_string()),
                eligible_since: Instant::now(),
            });
        }

        let pool = WorkerPool::spawn(3, queue.clone(), gpu_token, executor);
        std::thread::sleep(Duration::from_millis(200));
        queue.shutdown();
        pool.join();

        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }
}
