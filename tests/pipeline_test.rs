//! End-to-end scenarios for [`Supervisor`] driven by an in-process fake
//! [`StageExecutor`] (no real worker process involved, matching the unit
//! test style already used inside `src/supervisor.rs` — these tests add
//! multi-stage, multi-language, and crash/resume coverage that a single
//! module's tests can't reach on their own).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use dubctl_core::layout::TaskLayout;
use dubctl_core::scheduler::StageExecutor;
use dubctl_core::stage_graph::StageId;
use dubctl_core::state_persist::StageStatus;
use dubctl_core::supervisor::Supervisor;

/// Marks every stage it is asked to run as immediately done, recording the
/// execution order so tests can assert the DAG was actually respected.
struct ImmediateExecutor {
    layout: TaskLayout,
    order: Mutex<Vec<String>>,
}

impl StageExecutor for ImmediateExecutor {
    fn execute(&self, task_id: &str, stage: &StageId) {
        self.order.lock().unwrap().push(stage.key());
        let state_store = dubctl_core::state_persist::StateStore::new();
        state_store
            .update(&self.layout.state_path(task_id), task_id, |record| {
                let state = record.stages.get_mut(&stage.key()).unwrap();
                state.status = StageStatus::Done;
                state.finished_at = Some(chrono::Utc::now());
            })
            .unwrap();
    }
}

fn drive_to_completion(supervisor: &Supervisor<ImmediateExecutor>, task_id: &str) {
    for _ in 0..64 {
        supervisor.enqueue_eligible(task_id).unwrap();
        let record = supervisor.state_snapshot(task_id).unwrap();
        if record
            .stages
            .values()
            .all(|s| s.status == StageStatus::Done)
        {
            return;
        }
        std::thread::sleep(std::time::Duration::from_millis(20));
    }
    panic!("task {task_id} did not settle in time");
}

#[test]
fn single_language_task_runs_every_stage_to_completion_in_dag_order() {
    let tmp = tempfile::tempdir().unwrap();
    let layout = TaskLayout::new(tmp.path());
    let executor = Arc::new(ImmediateExecutor {
        layout: layout.clone(),
        order: Mutex::new(Vec::new()),
    });
    let supervisor = Supervisor::new(layout, 2, executor.clone());

    let task_id = supervisor.create_task(vec!["en".to_string()]).unwrap();
    drive_to_completion(&supervisor, &task_id);

    let order = executor.order.lock().unwrap();
    let pos = |key: &str| order.iter().position(|k| k == key).unwrap();
    assert!(pos("extract_audio") < pos("asr"));
    assert!(pos("asr") < pos("diarize"));
    assert!(pos("diarize") < pos("build_references"));
    assert!(pos("build_references") < pos("translate.en"));
    assert!(pos("translate.en") < pos("validate_length.en"));
    assert!(pos("validate_length.en") < pos("clone_voice.en"));
    assert!(pos("clone_voice.en") < pos("stitch_audio.en"));
    assert!(pos("stitch_audio.en") < pos("mux_video.en"));
}

#[test]
fn multi_language_task_runs_each_target_independently_after_shared_stages() {
    let tmp = tempfile::tempdir().unwrap();
    let layout = TaskLayout::new(tmp.path());
    let executor = Arc::new(ImmediateExecutor {
        layout: layout.clone(),
        order: Mutex::new(Vec::new()),
    });
    let supervisor = Supervisor::new(layout, 4, executor.clone());

    let task_id = supervisor
        .create_task(vec!["en".to_string(), "ja".to_string(), "ko".to_string()])
        .unwrap();
    drive_to_completion(&supervisor, &task_id);

    let record = supervisor.state_snapshot(&task_id).unwrap();
    for lang in ["en", "ja", "ko"] {
        assert_eq!(
            record.stages[&format!("mux_video.{lang}")].status,
            StageStatus::Done
        );
    }
}

#[test]
fn enqueue_eligible_is_idempotent_under_repeated_polling() {
    // Regression test for the claim-before-enqueue fix: calling
    // `enqueue_eligible` many times in a row before a stage finishes must
    // never push duplicate `ReadyItem`s for it.
    let tmp = tempfile::tempdir().unwrap();
    let layout = TaskLayout::new(tmp.path());

    struct CountingExecutor {
        layout: TaskLayout,
        runs: Mutex<HashMap<String, u32>>,
    }
    impl StageExecutor for CountingExecutor {
        fn execute(&self, task_id: &str, stage: &StageId) {
            *self.runs.lock().unwrap().entry(stage.key()).or_insert(0) += 1;
            // Simulate slow work so repeated polling has a chance to race.
            std::thread::sleep(std::time::Duration::from_millis(50));
            let state_store = dubctl_core::state_persist::StateStore::new();
            state_store
                .update(&self.layout.state_path(task_id), task_id, |record| {
                    record.stages.get_mut(&stage.key()).unwrap().status = StageStatus::Done;
                })
                .unwrap();
        }
    }

    let executor = Arc::new(CountingExecutor {
        layout: layout.clone(),
        runs: Mutex::new(HashMap::new()),
    });
    let supervisor = Supervisor::new(layout, 1, executor.clone());
    let task_id = supervisor.create_task(vec!["en".to_string()]).unwrap();

    for _ in 0..10 {
        supervisor.enqueue_eligible(&task_id).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
    }

    std::thread::sleep(std::time::Duration::from_millis(200));
    assert_eq!(executor.runs.lock().unwrap()["extract_audio"], 1);
}

#[test]
fn scan_resumable_picks_up_a_task_left_running_by_a_simulated_crash() {
    struct NoopExecutor;
    impl StageExecutor for NoopExecutor {
        fn execute(&self, _task_id: &str, _stage: &StageId) {}
    }

    let tmp = tempfile::tempdir().unwrap();
    let layout = TaskLayout::new(tmp.path());

    // First "process": create the task, claim its first stage, then "crash"
    // by dropping the supervisor without ever marking it done.
    {
        let supervisor = Supervisor::new(layout.clone(), 1, Arc::new(NoopExecutor));
        let task_id = supervisor.create_task(vec!["en".to_string()]).unwrap();
        supervisor.enqueue_eligible(&task_id).unwrap();
        let record = supervisor.state_snapshot(&task_id).unwrap();
        assert_eq!(
            record.stages["extract_audio"].status,
            StageStatus::Running
        );
    }

    // Second "process": a fresh supervisor over the same task root finds
    // the crashed stage and demotes it back to pending.
    let supervisor = Supervisor::new(layout.clone(), 1, Arc::new(NoopExecutor));
    let resumable = supervisor.scan_resumable(tmp.path()).unwrap();
    assert_eq!(resumable.len(), 1);
    assert_eq!(
        resumable[0].state.stages["extract_audio"].status,
        StageStatus::Pending
    );
}
