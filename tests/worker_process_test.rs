//! Exercises [`run_worker`] against a real child process (`mock_worker_test_helper`)
//! rather than an in-process fake, covering the cases the unit tests in
//! `src/worker/spawn.rs` can't: actual progress-line delivery, exit-code
//! mapping, timeout, and cooperative cancellation of a live child.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use dubctl_core::worker::{run_worker, CancellationToken, WorkerSpawnOptions};

fn mock_worker_path() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_mock_worker_test_helper"))
}

fn opts(env_overlay: HashMap<String, String>, timeout: Option<Duration>) -> WorkerSpawnOptions {
    let tmp = tempfile::NamedTempFile::new().unwrap();
    WorkerSpawnOptions {
        program: mock_worker_path(),
        config_path: tmp.path().to_path_buf(),
        env_overlay,
        timeout,
        silence_timeout: None,
        cancel: CancellationToken::new(),
    }
}

#[test]
fn successful_run_returns_parsed_result_and_reports_progress() {
    let mut env = HashMap::new();
    env.insert("MOCK_WORKER_PROGRESS".to_string(), "1/2,2/2".to_string());
    env.insert(
        "MOCK_WORKER_RESULT_JSON".to_string(),
        "{\"status\":\"ok\",\"translated\":3}".to_string(),
    );

    let mut seen = Vec::new();
    let outcome = run_worker(opts(env, None), |done, total| seen.push((done, total))).unwrap();

    assert_eq!(seen, vec![(1, 2), (2, 2)]);
    assert_eq!(outcome.result["status"], "ok");
    assert_eq!(outcome.result["translated"], 3);
}

#[test]
fn nonzero_exit_surfaces_as_worker_exit_nonzero_with_stderr_tail() {
    let mut env = HashMap::new();
    env.insert("MOCK_WORKER_EXIT_CODE".to_string(), "7".to_string());

    let err = run_worker(opts(env, None), |_, _| {}).unwrap_err();
    match err {
        dubctl_core::OrchestratorError::WorkerExitNonzero { code, tail } => {
            assert_eq!(code, Some(7));
            assert!(tail.contains("failing on purpose"));
        }
        other => panic!("expected WorkerExitNonzero, got {other:?}"),
    }
}

#[test]
fn exceeding_timeout_terminates_the_child_and_returns_worker_timeout() {
    let mut env = HashMap::new();
    env.insert("MOCK_WORKER_SLEEP_MS".to_string(), "2000".to_string());

    let err = run_worker(opts(env, Some(Duration::from_millis(100))), |_, _| {}).unwrap_err();
    assert!(matches!(err, dubctl_core::OrchestratorError::WorkerTimeout(_)));
}

#[test]
fn silence_with_no_output_terminates_the_child_and_returns_worker_silence_timeout() {
    let mut env = HashMap::new();
    // No MOCK_WORKER_PROGRESS, so the child emits nothing on either stream
    // until it exits - the silence window should fire well before then.
    env.insert("MOCK_WORKER_SLEEP_MS".to_string(), "2000".to_string());

    let mut spawn_opts = opts(env, None);
    spawn_opts.silence_timeout = Some(Duration::from_millis(100));

    let err = run_worker(spawn_opts, |_, _| {}).unwrap_err();
    assert!(matches!(
        err,
        dubctl_core::OrchestratorError::WorkerSilenceTimeout(_)
    ));
}

#[test]
fn progress_output_resets_the_silence_window() {
    let mut env = HashMap::new();
    // Emits a line every 20ms for a while, then the process exits
    // successfully - the silence window (100ms) never sees a 100ms gap.
    env.insert(
        "MOCK_WORKER_PROGRESS".to_string(),
        "1/5,2/5,3/5,4/5,5/5".to_string(),
    );

    let mut spawn_opts = opts(env, None);
    spawn_opts.silence_timeout = Some(Duration::from_millis(100));

    let outcome = run_worker(spawn_opts, |_, _| {}).unwrap();
    assert_eq!(outcome.result["status"], "ok");
}

#[test]
fn cancelling_mid_run_terminates_the_child_and_returns_cancelled() {
    let mut env = HashMap::new();
    env.insert("MOCK_WORKER_SLEEP_MS".to_string(), "2000".to_string());

    let spawn_opts = opts(env, None);
    let cancel = spawn_opts.cancel.clone();

    let handle = std::thread::spawn(move || run_worker(spawn_opts, |_, _| {}));
    std::thread::sleep(Duration::from_millis(100));
    cancel.cancel();

    let result = handle.join().unwrap();
    assert!(matches!(result, Err(dubctl_core::OrchestratorError::Cancelled)));
}
