//! Process spawning, multiplexed draining, and the exit-code taxonomy for a
//! single worker invocation.
//!
//! A dedicated reader thread per pipe, a short poll interval on the main
//! loop, and `try_wait` rather than a blocking `wait` so cancellation and
//! timeouts can be checked in between.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::{OrchestratorError, Result};

use super::pump::{extract_last_json_object, parse_progress_line, LinePump};

const POLL_INTERVAL: Duration = Duration::from_millis(50);
const KILL_GRACE_PERIOD: Duration = Duration::from_secs(2);
const STDERR_TAIL_LINES: usize = 20;

/// Cooperative cancellation flag shared between a stage's caller and its
/// running worker. Checked at every suspension point in the poll loop.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

pub struct WorkerSpawnOptions {
    pub program: PathBuf,
    pub config_path: PathBuf,
    pub env_overlay: HashMap<String, String>,
    pub timeout: Option<Duration>,
    /// Independent of `timeout`: killed if no stdout/stderr line arrives for
    /// this long, even while the overall run is still within its hard limit.
    /// Catches a worker stuck on startup (e.g. a hung model load) long
    /// before the much longer overall ceiling would.
    pub silence_timeout: Option<Duration>,
    pub cancel: CancellationToken,
}

/// Result of a worker run that reached a final JSON result.
#[derive(Debug)]
pub struct WorkerOutcome {
    pub result: serde_json::Value,
}

/// Spawn `program` with `config_path` as its sole argument, drain stdout and
/// stderr concurrently, forward progress lines to `on_progress`, and return
/// the worker's final JSON result.
///
/// `on_progress` receives `(done, total)` parsed from `[<tag>] progress:
/// N/M` lines on stderr (or stdout, if the worker merges the two streams).
pub fn run_worker(
    opts: WorkerSpawnOptions,
    mut on_progress: impl FnMut(u64, u64),
) -> Result<WorkerOutcome> {
    let mut cmd = Command::new(&opts.program);
    cmd.arg(&opts.config_path);
    for (key, value) in &opts.env_overlay {
        cmd.env(key, value);
    }
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());

    let mut child = cmd
        .spawn()
        .map_err(|source| OrchestratorError::WorkerSpawnFailed {
            program: opts.program.display().to_string(),
            source,
        })?;

    let stdout = child.stdout.take();
    let stderr = child.stderr.take().expect("stderr was piped");

    let mut stderr_pump = LinePump::spawn(stderr);
    let mut stdout_pump = stdout.map(LinePump::spawn);

    let mut stdout_lines: Vec<String> = Vec::new();
    let mut stderr_tail: Vec<String> = Vec::new();

    let start = Instant::now();
    let mut last_activity = Instant::now();
    let status = loop {
        if opts.cancel.is_cancelled() {
            terminate_child(&mut child);
            stderr_pump.join();
            return Err(OrchestratorError::Cancelled);
        }

        if let Some(limit) = opts.timeout {
            if start.elapsed() > limit {
                terminate_child(&mut child);
                stderr_pump.join();
                return Err(OrchestratorError::WorkerTimeout(limit));
            }
        }

        if let Some(limit) = opts.silence_timeout {
            if last_activity.elapsed() > limit {
                terminate_child(&mut child);
                stderr_pump.join();
                return Err(OrchestratorError::WorkerSilenceTimeout(limit));
            }
        }

        if let Some(line) = stderr_pump.recv_timeout(POLL_INTERVAL) {
            record_line(line, false, &mut stdout_lines, &mut stderr_tail, &mut on_progress);
            last_activity = Instant::now();
        }

        if let Some(pump) = stdout_pump.as_mut() {
            let mut batch = Vec::new();
            pump.drain_available(|line| batch.push(line));
            if !batch.is_empty() {
                last_activity = Instant::now();
            }
            for line in batch {
                record_line(line, true, &mut stdout_lines, &mut stderr_tail, &mut on_progress);
            }
        }

        if let Some(status) = child
            .try_wait()
            .map_err(|source| OrchestratorError::WorkerSpawnFailed {
                program: opts.program.display().to_string(),
                source,
            })?
        {
            let mut batch = Vec::new();
            stderr_pump.drain_available(|line| batch.push(line));
            for line in batch {
                record_line(line, false, &mut stdout_lines, &mut stderr_tail, &mut on_progress);
            }
            if let Some(pump) = stdout_pump.as_mut() {
                let mut batch = Vec::new();
                pump.drain_available(|line| batch.push(line));
                for line in batch {
                    record_line(line, true, &mut stdout_lines, &mut stderr_tail, &mut on_progress);
                }
            }
            break status;
        }
    };
    stderr_pump.join();

    if !status.success() {
        return Err(OrchestratorError::WorkerExitNonzero {
            code: status.code(),
            tail: stderr_tail.join("\n"),
        });
    }

    let combined = stdout_lines.join("\n");
    let result = extract_last_json_object(&combined).ok_or_else(|| {
        OrchestratorError::WorkerOutputMalformed(
            "no balanced JSON object found in worker stdout".to_string(),
        )
    })?;

    Ok(WorkerOutcome { result })
}

fn record_line(
    line: String,
    is_stdout: bool,
    stdout_lines: &mut Vec<String>,
    stderr_tail: &mut Vec<String>,
    on_progress: &mut impl FnMut(u64, u64),
) {
    if let Some((done, total)) = parse_progress_line(&line) {
        on_progress(done, total);
    } else {
        tracing::debug!(line = %line, stdout = is_stdout, "worker output");
    }
    if is_stdout {
        stdout_lines.push(line);
    } else {
        stderr_tail.push(line);
        if stderr_tail.len() > STDERR_TAIL_LINES {
            stderr_tail.remove(0);
        }
    }
}

/// SIGTERM-equivalent first, then SIGKILL-equivalent after a grace period.
/// Best-effort: the direct child is guaranteed to be targeted; any
/// transitive grandchildren the worker itself spawned are the worker's
/// responsibility to reap on receiving the first signal.
fn terminate_child(child: &mut std::process::Child) {
    #[cfg(unix)]
    {
        let pid = child.id() as i32;
        unsafe {
            libc_kill(pid, 15); // SIGTERM
        }
    }
    #[cfg(not(unix))]
    {
        let _ = child.kill();
    }

    let deadline = Instant::now() + KILL_GRACE_PERIOD;
    while Instant::now() < deadline {
        if matches!(child.try_wait(), Ok(Some(_))) {
            return;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
    let _ = child.kill();
    let _ = child.wait();
}

#[cfg(unix)]
unsafe fn libc_kill(pid: i32, sig: i32) {
    extern "C" {
        fn kill(pid: i32, sig: i32) -> i32;
    }
    kill(pid, sig);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancellation_token_reflects_cancel_call() {
        let token = CancellationToken::new();
        assert!(!token.is_cancelled());
        token.cancel();
        assert!(token.is_cancelled());
    }

    #[test]
    fn cancellation_token_clones_share_state() {
        let token = CancellationToken::new();
        let clone = token.clone();
        clone.cancel();
        assert!(token.is_cancelled());
    }
}
