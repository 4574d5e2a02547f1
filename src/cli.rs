//! Argument parsing and subcommand dispatch for the `dubctl` binary.
//!
//! A top-level `Cli` struct holds global flags plus a `Command` enum; `run`
//! does the actual work and `main` stays a thin exit-code shim.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};

use dubctl_core::config::Config;
use dubctl_core::layout::TaskLayout;
use dubctl_core::state_persist::StateStore;
use dubctl_core::supervisor::Supervisor;

use crate::cli_executor::{is_task_settled, summarize, CliExecutor};

#[derive(Parser)]
#[command(name = "dubctl", about = "Local video-dubbing pipeline orchestrator")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Root directory every task's files live under.
    #[arg(long, global = true, default_value = "tasks")]
    pub tasks_dir: PathBuf,
}

#[derive(Subcommand)]
pub enum Command {
    /// Register a new dubbing task and copy its inputs into place.
    Create {
        #[arg(long)]
        video: PathBuf,
        #[arg(long)]
        subtitle: PathBuf,
        #[arg(long = "target", required = true)]
        targets: Vec<String>,
    },
    /// Run a task's pipeline to completion (or until cancelled/failed).
    Start { task_id: String },
    /// Request cancellation of a task's in-flight work.
    Cancel { task_id: String },
    /// Remove a task's entire on-disk tree.
    Delete { task_id: String },
    /// Print one task's stage statuses, or every task's if omitted.
    Status { task_id: Option<String> },
    /// List tasks left incomplete by a previous crash, without starting them.
    ResumeList,
}

fn build_supervisor(tasks_dir: &std::path::Path, config: &Config) -> (Arc<Supervisor<CliExecutor>>, Arc<CliExecutor>) {
    let layout = TaskLayout::new(tasks_dir);
    let state_store = Arc::new(StateStore::new());
    let executor = Arc::new(CliExecutor::new(
        layout.clone(),
        state_store,
        config.max_translation_retries,
        config.models_dir.clone(),
    ));
    let supervisor = Arc::new(Supervisor::new(layout, config.worker_pool_size, executor.clone()));
    (supervisor, executor)
}

pub async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = Config::from_env();

    match cli.command {
        Command::Create { video, subtitle, targets } => {
            let (supervisor, _executor) = build_supervisor(&cli.tasks_dir, &config);
            let task_id = supervisor.create_task(targets)?;

            let layout = supervisor.layout();
            let input_dir = layout.input_dir(&task_id);
            let video_dest = input_dir.join(
                video.file_name().ok_or_else(|| anyhow::anyhow!("--video has no file name"))?,
            );
            std::fs::copy(&video, &video_dest)?;

            let processed_dir = layout.processed_dir(&task_id);
            std::fs::create_dir_all(&processed_dir)?;
            std::fs::copy(&subtitle, layout.source_subtitle_path(&task_id))?;

            println!("{task_id}");
            Ok(())
        }

        Command::Start { task_id } => {
            let (supervisor, executor) = build_supervisor(&cli.tasks_dir, &config);
            supervisor.scan_resumable(&cli.tasks_dir)?;
            supervisor.enqueue_eligible(&task_id)?;

            let driver_supervisor = supervisor.clone();
            let driver_task_id = task_id.clone();
            let mut driver = tokio::task::spawn_blocking(move || {
                drive_to_completion(&driver_supervisor, &driver_task_id)
            });

            tokio::select! {
                result = &mut driver => {
                    result??;
                }
                _ = tokio::signal::ctrl_c() => {
                    eprintln!("cancelling {task_id}, waiting for in-flight workers to stop...");
                    executor.cancel(&task_id);
                    supervisor.cancel_task(&task_id)?;
                    // Join rather than abandon: the driver loop stops
                    // claiming new stages once it observes the
                    // cancellation and returns once the in-flight one
                    // actually exits (worker::run_worker's own grace
                    // period bounds how long that takes).
                    let _ = driver.await;
                }
            }
            Ok(())
        }

        Command::Cancel { task_id } => {
            let (supervisor, executor) = build_supervisor(&cli.tasks_dir, &config);
            executor.cancel(&task_id);
            supervisor.cancel_task(&task_id)?;
            Ok(())
        }

        Command::Delete { task_id } => {
            let (supervisor, _executor) = build_supervisor(&cli.tasks_dir, &config);
            supervisor.delete_task(&task_id)?;
            Ok(())
        }

        Command::Status { task_id } => {
            let (supervisor, _executor) = build_supervisor(&cli.tasks_dir, &config);
            match task_id {
                Some(id) => print_status(&supervisor, &id)?,
                None => {
                    for entry in std::fs::read_dir(&cli.tasks_dir).into_iter().flatten().flatten() {
                        if let Some(id) = entry.file_name().to_str() {
                            if entry.path().join("state.json").exists() {
                                print_status(&supervisor, id)?;
                            }
                        }
                    }
                }
            }
            Ok(())
        }

        Command::ResumeList => {
            let (supervisor, _executor) = build_supervisor(&cli.tasks_dir, &config);
            std::fs::create_dir_all(&cli.tasks_dir)?;
            let resumable = supervisor.scan_resumable(&cli.tasks_dir)?;
            if resumable.is_empty() {
                println!("no incomplete tasks");
            }
            for task in resumable {
                println!("{}\ttargets={}", task.task_id, task.state.targets.join(","));
            }
            Ok(())
        }
    }
}

fn print_status(supervisor: &Supervisor<CliExecutor>, task_id: &str) -> anyhow::Result<()> {
    let record = supervisor.state_snapshot(task_id)?;
    println!("{task_id}");
    let mut keys: Vec<_> = record.stages.keys().collect();
    keys.sort();
    for key in keys {
        let stage = &record.stages[key];
        println!("  {key:<24} {:?} (attempts={})", stage.status, stage.attempts);
    }
    Ok(())
}

/// Polls `state.json` until every stage is out of `pending`/`running`,
/// re-enqueueing newly-eligible stages each time the snapshot changes.
/// Runs on a blocking thread because [`Supervisor::enqueue_eligible`] and
/// the state store it reads both block on `std::sync` primitives.
fn drive_to_completion(supervisor: &Supervisor<CliExecutor>, task_id: &str) -> anyhow::Result<()> {
    const POLL_INTERVAL: Duration = Duration::from_millis(250);
    let mut last_summary = String::new();

    loop {
        let record = supervisor.state_snapshot(task_id)?;
        let summary = summarize(&record.stages);
        let rendered = {
            let mut v: Vec<_> = summary.into_iter().collect();
            v.sort();
            v.join(",")
        };
        if rendered != last_summary {
            tracing::info!(task_id, statuses = %rendered, "stage statuses changed");
            last_summary = rendered;
        }

        if is_task_settled(&record.stages) {
            return Ok(());
        }

        let cancelled = supervisor
            .cancellation_token(task_id)
            .map(|t| t.is_cancelled())
            .unwrap_or(false);
        let nothing_in_flight = !record
            .stages
            .values()
            .any(|s| s.status == dubctl_core::state_persist::StageStatus::Running);
        if cancelled && nothing_in_flight {
            return Ok(());
        }
        if !cancelled {
            supervisor.enqueue_eligible(task_id)?;
        }
        std::thread::sleep(POLL_INTERVAL);
    }
}
