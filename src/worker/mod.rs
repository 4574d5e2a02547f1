//! Worker invocation: spawning an external tool with a JSON config,
//! multiplexing its stdout/stderr, and mapping its exit into the
//! orchestrator's result/error taxonomy.

mod config;
mod pump;
mod spawn;

pub use config::WorkerConfig;
pub use pump::{extract_last_json_object, parse_progress_line};
pub use spawn::{CancellationToken, WorkerOutcome, WorkerSpawnOptions, run_worker};
