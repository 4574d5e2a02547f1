//! A stand-in worker process for exercising [`dubctl_core::worker::run_worker`]
//! against a real child process rather than an in-process fake. Controlled
//! entirely by environment variables so the integration tests that spawn it
//! never need a fixture file on disk.

use std::env;
use std::time::Duration;

fn main() {
    let _config_path = env::args().nth(1).expect("mock worker expects a config path argument");

    if let Ok(progress) = env::var("MOCK_WORKER_PROGRESS") {
        for step in progress.split(',') {
            eprintln!("[mock_worker] progress: {step}");
            std::thread::sleep(Duration::from_millis(20));
        }
    }

    if let Ok(sleep_ms) = env::var("MOCK_WORKER_SLEEP_MS") {
        if let Ok(ms) = sleep_ms.parse::<u64>() {
            std::thread::sleep(Duration::from_millis(ms));
        }
    }

    let exit_code: i32 = env::var("MOCK_WORKER_EXIT_CODE")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);

    if exit_code == 0 {
        let result = env::var("MOCK_WORKER_RESULT_JSON")
            .unwrap_or_else(|_| "{\"status\":\"ok\"}".to_string());
        println!("{result}");
    } else {
        eprintln!("mock worker failing on purpose");
    }

    std::process::exit(exit_code);
}
