//! Environment-variable configuration: `WORKER_POOL_SIZE`, `MODELS_DIR`,
//! `MAX_TRANSLATION_RETRIES`, plus the per-worker program path overrides
//! the CLI substitutes into spawn commands.

use std::path::PathBuf;

const DEFAULT_WORKER_POOL_SIZE: usize = 4;
const DEFAULT_MODELS_DIR: &str = "models";
const DEFAULT_MAX_TRANSLATION_RETRIES: u32 = 3;

#[derive(Debug, Clone)]
pub struct Config {
    pub worker_pool_size: usize,
    pub models_dir: PathBuf,
    pub max_translation_retries: u32,
}

impl Config {
    /// Reads every variable from the process environment, falling back to
    /// hardcoded defaults on absence or a malformed value (never fatal —
    /// configuration is advisory, not load-bearing for startup).
    pub fn from_env() -> Self {
        let worker_pool_size = std::env::var("WORKER_POOL_SIZE")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_WORKER_POOL_SIZE);

        let models_dir = std::env::var("MODELS_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_MODELS_DIR));

        let max_translation_retries = std::env::var("MAX_TRANSLATION_RETRIES")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_MAX_TRANSLATION_RETRIES);

        Self {
            worker_pool_size,
            models_dir,
            max_translation_retries,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            worker_pool_size: DEFAULT_WORKER_POOL_SIZE,
            models_dir: PathBuf::from(DEFAULT_MODELS_DIR),
            max_translation_retries: DEFAULT_MAX_TRANSLATION_RETRIES,
        }
    }
}
