//! The JSON config envelope written to disk before spawning a worker.

use std::path::PathBuf;

use serde::Serialize;
use serde_json::Value;

/// `{<worker_specific_fields>, output_dir, progress_tag}`. `extra` carries
/// the stage-specific fields (e.g. source path, target language, model
/// path) as a flat JSON object merged alongside the two common keys.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerConfig {
    pub output_dir: PathBuf,
    pub progress_tag: String,
    #[serde(flatten)]
    pub extra: Value,
}

impl WorkerConfig {
    pub fn new(output_dir: impl Into<PathBuf>, progress_tag: impl Into<String>, extra: Value) -> Self {
        Self {
            output_dir: output_dir.into(),
            progress_tag: progress_tag.into(),
            extra,
        }
    }

    /// Write the envelope to `path` as pretty JSON, the form every worker's
    /// single command-line argument points to.
    pub fn write_to(&self, path: &std::path::Path) -> std::io::Result<()> {
        let body = serde_json::to_vec_pretty(self).expect("WorkerConfig always serializes");
        std::fs::write(path, body)
    }
}
