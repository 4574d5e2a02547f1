//! Structured error taxonomy shared by every orchestrator component.

use std::path::PathBuf;

use thiserror::Error;

/// Non-overlapping error kinds, one per failure mode the pipeline surfaces.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("input not found: {0}")]
    InputNotFound(PathBuf),

    #[error("invalid subtitle: {0}")]
    InvalidSubtitle(String),

    #[error("model missing: {0}")]
    ModelMissing(String),

    #[error("model corrupted: {name}: {reason}")]
    ModelCorrupted { name: String, reason: String },

    #[error("gpu probe failed: {0}")]
    GpuProbeFailed(String),

    #[error("failed to spawn worker {program}: {source}")]
    WorkerSpawnFailed {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("worker exited with status {code:?}: {tail}")]
    WorkerExitNonzero { code: Option<i32>, tail: String },

    #[error("worker timed out after {0:?}")]
    WorkerTimeout(std::time::Duration),

    #[error("worker produced no output for {0:?}")]
    WorkerSilenceTimeout(std::time::Duration),

    #[error("worker output malformed: {0}")]
    WorkerOutputMalformed(String),

    #[error("translation exceeded length ratio: {ratio:.2} > {limit:.2}")]
    ValidationLengthExceeded { ratio: f64, limit: f64 },

    #[error("translation violates script policy: {0}")]
    ValidationScriptViolation(String),

    #[error("failed to write state file {path}: {source}")]
    StateWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cancelled")]
    Cancelled,

    #[error("resource busy: {path} ({reason})")]
    ResourceBusy { path: PathBuf, reason: String },
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;

impl OrchestratorError {
    /// The stable kind tag written into `state.json`'s `last_error.kind`.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InputNotFound(_) => "INPUT_NOT_FOUND",
            Self::InvalidSubtitle(_) => "INVALID_SUBTITLE",
            Self::ModelMissing(_) => "MODEL_MISSING",
            Self::ModelCorrupted { .. } => "MODEL_CORRUPTED",
            Self::GpuProbeFailed(_) => "GPU_PROBE_FAILED",
            Self::WorkerSpawnFailed { .. } => "WORKER_SPAWN_FAILED",
            Self::WorkerExitNonzero { .. } => "WORKER_EXIT_NONZERO",
            Self::WorkerTimeout(_) => "WORKER_TIMEOUT",
            Self::WorkerSilenceTimeout(_) => "WORKER_SILENCE_TIMEOUT",
            Self::WorkerOutputMalformed(_) => "WORKER_OUTPUT_MALFORMED",
            Self::ValidationLengthExceeded { .. } => "VALIDATION_LENGTH_EXCEEDED",
            Self::ValidationScriptViolation(_) => "VALIDATION_SCRIPT_VIOLATION",
            Self::StateWriteFailed { .. } => "STATE_WRITE_FAILED",
            Self::Cancelled => "CANCELLED",
            Self::ResourceBusy { .. } => "RESOURCE_BUSY",
        }
    }
}
