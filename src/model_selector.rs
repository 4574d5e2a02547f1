//! Component D: probes free GPU memory, enumerates candidate model
//! directories in preference order, verifies integrity, and picks the best
//! fit with a deterministic fallback chain.
//!
//! Shells out, checks exit status, then scans stdout lines — the same
//! spawn-and-scan shape used for every other external-tool probe in this
//! crate.

use std::path::{Path, PathBuf};
use std::process::Command;

use serde::{Deserialize, Serialize};

use crate::error::{OrchestratorError, Result};

const MIN_WEIGHT_FILE_BYTES: u64 = 10 * 1024 * 1024;

/// One entry in the ordered preference list, largest-and-best first.
#[derive(Debug, Clone)]
pub struct ModelCandidate {
    pub name: String,
    pub dir: PathBuf,
    pub min_free_mib: u64,
}

/// The selector's pinned choice, recorded in `state.json` for a job's
/// lifetime and never re-probed mid-job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelSelection {
    pub name: String,
    pub dir: PathBuf,
    pub free_mib_at_selection: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GpuMemoryStrategy {
    Sum,
    Max,
}

/// Sum (default) or max of `memory.free` across every GPU line reported by
/// `nvidia-smi`. A probe failure is reported as an error; callers apply the
/// spec's local-recovery rule (treat as 0 MiB) themselves.
pub fn probe_free_gpu_memory_mib(strategy: GpuMemoryStrategy) -> Result<u64> {
    let output = Command::new("nvidia-smi")
        .arg("--query-gpu=memory.free")
        .arg("--format=csv,noheader,nounits")
        .output()
        .map_err(|e| OrchestratorError::GpuProbeFailed(e.to_string()))?;

    if !output.status.success() {
        return Err(OrchestratorError::GpuProbeFailed(format!(
            "nvidia-smi exited with status {:?}",
            output.status.code()
        )));
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    let values: Vec<u64> = stdout
        .lines()
        .filter_map(|line| line.trim().parse::<u64>().ok())
        .collect();

    if values.is_empty() {
        return Err(OrchestratorError::GpuProbeFailed(
            "no parseable memory.free values in nvidia-smi output".to_string(),
        ));
    }

    Ok(match strategy {
        GpuMemoryStrategy::Sum => values.iter().sum(),
        GpuMemoryStrategy::Max => *values.iter().max().unwrap(),
    })
}

fn file_non_empty(path: &Path) -> bool {
    std::fs::metadata(path).map(|m| m.len() > 0).unwrap_or(false)
}

fn has_weight_file_over_threshold(dir: &Path) -> bool {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return false;
    };
    entries.flatten().any(|entry| {
        let path = entry.path();
        let is_weight = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|ext| ext == "safetensors" || ext == "bin")
            .unwrap_or(false);
        is_weight
            && std::fs::metadata(&path)
                .map(|m| m.len() > MIN_WEIGHT_FILE_BYTES)
                .unwrap_or(false)
    })
}

/// `config.json` and `tokenizer_config.json` present and non-empty, plus at
/// least one `*.safetensors`/`*.bin` file over 10 MiB. Returns the rejection
/// reason on failure so callers can log `CORRUPTED` with context.
fn check_integrity(dir: &Path) -> std::result::Result<(), String> {
    if !dir.is_dir() {
        return Err("directory does not exist".to_string());
    }
    if !file_non_empty(&dir.join("config.json")) {
        return Err("config.json missing or empty".to_string());
    }
    if !file_non_empty(&dir.join("tokenizer_config.json")) {
        return Err("tokenizer_config.json missing or empty".to_string());
    }
    if !has_weight_file_over_threshold(dir) {
        return Err("no *.safetensors/*.bin file larger than 10 MiB".to_string());
    }
    Ok(())
}

/// Translation model tiers in preference order, best quality first. Each
/// entry is a subdirectory of `models_dir`; only directories that actually
/// exist on disk are offered to [`select_model`], so a partial install
/// (e.g. only the fallback model downloaded) still works.
const TRANSLATION_MODEL_TIERS: &[(&str, u64)] = &[
    ("Qwen3-4B-FP8", 6_000),
    ("Qwen3-4B", 9_000),
    ("Qwen3-1.7B", 4_000),
];

/// Enumerate the translation model candidates present under
/// `models_dir/translate`, in the fixed preference order above.
pub fn translation_model_candidates(models_dir: &Path) -> Vec<ModelCandidate> {
    let base = models_dir.join("translate");
    TRANSLATION_MODEL_TIERS
        .iter()
        .map(|(name, min_free_mib)| ModelCandidate {
            name: name.to_string(),
            dir: base.join(name),
            min_free_mib: *min_free_mib,
        })
        .filter(|candidate| candidate.dir.is_dir())
        .collect()
}

/// Walk `candidates` in order. The first candidate whose free-memory
/// requirement is met *and* whose integrity check passes wins. If none
/// meets its memory requirement, the smallest integrity-passing candidate
/// (last in the preference list that still passes) is returned instead. If
/// no candidate passes integrity at all, every rejection reason is reported.
pub fn select_model(
    candidates: &[ModelCandidate],
    free_mib: u64,
) -> Result<ModelSelection> {
    let mut integrity_passing: Vec<&ModelCandidate> = Vec::new();
    let mut rejections: Vec<String> = Vec::new();

    for candidate in candidates {
        match check_integrity(&candidate.dir) {
            Ok(()) => integrity_passing.push(candidate),
            Err(reason) => {
                tracing::warn!(model = %candidate.name, reason = %reason, "CORRUPTED");
                rejections.push(format!("{}: {reason}", candidate.name));
            }
        }
    }

    if let Some(fit) = integrity_passing
        .iter()
        .find(|c| free_mib >= c.min_free_mib)
    {
        return Ok(ModelSelection {
            name: fit.name.clone(),
            dir: fit.dir.clone(),
            free_mib_at_selection: free_mib,
        });
    }

    if let Some(smallest) = integrity_passing.last() {
        return Ok(ModelSelection {
            name: smallest.name.clone(),
            dir: smallest.dir.clone(),
            free_mib_at_selection: free_mib,
        });
    }

    Err(OrchestratorError::ModelMissing(format!(
        "no candidate passed integrity checks: [{}]",
        rejections.join("; ")
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_candidate(dir: &Path, weight_bytes: u64) {
        std::fs::create_dir_all(dir).unwrap();
        std::fs::write(dir.join("config.json"), b"{}").unwrap();
        std::fs::write(dir.join("tokenizer_config.json"), b"{}").unwrap();
        std::fs::write(dir.join("model.safetensors"), vec![0u8; weight_bytes as usize]).unwrap();
    }

    #[test]
    fn picks_first_candidate_meeting_memory_and_integrity() {
        let tmp = tempfile::tempdir().unwrap();
        let best = tmp.path().join("best");
        let fallback = tmp.path().join("fallback");
        write_candidate(&best, MIN_WEIGHT_FILE_BYTES + 1);
        write_candidate(&fallback, MIN_WEIGHT_FILE_BYTES + 1);

        let candidates = vec![
            ModelCandidate {
                name: "best".to_string(),
                dir: best,
                min_free_mib: 20_000,
            },
            ModelCandidate {
                name: "fallback".to_string(),
                dir: fallback,
                min_free_mib: 4_000,
            },
        ];

        let selection = select_model(&candidates, 6_000).unwrap();
        assert_eq!(selection.name, "fallback");
    }

    #[test]
    fn skips_corrupted_candidate_regardless_of_memory() {
        let tmp = tempfile::tempdir().unwrap();
        let corrupted = tmp.path().join("corrupted");
        std::fs::create_dir_all(&corrupted).unwrap();
        std::fs::write(corrupted.join("config.json"), b"").unwrap();
        let next = tmp.path().join("next");
        write_candidate(&next, MIN_WEIGHT_FILE_BYTES + 1);

        let candidates = vec![
            ModelCandidate {
                name: "corrupted".to_string(),
                dir: corrupted,
                min_free_mib: 1,
            },
            ModelCandidate {
                name: "next".to_string(),
                dir: next,
                min_free_mib: 1,
            },
        ];

        let selection = select_model(&candidates, 100_000).unwrap();
        assert_eq!(selection.name, "next");
    }

    #[test]
    fn falls_back_to_smallest_integrity_passing_when_none_meet_memory() {
        let tmp = tempfile::tempdir().unwrap();
        let big = tmp.path().join("big");
        let small = tmp.path().join("small");
        write_candidate(&big, MIN_WEIGHT_FILE_BYTES + 1);
        write_candidate(&small, MIN_WEIGHT_FILE_BYTES + 1);

        let candidates = vec![
            ModelCandidate {
                name: "big".to_string(),
                dir: big,
                min_free_mib: 20_000,
            },
            ModelCandidate {
                name: "small".to_string(),
                dir: small,
                min_free_mib: 12_000,
            },
        ];

        let selection = select_model(&candidates, 0).unwrap();
        assert_eq!(selection.name, "small");
    }

    #[test]
    fn translation_model_candidates_skips_tiers_not_present_on_disk() {
        let tmp = tempfile::tempdir().unwrap();
        let translate_dir = tmp.path().join("translate");
        write_candidate(&translate_dir.join("Qwen3-1.7B"), MIN_WEIGHT_FILE_BYTES + 1);

        let candidates = translation_model_candidates(tmp.path());
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].name, "Qwen3-1.7B");
    }

    #[test]
    fn translation_model_candidates_keeps_preference_order() {
        let tmp = tempfile::tempdir().unwrap();
        let translate_dir = tmp.path().join("translate");
        write_candidate(&translate_dir.join("Qwen3-1.7B"), MIN_WEIGHT_FILE_BYTES + 1);
        write_candidate(&translate_dir.join("Qwen3-4B-FP8"), MIN_WEIGHT_FILE_BYTES + 1);

        let candidates = translation_model_candidates(tmp.path());
        assert_eq!(candidates[0].name, "Qwen3-4B-FP8");
        assert_eq!(candidates[1].name, "Qwen3-1.7B");
    }

    #[test]
    fn fails_with_structured_error_when_no_candidate_passes_integrity() {
        let tmp = tempfile::tempdir().unwrap();
        let empty = tmp.path().join("empty");
        std::fs::create_dir_all(&empty).unwrap();

        let candidates = vec![ModelCandidate {
            name: "empty".to_string(),
            dir: empty,
            min_free_mib: 1,
        }];

        let err = select_model(&candidates, 1_000_000).unwrap_err();
        assert!(matches!(err, OrchestratorError::ModelMissing(_)));
    }
}
