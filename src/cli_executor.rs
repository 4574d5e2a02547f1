//! The `dubctl` binary's [`StageExecutor`]: turns a claimed stage into a
//! worker-process invocation (or, for `validate_length`, a pure in-process
//! check) and folds the result back into `state.json`.
//!
//! The per-stage config envelope fields are this binary's own convention
//! over the paths [`TaskLayout`] already pins; the worker programs
//! themselves are external and not implemented here.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;

use dubctl_core::layout::TaskLayout;
use dubctl_core::model_selector::{
    probe_free_gpu_memory_mib, select_model, translation_model_candidates, GpuMemoryStrategy,
    ModelSelection,
};
use dubctl_core::scheduler::should_retry;
use dubctl_core::stage_graph::{PerLanguageStage, SharedStage, StageId};
use dubctl_core::state_persist::{LastError, StageStatus, StateStore};
use dubctl_core::subtitle;
use dubctl_core::worker::{run_worker, CancellationToken, WorkerConfig, WorkerSpawnOptions};
use dubctl_core::OrchestratorError;

/// Stage-type name independent of target language, used both as the
/// `WORKER_PROGRAM_*` environment lookup key and the default program name.
fn stage_type_name(stage: &StageId) -> &'static str {
    match stage {
        StageId::Shared(SharedStage::ExtractAudio) => "extract_audio",
        StageId::Shared(SharedStage::Asr) => "asr",
        StageId::Shared(SharedStage::Diarize) => "diarize",
        StageId::Shared(SharedStage::BuildReferences) => "build_references",
        StageId::PerLanguage(PerLanguageStage::Translate, _) => "translate",
        StageId::PerLanguage(PerLanguageStage::ValidateLength, _) => "validate_length",
        StageId::PerLanguage(PerLanguageStage::CloneVoice, _) => "clone_voice",
        StageId::PerLanguage(PerLanguageStage::StitchAudio, _) => "stitch_audio",
        StageId::PerLanguage(PerLanguageStage::MuxVideo, _) => "mux_video",
    }
}

fn worker_program(stage: &StageId) -> PathBuf {
    let env_key = format!("WORKER_PROGRAM_{}", stage_type_name(stage).to_uppercase());
    std::env::var(&env_key)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(format!("dubctl-worker-{}", stage_type_name(stage))))
}

fn first_entry(dir: &std::path::Path) -> Option<PathBuf> {
    std::fs::read_dir(dir)
        .ok()?
        .flatten()
        .map(|e| e.path())
        .find(|p| p.is_file())
}

/// Assembles the stage-specific fields of the worker config envelope. Every
/// path named here is pinned by [`TaskLayout`], so a worker never needs to
/// know the task tree's layout conventions beyond the one file it reads or
/// writes.
///
/// `model_path`, when given, is folded into the envelope of the one stage
/// that needs it (`Translate`'s `model_path` field) - callers that have
/// nothing to add (every other stage) just pass `None`.
fn build_extra(
    layout: &TaskLayout,
    task_id: &str,
    stage: &StageId,
    model_path: Option<&std::path::Path>,
) -> serde_json::Value {
    match stage {
        StageId::Shared(SharedStage::ExtractAudio) => {
            let video = first_entry(&layout.input_dir(task_id));
            json!({
                "video_path": video,
                "output_audio_path": layout.processed_audio_path(task_id),
            })
        }
        StageId::Shared(SharedStage::Asr) => json!({
            "audio_path": layout.processed_audio_path(task_id),
            "output_subtitle_path": layout.source_subtitle_path(task_id),
        }),
        StageId::Shared(SharedStage::Diarize) => json!({
            "audio_path": layout.processed_audio_path(task_id),
            "speaker_segments_dir": layout.speaker_segments_dir(task_id),
            "speaker_data_path": layout.speaker_data_path(task_id),
        }),
        StageId::Shared(SharedStage::BuildReferences) => json!({
            "speaker_data_path": layout.speaker_data_path(task_id),
            "speaker_segments_dir": layout.speaker_segments_dir(task_id),
        }),
        StageId::PerLanguage(PerLanguageStage::Translate, lang) => json!({
            "source_subtitle_path": layout.source_subtitle_path(task_id),
            "target_language": lang,
            "output_subtitle_path": layout.translated_subtitle_path(task_id, lang),
            "model_path": model_path,
        }),
        StageId::PerLanguage(PerLanguageStage::ValidateLength, _) => {
            unreachable!("validate_length never spawns a worker")
        }
        StageId::PerLanguage(PerLanguageStage::CloneVoice, lang) => json!({
            "translated_subtitle_path": layout.translated_subtitle_path(task_id, lang),
            "speaker_data_path": layout.speaker_data_path(task_id),
            "cloned_audio_dir": layout.cloned_audio_dir(task_id, lang),
            "model_path": model_path,
        }),
        StageId::PerLanguage(PerLanguageStage::StitchAudio, lang) => json!({
            "cloned_audio_dir": layout.cloned_audio_dir(task_id, lang),
            "output_audio_path": layout.stitched_audio_path(task_id, lang),
        }),
        StageId::PerLanguage(PerLanguageStage::MuxVideo, lang) => json!({
            "video_path": first_entry(&layout.input_dir(task_id)),
            "stitched_audio_path": layout.stitched_audio_path(task_id, lang),
            "output_video_path": layout.final_video_path(task_id, lang),
        }),
    }
}

fn worker_timeout() -> Option<Duration> {
    std::env::var("WORKER_TIMEOUT_SECS")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs)
}

/// Default per-line-silence limit for `stage`'s stage type, overridable per
/// stage type via `WORKER_SILENCE_TIMEOUT_SECS_<STAGE_TYPE_UPPER>`.
/// Transcription/synthesis stages load heavy models before producing any
/// output, so they get a longer window than translation, which starts
/// streaming tokens almost immediately.
fn worker_silence_timeout(stage: &StageId) -> Option<Duration> {
    let default_secs = match stage {
        StageId::PerLanguage(PerLanguageStage::Translate, _) => 300,
        _ => 600,
    };
    let env_key = format!(
        "WORKER_SILENCE_TIMEOUT_SECS_{}",
        stage_type_name(stage).to_uppercase()
    );
    let secs = std::env::var(&env_key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(default_secs);
    Some(Duration::from_secs(secs))
}

pub struct CliExecutor {
    layout: TaskLayout,
    state_store: std::sync::Arc<StateStore>,
    max_translation_retries: u32,
    models_dir: PathBuf,
    /// One live cancellation token per task currently running a worker, so
    /// [`CliExecutor::cancel`] can reach a worker mid-flight without the
    /// executor needing a back-reference to the supervisor that owns it.
    running: Mutex<HashMap<String, CancellationToken>>,
}

impl CliExecutor {
    pub fn new(
        layout: TaskLayout,
        state_store: std::sync::Arc<StateStore>,
        max_translation_retries: u32,
        models_dir: PathBuf,
    ) -> Self {
        Self {
            layout,
            state_store,
            max_translation_retries,
            models_dir,
            running: Mutex::new(HashMap::new()),
        }
    }

    /// The translation stage pins one model for the whole job's lifetime
    /// (never re-probed mid-job): the first call selects and persists it,
    /// every later call for the same task reuses the recorded choice.
    fn ensure_translation_model(&self, task_id: &str) -> dubctl_core::Result<ModelSelection> {
        let path = self.layout.state_path(task_id);
        if let Ok(record) = self.state_store.load(&path, task_id) {
            if let Some(selection) = record.model_selection {
                return Ok(selection);
            }
        }

        let free_mib = probe_free_gpu_memory_mib(GpuMemoryStrategy::Sum).unwrap_or_else(|err| {
            tracing::warn!(task_id, error = %err, "GPU probe failed, treating as 0 MiB free");
            0
        });
        let candidates = translation_model_candidates(&self.models_dir);
        let selection = select_model(&candidates, free_mib)?;

        self.state_store.update(&path, task_id, |record| {
            record.model_selection = Some(selection.clone());
        })?;

        Ok(selection)
    }

    fn running_key(task_id: &str, stage: &StageId) -> String {
        format!("{task_id}:{}", stage.key())
    }

    /// Best-effort: signals every worker currently running on behalf of
    /// `task_id` (there may be more than one — the pool runs independent
    /// per-language stages concurrently) to terminate.
    pub fn cancel(&self, task_id: &str) {
        let prefix = format!("{task_id}:");
        let running = self.running.lock().unwrap_or_else(|e| e.into_inner());
        for (key, token) in running.iter() {
            if key.starts_with(&prefix) {
                token.cancel();
            }
        }
    }

    fn run_worker_stage(&self, task_id: &str, stage: &StageId) {
        let model_path = if matches!(stage, StageId::PerLanguage(PerLanguageStage::Translate, _)) {
            match self.ensure_translation_model(task_id) {
                Ok(selection) => Some(selection.dir),
                Err(err) => {
                    self.finish_failed(task_id, stage, &err);
                    return;
                }
            }
        } else if matches!(stage, StageId::PerLanguage(PerLanguageStage::CloneVoice, _)) {
            // Voice cloning runs a single fixed model (no low-VRAM fallback
            // tiers exist for it), so there's no selection to pin - just
            // point the worker at its one model directory.
            Some(self.models_dir.join("clone_voice"))
        } else {
            None
        };

        let program = worker_program(stage);
        let extra = build_extra(&self.layout, task_id, stage, model_path.as_deref());
        let output_dir = self.layout.task_root(task_id);
        let config_dir = output_dir.join(".worker_configs");
        let _ = std::fs::create_dir_all(&config_dir);
        let config_path = config_dir.join(format!("{}.json", stage.key().replace('.', "_")));

        let config = WorkerConfig::new(output_dir.clone(), stage.key(), extra);
        if let Err(source) = config.write_to(&config_path) {
            self.finish_failed(task_id, stage, &OrchestratorError::StateWriteFailed {
                path: config_path,
                source,
            });
            return;
        }

        let cancel = CancellationToken::new();
        let running_key = Self::running_key(task_id, stage);
        self.running
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(running_key.clone(), cancel.clone());

        let opts = WorkerSpawnOptions {
            program,
            config_path: config_path.clone(),
            env_overlay: HashMap::new(),
            timeout: worker_timeout(),
            silence_timeout: worker_silence_timeout(stage),
            cancel,
        };

        let outcome = run_worker(opts, |done, total| {
            tracing::info!(task_id, stage = %stage.key(), done, total, "progress");
        });

        self.running.lock().unwrap_or_else(|e| e.into_inner()).remove(&running_key);
        let _ = std::fs::remove_file(&config_path);

        match outcome {
            Ok(_) => self.finish_done(task_id, stage),
            Err(err) => self.finish_failed(task_id, stage, &err),
        }
    }

    /// `validate_length` never spawns a worker: it reads the source and
    /// translated subtitles straight off disk and applies the length/script
    /// policy in-process.
    fn run_validate_length(&self, task_id: &str, lang: &str) {
        let source_path = self.layout.source_subtitle_path(task_id);
        let translated_path = self.layout.translated_subtitle_path(task_id, lang);

        let (source_text, translated_text) = match (
            std::fs::read_to_string(&source_path),
            std::fs::read_to_string(&translated_path),
        ) {
            (Ok(s), Ok(t)) => (s, t),
            (Err(source), _) => {
                return self.finish_failed(
                    task_id,
                    &StageId::PerLanguage(PerLanguageStage::ValidateLength, lang.to_string()),
                    &OrchestratorError::InvalidSubtitle(format!(
                        "failed to read {}: {source}",
                        source_path.display()
                    )),
                );
            }
            (_, Err(source)) => {
                return self.finish_failed(
                    task_id,
                    &StageId::PerLanguage(PerLanguageStage::ValidateLength, lang.to_string()),
                    &OrchestratorError::InvalidSubtitle(format!(
                        "failed to read {}: {source}",
                        translated_path.display()
                    )),
                );
            }
        };

        let source_cues = subtitle::parse(&source_text);
        let translated_cues = subtitle::parse(&translated_text);
        let stage = StageId::PerLanguage(PerLanguageStage::ValidateLength, lang.to_string());

        // Each cue is its own translation unit and is checked independently:
        // one bad cue among many good ones must not be diluted by an
        // aggregate join, and many borderline cues must not trip a
        // whole-file failure that no individual cue actually earns.
        let flagged: Vec<(usize, subtitle::ValidationOutcome)> = source_cues
            .cues
            .iter()
            .zip(translated_cues.cues.iter())
            .enumerate()
            .filter_map(|(index, (source_cue, translated_cue))| {
                match subtitle::validate(lang, &source_cue.text, &translated_cue.text) {
                    subtitle::ValidationOutcome::Accepted => None,
                    other => Some((index, other)),
                }
            })
            .collect();

        if flagged.is_empty() {
            return self.finish_done(task_id, &stage);
        }

        tracing::warn!(
            task_id,
            lang,
            flagged_cues = ?flagged.iter().map(|(i, _)| *i).collect::<Vec<_>>(),
            "cue-level validation failures"
        );

        // Length violations are reported first, matching the per-cue
        // length-before-script precedence; among length violations the
        // worst ratio drives the retry decision.
        let worst_long = flagged
            .iter()
            .filter_map(|(_, outcome)| match outcome {
                subtitle::ValidationOutcome::FlaggedLong { ratio, limit } => Some((*ratio, *limit)),
                _ => None,
            })
            .max_by(|a, b| a.0.partial_cmp(&b.0).unwrap());

        if let Some((ratio, limit)) = worst_long {
            return self.retry_translation(
                task_id,
                lang,
                &stage,
                OrchestratorError::ValidationLengthExceeded { ratio, limit },
            );
        }

        let reason = flagged
            .iter()
            .find_map(|(_, outcome)| match outcome {
                subtitle::ValidationOutcome::FlaggedScript { reason } => Some(reason.clone()),
                _ => None,
            })
            .expect("flagged is non-empty and contains no FlaggedLong, so at least one FlaggedScript remains");
        self.retry_translation(
            task_id,
            lang,
            &stage,
            OrchestratorError::ValidationScriptViolation(reason),
        );
    }

    /// A failed validation resubmits `translate.<lang>` for another attempt
    /// (per-cue resubmission is a worker-side concern; the orchestrator only
    /// knows how to re-run the whole stage) up to the translation retry
    /// budget, then gives up and fails both stages.
    fn retry_translation(
        &self,
        task_id: &str,
        lang: &str,
        validate_stage: &StageId,
        err: OrchestratorError,
    ) {
        let translate_stage = StageId::PerLanguage(PerLanguageStage::Translate, lang.to_string());
        let path = self.layout.state_path(task_id);
        let translate_attempts = self
            .state_store
            .load(&path, task_id)
            .map(|r| r.stages.get(&translate_stage.key()).map(|s| s.attempts).unwrap_or(0))
            .unwrap_or(0);

        let retry = translate_attempts < self.max_translation_retries;
        let kind = err.kind().to_string();
        let message = err.to_string();

        let _ = self.state_store.update(&path, task_id, |record| {
            if let Some(state) = record.stages.get_mut(&validate_stage.key()) {
                state.status = if retry { StageStatus::Pending } else { StageStatus::Failed };
                state.finished_at = Some(Utc::now());
                state.last_error = Some(LastError { kind: kind.clone(), message: message.clone(), tail: vec![] });
            }
            if retry {
                if let Some(state) = record.stages.get_mut(&translate_stage.key()) {
                    state.status = StageStatus::Pending;
                }
            }
        });
    }

    fn finish_done(&self, task_id: &str, stage: &StageId) {
        let path = self.layout.state_path(task_id);
        let _ = self.state_store.update(&path, task_id, |record| {
            if let Some(state) = record.stages.get_mut(&stage.key()) {
                state.status = StageStatus::Done;
                state.finished_at = Some(Utc::now());
                state.last_error = None;
            }
        });
    }

    fn finish_failed(&self, task_id: &str, stage: &StageId, err: &OrchestratorError) {
        let path = self.layout.state_path(task_id);
        let kind = err.kind().to_string();
        let message = err.to_string();
        let cancelled = matches!(err, OrchestratorError::Cancelled);
        let _ = self.state_store.update(&path, task_id, |record| {
            let Some(state) = record.stages.get_mut(&stage.key()) else {
                return;
            };
            state.finished_at = Some(Utc::now());
            state.last_error = Some(LastError { kind: kind.clone(), message: message.clone(), tail: vec![] });
            state.status = if cancelled {
                StageStatus::Cancelled
            } else if matches!(
                err,
                OrchestratorError::WorkerTimeout(_) | OrchestratorError::WorkerSilenceTimeout(_)
            ) {
                StageStatus::Timeout
            } else if should_retry(&kind, state.attempts) {
                StageStatus::Pending
            } else {
                StageStatus::Failed
            };
        });
    }
}

impl dubctl_core::scheduler::StageExecutor for CliExecutor {
    fn execute(&self, task_id: &str, stage: &StageId) {
        if let StageId::PerLanguage(PerLanguageStage::ValidateLength, lang) = stage {
            self.run_validate_length(task_id, lang);
        } else {
            self.run_worker_stage(task_id, stage);
        }
    }
}

/// A task is finished driving (successfully or not) once no stage remains
/// `pending`/`running`.
pub fn is_task_settled(stages: &HashMap<String, dubctl_core::state_persist::StageState>) -> bool {
    stages
        .values()
        .all(|s| !matches!(s.status, StageStatus::Pending | StageStatus::Running))
}

/// Distinct terminal statuses seen across a task's stages, for a one-line
/// summary at the end of `start`.
pub fn summarize(stages: &HashMap<String, dubctl_core::state_persist::StageState>) -> HashSet<String> {
    stages.values().map(|s| format!("{:?}", s.status)).collect()
}
