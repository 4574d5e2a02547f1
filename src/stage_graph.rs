//! Component F (part 1): the dubbing pipeline DAG as pure data — stage
//! identity, predecessor edges, the GPU-exclusive class, and eligibility.
//!
//! No execution lives here; [`crate::scheduler`] walks this graph against a
//! [`crate::state_persist::StateRecord`] to decide what to run next.

use std::collections::HashMap;

use crate::state_persist::{StageState, StageStatus};

/// The stages that run once per task, shared by every target language.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SharedStage {
    ExtractAudio,
    Asr,
    Diarize,
    BuildReferences,
}

/// The stages that fan out once per target language.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PerLanguageStage {
    Translate,
    ValidateLength,
    CloneVoice,
    StitchAudio,
    MuxVideo,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum StageId {
    Shared(SharedStage),
    PerLanguage(PerLanguageStage, String),
}

impl StageId {
    /// The key this stage is stored under in `state.json.stages`.
    pub fn key(&self) -> String {
        match self {
            Self::Shared(stage) => shared_name(*stage).to_string(),
            Self::PerLanguage(stage, lang) => format!("{}.{lang}", per_lang_name(*stage)),
        }
    }

    /// `{ASR, DIARIZE, TRANSLATE, CLONE_VOICE}` hold the single GPU-exclusive
    /// token for their duration; everything else runs freely up to pool size.
    pub fn is_gpu_exclusive(&self) -> bool {
        matches!(
            self,
            Self::Shared(SharedStage::Asr)
                | Self::Shared(SharedStage::Diarize)
                | Self::PerLanguage(PerLanguageStage::Translate, _)
                | Self::PerLanguage(PerLanguageStage::CloneVoice, _)
        )
    }

    /// Direct predecessors in the pipeline DAG. `build_references` fans
    /// into every target language's `translate.<lang>`.
    pub fn predecessors(&self) -> Vec<StageId> {
        match self {
            Self::Shared(SharedStage::ExtractAudio) => vec![],
            Self::Shared(SharedStage::Asr) => vec![Self::Shared(SharedStage::ExtractAudio)],
            Self::Shared(SharedStage::Diarize) => vec![Self::Shared(SharedStage::Asr)],
            Self::Shared(SharedStage::BuildReferences) => vec![Self::Shared(SharedStage::Diarize)],
            Self::PerLanguage(PerLanguageStage::Translate, _) => {
                vec![Self::Shared(SharedStage::BuildReferences)]
            }
            Self::PerLanguage(PerLanguageStage::ValidateLength, lang) => {
                vec![Self::PerLanguage(PerLanguageStage::Translate, lang.clone())]
            }
            Self::PerLanguage(PerLanguageStage::CloneVoice, lang) => vec![Self::PerLanguage(
                PerLanguageStage::ValidateLength,
                lang.clone(),
            )],
            Self::PerLanguage(PerLanguageStage::StitchAudio, lang) => {
                vec![Self::PerLanguage(PerLanguageStage::CloneVoice, lang.clone())]
            }
            Self::PerLanguage(PerLanguageStage::MuxVideo, lang) => {
                vec![Self::PerLanguage(PerLanguageStage::StitchAudio, lang.clone())]
            }
        }
    }

    /// All stages for a task with the given targets, in a stable
    /// predecessors-before-successors order.
    pub fn all_for_targets(targets: &[String]) -> Vec<StageId> {
        let mut stages = vec![
            Self::Shared(SharedStage::ExtractAudio),
            Self::Shared(SharedStage::Asr),
            Self::Shared(SharedStage::Diarize),
            Self::Shared(SharedStage::BuildReferences),
        ];
        for lang in targets {
            for stage in [
                PerLanguageStage::Translate,
                PerLanguageStage::ValidateLength,
                PerLanguageStage::CloneVoice,
                PerLanguageStage::StitchAudio,
                PerLanguageStage::MuxVideo,
            ] {
                stages.push(Self::PerLanguage(stage, lang.clone()));
            }
        }
        stages
    }
}

fn shared_name(stage: SharedStage) -> &'static str {
    match stage {
        SharedStage::ExtractAudio => "extract_audio",
        SharedStage::Asr => "asr",
        SharedStage::Diarize => "diarize",
        SharedStage::BuildReferences => "build_references",
    }
}

fn per_lang_name(stage: PerLanguageStage) -> &'static str {
    match stage {
        PerLanguageStage::Translate => "translate",
        PerLanguageStage::ValidateLength => "validate_length",
        PerLanguageStage::CloneVoice => "clone_voice",
        PerLanguageStage::StitchAudio => "stitch_audio",
        PerLanguageStage::MuxVideo => "mux_video",
    }
}

/// A stage is eligible when every predecessor is `done` and its own status
/// is `pending` (a crashed `running` stage is demoted to `pending` on
/// resume before this is ever called — see
/// [`crate::state_persist::StateRecord::mark_crashed_stages_retryable`]).
pub fn is_eligible(stage: &StageId, stages: &HashMap<String, StageState>) -> bool {
    let Some(own) = stages.get(&stage.key()) else {
        return false;
    };
    if own.status != StageStatus::Pending {
        return false;
    }
    stage
        .predecessors()
        .iter()
        .all(|pred| stages.get(&pred.key()).map(|s| s.status == StageStatus::Done).unwrap_or(false))
}

pub fn eligible_stages(targets: &[String], stages: &HashMap<String, StageState>) -> Vec<StageId> {
    StageId::all_for_targets(targets)
        .into_iter()
        .filter(|stage| is_eligible(stage, stages))
        .collect()
}
