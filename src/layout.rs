//! Task file layout: pure path algebra plus the only two filesystem mutators
//! in the component (`ensure_structure`, `delete_task`).
//!
//! File names here are a stable contract external tooling can rely on.

use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use crate::error::{OrchestratorError, Result};

/// Root directory all tasks live under.
#[derive(Debug, Clone)]
pub struct TaskLayout {
    base: PathBuf,
}

impl TaskLayout {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    pub fn task_root(&self, task_id: &str) -> PathBuf {
        self.base.join(task_id)
    }

    pub fn input_dir(&self, task_id: &str) -> PathBuf {
        self.task_root(task_id).join("input")
    }

    pub fn processed_dir(&self, task_id: &str) -> PathBuf {
        self.task_root(task_id).join("processed")
    }

    pub fn processed_audio_path(&self, task_id: &str) -> PathBuf {
        self.processed_dir(task_id).join("audio.wav")
    }

    pub fn source_subtitle_path(&self, task_id: &str) -> PathBuf {
        self.processed_dir(task_id).join("source_subtitle.srt")
    }

    pub fn speaker_segments_dir(&self, task_id: &str) -> PathBuf {
        self.processed_dir(task_id).join("speaker_segments")
    }

    pub fn speaker_data_path(&self, task_id: &str) -> PathBuf {
        self.processed_dir(task_id).join("speaker_data.json")
    }

    pub fn outputs_dir(&self, task_id: &str) -> PathBuf {
        self.task_root(task_id).join("outputs")
    }

    pub fn lang_dir(&self, task_id: &str, lang: &str) -> PathBuf {
        self.outputs_dir(task_id).join(lang)
    }

    pub fn translated_subtitle_path(&self, task_id: &str, lang: &str) -> PathBuf {
        self.lang_dir(task_id, lang).join("translated.srt")
    }

    pub fn cloned_audio_dir(&self, task_id: &str, lang: &str) -> PathBuf {
        self.lang_dir(task_id, lang).join("cloned_audio")
    }

    pub fn stitched_audio_path(&self, task_id: &str, lang: &str) -> PathBuf {
        self.lang_dir(task_id, lang).join("stitched_audio.wav")
    }

    pub fn final_video_path(&self, task_id: &str, lang: &str) -> PathBuf {
        self.lang_dir(task_id, lang).join("final_video.mp4")
    }

    /// `<original_stem>_<lang>.<ext kept from original>` inside the language dir.
    pub fn export_path(&self, task_id: &str, lang: &str, original_basename: &str) -> PathBuf {
        let stem = Path::new(original_basename)
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or(original_basename);
        self.lang_dir(task_id, lang)
            .join(format!("{stem}_{lang}.mp4"))
    }

    pub fn state_path(&self, task_id: &str) -> PathBuf {
        self.task_root(task_id).join("state.json")
    }

    /// Idempotent recursive creation of the four canonical subtrees.
    pub fn ensure_structure(&self, task_id: &str) -> Result<()> {
        for dir in [
            self.task_root(task_id),
            self.input_dir(task_id),
            self.processed_dir(task_id),
            self.outputs_dir(task_id),
        ] {
            std::fs::create_dir_all(&dir).map_err(|source| OrchestratorError::StateWriteFailed {
                path: dir,
                source,
            })?;
        }
        Ok(())
    }

    /// Ensure the per-language output subtree exists (called on first
    /// fan-out into a target, including idempotent re-entry for targets
    /// added after job creation).
    pub fn ensure_lang_structure(&self, task_id: &str, lang: &str) -> Result<()> {
        for dir in [
            self.lang_dir(task_id, lang),
            self.cloned_audio_dir(task_id, lang),
        ] {
            std::fs::create_dir_all(&dir).map_err(|source| OrchestratorError::StateWriteFailed {
                path: dir,
                source,
            })?;
        }
        Ok(())
    }

    /// Recursive delete with retry-on-busy: clear read-only bits and retry
    /// up to three times with a 500ms backoff before surfacing
    /// `RESOURCE_BUSY` naming the offending path.
    pub fn delete_task(&self, task_id: &str) -> Result<()> {
        let root = self.task_root(task_id);
        if !root.exists() {
            return Ok(());
        }

        let mut last_err: Option<std::io::Error> = None;
        for attempt in 0..3 {
            clear_readonly_recursive(&root);
            match std::fs::remove_dir_all(&root) {
                Ok(()) => return Ok(()),
                Err(err) => {
                    last_err = Some(err);
                    if attempt < 2 {
                        thread::sleep(Duration::from_millis(500));
                    }
                }
            }
        }

        Err(OrchestratorError::ResourceBusy {
            path: root,
            reason: last_err
                .map(|e| e.to_string())
                .unwrap_or_else(|| "unknown".to_string()),
        })
    }
}

fn clear_readonly_recursive(path: &Path) {
    let Ok(metadata) = std::fs::metadata(path) else {
        return;
    };
    let mut perms = metadata.permissions();
    if perms.readonly() {
        perms.set_readonly(false);
        let _ = std::fs::set_permissions(path, perms);
    }
    if metadata.is_dir() {
        if let Ok(entries) = std::fs::read_dir(path) {
            for entry in entries.flatten() {
                clear_readonly_recursive(&entry.path());
            }
        }
    }
}
