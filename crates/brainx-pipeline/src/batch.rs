//! Batch mode: one run per subject sub-directory of the input.

use std::path::{Path, PathBuf};

use brainx_core::{BrainxError, PipelineKind, PipelineStage, QualityPreset, Result, RunContext};
use serde::Serialize;
use tracing::{info, warn};

use crate::orchestrator::{Orchestrator, RunOutcome};

/// Sub-directories of `input`, sorted by name. Hidden directories are
/// ignored.
pub fn discover_subjects(input: &Path) -> Result<Vec<(String, PathBuf)>> {
    let entries = std::fs::read_dir(input).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => BrainxError::FileNotFound(input.to_path_buf()),
        std::io::ErrorKind::PermissionDenied => BrainxError::Permission(input.to_path_buf()),
        _ => BrainxError::Io(e),
    })?;

    let mut subjects = Vec::new();
    for entry in entries {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        if name.starts_with('.') {
            continue;
        }
        subjects.push((name, entry.path()));
    }
    subjects.sort();
    Ok(subjects)
}

#[derive(Debug, Serialize)]
pub struct BatchOutcome {
    pub runs: Vec<RunOutcome>,
}

impl BatchOutcome {
    pub fn failed(&self) -> usize {
        self.runs.iter().filter(|r| !r.success()).count()
    }

    /// The first failing subject's exit code, or 0.
    pub fn exit_code(&self) -> i32 {
        self.runs
            .iter()
            .map(RunOutcome::exit_code)
            .find(|&code| code != 0)
            .unwrap_or(0)
    }
}

/// Settings shared by every subject of a batch.
#[derive(Debug, Clone, Copy)]
pub struct BatchSettings {
    pub quality: QualityPreset,
    pub start_stage: PipelineStage,
}

/// Run every subject under `input`, writing to `<output>/<subject>`.
///
/// Subjects run one after another; each one's stages still dispatch their
/// batches in parallel. A failing subject does not stop the rest.
pub async fn run_batch(
    orchestrator: &Orchestrator,
    input: &Path,
    output: &Path,
    settings: BatchSettings,
) -> Result<BatchOutcome> {
    let subjects = discover_subjects(input)?;
    if subjects.is_empty() {
        return Err(BrainxError::DataMissing(format!(
            "no subject directories under {}",
            input.display()
        )));
    }
    info!(subjects = subjects.len(), "batch started");

    let mut runs = Vec::with_capacity(subjects.len());
    for (subject, dir) in subjects {
        let mut ctx = RunContext::new(&subject, dir, output.join(&subject))
            .with_quality(settings.quality)
            .with_pipeline(PipelineKind::Batch)
            .with_start_stage(settings.start_stage);
        let outcome = orchestrator.run(&mut ctx).await;
        if !outcome.success() {
            warn!(subject = %subject, exit_code = outcome.exit_code(), "subject failed");
        }
        runs.push(outcome);
    }

    let outcome = BatchOutcome { runs };
    info!(
        subjects = outcome.runs.len(),
        failed = outcome.failed(),
        "batch finished"
    );
    Ok(outcome)
}
