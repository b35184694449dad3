//! Per-run state threaded through the orchestrator.
//!
//! A `RunContext` is created from the parsed configuration, mutated only by
//! the orchestrator and dropped at exit. Batch mode creates one per subject.
//! Nothing here is persisted; durable state lives in the artifact tree.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::Serialize;
use uuid::Uuid;

use crate::domain::error::{BrainxError, Result};
use crate::domain::quality::{PipelineKind, QualityPreset};
use crate::domain::stage::PipelineStage;

/// Where a run is in its forward-only lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "stage", rename_all = "snake_case")]
pub enum RunState {
    NotStarted,
    Running(PipelineStage),
    Completed,
    Failed,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Completed | RunState::Failed)
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunState::NotStarted => f.write_str("not_started"),
            RunState::Running(stage) => write!(f, "running({stage})"),
            RunState::Completed => f.write_str("completed"),
            RunState::Failed => f.write_str("failed"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunContext {
    pub run_id: Uuid,
    pub subject: String,
    pub input_dir: PathBuf,
    pub output_root: PathBuf,
    pub quality: QualityPreset,
    pub pipeline: PipelineKind,
    pub start_stage: PipelineStage,
    state: RunState,
    error_count: u32,
}

impl RunContext {
    pub fn new(
        subject: impl Into<String>,
        input_dir: impl Into<PathBuf>,
        output_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            subject: subject.into(),
            input_dir: input_dir.into(),
            output_root: output_root.into(),
            quality: QualityPreset::default(),
            pipeline: PipelineKind::default(),
            start_stage: PipelineStage::Import,
            state: RunState::NotStarted,
            error_count: 0,
        }
    }

    pub fn with_quality(mut self, quality: QualityPreset) -> Self {
        self.quality = quality;
        self
    }

    pub fn with_pipeline(mut self, pipeline: PipelineKind) -> Self {
        self.pipeline = pipeline;
        self
    }

    pub fn with_start_stage(mut self, stage: PipelineStage) -> Self {
        self.start_stage = stage;
        self
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn error_count(&self) -> u32 {
        self.error_count
    }

    /// True only once the run has completed.
    pub fn success(&self) -> bool {
        self.state == RunState::Completed
    }

    /// Enter `stage`. Transitions only move forward: a stage can be entered
    /// from `NotStarted` or from an earlier stage, never twice.
    pub fn begin(&mut self, stage: PipelineStage) -> Result<()> {
        let allowed = match self.state {
            RunState::NotStarted => true,
            RunState::Running(current) => stage > current,
            RunState::Completed | RunState::Failed => false,
        };
        if !allowed {
            return Err(BrainxError::InvalidArgument(format!(
                "cannot enter stage {stage} from state {}",
                self.state
            )));
        }
        self.state = RunState::Running(stage);
        Ok(())
    }

    pub fn record_error(&mut self) -> u32 {
        self.error_count += 1;
        self.error_count
    }

    pub fn complete(&mut self) -> Result<()> {
        self.finish(RunState::Completed)
    }

    pub fn fail(&mut self) -> Result<()> {
        self.finish(RunState::Failed)
    }

    fn finish(&mut self, terminal: RunState) -> Result<()> {
        if self.state.is_terminal() {
            return Err(BrainxError::InvalidArgument(format!(
                "run already {}",
                self.state
            )));
        }
        self.state = terminal;
        Ok(())
    }

    /// `<output_root>/logs`, outside the module tree.
    pub fn logs_dir(&self) -> PathBuf {
        self.output_root.join("logs")
    }

    pub fn output_root(&self) -> &Path {
        &self.output_root
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> RunContext {
        RunContext::new("sub-01", "/in", "/out")
    }

    #[test]
    fn test_forward_transitions() {
        let mut ctx = ctx();
        assert_eq!(ctx.state(), RunState::NotStarted);
        ctx.begin(PipelineStage::Registration).unwrap();
        ctx.begin(PipelineStage::Segmentation).unwrap();
        ctx.complete().unwrap();
        assert!(ctx.success());
    }

    #[test]
    fn test_no_reentry_or_backwards() {
        let mut ctx = ctx();
        ctx.begin(PipelineStage::Analysis).unwrap();
        assert!(ctx.begin(PipelineStage::Analysis).is_err());
        assert!(ctx.begin(PipelineStage::Import).is_err());
    }

    #[test]
    fn test_terminal_is_final() {
        let mut ctx = ctx();
        ctx.fail().unwrap();
        assert!(ctx.begin(PipelineStage::Import).is_err());
        assert!(ctx.complete().is_err());
        assert!(!ctx.success());
    }

    #[test]
    fn test_error_counter() {
        let mut ctx = ctx();
        assert_eq!(ctx.record_error(), 1);
        assert_eq!(ctx.record_error(), 2);
        assert_eq!(ctx.error_count(), 2);
        assert_eq!(ctx.logs_dir(), PathBuf::from("/out/logs"));
    }
}
