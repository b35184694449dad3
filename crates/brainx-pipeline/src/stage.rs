//! Stage bodies and per-stage reports.

use std::fmt;
use std::path::PathBuf;

use async_trait::async_trait;
use brainx_core::{PipelineStage, Result};
use serde::Serialize;

use crate::env::StageEnv;

/// Concrete artifacts a stage body produced, validated on top of the
/// stage's declared patterns.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StageOutput {
    pub artifacts: Vec<PathBuf>,
}

impl StageOutput {
    pub fn push(&mut self, path: impl Into<PathBuf>) {
        self.artifacts.push(path.into());
    }

    pub fn extend(&mut self, paths: impl IntoIterator<Item = PathBuf>) {
        self.artifacts.extend(paths);
    }
}

/// One stage of a run.
#[async_trait]
pub trait StageBody: Send + Sync {
    fn stage(&self) -> PipelineStage;

    async fn run(&self, env: &StageEnv) -> Result<StageOutput>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Succeeded,
    Failed,
    /// Before the start stage; outputs found on disk.
    Rediscovered,
    /// Excluded by the pipeline kind.
    Skipped,
    /// Never reached because an earlier strict stage failed.
    NotRun,
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StageStatus::Succeeded => "succeeded",
            StageStatus::Failed => "failed",
            StageStatus::Rediscovered => "rediscovered",
            StageStatus::Skipped => "skipped",
            StageStatus::NotRun => "not_run",
        };
        f.write_str(s)
    }
}

/// Result of a single stage within a run.
#[derive(Debug, Clone, Serialize)]
pub struct StageReport {
    pub stage: PipelineStage,
    pub status: StageStatus,
    pub duration_ms: u64,
    pub artifacts: usize,
    pub error: Option<String>,
}

impl StageReport {
    pub fn new(stage: PipelineStage, status: StageStatus) -> Self {
        Self {
            stage,
            status,
            duration_ms: 0,
            artifacts: 0,
            error: None,
        }
    }

    /// Whether this stage ran and passed.
    pub fn passed(&self) -> bool {
        self.status == StageStatus::Succeeded
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_report_passed() {
        let report = StageReport::new(PipelineStage::Import, StageStatus::Succeeded);
        assert!(report.passed());
        let report = StageReport::new(PipelineStage::Import, StageStatus::Rediscovered);
        assert!(!report.passed());
    }
}
