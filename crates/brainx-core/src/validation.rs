//! Validation gate: a stage's declared outputs must exist and, for
//! volumetric artifacts, pass structural sanity checks.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use brainx_toolkit::ImageInfoProbe;
use serde::Serialize;
use tracing::debug;

use crate::artifact::{glob_in, ArtifactKind};
use crate::domain::error::{BrainxError, Result};
use crate::domain::stage::PipelineStage;

/// A present artifact that failed a structural check.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InvalidArtifact {
    pub path: PathBuf,
    pub reason: String,
}

/// Outcome of validating a set of patterns or paths.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ValidationReport {
    /// Patterns (or concrete paths) with no matching file.
    pub missing: Vec<String>,
    pub invalid: Vec<InvalidArtifact>,
    /// Files that matched and passed.
    pub checked: Vec<PathBuf>,
}

impl ValidationReport {
    pub fn is_ok(&self) -> bool {
        self.missing.is_empty() && self.invalid.is_empty()
    }

    pub fn merge(&mut self, other: ValidationReport) {
        self.missing.extend(other.missing);
        self.invalid.extend(other.invalid);
        for path in other.checked {
            if !self.checked.contains(&path) {
                self.checked.push(path);
            }
        }
    }

    /// `Ok(())` when clean, otherwise a `Validation` error for `stage`.
    pub fn into_result(self, stage: PipelineStage) -> Result<()> {
        if self.is_ok() {
            return Ok(());
        }
        Err(BrainxError::Validation {
            stage: stage.name().to_string(),
            missing: self.missing,
            invalid: self
                .invalid
                .into_iter()
                .map(|i| format!("{}: {}", i.path.display(), i.reason))
                .collect(),
        })
    }
}

/// Checks artifacts against existence, minimum size and header readability.
#[derive(Clone)]
pub struct ValidationGate {
    probe: Arc<dyn ImageInfoProbe>,
    min_image_bytes: u64,
}

impl ValidationGate {
    pub fn new(probe: Arc<dyn ImageInfoProbe>, min_image_bytes: u64) -> Self {
        Self {
            probe,
            min_image_bytes,
        }
    }

    /// Validate `patterns` relative to `module_dir`.
    ///
    /// Wildcard patterns are globbed; a pattern with no match is missing.
    pub async fn validate(&self, module_dir: &Path, patterns: &[&str]) -> Result<ValidationReport> {
        let mut report = ValidationReport::default();
        for pattern in patterns {
            let matches = if is_wildcard(pattern) {
                glob_in(module_dir, pattern)?
            } else {
                let path = module_dir.join(pattern);
                if path.is_file() {
                    vec![path]
                } else {
                    Vec::new()
                }
            };

            if matches.is_empty() {
                report
                    .missing
                    .push(module_dir.join(pattern).to_string_lossy().to_string());
                continue;
            }
            for path in matches {
                self.check_file(&path, &mut report).await;
            }
        }
        Ok(report)
    }

    /// Validate concrete paths reported by a stage body.
    pub async fn validate_paths(&self, paths: &[PathBuf]) -> ValidationReport {
        let mut report = ValidationReport::default();
        for path in paths {
            if !path.is_file() {
                report.missing.push(path.to_string_lossy().to_string());
                continue;
            }
            self.check_file(path, &mut report).await;
        }
        report
    }

    /// Declared outputs of `stage` under `output_root`, plus `reported` paths.
    pub async fn validate_stage(
        &self,
        output_root: &Path,
        stage: PipelineStage,
        reported: &[PathBuf],
    ) -> Result<ValidationReport> {
        let mut report = ValidationReport::default();
        for output in stage.declared_outputs() {
            let dir = output.module.dir(output_root);
            report.merge(self.validate(&dir, &[output.pattern]).await?);
        }
        report.merge(self.validate_paths(reported).await);
        debug!(
            stage = %stage,
            checked = report.checked.len(),
            missing = report.missing.len(),
            invalid = report.invalid.len(),
            "validation gate"
        );
        Ok(report)
    }

    async fn check_file(&self, path: &Path, report: &mut ValidationReport) {
        if report.checked.iter().any(|p| p == path) {
            return;
        }
        let volumetric = ArtifactKind::infer(path).is_some_and(|k| k.is_volumetric());
        if volumetric {
            let size = match tokio::fs::metadata(path).await {
                Ok(meta) => meta.len(),
                Err(e) => {
                    report.invalid.push(InvalidArtifact {
                        path: path.to_path_buf(),
                        reason: format!("unreadable: {e}"),
                    });
                    return;
                }
            };
            if size < self.min_image_bytes {
                report.invalid.push(InvalidArtifact {
                    path: path.to_path_buf(),
                    reason: format!("{size} bytes, below minimum {}", self.min_image_bytes),
                });
                return;
            }
            if let Err(e) = self.probe.header(path).await {
                report.invalid.push(InvalidArtifact {
                    path: path.to_path_buf(),
                    reason: format!("header unreadable: {e}"),
                });
                return;
            }
        }
        report.checked.push(path.to_path_buf());
    }
}

fn is_wildcard(pattern: &str) -> bool {
    pattern.contains(['*', '?', '['])
}
