//! What a stage body can see: the run's identity, configuration, tools and
//! worker pool. Cheap to clone so dispatch closures can own a copy.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use brainx_core::{
    subject_basename, ArtifactKey, BatchReport, BrainxError, HaltPolicy, ItemStatus, JobBatch, Modality,
    ModuleDir, PipelineConfig, QualityParameters, QualityPreset, Result, RunContext, ValidationGate,
    WorkerPool,
};
use brainx_toolkit::Toolkit;
use tracing::{debug, warn};

#[derive(Clone)]
pub struct StageEnv {
    pub subject: String,
    pub input_dir: PathBuf,
    pub output_root: PathBuf,
    pub quality: QualityPreset,
    pub config: Arc<PipelineConfig>,
    pub toolkit: Toolkit,
    pub pool: WorkerPool,
    pub gate: ValidationGate,
}

impl StageEnv {
    pub fn for_run(
        ctx: &RunContext,
        config: Arc<PipelineConfig>,
        toolkit: Toolkit,
        pool: WorkerPool,
    ) -> Self {
        let gate = ValidationGate::new(toolkit.info.clone(), config.validation.min_image_bytes);
        Self {
            subject: ctx.subject.clone(),
            input_dir: ctx.input_dir.clone(),
            output_root: ctx.output_root.clone(),
            quality: ctx.quality,
            config,
            toolkit,
            pool,
            gate,
        }
    }

    pub fn root(&self) -> &Path {
        &self.output_root
    }

    pub fn params(&self) -> QualityParameters {
        self.quality.parameters()
    }

    /// `<subject>_<MODALITY>`
    pub fn basename(&self, modality: Modality) -> String {
        subject_basename(&self.subject, modality.tag())
    }

    pub fn key(&self, module: ModuleDir, modality: Modality) -> ArtifactKey {
        ArtifactKey::new(module, self.basename(modality))
    }

    /// Subject-level artifact (not tied to a modality).
    pub fn subject_key(&self, module: ModuleDir) -> ArtifactKey {
        ArtifactKey::new(module, self.subject.clone())
    }

    pub fn path(&self, key: &ArtifactKey) -> PathBuf {
        key.path(&self.output_root)
    }

    pub fn ensure(&self, module: ModuleDir) -> Result<PathBuf> {
        module.ensure(&self.output_root)
    }

    /// A batch configured from `[parallel]`.
    pub fn batch<T>(&self, operation: &str, inputs: Vec<T>) -> JobBatch<T> {
        let parallel = &self.config.parallel;
        JobBatch::new(operation, inputs)
            .degree(self.pool.degree_for(parallel.jobs))
            .halt(parallel.halt_policy)
            .timeout(parallel.batch_timeout())
    }

    /// Threads each external tool may use when `degree` jobs share the host.
    pub fn threads_per_job(&self, degree: usize) -> usize {
        (self.pool.max_workers() / degree.max(1)).max(1)
    }
}

/// Per-modality batch results.
///
/// Under stop-on-first-failure any failure fails the stage. Under
/// best-effort only failures of required modalities do; the rest are
/// logged and dropped.
pub fn settle<R>(report: BatchReport<Modality, R>, halt: HaltPolicy) -> Result<Vec<(Modality, R)>> {
    let operation = report.operation.clone();
    let mut out = Vec::new();
    let mut first_required: Option<BrainxError> = None;
    let mut first_any: Option<BrainxError> = None;

    for item in report.items {
        match item.status {
            ItemStatus::Succeeded(r) => out.push((item.input, r)),
            ItemStatus::Failed(e) => {
                warn!(operation = %operation, modality = %item.input, error = %e, "batch item failed");
                if item.input.is_required() {
                    first_required.get_or_insert(e);
                } else {
                    first_any.get_or_insert(e);
                }
            }
            ItemStatus::NotAttempted => {
                debug!(operation = %operation, modality = %item.input, "not attempted")
            }
        }
    }

    if let Some(e) = first_required {
        return Err(e);
    }
    if halt == HaltPolicy::StopOnFirstFailure {
        if let Some(e) = first_any {
            return Err(e);
        }
    }
    Ok(out)
}
