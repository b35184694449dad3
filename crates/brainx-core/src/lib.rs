//! brainx core library
//!
//! Domain model, artifact layout, input selection, parallel dispatch and
//! validation for the brainx stage pipeline. Stage bodies and the
//! orchestrator live in `brainx-pipeline`; external tools are reached
//! through the traits in `brainx-toolkit`.

pub mod artifact;
pub mod config;
pub mod context;
pub mod dedupe;
pub mod dispatch;
pub mod domain;
pub mod obs;
pub mod scoring;
pub mod selection;
pub mod telemetry;
pub mod validation;

pub use artifact::{
    discover, glob_in, image_stem, relative_to, subject_basename, ArtifactKey, ArtifactKind,
    ModuleDir,
};
pub use config::{
    AnalysisConfig, ImportConfig, ParallelConfig, PipelineConfig, StagesConfig, ValidationConfig,
};
pub use context::{RunContext, RunState};
pub use dedupe::{dedupe, file_digest, DedupeReport};
pub use dispatch::{
    dispatch, BatchReport, DispatchError, HaltPolicy, ItemReport, ItemStatus, JobBatch, WorkerPool,
};
pub use domain::{
    exit, AcquisitionDim, AcquisitionInfo, AcquisitionType, BrainxError, Modality,
    ModalityMatcher, ModalityPattern, ModalityPatterns, ModalityRole, OutputPattern, PipelineKind,
    PipelineStage, Prerequisite, QualityParameters, QualityPreset, ReferenceDecision,
    ReferenceStrategy, Result, ScanCandidate, ScanSelection, SelectedScan,
};
pub use scoring::{contrast_proxy, resolution_similarity, ScoreBreakdown, ScoringPolicy};
pub use selection::{Chosen, ReferenceSelector, SelectionOutcome};
pub use telemetry::init_tracing;
pub use validation::{InvalidArtifact, ValidationGate, ValidationReport};
