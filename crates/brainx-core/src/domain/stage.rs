//! The fixed, ordered set of pipeline stages.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::artifact::ModuleDir;
use crate::domain::error::{BrainxError, Result};
use crate::domain::quality::PipelineKind;

/// One of the eight ordered stages of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStage {
    Import,
    Preprocess,
    BrainExtraction,
    Registration,
    Segmentation,
    Analysis,
    Visualization,
    Tracking,
}

/// A glob pattern within a module directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputPattern {
    pub module: ModuleDir,
    pub pattern: &'static str,
}

/// An artifact a stage consumes, and the stage that produces it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Prerequisite {
    pub output: OutputPattern,
    pub produced_by: PipelineStage,
}

const fn out(module: ModuleDir, pattern: &'static str) -> OutputPattern {
    OutputPattern { module, pattern }
}

const fn pre(module: ModuleDir, pattern: &'static str, produced_by: PipelineStage) -> Prerequisite {
    Prerequisite {
        output: OutputPattern { module, pattern },
        produced_by,
    }
}

use ModuleDir as M;
use PipelineStage as S;

const IMPORT_OUT: &[OutputPattern] = &[
    out(M::Extracted, "*.nii.gz"),
    out(M::Metadata, "scanner_params.json"),
];
const PREPROCESS_OUT: &[OutputPattern] = &[
    out(M::Metadata, "reference_space.json"),
    out(M::Metadata, "selected_scans.json"),
    out(M::BiasCorrected, "*_n4.nii.gz"),
];
const BRAIN_OUT: &[OutputPattern] = &[
    out(M::BrainExtraction, "*_brain.nii.gz"),
    out(M::BrainExtraction, "*_brain_mask.nii.gz"),
    out(M::Standardized, "*_std.nii.gz"),
];
const REGISTRATION_OUT: &[OutputPattern] = &[
    out(M::Registered, "*_reg.nii.gz"),
    out(M::ValidationRegistration, "*_registration.json"),
];
const SEGMENTATION_OUT: &[OutputPattern] = &[
    out(M::SegmentationBrainstem, "*_brainstem.nii.gz"),
    out(M::SegmentationPons, "*_pons.nii.gz"),
    out(M::ValidationSegmentation, "*_segmentation.json"),
];
const ANALYSIS_OUT: &[OutputPattern] = &[
    out(M::HyperintensityThresholds, "*_thresh*.nii.gz"),
    out(M::HyperintensityClusters, "*_clusters*.tsv"),
    out(M::ValidationHyperintensities, "*_hyperintensities.json"),
    out(M::ValidationHyperintensities, "*_brainstem_values.txt"),
];
const VISUALIZATION_OUT: &[OutputPattern] = &[
    out(M::QcVisualizations, "*.png"),
    out(M::Reports, "qc_manifest.json"),
];
const TRACKING_OUT: &[OutputPattern] = &[
    out(M::Reports, "cluster_dicom_trace.json"),
    out(M::Summary, "pipeline_summary.json"),
    out(M::Summary, "pipeline_summary.md"),
];

const PREPROCESS_PRE: &[Prerequisite] = &[pre(M::Extracted, "*.nii.gz", S::Import)];
const BRAIN_PRE: &[Prerequisite] = &[
    pre(M::Metadata, "reference_space.json", S::Preprocess),
    pre(M::Metadata, "selected_scans.json", S::Preprocess),
    pre(M::BiasCorrected, "*_n4.nii.gz", S::Preprocess),
];
const REGISTRATION_PRE: &[Prerequisite] = &[
    pre(M::Metadata, "reference_space.json", S::Preprocess),
    pre(M::Standardized, "*_std.nii.gz", S::BrainExtraction),
];
const SEGMENTATION_PRE: &[Prerequisite] = &[
    pre(M::Metadata, "reference_space.json", S::Preprocess),
    pre(M::Registered, "*_reg.nii.gz", S::Registration),
];
const ANALYSIS_PRE: &[Prerequisite] = &[
    pre(M::Registered, "*_reg.nii.gz", S::Registration),
    pre(M::SegmentationBrainstem, "*_brainstem.nii.gz", S::Segmentation),
];
const VISUALIZATION_PRE: &[Prerequisite] = &[
    pre(M::Registered, "*_reg.nii.gz", S::Registration),
    pre(M::SegmentationBrainstem, "*_brainstem.nii.gz", S::Segmentation),
];
/// Everything the summary reports on. QC overlays are best-effort and not
/// required.
const TRACKING_PRE: &[Prerequisite] = &[
    pre(M::Metadata, "scanner_params.json", S::Import),
    pre(M::Metadata, "reference_space.json", S::Preprocess),
    pre(M::Standardized, "*_std.nii.gz", S::BrainExtraction),
    pre(M::Registered, "*_reg.nii.gz", S::Registration),
    pre(M::SegmentationBrainstem, "*_brainstem.nii.gz", S::Segmentation),
    pre(M::ValidationHyperintensities, "*_hyperintensities.json", S::Analysis),
];

impl PipelineStage {
    pub const ALL: [PipelineStage; 8] = [
        S::Import,
        S::Preprocess,
        S::BrainExtraction,
        S::Registration,
        S::Segmentation,
        S::Analysis,
        S::Visualization,
        S::Tracking,
    ];

    /// 1-based position in the run.
    pub fn ordinal(&self) -> u8 {
        match self {
            S::Import => 1,
            S::Preprocess => 2,
            S::BrainExtraction => 3,
            S::Registration => 4,
            S::Segmentation => 5,
            S::Analysis => 6,
            S::Visualization => 7,
            S::Tracking => 8,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            S::Import => "import",
            S::Preprocess => "preprocess",
            S::BrainExtraction => "brain_extraction",
            S::Registration => "registration",
            S::Segmentation => "segmentation",
            S::Analysis => "analysis",
            S::Visualization => "visualization",
            S::Tracking => "tracking",
        }
    }

    pub fn declared_outputs(&self) -> &'static [OutputPattern] {
        match self {
            S::Import => IMPORT_OUT,
            S::Preprocess => PREPROCESS_OUT,
            S::BrainExtraction => BRAIN_OUT,
            S::Registration => REGISTRATION_OUT,
            S::Segmentation => SEGMENTATION_OUT,
            S::Analysis => ANALYSIS_OUT,
            S::Visualization => VISUALIZATION_OUT,
            S::Tracking => TRACKING_OUT,
        }
    }

    pub fn prerequisites(&self) -> &'static [Prerequisite] {
        match self {
            S::Import => &[],
            S::Preprocess => PREPROCESS_PRE,
            S::BrainExtraction => BRAIN_PRE,
            S::Registration => REGISTRATION_PRE,
            S::Segmentation => SEGMENTATION_PRE,
            S::Analysis => ANALYSIS_PRE,
            S::Visualization => VISUALIZATION_PRE,
            S::Tracking => TRACKING_PRE,
        }
    }

    /// Failures of a best-effort stage are counted but do not abort the run.
    pub fn best_effort_by_default(&self) -> bool {
        matches!(self, S::Visualization)
    }

    /// Whether a pipeline kind runs this stage at all.
    pub fn included_in(&self, kind: PipelineKind) -> bool {
        match kind {
            PipelineKind::Basic => !matches!(self, S::Visualization),
            PipelineKind::Full | PipelineKind::Batch => true,
        }
    }
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for PipelineStage {
    type Err = BrainxError;

    /// Accepts the stage name (`-` and `_` interchangeable) or its ordinal.
    fn from_str(s: &str) -> Result<Self> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        PipelineStage::ALL
            .into_iter()
            .find(|stage| stage.name() == normalized || stage.ordinal().to_string() == normalized)
            .ok_or_else(|| BrainxError::InvalidArgument(format!("unknown stage {s:?}")))
    }
}
