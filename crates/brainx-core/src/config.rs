//! Pipeline configuration.
//!
//! Loaded from an optional TOML file; every section has defaults, so an
//! empty file (or none at all) is a valid configuration. CLI flags are
//! applied on top by the binary, then [`PipelineConfig::validate`] runs.

use std::path::{Path, PathBuf};
use std::time::Duration;

use brainx_toolkit::ToolPaths;
use serde::{Deserialize, Serialize};

use crate::dispatch::HaltPolicy;
use crate::domain::decision::ReferenceStrategy;
use crate::domain::error::{BrainxError, Result};
use crate::domain::modality::{Modality, ModalityPatterns};
use crate::domain::quality::{PipelineKind, QualityPreset};
use crate::domain::stage::PipelineStage;
use crate::scoring::ScoringPolicy;

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub subject: Option<String>,
    pub input_dir: Option<PathBuf>,
    pub output_dir: Option<PathBuf>,
    pub quality: QualityPreset,
    pub pipeline: PipelineKind,
    pub start_stage: Option<PipelineStage>,
    pub reference_strategy: ReferenceStrategy,
    pub parallel: ParallelConfig,
    pub scoring: ScoringPolicy,
    pub modalities: ModalityPatterns,
    pub import: ImportConfig,
    pub analysis: AnalysisConfig,
    pub validation: ValidationConfig,
    pub stages: StagesConfig,
    pub tools: ToolPaths,
}

/// `[parallel]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParallelConfig {
    pub enabled: bool,
    /// Concurrent workers per batch; 0 means one per core.
    pub jobs: usize,
    pub halt_policy: HaltPolicy,
    /// 0 means unbounded.
    pub batch_timeout_secs: u64,
}

impl Default for ParallelConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            jobs: 0,
            halt_policy: HaltPolicy::StopOnFirstFailure,
            batch_timeout_secs: 0,
        }
    }
}

impl ParallelConfig {
    pub fn batch_timeout(&self) -> Option<Duration> {
        (self.batch_timeout_secs > 0).then(|| Duration::from_secs(self.batch_timeout_secs))
    }
}

/// `[import]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImportConfig {
    /// DICOM file patterns, tried in order; the first with a match wins.
    pub dicom_patterns: Vec<String>,
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self {
            dicom_patterns: ["*.dcm", "IM*", "Image*", "*.[0-9][0-9][0-9][0-9]", "DICOM*"]
                .into_iter()
                .map(str::to_string)
                .collect(),
        }
    }
}

/// `[analysis]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    /// Threshold = mean + k * sd within the brainstem, one mask per k.
    pub threshold_multipliers: Vec<f64>,
    pub min_cluster_voxels: u64,
    pub overlap_distance_mm: f64,
    /// Which multiplier's clusters feed the cross-modality overlap table.
    pub overlap_multiplier: f64,
    pub modalities: Vec<Modality>,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            threshold_multipliers: vec![1.5, 2.0, 2.5, 3.0],
            min_cluster_voxels: 10,
            overlap_distance_mm: 10.0,
            overlap_multiplier: 2.0,
            modalities: vec![Modality::Flair],
        }
    }
}

/// `[validation]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationConfig {
    pub min_image_bytes: u64,
    pub min_registration_correlation: f64,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            min_image_bytes: 1024,
            min_registration_correlation: 0.5,
        }
    }
}

/// `[stages]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StagesConfig {
    /// Stages whose failure is counted but does not abort the run.
    pub best_effort: Vec<PipelineStage>,
}

impl Default for StagesConfig {
    fn default() -> Self {
        Self {
            best_effort: PipelineStage::ALL
                .into_iter()
                .filter(PipelineStage::best_effort_by_default)
                .collect(),
        }
    }
}

impl PipelineConfig {
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| BrainxError::Config(format!("parse TOML failed: {e}")))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => BrainxError::FileNotFound(path.to_path_buf()),
            std::io::ErrorKind::PermissionDenied => BrainxError::Permission(path.to_path_buf()),
            _ => BrainxError::Io(e),
        })?;
        Self::from_toml_str(&content)
    }

    pub fn is_best_effort(&self, stage: PipelineStage) -> bool {
        self.stages.best_effort.contains(&stage)
    }

    /// Reject values no run could use.
    pub fn validate(&self) -> Result<()> {
        let s = &self.scoring;
        let ceilings = [
            ("primary_size_ceiling_mib", s.primary_size_ceiling_mib),
            ("size_ceiling_mib", s.size_ceiling_mib),
            ("dimension_divisor", s.dimension_divisor),
            ("dimension_ceiling", s.dimension_ceiling),
            ("voxel_ceiling", s.voxel_ceiling),
            ("contrast_ceiling", s.contrast_ceiling),
        ];
        for (name, value) in ceilings {
            if !(value > 0.0 && value.is_finite()) {
                return Err(BrainxError::InvalidArgument(format!(
                    "scoring.{name} must be positive, got {value}"
                )));
            }
        }
        for (name, value) in [
            ("voxel_numerator", s.voxel_numerator),
            ("acquisition_bonus", s.acquisition_bonus),
            ("similarity_weight", s.similarity_weight),
            ("fluid_similarity_weight", s.fluid_similarity_weight),
        ] {
            if !(value >= 0.0 && value.is_finite()) {
                return Err(BrainxError::InvalidArgument(format!(
                    "scoring.{name} must be non-negative, got {value}"
                )));
            }
        }

        let a = &self.analysis;
        if a.threshold_multipliers.is_empty() {
            return Err(BrainxError::InvalidArgument(
                "analysis.threshold_multipliers must not be empty".into(),
            ));
        }
        if a.modalities.is_empty() {
            return Err(BrainxError::InvalidArgument(
                "analysis.modalities must not be empty".into(),
            ));
        }
        if !(a.overlap_distance_mm > 0.0) {
            return Err(BrainxError::InvalidArgument(
                "analysis.overlap_distance_mm must be positive".into(),
            ));
        }
        if self.import.dicom_patterns.is_empty() {
            return Err(BrainxError::InvalidArgument(
                "import.dicom_patterns must not be empty".into(),
            ));
        }
        for pattern in &self.import.dicom_patterns {
            glob::Pattern::new(pattern).map_err(|e| {
                BrainxError::InvalidArgument(format!("import pattern {pattern:?}: {e}"))
            })?;
        }
        if let Some(subject) = &self.subject {
            if subject.is_empty() || subject.contains(['/', '\\']) {
                return Err(BrainxError::InvalidArgument(format!(
                    "subject id {subject:?} must be a non-empty file name"
                )));
            }
        }

        self.modalities.compile()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_toml_is_default() {
        let config = PipelineConfig::from_toml_str("").unwrap();
        assert_eq!(config, PipelineConfig::default());
        assert!(config.validate().is_ok());
        assert!(config.is_best_effort(PipelineStage::Visualization));
        assert!(!config.is_best_effort(PipelineStage::Registration));
    }

    #[test]
    fn test_sections_override_defaults() {
        let config = PipelineConfig::from_toml_str(
            r#"
            quality = "HIGH"
            pipeline = "BASIC"
            start_stage = "registration"
            reference_strategy = "always-secondary"

            [parallel]
            jobs = 3
            halt_policy = "best-effort"
            batch_timeout_secs = 600

            [scoring]
            acquisition_bonus = 50.0

            [analysis]
            threshold_multipliers = [2.0]
            modalities = ["FLAIR", "T2"]

            [modalities.swi]
            include = "(?i)swan"

            [tools]
            bet = "/opt/fsl/bin/bet"
            "#,
        )
        .unwrap();

        assert_eq!(config.quality, QualityPreset::High);
        assert_eq!(config.pipeline, PipelineKind::Basic);
        assert_eq!(config.start_stage, Some(PipelineStage::Registration));
        assert_eq!(config.reference_strategy, ReferenceStrategy::AlwaysSecondary);
        assert_eq!(config.parallel.jobs, 3);
        assert_eq!(config.parallel.halt_policy, HaltPolicy::BestEffort);
        assert_eq!(config.parallel.batch_timeout(), Some(Duration::from_secs(600)));
        assert_eq!(config.scoring.acquisition_bonus, 50.0);
        assert_eq!(config.scoring.similarity_weight, 5.0);
        assert_eq!(config.analysis.modalities, vec![Modality::Flair, Modality::T2]);
        assert_eq!(config.modalities.swi.include, "(?i)swan");
        assert_eq!(config.tools.bet, "/opt/fsl/bin/bet");
        assert_eq!(config.tools.fslinfo, "fslinfo");
    }

    #[test]
    fn test_bad_toml_is_config_error() {
        let err = PipelineConfig::from_toml_str("quality = [").unwrap_err();
        assert!(matches!(err, BrainxError::Config(_)));
    }

    #[test]
    fn test_validate_rejects_non_positive_ceiling() {
        let mut config = PipelineConfig::default();
        config.scoring.size_ceiling_mib = 0.0;
        assert!(matches!(config.validate(), Err(BrainxError::InvalidArgument(_))));
    }

    #[test]
    fn test_validate_rejects_empty_thresholds() {
        let mut config = PipelineConfig::default();
        config.analysis.threshold_multipliers.clear();
        assert!(matches!(config.validate(), Err(BrainxError::InvalidArgument(_))));
    }

    #[test]
    fn test_validate_rejects_bad_modality_regex() {
        let mut config = PipelineConfig::default();
        config.modalities.t1.include = "[".into();
        assert!(matches!(config.validate(), Err(BrainxError::InvalidArgument(_))));
    }

    #[test]
    fn test_missing_file_is_file_not_found() {
        let err = PipelineConfig::load(Path::new("/nonexistent/brainx.toml")).unwrap_err();
        assert_eq!(err.exit_code(), 3);
    }
}
