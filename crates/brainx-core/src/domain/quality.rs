//! Quality presets and pipeline kinds.

use std::fmt;
use std::str::FromStr;

use brainx_toolkit::TransformModel;
use serde::{Deserialize, Serialize};

use crate::domain::error::{BrainxError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum QualityPreset {
    Low,
    #[default]
    Medium,
    High,
}

/// Tool parameters implied by a quality preset.
#[derive(Debug, Clone, PartialEq)]
pub struct QualityParameters {
    pub bias_shrink_factor: u8,
    pub bias_iterations: Vec<u32>,
    pub fractional_intensity: f64,
    pub registration_model: TransformModel,
}

impl QualityPreset {
    pub fn parameters(&self) -> QualityParameters {
        match self {
            QualityPreset::Low => QualityParameters {
                bias_shrink_factor: 4,
                bias_iterations: vec![20, 20, 10],
                fractional_intensity: 0.5,
                registration_model: TransformModel::Rigid,
            },
            QualityPreset::Medium => QualityParameters {
                bias_shrink_factor: 4,
                bias_iterations: vec![50, 50, 30, 20],
                fractional_intensity: 0.5,
                registration_model: TransformModel::Affine,
            },
            QualityPreset::High => QualityParameters {
                bias_shrink_factor: 2,
                bias_iterations: vec![100, 100, 70, 50],
                fractional_intensity: 0.45,
                registration_model: TransformModel::Syn,
            },
        }
    }
}

impl fmt::Display for QualityPreset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            QualityPreset::Low => "LOW",
            QualityPreset::Medium => "MEDIUM",
            QualityPreset::High => "HIGH",
        })
    }
}

impl FromStr for QualityPreset {
    type Err = BrainxError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "LOW" => Ok(QualityPreset::Low),
            "MEDIUM" => Ok(QualityPreset::Medium),
            "HIGH" => Ok(QualityPreset::High),
            _ => Err(BrainxError::InvalidArgument(format!("unknown quality {s:?}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PipelineKind {
    /// Every stage except visualization.
    Basic,
    #[default]
    Full,
    /// One full run per subject sub-directory of the input.
    Batch,
}

impl fmt::Display for PipelineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PipelineKind::Basic => "BASIC",
            PipelineKind::Full => "FULL",
            PipelineKind::Batch => "BATCH",
        })
    }
}

impl FromStr for PipelineKind {
    type Err = BrainxError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "BASIC" => Ok(PipelineKind::Basic),
            "FULL" => Ok(PipelineKind::Full),
            "BATCH" => Ok(PipelineKind::Batch),
            _ => Err(BrainxError::InvalidArgument(format!("unknown pipeline {s:?}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presets_parse_case_insensitively() {
        assert_eq!("high".parse::<QualityPreset>().unwrap(), QualityPreset::High);
        assert_eq!("Basic".parse::<PipelineKind>().unwrap(), PipelineKind::Basic);
        assert!("ultra".parse::<QualityPreset>().is_err());
    }

    #[test]
    fn test_higher_quality_runs_more_iterations() {
        let low: u32 = QualityPreset::Low.parameters().bias_iterations.iter().sum();
        let high: u32 = QualityPreset::High.parameters().bias_iterations.iter().sum();
        assert!(high > low);
        assert_eq!(
            QualityPreset::High.parameters().registration_model,
            TransformModel::Syn
        );
    }
}
