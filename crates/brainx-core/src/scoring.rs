//! Scan quality scoring.
//!
//! `score(c) = size + dimension + voxel + contrast + acquisition_bonus`. Every
//! component is non-negative and every constant lives in [`ScoringPolicy`].
//! Scoring is a pure function of candidate metadata: the contrast proxy is
//! measured when the candidate is loaded, not here.

use serde::{Deserialize, Serialize};

use crate::domain::candidate::{AcquisitionType, ScanCandidate};
use crate::domain::modality::ModalityRole;

const MIB: f64 = 1024.0 * 1024.0;

/// `[scoring]` configuration section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringPolicy {
    /// Size ceiling (MiB) for the primary anatomical modality.
    pub primary_size_ceiling_mib: f64,
    /// Size ceiling (MiB) for every other modality.
    pub size_ceiling_mib: f64,
    pub dimension_divisor: f64,
    pub dimension_ceiling: f64,
    pub voxel_numerator: f64,
    pub voxel_ceiling: f64,
    pub contrast_ceiling: f64,
    pub acquisition_bonus: f64,
    pub similarity_weight: f64,
    pub fluid_similarity_weight: f64,
}

impl Default for ScoringPolicy {
    fn default() -> Self {
        Self {
            primary_size_ceiling_mib: 10.0,
            size_ceiling_mib: 5.0,
            dimension_divisor: 1_000_000.0,
            dimension_ceiling: 10.0,
            voxel_numerator: 10.0,
            voxel_ceiling: 10.0,
            contrast_ceiling: 10.0,
            acquisition_bonus: 100.0,
            similarity_weight: 5.0,
            fluid_similarity_weight: 1.0,
        }
    }
}

/// Per-component score of one candidate.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct ScoreBreakdown {
    pub size: f64,
    pub dimension: f64,
    pub voxel: f64,
    pub contrast: f64,
    pub acquisition: f64,
}

impl ScoreBreakdown {
    pub fn total(&self) -> f64 {
        self.size + self.dimension + self.voxel + self.contrast + self.acquisition
    }
}

fn clamp_component(value: f64, ceiling: f64) -> f64 {
    if value.is_finite() {
        value.clamp(0.0, ceiling.max(0.0))
    } else {
        0.0
    }
}

impl ScoringPolicy {
    pub fn score(&self, c: &ScanCandidate) -> ScoreBreakdown {
        let primary = c.modality.role() == ModalityRole::PrimaryAnatomical;

        let size_ceiling = if primary {
            self.primary_size_ceiling_mib
        } else {
            self.size_ceiling_mib
        };
        let size = clamp_component(c.size_bytes as f64 / MIB, size_ceiling);

        let dimension = if self.dimension_divisor > 0.0 {
            clamp_component(c.voxel_count() as f64 / self.dimension_divisor, self.dimension_ceiling)
        } else {
            0.0
        };

        let volume = c.voxel_volume();
        let voxel = if volume > 0.0 && volume.is_finite() {
            clamp_component(self.voxel_numerator / volume, self.voxel_ceiling)
        } else {
            0.0
        };

        let contrast = match (primary, c.contrast) {
            (true, Some(proxy)) => clamp_component(proxy, self.contrast_ceiling),
            _ => 0.0,
        };

        let acquisition = if c.acquisition == AcquisitionType::Direct {
            self.acquisition_bonus.max(0.0)
        } else {
            0.0
        };

        ScoreBreakdown {
            size,
            dimension,
            voxel,
            contrast,
            acquisition,
        }
    }

    /// Score of a secondary candidate given the chosen primary.
    pub fn secondary_score(&self, c: &ScanCandidate, primary: Option<&ScanCandidate>) -> f64 {
        let base = self.score(c).total();
        let Some(primary) = primary else {
            return base;
        };
        let weight = match c.modality.role() {
            ModalityRole::FluidSensitive => self.fluid_similarity_weight,
            _ => self.similarity_weight,
        };
        base + weight * resolution_similarity(&c.voxel_mm, &primary.voxel_mm)
    }
}

/// `1 / (1 + euclid(a, b))`: 1 for identical grids, falling toward 0.
pub fn resolution_similarity(a: &[f64; 3], b: &[f64; 3]) -> f64 {
    let distance = a
        .iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y).powi(2))
        .sum::<f64>()
        .sqrt();
    if distance.is_finite() {
        1.0 / (1.0 + distance)
    } else {
        0.0
    }
}

/// Two-class contrast separation from four intensity statistics.
///
/// Foreground is everything above 10% of the maximum; it is split at its
/// mean and the proxy is the class-mean gap over the foreground deviation.
pub fn contrast_proxy(fg_sd: f64, upper_mean: f64, lower_mean: f64) -> Option<f64> {
    if fg_sd > 0.0 && fg_sd.is_finite() && upper_mean.is_finite() && lower_mean.is_finite() {
        Some(((upper_mean - lower_mean) / fg_sd).max(0.0))
    } else {
        None
    }
}
