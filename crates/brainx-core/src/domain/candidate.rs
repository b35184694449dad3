//! Scan candidates considered during reference selection.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::domain::modality::Modality;

/// Relative spread of voxel edges still counted as isotropic.
pub const ISOTROPY_TOLERANCE: f64 = 0.1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AcquisitionType {
    /// `ImageType` contains ORIGINAL and not DERIVED.
    Direct,
    Derived,
    #[default]
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AcquisitionDim {
    #[serde(rename = "2D")]
    TwoD,
    #[serde(rename = "3D")]
    ThreeD,
}

/// What the converter's JSON sidecar says about how a series was acquired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AcquisitionInfo {
    pub acquisition: AcquisitionType,
    pub dimensionality: Option<AcquisitionDim>,
}

impl AcquisitionInfo {
    /// Read `ImageType` (array or backslash-joined string) and
    /// `MRAcquisitionType` from a sidecar document.
    pub fn from_sidecar(doc: &serde_json::Value) -> Self {
        let tokens: Vec<String> = match doc.get("ImageType") {
            Some(serde_json::Value::Array(items)) => items
                .iter()
                .filter_map(|v| v.as_str())
                .map(str::to_ascii_uppercase)
                .collect(),
            Some(serde_json::Value::String(s)) => {
                s.split('\\').map(str::to_ascii_uppercase).collect()
            }
            _ => Vec::new(),
        };

        let acquisition = if tokens.is_empty() {
            AcquisitionType::Unknown
        } else if tokens.iter().any(|t| t == "DERIVED") {
            AcquisitionType::Derived
        } else if tokens.iter().any(|t| t == "ORIGINAL") {
            AcquisitionType::Direct
        } else {
            AcquisitionType::Unknown
        };

        let dimensionality = match doc.get("MRAcquisitionType").and_then(|v| v.as_str()) {
            Some(s) if s.eq_ignore_ascii_case("3D") => Some(AcquisitionDim::ThreeD),
            Some(s) if s.eq_ignore_ascii_case("2D") => Some(AcquisitionDim::TwoD),
            _ => None,
        };

        Self {
            acquisition,
            dimensionality,
        }
    }

    /// Load the sidecar next to an image; absent or unreadable means unknown.
    pub fn load_for(image: &Path) -> Self {
        let sidecar = sidecar_path(image);
        std::fs::read(&sidecar)
            .ok()
            .and_then(|bytes| serde_json::from_slice::<serde_json::Value>(&bytes).ok())
            .map(|doc| Self::from_sidecar(&doc))
            .unwrap_or_default()
    }
}

/// `x/T1_2.nii.gz` -> `x/T1_2.json`.
pub fn sidecar_path(image: &Path) -> PathBuf {
    let stem = crate::artifact::image_stem(image);
    image.with_file_name(format!("{stem}.json"))
}

/// One candidate file for a modality, with the metadata scoring needs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanCandidate {
    pub path: PathBuf,
    pub modality: Modality,
    /// Voxel edge lengths in millimetres.
    pub voxel_mm: [f64; 3],
    pub dims: [u32; 3],
    pub size_bytes: u64,
    pub acquisition: AcquisitionType,
    pub dimensionality: Option<AcquisitionDim>,
    pub contrast: Option<f64>,
}

impl ScanCandidate {
    pub fn voxel_volume(&self) -> f64 {
        self.voxel_mm.iter().product()
    }

    pub fn voxel_count(&self) -> u64 {
        self.dims.iter().map(|&d| u64::from(d)).product()
    }

    pub fn is_isotropic(&self) -> bool {
        let min = self.voxel_mm.iter().copied().fold(f64::INFINITY, f64::min);
        let max = self.voxel_mm.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        min > 0.0 && min.is_finite() && max.is_finite() && (max - min) / min <= ISOTROPY_TOLERANCE
    }

    /// Directly acquired, 3-D and isotropic: the preferred reference grid.
    pub fn is_direct_3d_isotropic(&self) -> bool {
        self.acquisition == AcquisitionType::Direct
            && self.dimensionality == Some(AcquisitionDim::ThreeD)
            && self.is_isotropic()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn candidate(voxel_mm: [f64; 3]) -> ScanCandidate {
        ScanCandidate {
            path: PathBuf::from("x.nii.gz"),
            modality: Modality::T1,
            voxel_mm,
            dims: [176, 256, 256],
            size_bytes: 0,
            acquisition: AcquisitionType::Direct,
            dimensionality: Some(AcquisitionDim::ThreeD),
            contrast: None,
        }
    }

    #[test]
    fn test_sidecar_array_original() {
        let info = AcquisitionInfo::from_sidecar(&json!({
            "ImageType": ["ORIGINAL", "PRIMARY", "M"],
            "MRAcquisitionType": "3D"
        }));
        assert_eq!(info.acquisition, AcquisitionType::Direct);
        assert_eq!(info.dimensionality, Some(AcquisitionDim::ThreeD));
    }

    #[test]
    fn test_sidecar_derived_wins_over_original() {
        let info = AcquisitionInfo::from_sidecar(&json!({
            "ImageType": "ORIGINAL\\DERIVED\\MPR"
        }));
        assert_eq!(info.acquisition, AcquisitionType::Derived);
        assert_eq!(info.dimensionality, None);
    }

    #[test]
    fn test_missing_sidecar_is_unknown() {
        let info = AcquisitionInfo::load_for(Path::new("/nonexistent/x.nii.gz"));
        assert_eq!(info.acquisition, AcquisitionType::Unknown);
    }

    #[test]
    fn test_sidecar_path() {
        assert_eq!(
            sidecar_path(Path::new("/e/T1_MPRAGE_2.nii.gz")),
            PathBuf::from("/e/T1_MPRAGE_2.json")
        );
    }

    #[test]
    fn test_isotropy() {
        assert!(candidate([0.9, 0.9, 0.9]).is_isotropic());
        assert!(!candidate([1.0, 1.0, 1.2]).is_isotropic());
        assert!(!candidate([0.0, 1.0, 1.0]).is_isotropic());
        assert!(candidate([1.0, 1.0, 1.0]).is_direct_3d_isotropic());
    }
}
