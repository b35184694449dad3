//! Scanner metadata normalised from the first DICOM header of a study.

use brainx_core::{ArtifactKey, ModuleDir};
use brainx_toolkit::DicomHeader;
use serde::{Deserialize, Serialize};

pub const DEFAULT_FIELD_STRENGTH: &str = "1.5T";
pub const SOURCE_HEADER: &str = "dicom-header";
pub const SOURCE_FALLBACK: &str = "basic-extraction-fallback";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScannerParams {
    pub manufacturer: String,
    pub field_strength: String,
    pub model_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub study_description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub series_description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub protocol_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sequence_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub software_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub station_name: Option<String>,
    pub source: String,
}

impl ScannerParams {
    /// `metadata/scanner_params.json`
    pub fn artifact() -> ArtifactKey {
        ArtifactKey::new(ModuleDir::Metadata, "scanner_params").ext("json")
    }

    /// Defaults used when no header could be read.
    pub fn fallback() -> Self {
        Self {
            manufacturer: "Unknown".to_string(),
            field_strength: DEFAULT_FIELD_STRENGTH.to_string(),
            model_name: "Unknown".to_string(),
            study_description: None,
            series_description: None,
            protocol_name: None,
            sequence_name: None,
            software_version: None,
            station_name: None,
            source: SOURCE_FALLBACK.to_string(),
        }
    }

    pub fn from_header(header: &DicomHeader) -> Self {
        let owned = |key: &str| header.get(key).map(str::to_string);
        let manufacturer = normalize_manufacturer(header.get("Manufacturer").unwrap_or("Unknown"));

        let mut params = Self {
            field_strength: field_strength(header.get("MagneticFieldStrength")),
            model_name: owned("ManufacturerModelName").unwrap_or_else(|| "Unknown".to_string()),
            study_description: owned("StudyDescription"),
            series_description: owned("SeriesDescription"),
            protocol_name: None,
            sequence_name: None,
            software_version: None,
            station_name: None,
            source: SOURCE_HEADER.to_string(),
            manufacturer,
        };
        match params.manufacturer.as_str() {
            "SIEMENS" => {
                params.protocol_name = owned("ProtocolName");
                params.sequence_name = owned("SequenceName");
                params.software_version = owned("SoftwareVersions");
            }
            "PHILIPS" => params.station_name = owned("StationName"),
            _ => {}
        }
        params
    }
}

/// Fold vendor strings onto `SIEMENS`, `PHILIPS` or `GE`; anything else is
/// upper-cased.
pub fn normalize_manufacturer(raw: &str) -> String {
    let lower = raw.trim().to_ascii_lowercase();
    if lower.contains("siemens") {
        "SIEMENS".to_string()
    } else if lower.contains("philips") {
        "PHILIPS".to_string()
    } else if lower.contains("ge") {
        "GE".to_string()
    } else {
        raw.trim().to_ascii_uppercase()
    }
}

/// `"3"` -> `"3.0T"`; missing or unparsable values fall back to 1.5T.
pub fn field_strength(raw: Option<&str>) -> String {
    raw.and_then(|s| s.trim().parse::<f64>().ok())
        .filter(|v| v.is_finite() && *v > 0.0)
        .map(|v| format!("{v:.1}T"))
        .unwrap_or_else(|| DEFAULT_FIELD_STRENGTH.to_string())
}
