//! Narrow, typed interfaces for every external collaborator.
//!
//! Each trait takes a request struct and returns a typed response. Parsing of
//! tool-specific report formats stays behind these traits (see [`crate::parse`]),
//! so orchestration code never sees raw tool output.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ToolResult;

/// The external collaborators brainx drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolKind {
    DicomConversion,
    DicomHeaders,
    BiasCorrection,
    BrainExtraction,
    Registration,
    Segmentation,
    ImageInfo,
    ImageStats,
    Similarity,
    LesionAnalysis,
    QcRender,
}

impl ToolKind {
    pub fn name(&self) -> &'static str {
        match self {
            ToolKind::DicomConversion => "dicom_conversion",
            ToolKind::DicomHeaders => "dicom_headers",
            ToolKind::BiasCorrection => "bias_correction",
            ToolKind::BrainExtraction => "brain_extraction",
            ToolKind::Registration => "registration",
            ToolKind::Segmentation => "segmentation",
            ToolKind::ImageInfo => "image_info",
            ToolKind::ImageStats => "image_stats",
            ToolKind::Similarity => "similarity",
            ToolKind::LesionAnalysis => "lesion_analysis",
            ToolKind::QcRender => "qc_render",
        }
    }

    /// Process exit code reported when this collaborator fails (20-29 band).
    pub fn exit_code(&self) -> i32 {
        match self {
            ToolKind::DicomConversion => 20,
            ToolKind::DicomHeaders => 21,
            ToolKind::BiasCorrection => 22,
            ToolKind::BrainExtraction => 23,
            ToolKind::Registration => 24,
            ToolKind::Segmentation => 25,
            ToolKind::ImageInfo | ToolKind::ImageStats | ToolKind::Similarity => 26,
            ToolKind::LesionAnalysis => 27,
            ToolKind::QcRender => 28,
        }
    }
}

impl fmt::Display for ToolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ---------------------------------------------------------------------------
// DICOM
// ---------------------------------------------------------------------------

/// Convert a directory of DICOM slices into volumetric files.
#[derive(Debug, Clone, PartialEq)]
pub struct ConvertRequest {
    pub input_dir: PathBuf,
    /// Shell-style pattern that selected the DICOM files (e.g. `Image*`).
    pub file_pattern: String,
    pub output_dir: PathBuf,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConvertOutput {
    /// Volumetric files present in the output directory, lexically sorted.
    pub files: Vec<PathBuf>,
    pub count: usize,
}

#[async_trait]
pub trait DicomConverter: Send + Sync {
    async fn convert(&self, request: &ConvertRequest) -> ToolResult<ConvertOutput>;
}

/// Raw header fields of one DICOM file, keyed by attribute keyword.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DicomHeader {
    pub fields: BTreeMap<String, String>,
}

impl DicomHeader {
    pub fn get(&self, keyword: &str) -> Option<&str> {
        self.fields
            .get(keyword)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }
}

#[async_trait]
pub trait DicomHeaderReader: Send + Sync {
    async fn read_header(&self, file: &Path) -> ToolResult<DicomHeader>;
}

// ---------------------------------------------------------------------------
// Preprocessing
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct BiasCorrectionRequest {
    pub input: PathBuf,
    pub mask: Option<PathBuf>,
    pub output: PathBuf,
    pub shrink_factor: u8,
    /// Iterations per resolution level.
    pub iterations: Vec<u32>,
}

#[async_trait]
pub trait BiasCorrector: Send + Sync {
    /// Returns the corrected image path.
    async fn correct(&self, request: &BiasCorrectionRequest) -> ToolResult<PathBuf>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct BrainExtractionRequest {
    pub input: PathBuf,
    /// Output brain image; the mask is written next to it with a `_mask` suffix.
    pub output: PathBuf,
    pub fractional_intensity: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BrainExtractionOutput {
    pub brain: PathBuf,
    pub mask: PathBuf,
}

#[async_trait]
pub trait BrainExtractor: Send + Sync {
    async fn extract(&self, request: &BrainExtractionRequest) -> ToolResult<BrainExtractionOutput>;
}

// ---------------------------------------------------------------------------
// Registration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransformModel {
    Rigid,
    Affine,
    Syn,
}

impl TransformModel {
    /// `antsRegistrationSyNQuick.sh -t` flag.
    pub fn flag(&self) -> &'static str {
        match self {
            TransformModel::Rigid => "r",
            TransformModel::Affine => "a",
            TransformModel::Syn => "s",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Interpolation {
    Linear,
    NearestNeighbor,
}

impl Interpolation {
    pub fn ants_name(&self) -> &'static str {
        match self {
            Interpolation::Linear => "Linear",
            Interpolation::NearestNeighbor => "NearestNeighbor",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RegistrationRequest {
    pub fixed: PathBuf,
    pub moving: PathBuf,
    /// Outputs are `<prefix>Warped.nii.gz`, `<prefix>0GenericAffine.mat`, ...
    pub output_prefix: PathBuf,
    pub model: TransformModel,
    pub threads: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RegistrationOutput {
    pub warped: PathBuf,
    pub transforms: Vec<PathBuf>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResampleRequest {
    pub input: PathBuf,
    pub reference: PathBuf,
    pub output: PathBuf,
    pub interpolation: Interpolation,
}

#[async_trait]
pub trait Registrar: Send + Sync {
    async fn register(&self, request: &RegistrationRequest) -> ToolResult<RegistrationOutput>;

    /// Resample `input` onto the voxel grid of `reference` (identity transform).
    async fn resample(&self, request: &ResampleRequest) -> ToolResult<PathBuf>;
}

// ---------------------------------------------------------------------------
// Segmentation
// ---------------------------------------------------------------------------

/// Atlas template plus label image and the label values brainx cares about.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AtlasReference {
    pub template: PathBuf,
    pub labels: PathBuf,
    /// Inclusive label range covering the whole brainstem.
    pub brainstem_labels: [u32; 2],
    pub pons_label: u32,
    pub dorsal_pons_label: u32,
    pub ventral_pons_label: u32,
}

impl Default for AtlasReference {
    fn default() -> Self {
        Self {
            template: PathBuf::from("atlas/brainstem_template.nii.gz"),
            labels: PathBuf::from("atlas/brainstem_labels.nii.gz"),
            brainstem_labels: [1, 3],
            pons_label: 2,
            dorsal_pons_label: 4,
            ventral_pons_label: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SegmentationRequest {
    pub image: PathBuf,
    pub atlas: AtlasReference,
    pub brainstem_output: PathBuf,
    pub pons_output: PathBuf,
    pub dorsal_pons_output: PathBuf,
    pub ventral_pons_output: PathBuf,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SegmentationOutput {
    pub brainstem: PathBuf,
    pub pons: PathBuf,
    pub dorsal_pons: PathBuf,
    pub ventral_pons: PathBuf,
}

#[async_trait]
pub trait Segmenter: Send + Sync {
    async fn segment(&self, request: &SegmentationRequest) -> ToolResult<SegmentationOutput>;
}

// ---------------------------------------------------------------------------
// Probes
// ---------------------------------------------------------------------------

/// Geometry read from a volumetric image header.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageHeader {
    /// Matrix dimensions (voxels along x, y, z).
    pub dims: [u32; 3],
    /// Voxel edge lengths in millimetres.
    pub pixdim: [f64; 3],
    pub datatype: String,
}

impl ImageHeader {
    pub fn voxel_count(&self) -> u64 {
        self.dims.iter().map(|&d| u64::from(d)).product()
    }

    pub fn voxel_volume(&self) -> f64 {
        self.pixdim.iter().product()
    }
}

#[async_trait]
pub trait ImageInfoProbe: Send + Sync {
    async fn header(&self, image: &Path) -> ToolResult<ImageHeader>;
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct StatsQuery {
    pub image: PathBuf,
    pub mask: Option<PathBuf>,
    /// Only voxels with intensity >= lower are counted.
    pub lower: Option<f64>,
    /// Only voxels with intensity <= upper are counted.
    pub upper: Option<f64>,
}

impl StatsQuery {
    pub fn new(image: impl Into<PathBuf>) -> Self {
        Self {
            image: image.into(),
            ..Self::default()
        }
    }

    pub fn with_mask(mut self, mask: impl Into<PathBuf>) -> Self {
        self.mask = Some(mask.into());
        self
    }

    pub fn window(mut self, lower: Option<f64>, upper: Option<f64>) -> Self {
        self.lower = lower;
        self.upper = upper;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageStats {
    pub voxels: u64,
    pub volume_mm3: f64,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub std_dev: f64,
}

#[async_trait]
pub trait ImageStatsProbe: Send + Sync {
    async fn stats(&self, query: &StatsQuery) -> ToolResult<ImageStats>;

    /// Intensity of every voxel of `query.image` inside `query.mask`, in the
    /// tool's voxel order. The intensity window is ignored.
    async fn voxel_values(&self, query: &StatsQuery) -> ToolResult<Vec<f64>>;
}

#[async_trait]
pub trait SimilarityProbe: Send + Sync {
    /// Pearson correlation between two images on the same grid.
    async fn correlation(&self, a: &Path, b: &Path) -> ToolResult<f64>;
}

// ---------------------------------------------------------------------------
// Lesion analysis & QC
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct ThresholdRequest {
    pub image: PathBuf,
    pub mask: PathBuf,
    pub threshold: f64,
    pub output: PathBuf,
}

/// One connected component of a binary lesion mask.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cluster {
    pub index: u32,
    pub voxels: u64,
    pub max_intensity: f64,
    /// Centre of gravity in millimetres.
    pub cog_mm: [f64; 3],
}

#[async_trait]
pub trait LesionAnalyzer: Send + Sync {
    /// Binarise `image` within `mask` at `threshold`.
    async fn threshold(&self, request: &ThresholdRequest) -> ToolResult<PathBuf>;

    /// Connected-component table of a binary mask.
    async fn clusters(&self, binary_mask: &Path) -> ToolResult<Vec<Cluster>>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct OverlayRequest {
    pub base: PathBuf,
    pub overlay: Option<PathBuf>,
    pub output: PathBuf,
}

#[async_trait]
pub trait QcRenderer: Send + Sync {
    async fn render_overlay(&self, request: &OverlayRequest) -> ToolResult<PathBuf>;
}

// ---------------------------------------------------------------------------
// Bundle
// ---------------------------------------------------------------------------

/// Every collaborator a pipeline run needs, behind trait objects.
#[derive(Clone)]
pub struct Toolkit {
    pub converter: Arc<dyn DicomConverter>,
    pub dicom_headers: Arc<dyn DicomHeaderReader>,
    pub bias: Arc<dyn BiasCorrector>,
    pub brain: Arc<dyn BrainExtractor>,
    pub registrar: Arc<dyn Registrar>,
    pub segmenter: Arc<dyn Segmenter>,
    pub info: Arc<dyn ImageInfoProbe>,
    pub stats: Arc<dyn ImageStatsProbe>,
    pub similarity: Arc<dyn SimilarityProbe>,
    pub lesions: Arc<dyn LesionAnalyzer>,
    pub renderer: Arc<dyn QcRenderer>,
}

impl Toolkit {
    /// Build a toolkit where one value implements every collaborator.
    pub fn shared<T>(tools: Arc<T>) -> Self
    where
        T: DicomConverter
            + DicomHeaderReader
            + BiasCorrector
            + BrainExtractor
            + Registrar
            + Segmenter
            + ImageInfoProbe
            + ImageStatsProbe
            + SimilarityProbe
            + LesionAnalyzer
            + QcRenderer
            + 'static,
    {
        Self {
            converter: tools.clone(),
            dicom_headers: tools.clone(),
            bias: tools.clone(),
            brain: tools.clone(),
            registrar: tools.clone(),
            segmenter: tools.clone(),
            info: tools.clone(),
            stats: tools.clone(),
            similarity: tools.clone(),
            lesions: tools.clone(),
            renderer: tools,
        }
    }
}

impl fmt::Debug for Toolkit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Toolkit").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tool_exit_codes_stay_in_band() {
        for kind in [
            ToolKind::DicomConversion,
            ToolKind::DicomHeaders,
            ToolKind::BiasCorrection,
            ToolKind::BrainExtraction,
            ToolKind::Registration,
            ToolKind::Segmentation,
            ToolKind::ImageInfo,
            ToolKind::ImageStats,
            ToolKind::Similarity,
            ToolKind::LesionAnalysis,
            ToolKind::QcRender,
        ] {
            assert!((20..=29).contains(&kind.exit_code()), "{kind}");
        }
    }

    #[test]
    fn test_header_geometry() {
        let header = ImageHeader {
            dims: [176, 256, 256],
            pixdim: [1.0, 0.9, 0.9],
            datatype: "FLOAT32".to_string(),
        };
        assert_eq!(header.voxel_count(), 176 * 256 * 256);
        assert!((header.voxel_volume() - 0.81).abs() < 1e-9);
    }

    #[test]
    fn test_dicom_header_ignores_empty_values() {
        let mut header = DicomHeader::default();
        header.fields.insert("Manufacturer".into(), String::new());
        header.fields.insert("Modality".into(), "MR".into());
        assert_eq!(header.get("Manufacturer"), None);
        assert_eq!(header.get("Modality"), Some("MR"));
    }
}
