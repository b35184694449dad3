//! In-process fake of every collaborator (testing only)
//!
//! `FakeToolkit` writes deterministic bytes derived from its inputs, serves
//! configured headers and statistics, and can be told to fail a given
//! operation. Outputs depend only on input bytes and parameters, so two runs
//! over the same tree produce byte-identical artifacts.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use crate::error::{ToolError, ToolResult};
use crate::interfaces::*;

/// Smallest file the fake writes for a volumetric output.
pub const FAKE_IMAGE_BYTES: usize = 4096;

/// One series the fake converter "finds" in a DICOM directory.
#[derive(Debug, Clone)]
pub struct FakeSeries {
    pub file_name: String,
    pub payload: Vec<u8>,
    /// Written as `<stem>.json` next to the volume when present.
    pub sidecar: Option<serde_json::Value>,
}

impl FakeSeries {
    /// A directly acquired 3-D series with a unique payload.
    pub fn original_3d(file_name: impl Into<String>) -> Self {
        let file_name = file_name.into();
        Self {
            payload: padded(file_name.as_bytes(), FAKE_IMAGE_BYTES),
            sidecar: Some(serde_json::json!({
                "ImageType": ["ORIGINAL", "PRIMARY", "M", "ND"],
                "MRAcquisitionType": "3D",
            })),
            file_name,
        }
    }

    pub fn with_payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = payload;
        self
    }

    pub fn without_sidecar(mut self) -> Self {
        self.sidecar = None;
        self
    }
}

#[derive(Debug, Clone)]
struct FailRule {
    tool: ToolKind,
    needle: Option<String>,
}

/// Deterministic in-memory collaborator.
#[derive(Debug)]
pub struct FakeToolkit {
    series: Vec<FakeSeries>,
    dicom_fields: BTreeMap<String, String>,
    dicom_overrides: Mutex<Vec<(String, BTreeMap<String, String>)>>,
    default_header: ImageHeader,
    headers: Mutex<HashMap<String, ImageHeader>>,
    corrupt: Mutex<Vec<String>>,
    stats: Mutex<Vec<(String, ImageStats)>>,
    intensity_range: (f64, f64),
    correlation: f64,
    clusters: Vec<Cluster>,
    voxel_values: Vec<f64>,
    failures: Mutex<Vec<FailRule>>,
    calls: Mutex<Vec<(ToolKind, String)>>,
}

impl Default for FakeToolkit {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeToolkit {
    /// A T1 and a FLAIR series, Siemens 3T headers, 1 mm isotropic grids.
    pub fn new() -> Self {
        let dicom_fields = [
            ("Manufacturer", "Siemens Healthineers"),
            ("ManufacturerModelName", "Prisma_fit"),
            ("MagneticFieldStrength", "3"),
            ("StudyDescription", "BRAIN^ROUTINE"),
            ("SeriesDescription", "t1_mprage_sag"),
            ("ProtocolName", "t1_mprage_sag_p2"),
            ("SequenceName", "*tfl3d1_16ns"),
            ("SoftwareVersions", "syngo MR XA30"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        Self {
            series: vec![
                FakeSeries::original_3d("T1_MPRAGE_SAG_2.nii.gz"),
                FakeSeries::original_3d("T2_SPACE_FLAIR_SAG_3.nii.gz"),
            ],
            dicom_fields,
            dicom_overrides: Mutex::new(Vec::new()),
            default_header: ImageHeader {
                dims: [176, 256, 256],
                pixdim: [1.0, 1.0, 1.0],
                datatype: "FLOAT32".to_string(),
            },
            headers: Mutex::new(HashMap::new()),
            corrupt: Mutex::new(Vec::new()),
            stats: Mutex::new(Vec::new()),
            intensity_range: (0.0, 800.0),
            correlation: 0.92,
            clusters: vec![
                Cluster {
                    index: 2,
                    voxels: 42,
                    max_intensity: 1.0,
                    cog_mm: [1.5, -28.0, -34.0],
                },
                Cluster {
                    index: 1,
                    voxels: 4,
                    max_intensity: 1.0,
                    cog_mm: [-6.0, -30.5, -40.0],
                },
            ],
            voxel_values: vec![412.5, 0.0, 388.25, f64::NAN, 97.0],
            failures: Mutex::new(Vec::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn with_series(mut self, series: Vec<FakeSeries>) -> Self {
        self.series = series;
        self
    }

    pub fn with_dicom_fields(mut self, fields: BTreeMap<String, String>) -> Self {
        self.dicom_fields = fields;
        self
    }

    pub fn with_clusters(mut self, clusters: Vec<Cluster>) -> Self {
        self.clusters = clusters;
        self
    }

    pub fn with_voxel_values(mut self, values: Vec<f64>) -> Self {
        self.voxel_values = values;
        self
    }

    pub fn with_correlation(mut self, correlation: f64) -> Self {
        self.correlation = correlation;
        self
    }

    /// Serve `header` for files whose name equals `file_name`.
    pub fn set_header(&self, file_name: &str, header: ImageHeader) {
        self.headers
            .lock()
            .unwrap()
            .insert(file_name.to_string(), header);
    }

    /// DICOM files whose path contains `needle` report `fields` on top of
    /// the shared ones.
    pub fn set_dicom_header(&self, needle: &str, fields: &[(&str, &str)]) {
        let fields = fields
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        self.dicom_overrides
            .lock()
            .unwrap()
            .push((needle.to_string(), fields));
    }

    /// Header reads fail for files whose name contains `needle`.
    pub fn mark_corrupt(&self, needle: &str) {
        self.corrupt.lock().unwrap().push(needle.to_string());
    }

    /// Serve fixed statistics for images whose name contains `needle`.
    pub fn set_stats(&self, needle: &str, stats: ImageStats) {
        self.stats.lock().unwrap().push((needle.to_string(), stats));
    }

    /// Make `tool` fail; with a needle, only for inputs whose path contains it.
    pub fn fail_on(&self, tool: ToolKind, needle: Option<&str>) {
        self.failures.lock().unwrap().push(FailRule {
            tool,
            needle: needle.map(str::to_string),
        });
    }

    /// Every recorded call as `(tool, primary input path)`.
    pub fn calls(&self) -> Vec<(ToolKind, String)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self, tool: ToolKind) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(t, _)| *t == tool)
            .count()
    }

    fn record(&self, tool: ToolKind, input: &Path) -> ToolResult<()> {
        let input_str = input.to_string_lossy().to_string();
        self.calls.lock().unwrap().push((tool, input_str.clone()));

        let failures = self.failures.lock().unwrap();
        let hit = failures.iter().any(|rule| {
            rule.tool == tool
                && rule
                    .needle
                    .as_deref()
                    .map_or(true, |needle| input_str.contains(needle))
        });
        if hit {
            return Err(ToolError::Failed {
                tool,
                program: format!("fake-{tool}"),
                code: 1,
                stderr: format!("injected failure for {input_str}"),
            });
        }
        Ok(())
    }

    async fn require(&self, tool: ToolKind, path: &Path) -> ToolResult<Vec<u8>> {
        tokio::fs::read(path).await.map_err(|e| ToolError::Failed {
            tool,
            program: format!("fake-{tool}"),
            code: 1,
            stderr: format!("cannot read {}: {e}", path.display()),
        })
    }

    /// Write bytes derived from the inputs' contents and `label`.
    async fn derive(&self, tool: ToolKind, inputs: &[&Path], label: &str, output: &Path) -> ToolResult<PathBuf> {
        let mut hasher = Sha256::new();
        hasher.update(tool.name().as_bytes());
        hasher.update(label.as_bytes());
        for input in inputs {
            hasher.update(self.require(tool, input).await?);
        }
        let seed = hex::encode(hasher.finalize());

        if let Some(parent) = output.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(output, padded(seed.as_bytes(), FAKE_IMAGE_BYTES)).await?;
        Ok(output.to_path_buf())
    }

    fn file_name(path: &Path) -> String {
        path.file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default()
    }

    /// Uniform intensity model over `intensity_range`, restricted to a window.
    fn modelled_stats(&self, query: &StatsQuery) -> ImageStats {
        let (min, max) = self.intensity_range;
        let lo = query.lower.map_or(min, |l| l.max(min));
        let hi = query.upper.map_or(max, |u| u.min(max));
        let total = f64::from(self.default_header.dims.iter().product::<u32>());
        if hi <= lo {
            return ImageStats {
                voxels: 0,
                volume_mm3: 0.0,
                min: 0.0,
                max: 0.0,
                mean: 0.0,
                std_dev: 0.0,
            };
        }
        let voxels = (total * (hi - lo) / (max - min)).round();
        ImageStats {
            voxels: voxels as u64,
            volume_mm3: voxels * self.default_header.pixdim.iter().product::<f64>(),
            min: lo,
            max: hi,
            mean: (lo + hi) / 2.0,
            std_dev: (hi - lo) / 12f64.sqrt(),
        }
    }
}

fn padded(seed: &[u8], len: usize) -> Vec<u8> {
    if seed.is_empty() {
        return vec![0; len];
    }
    seed.iter().copied().cycle().take(len.max(seed.len())).collect()
}

#[async_trait]
impl DicomConverter for FakeToolkit {
    async fn convert(&self, request: &ConvertRequest) -> ToolResult<ConvertOutput> {
        self.record(ToolKind::DicomConversion, &request.input_dir)?;
        tokio::fs::create_dir_all(&request.output_dir).await?;

        let mut files = Vec::new();
        for series in &self.series {
            let path = request.output_dir.join(&series.file_name);
            tokio::fs::write(&path, &series.payload).await?;
            if let Some(sidecar) = &series.sidecar {
                let stem = series
                    .file_name
                    .trim_end_matches(".gz")
                    .trim_end_matches(".nii");
                let json = serde_json::to_vec_pretty(sidecar).map_err(|e| {
                    ToolError::Parse {
                        tool: ToolKind::DicomConversion,
                        detail: e.to_string(),
                    }
                })?;
                tokio::fs::write(request.output_dir.join(format!("{stem}.json")), json).await?;
            }
            files.push(path);
        }
        files.sort();
        Ok(ConvertOutput {
            count: files.len(),
            files,
        })
    }
}

#[async_trait]
impl DicomHeaderReader for FakeToolkit {
    async fn read_header(&self, file: &Path) -> ToolResult<DicomHeader> {
        self.record(ToolKind::DicomHeaders, file)?;
        self.require(ToolKind::DicomHeaders, file).await?;
        let path = file.to_string_lossy();
        let mut fields = self.dicom_fields.clone();
        for (needle, extra) in self.dicom_overrides.lock().unwrap().iter() {
            if path.contains(needle.as_str()) {
                fields.extend(extra.iter().map(|(k, v)| (k.clone(), v.clone())));
            }
        }
        Ok(DicomHeader { fields })
    }
}

#[async_trait]
impl BiasCorrector for FakeToolkit {
    async fn correct(&self, request: &BiasCorrectionRequest) -> ToolResult<PathBuf> {
        self.record(ToolKind::BiasCorrection, &request.input)?;
        let label = format!("s{}:{:?}", request.shrink_factor, request.iterations);
        let mut inputs = vec![request.input.as_path()];
        if let Some(mask) = &request.mask {
            inputs.push(mask.as_path());
        }
        self.derive(ToolKind::BiasCorrection, &inputs, &label, &request.output)
            .await
    }
}

#[async_trait]
impl BrainExtractor for FakeToolkit {
    async fn extract(&self, request: &BrainExtractionRequest) -> ToolResult<BrainExtractionOutput> {
        self.record(ToolKind::BrainExtraction, &request.input)?;
        let name = Self::file_name(&request.output);
        let stem = name.trim_end_matches(".gz").trim_end_matches(".nii");
        let mask_path = request.output.with_file_name(format!("{stem}_mask.nii.gz"));
        let f = format!("{:.2}", request.fractional_intensity);
        let brain = self
            .derive(ToolKind::BrainExtraction, &[request.input.as_path()], &f, &request.output)
            .await?;
        let mask = self
            .derive(ToolKind::BrainExtraction, &[request.input.as_path()], &format!("mask{f}"), &mask_path)
            .await?;
        Ok(BrainExtractionOutput { brain, mask })
    }
}

#[async_trait]
impl Registrar for FakeToolkit {
    async fn register(&self, request: &RegistrationRequest) -> ToolResult<RegistrationOutput> {
        self.record(ToolKind::Registration, &request.moving)?;
        let prefix = request.output_prefix.to_string_lossy().to_string();
        let label = request.model.flag();
        let inputs = [request.fixed.as_path(), request.moving.as_path()];
        let warped = self
            .derive(
                ToolKind::Registration,
                &inputs,
                label,
                Path::new(&format!("{prefix}Warped.nii.gz")),
            )
            .await?;
        let affine = self
            .derive(
                ToolKind::Registration,
                &inputs,
                &format!("{label}affine"),
                Path::new(&format!("{prefix}0GenericAffine.mat")),
            )
            .await?;
        Ok(RegistrationOutput {
            warped,
            transforms: vec![affine],
        })
    }

    async fn resample(&self, request: &ResampleRequest) -> ToolResult<PathBuf> {
        self.record(ToolKind::Registration, &request.input)?;
        let label = request.interpolation.ants_name();
        self.derive(
            ToolKind::Registration,
            &[request.input.as_path(), request.reference.as_path()],
            label,
            &request.output,
        )
        .await
    }
}

#[async_trait]
impl Segmenter for FakeToolkit {
    async fn segment(&self, request: &SegmentationRequest) -> ToolResult<SegmentationOutput> {
        self.record(ToolKind::Segmentation, &request.image)?;
        let image = request.image.as_path();
        let kind = ToolKind::Segmentation;
        Ok(SegmentationOutput {
            brainstem: self
                .derive(kind, &[image], "brainstem", &request.brainstem_output)
                .await?,
            pons: self.derive(kind, &[image], "pons", &request.pons_output).await?,
            dorsal_pons: self
                .derive(kind, &[image], "dorsal", &request.dorsal_pons_output)
                .await?,
            ventral_pons: self
                .derive(kind, &[image], "ventral", &request.ventral_pons_output)
                .await?,
        })
    }
}

#[async_trait]
impl ImageInfoProbe for FakeToolkit {
    async fn header(&self, image: &Path) -> ToolResult<ImageHeader> {
        self.record(ToolKind::ImageInfo, image)?;
        self.require(ToolKind::ImageInfo, image).await?;

        let name = Self::file_name(image);
        if self.corrupt.lock().unwrap().iter().any(|n| name.contains(n.as_str())) {
            return Err(ToolError::parse(ToolKind::ImageInfo, format!("{name}: invalid header")));
        }
        Ok(self
            .headers
            .lock()
            .unwrap()
            .get(&name)
            .cloned()
            .unwrap_or_else(|| self.default_header.clone()))
    }
}

#[async_trait]
impl ImageStatsProbe for FakeToolkit {
    async fn stats(&self, query: &StatsQuery) -> ToolResult<ImageStats> {
        self.record(ToolKind::ImageStats, &query.image)?;
        self.require(ToolKind::ImageStats, &query.image).await?;

        let name = Self::file_name(&query.image);
        let fixed = self
            .stats
            .lock()
            .unwrap()
            .iter()
            .find(|(needle, _)| name.contains(needle.as_str()))
            .map(|(_, s)| s.clone());
        Ok(fixed.unwrap_or_else(|| self.modelled_stats(query)))
    }

    async fn voxel_values(&self, query: &StatsQuery) -> ToolResult<Vec<f64>> {
        self.record(ToolKind::ImageStats, &query.image)?;
        self.require(ToolKind::ImageStats, &query.image).await?;
        if let Some(mask) = &query.mask {
            self.require(ToolKind::ImageStats, mask).await?;
        }
        Ok(self.voxel_values.clone())
    }
}

#[async_trait]
impl SimilarityProbe for FakeToolkit {
    async fn correlation(&self, a: &Path, b: &Path) -> ToolResult<f64> {
        self.record(ToolKind::Similarity, a)?;
        self.require(ToolKind::Similarity, a).await?;
        self.require(ToolKind::Similarity, b).await?;
        Ok(self.correlation)
    }
}

#[async_trait]
impl LesionAnalyzer for FakeToolkit {
    async fn threshold(&self, request: &ThresholdRequest) -> ToolResult<PathBuf> {
        self.record(ToolKind::LesionAnalysis, &request.image)?;
        let label = format!("{:.6}", request.threshold);
        self.derive(
            ToolKind::LesionAnalysis,
            &[request.image.as_path(), request.mask.as_path()],
            &label,
            &request.output,
        )
        .await
    }

    async fn clusters(&self, binary_mask: &Path) -> ToolResult<Vec<Cluster>> {
        self.record(ToolKind::LesionAnalysis, binary_mask)?;
        self.require(ToolKind::LesionAnalysis, binary_mask).await?;
        Ok(self.clusters.clone())
    }
}

#[async_trait]
impl QcRenderer for FakeToolkit {
    async fn render_overlay(&self, request: &OverlayRequest) -> ToolResult<PathBuf> {
        self.record(ToolKind::QcRender, &request.base)?;
        let mut inputs = vec![request.base.as_path()];
        if let Some(overlay) = &request.overlay {
            inputs.push(overlay.as_path());
        }
        self.derive(ToolKind::QcRender, &inputs, "png", &request.output)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_derived_outputs_are_deterministic() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("in.nii.gz");
        std::fs::write(&input, b"volume").unwrap();
        let fake = FakeToolkit::new();

        let request = |out: &str| BiasCorrectionRequest {
            input: input.clone(),
            mask: None,
            output: dir.path().join(out),
            shrink_factor: 4,
            iterations: vec![50, 50, 30, 20],
        };
        let a = fake.correct(&request("a_n4.nii.gz")).await.unwrap();
        let b = fake.correct(&request("b_n4.nii.gz")).await.unwrap();

        let bytes_a = std::fs::read(a).unwrap();
        assert_eq!(bytes_a, std::fs::read(b).unwrap());
        assert!(bytes_a.len() >= FAKE_IMAGE_BYTES);
        assert_eq!(fake.call_count(ToolKind::BiasCorrection), 2);
    }

    #[tokio::test]
    async fn test_missing_input_fails_like_a_tool() {
        let dir = tempfile::tempdir().unwrap();
        let fake = FakeToolkit::new();
        let err = fake.header(&dir.path().join("absent.nii.gz")).await.unwrap_err();
        assert!(matches!(err, ToolError::Failed { tool: ToolKind::ImageInfo, .. }));
    }

    #[tokio::test]
    async fn test_fail_on_matches_needle_only() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["s_T1.nii.gz", "s_FLAIR.nii.gz"] {
            std::fs::write(dir.path().join(name), b"x").unwrap();
        }
        let fake = FakeToolkit::new();
        fake.fail_on(ToolKind::ImageInfo, Some("FLAIR"));

        assert!(fake.header(&dir.path().join("s_T1.nii.gz")).await.is_ok());
        assert!(fake.header(&dir.path().join("s_FLAIR.nii.gz")).await.is_err());
    }

    #[tokio::test]
    async fn test_converter_writes_series_and_sidecars() {
        let dir = tempfile::tempdir().unwrap();
        let fake = FakeToolkit::new();
        let out = fake
            .convert(&ConvertRequest {
                input_dir: dir.path().join("dicom"),
                file_pattern: "*.dcm".into(),
                output_dir: dir.path().join("extracted"),
            })
            .await
            .unwrap();

        assert_eq!(out.count, 2);
        assert!(dir.path().join("extracted/T1_MPRAGE_SAG_2.json").is_file());
    }

    #[tokio::test]
    async fn test_windowed_stats_follow_uniform_model() {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("img.nii.gz");
        std::fs::write(&image, b"x").unwrap();
        let fake = FakeToolkit::new();

        let all = fake.stats(&StatsQuery::new(&image)).await.unwrap();
        let upper = fake
            .stats(&StatsQuery::new(&image).window(Some(400.0), None))
            .await
            .unwrap();
        assert_eq!(all.max, 800.0);
        assert_eq!(upper.mean, 600.0);
        assert!(upper.voxels < all.voxels);
    }

    #[tokio::test]
    async fn test_dicom_overrides_apply_by_path() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["IM0001", "IM0002"] {
            std::fs::write(dir.path().join(name), b"dicom").unwrap();
        }
        let fake = FakeToolkit::new();
        fake.set_dicom_header("IM0002", &[("InstanceNumber", "2"), ("SeriesDescription", "t2_flair")]);

        let first = fake.read_header(&dir.path().join("IM0001")).await.unwrap();
        let second = fake.read_header(&dir.path().join("IM0002")).await.unwrap();
        assert_eq!(first.get("SeriesDescription"), Some("t1_mprage_sag"));
        assert_eq!(first.get("InstanceNumber"), None);
        assert_eq!(second.get("SeriesDescription"), Some("t2_flair"));
        assert_eq!(second.get("Manufacturer"), Some("Siemens Healthineers"));
    }
}
