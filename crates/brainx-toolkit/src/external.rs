//! Command-line adapters: every collaborator trait backed by an installed tool.
//!
//! DICOM conversion uses dcm2niix, headers come from DCMTK `dcmdump`, bias
//! correction, registration and resampling use ANTs, everything else uses FSL.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::command::ToolInvocation;
use crate::error::{ToolError, ToolResult};
use crate::interfaces::*;
use crate::parse;

/// Executable names (or absolute paths) for each external tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolPaths {
    pub dcm2niix: String,
    pub dcmdump: String,
    pub n4: String,
    pub bet: String,
    pub ants_registration: String,
    pub ants_apply_transforms: String,
    pub fslinfo: String,
    pub fslstats: String,
    pub fslcc: String,
    pub fslmeants: String,
    pub fslmaths: String,
    pub cluster: String,
    pub slicer: String,
    /// Per-invocation wall clock limit in seconds; 0 disables it.
    pub timeout_secs: u64,
    pub atlas: AtlasReference,
}

impl Default for ToolPaths {
    fn default() -> Self {
        Self {
            dcm2niix: "dcm2niix".into(),
            dcmdump: "dcmdump".into(),
            n4: "N4BiasFieldCorrection".into(),
            bet: "bet".into(),
            ants_registration: "antsRegistrationSyNQuick.sh".into(),
            ants_apply_transforms: "antsApplyTransforms".into(),
            fslinfo: "fslinfo".into(),
            fslstats: "fslstats".into(),
            fslcc: "fslcc".into(),
            fslmeants: "fslmeants".into(),
            fslmaths: "fslmaths".into(),
            cluster: "cluster".into(),
            slicer: "slicer".into(),
            timeout_secs: 0,
            atlas: AtlasReference::default(),
        }
    }
}

/// Drives the real command-line tools.
#[derive(Debug, Clone, Default)]
pub struct CommandToolkit {
    paths: ToolPaths,
}

impl CommandToolkit {
    pub fn new(paths: ToolPaths) -> Self {
        Self { paths }
    }

    pub fn paths(&self) -> &ToolPaths {
        &self.paths
    }

    fn invoke(&self, tool: ToolKind, program: &str) -> ToolInvocation {
        let timeout = Some(Duration::from_secs(self.paths.timeout_secs));
        ToolInvocation::new(tool, program).timeout(timeout)
    }

    /// dcm2niix overwrites existing outputs (`-w 1`) instead of writing
    /// suffixed copies next to them.
    fn convert_invocation(&self, request: &ConvertRequest) -> ToolInvocation {
        self.invoke(ToolKind::DicomConversion, &self.paths.dcm2niix)
            .args(["-z", "y", "-b", "y", "-w", "1", "-f", "%p_%s", "-o"])
            .path_arg(&request.output_dir)
            .path_arg(&request.input_dir)
    }

    /// One line per masked voxel: `x y z value`.
    fn voxel_values_invocation(&self, query: &StatsQuery) -> ToolInvocation {
        let mut cmd = self
            .invoke(ToolKind::ImageStats, &self.paths.fslmeants)
            .arg("-i")
            .path_arg(&query.image);
        if let Some(mask) = &query.mask {
            cmd = cmd.arg("-m").path_arg(mask);
        }
        cmd.args(["--showall", "--transpose"])
    }
}

/// Fail with `MissingOutput` unless the tool actually wrote `path`.
fn expect_output(tool: ToolKind, path: &Path) -> ToolResult<PathBuf> {
    if path.is_file() {
        Ok(path.to_path_buf())
    } else {
        Err(ToolError::MissingOutput {
            tool,
            path: path.to_path_buf(),
        })
    }
}

fn with_suffix(prefix: &Path, suffix: &str) -> PathBuf {
    let mut s = prefix.as_os_str().to_os_string();
    s.push(suffix);
    PathBuf::from(s)
}

/// `sub_brain.nii.gz` -> `sub_brain`.
fn image_stem(path: &Path) -> String {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    name.trim_end_matches(".gz")
        .trim_end_matches(".nii")
        .to_string()
}

fn list_volumes(dir: &Path) -> ToolResult<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        let name = path.to_string_lossy();
        if path.is_file() && (name.ends_with(".nii.gz") || name.ends_with(".nii")) {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

#[async_trait]
impl DicomConverter for CommandToolkit {
    async fn convert(&self, request: &ConvertRequest) -> ToolResult<ConvertOutput> {
        tokio::fs::create_dir_all(&request.output_dir).await?;
        debug!(pattern = %request.file_pattern, dir = %request.input_dir.display(), "converting DICOM series");

        self.convert_invocation(request).run().await?;

        let files = list_volumes(&request.output_dir)?;
        if files.is_empty() {
            return Err(ToolError::MissingOutput {
                tool: ToolKind::DicomConversion,
                path: request.output_dir.clone(),
            });
        }
        Ok(ConvertOutput {
            count: files.len(),
            files,
        })
    }
}

#[async_trait]
impl DicomHeaderReader for CommandToolkit {
    async fn read_header(&self, file: &Path) -> ToolResult<DicomHeader> {
        let out = self
            .invoke(ToolKind::DicomHeaders, &self.paths.dcmdump)
            .path_arg(file)
            .run()
            .await?;
        Ok(parse::parse_dicom_dump(&out.stdout))
    }
}

#[async_trait]
impl BiasCorrector for CommandToolkit {
    async fn correct(&self, request: &BiasCorrectionRequest) -> ToolResult<PathBuf> {
        let convergence = format!(
            "[{},0.0001]",
            request
                .iterations
                .iter()
                .map(u32::to_string)
                .collect::<Vec<_>>()
                .join("x")
        );
        let mut cmd = self
            .invoke(ToolKind::BiasCorrection, &self.paths.n4)
            .args(["-d", "3", "-i"])
            .path_arg(&request.input);
        if let Some(mask) = &request.mask {
            cmd = cmd.arg("-x").path_arg(mask);
        }
        cmd.arg("-o")
            .path_arg(&request.output)
            .arg("-s")
            .arg(request.shrink_factor.to_string())
            .arg("-c")
            .arg(convergence)
            .args(["-b", "[200]"])
            .run()
            .await?;
        expect_output(ToolKind::BiasCorrection, &request.output)
    }
}

#[async_trait]
impl BrainExtractor for CommandToolkit {
    async fn extract(&self, request: &BrainExtractionRequest) -> ToolResult<BrainExtractionOutput> {
        self.invoke(ToolKind::BrainExtraction, &self.paths.bet)
            .path_arg(&request.input)
            .path_arg(&request.output)
            .args(["-m", "-f"])
            .arg(format!("{:.2}", request.fractional_intensity))
            .run()
            .await?;

        let mask = request
            .output
            .with_file_name(format!("{}_mask.nii.gz", image_stem(&request.output)));
        Ok(BrainExtractionOutput {
            brain: expect_output(ToolKind::BrainExtraction, &request.output)?,
            mask: expect_output(ToolKind::BrainExtraction, &mask)?,
        })
    }
}

#[async_trait]
impl Registrar for CommandToolkit {
    async fn register(&self, request: &RegistrationRequest) -> ToolResult<RegistrationOutput> {
        self.invoke(ToolKind::Registration, &self.paths.ants_registration)
            .args(["-d", "3", "-f"])
            .path_arg(&request.fixed)
            .arg("-m")
            .path_arg(&request.moving)
            .arg("-o")
            .path_arg(&request.output_prefix)
            .args(["-t", request.model.flag()])
            .arg("-n")
            .arg(request.threads.max(1).to_string())
            .run()
            .await?;

        let warped = expect_output(
            ToolKind::Registration,
            &with_suffix(&request.output_prefix, "Warped.nii.gz"),
        )?;
        let mut transforms = vec![expect_output(
            ToolKind::Registration,
            &with_suffix(&request.output_prefix, "0GenericAffine.mat"),
        )?];
        let warp = with_suffix(&request.output_prefix, "1Warp.nii.gz");
        if warp.is_file() {
            transforms.push(warp);
        }
        Ok(RegistrationOutput { warped, transforms })
    }

    async fn resample(&self, request: &ResampleRequest) -> ToolResult<PathBuf> {
        self.invoke(ToolKind::Registration, &self.paths.ants_apply_transforms)
            .args(["-d", "3", "-i"])
            .path_arg(&request.input)
            .arg("-r")
            .path_arg(&request.reference)
            .arg("-o")
            .path_arg(&request.output)
            .args(["-n", request.interpolation.ants_name(), "-t", "identity"])
            .run()
            .await?;
        expect_output(ToolKind::Registration, &request.output)
    }
}

impl CommandToolkit {
    async fn extract_labels(&self, labels: &Path, lo: u32, hi: u32, output: &Path) -> ToolResult<PathBuf> {
        self.invoke(ToolKind::Segmentation, &self.paths.fslmaths)
            .path_arg(labels)
            .arg("-thr")
            .arg(lo.to_string())
            .arg("-uthr")
            .arg(hi.to_string())
            .arg("-bin")
            .path_arg(output)
            .run()
            .await?;
        expect_output(ToolKind::Segmentation, output)
    }
}

#[async_trait]
impl Segmenter for CommandToolkit {
    async fn segment(&self, request: &SegmentationRequest) -> ToolResult<SegmentationOutput> {
        let atlas = &request.atlas;
        let work_prefix = request
            .brainstem_output
            .with_file_name(format!("{}_atlas_", image_stem(&request.image)));

        // atlas -> subject, then carry the labels across with nearest neighbour
        let registration = self
            .register(&RegistrationRequest {
                fixed: request.image.clone(),
                moving: atlas.template.clone(),
                output_prefix: work_prefix.clone(),
                model: TransformModel::Affine,
                threads: 1,
            })
            .await
            .map_err(|e| match e {
                ToolError::Failed { program, code, stderr, .. } => ToolError::Failed {
                    tool: ToolKind::Segmentation,
                    program,
                    code,
                    stderr,
                },
                other => other,
            })?;

        let labels = with_suffix(&work_prefix, "labels.nii.gz");
        let mut apply = self
            .invoke(ToolKind::Segmentation, &self.paths.ants_apply_transforms)
            .args(["-d", "3", "-i"])
            .path_arg(&atlas.labels)
            .arg("-r")
            .path_arg(&request.image)
            .arg("-o")
            .path_arg(&labels)
            .args(["-n", Interpolation::NearestNeighbor.ants_name()]);
        for transform in &registration.transforms {
            apply = apply.arg("-t").path_arg(transform);
        }
        apply.run().await?;

        let [lo, hi] = atlas.brainstem_labels;
        Ok(SegmentationOutput {
            brainstem: self.extract_labels(&labels, lo, hi, &request.brainstem_output).await?,
            pons: self
                .extract_labels(&labels, atlas.pons_label, atlas.pons_label, &request.pons_output)
                .await?,
            dorsal_pons: self
                .extract_labels(
                    &labels,
                    atlas.dorsal_pons_label,
                    atlas.dorsal_pons_label,
                    &request.dorsal_pons_output,
                )
                .await?,
            ventral_pons: self
                .extract_labels(
                    &labels,
                    atlas.ventral_pons_label,
                    atlas.ventral_pons_label,
                    &request.ventral_pons_output,
                )
                .await?,
        })
    }
}

#[async_trait]
impl ImageInfoProbe for CommandToolkit {
    async fn header(&self, image: &Path) -> ToolResult<ImageHeader> {
        let out = self
            .invoke(ToolKind::ImageInfo, &self.paths.fslinfo)
            .path_arg(image)
            .run()
            .await?;
        parse::parse_image_info(&out.stdout)
    }
}

#[async_trait]
impl ImageStatsProbe for CommandToolkit {
    async fn stats(&self, query: &StatsQuery) -> ToolResult<ImageStats> {
        let mut cmd = self
            .invoke(ToolKind::ImageStats, &self.paths.fslstats)
            .path_arg(&query.image);
        if let Some(mask) = &query.mask {
            cmd = cmd.arg("-k").path_arg(mask);
        }
        if let Some(lower) = query.lower {
            cmd = cmd.arg("-l").arg(lower.to_string());
        }
        if let Some(upper) = query.upper {
            cmd = cmd.arg("-u").arg(upper.to_string());
        }
        let out = cmd.args(["-V", "-R", "-M", "-S"]).run().await?;
        parse::parse_image_stats(&out.stdout)
    }

    async fn voxel_values(&self, query: &StatsQuery) -> ToolResult<Vec<f64>> {
        let out = self.voxel_values_invocation(query).run().await?;
        parse::parse_voxel_values(&out.stdout)
    }
}

#[async_trait]
impl SimilarityProbe for CommandToolkit {
    async fn correlation(&self, a: &Path, b: &Path) -> ToolResult<f64> {
        let out = self
            .invoke(ToolKind::Similarity, &self.paths.fslcc)
            .args(["-p", "6"])
            .path_arg(a)
            .path_arg(b)
            .run()
            .await?;
        parse::parse_correlation(&out.stdout)
    }
}

#[async_trait]
impl LesionAnalyzer for CommandToolkit {
    async fn threshold(&self, request: &ThresholdRequest) -> ToolResult<PathBuf> {
        self.invoke(ToolKind::LesionAnalysis, &self.paths.fslmaths)
            .path_arg(&request.image)
            .arg("-mas")
            .path_arg(&request.mask)
            .arg("-thr")
            .arg(format!("{:.6}", request.threshold))
            .arg("-bin")
            .path_arg(&request.output)
            .run()
            .await?;
        expect_output(ToolKind::LesionAnalysis, &request.output)
    }

    async fn clusters(&self, binary_mask: &Path) -> ToolResult<Vec<Cluster>> {
        let out = self
            .invoke(ToolKind::LesionAnalysis, &self.paths.cluster)
            .arg(format!("--in={}", binary_mask.display()))
            .args(["--thresh=0.5", "--mm"])
            .run()
            .await?;
        parse::parse_cluster_table(&out.stdout)
    }
}

#[async_trait]
impl QcRenderer for CommandToolkit {
    async fn render_overlay(&self, request: &OverlayRequest) -> ToolResult<PathBuf> {
        let mut cmd = self
            .invoke(ToolKind::QcRender, &self.paths.slicer)
            .path_arg(&request.base);
        if let Some(overlay) = &request.overlay {
            cmd = cmd.path_arg(overlay);
        }
        cmd.arg("-a").path_arg(&request.output).run().await?;
        expect_output(ToolKind::QcRender, &request.output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_image_stem_strips_nifti_extensions() {
        assert_eq!(image_stem(Path::new("/x/s1_FLAIR_brain.nii.gz")), "s1_FLAIR_brain");
        assert_eq!(image_stem(Path::new("s1_T1.nii")), "s1_T1");
    }

    #[test]
    fn test_with_suffix_appends_to_prefix() {
        let p = with_suffix(Path::new("/out/s1_FLAIR_"), "Warped.nii.gz");
        assert_eq!(p, PathBuf::from("/out/s1_FLAIR_Warped.nii.gz"));
    }

    #[test]
    fn test_tool_paths_toml_defaults() {
        let paths: ToolPaths = serde_json::from_str(r#"{"bet": "/opt/fsl/bin/bet"}"#).unwrap();
        assert_eq!(paths.bet, "/opt/fsl/bin/bet");
        assert_eq!(paths.fslinfo, "fslinfo");
        assert_eq!(paths.atlas.pons_label, 2);
    }

    #[test]
    fn test_conversion_overwrites_on_rerun() {
        let kit = CommandToolkit::default();
        let request = ConvertRequest {
            input_dir: PathBuf::from("/data/sub01"),
            file_pattern: "IM*".into(),
            output_dir: PathBuf::from("/out/extracted"),
        };
        let invocation = kit.convert_invocation(&request);
        let argv: Vec<String> = invocation
            .argv()
            .iter()
            .map(|a| a.to_string_lossy().to_string())
            .collect();

        assert_eq!(invocation.program(), "dcm2niix");
        let w = argv.iter().position(|a| a == "-w").unwrap();
        assert_eq!(argv[w + 1], "1");
        assert_eq!(
            argv[argv.len() - 2..].to_vec(),
            vec!["/out/extracted", "/data/sub01"]
        );
    }

    #[test]
    fn test_voxel_export_lists_every_masked_voxel() {
        let kit = CommandToolkit::default();
        let query = StatsQuery::new("/out/s_FLAIR_reg.nii.gz")
            .with_mask("/out/s_brainstem.nii.gz")
            .window(Some(10.0), None);
        let invocation = kit.voxel_values_invocation(&query);
        let argv: Vec<String> = invocation
            .argv()
            .iter()
            .map(|a| a.to_string_lossy().to_string())
            .collect();

        assert_eq!(invocation.program(), "fslmeants");
        assert_eq!(
            argv,
            vec![
                "-i",
                "/out/s_FLAIR_reg.nii.gz",
                "-m",
                "/out/s_brainstem.nii.gz",
                "--showall",
                "--transpose"
            ]
        );
    }

    #[tokio::test]
    async fn test_missing_executable_surfaces_not_found() {
        let kit = CommandToolkit::new(ToolPaths {
            fslinfo: "brainx-missing-fslinfo".into(),
            ..ToolPaths::default()
        });
        let err = kit.header(Path::new("/tmp/none.nii.gz")).await.unwrap_err();
        assert!(matches!(err, ToolError::NotFound { tool: ToolKind::ImageInfo, .. }));
    }

    #[tokio::test]
    async fn test_expect_output_reports_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = expect_output(ToolKind::QcRender, &dir.path().join("a.png")).unwrap_err();
        assert!(matches!(err, ToolError::MissingOutput { .. }));
    }
}
