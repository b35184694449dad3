//! Stage 6: brainstem hyperintensity thresholds, cluster tables and the
//! cross-modality overlap.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use brainx_core::{
    dispatch, relative_to, ArtifactKey, BrainxError, Modality, ModuleDir, PipelineStage, Result,
};
use brainx_toolkit::parse::render_cluster_table;
use brainx_toolkit::{Cluster, StatsQuery, ThresholdRequest};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::env::{settle, StageEnv};
use crate::overlap::{find_overlaps, render_csv, OVERLAP_FILE};
use crate::stage::{StageBody, StageOutput};
use crate::steps::{present, require_file, write_json};

pub struct Analysis;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdLevel {
    pub multiplier: f64,
    pub threshold: f64,
    pub mask: PathBuf,
    pub cluster_table: PathBuf,
    pub clusters: usize,
    pub lesion_voxels: u64,
}

/// `validation/hyperintensities/<base>_hyperintensities.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HyperintensityReport {
    pub modality: Modality,
    pub image: PathBuf,
    pub brainstem_mask: PathBuf,
    pub brainstem_mean: f64,
    pub brainstem_std_dev: f64,
    pub min_cluster_voxels: u64,
    pub levels: Vec<ThresholdLevel>,
    /// Brainstem intensities kept for distribution fitting.
    pub voxel_values: PathBuf,
    pub voxel_value_count: usize,
}

struct ModalityResult {
    files: Vec<PathBuf>,
    /// Clusters at the overlap multiplier, when it is one of the levels.
    overlap_clusters: Option<Vec<Cluster>>,
}

/// `_thresh2.0`, `_clusters2.0`, ...
fn level_suffix(prefix: &str, multiplier: f64) -> String {
    format!("{prefix}{multiplier:.1}")
}

/// Non-zero finite intensities, one per line. Returns the text and how
/// many values it holds.
fn render_voxel_values(values: &[f64]) -> (String, usize) {
    let mut text = String::new();
    let mut count = 0;
    for v in values.iter().filter(|v| v.is_finite() && **v != 0.0) {
        let _ = writeln!(text, "{v:.6}");
        count += 1;
    }
    (text, count)
}

/// `validation/hyperintensities/<base>_brainstem_values.txt`
async fn export_voxel_values(
    env: &StageEnv,
    modality: Modality,
    image: &Path,
    brainstem: &Path,
) -> Result<(PathBuf, usize)> {
    let values = env
        .toolkit
        .stats
        .voxel_values(&StatsQuery::new(image).with_mask(brainstem))
        .await?;
    let (text, count) = render_voxel_values(&values);
    if count == 0 {
        warn!(%modality, "no non-zero voxel values inside the brainstem");
    }
    let path = env.path(
        &env.key(ModuleDir::ValidationHyperintensities, modality)
            .suffix("_brainstem_values")
            .ext("txt"),
    );
    tokio::fs::write(&path, text).await?;
    Ok((path, count))
}

async fn analyze(env: StageEnv, modality: Modality, brainstem: PathBuf) -> Result<ModalityResult> {
    let analysis = &env.config.analysis;
    let image = env.path(&env.key(ModuleDir::Registered, modality).suffix("_reg"));
    let stats = env
        .toolkit
        .stats
        .stats(&StatsQuery::new(&image).with_mask(&brainstem))
        .await?;
    if stats.voxels == 0 {
        return Err(BrainxError::DataCorrupt(format!(
            "{modality} has no voxels inside the brainstem mask"
        )));
    }

    let (values_path, voxel_value_count) = export_voxel_values(&env, modality, &image, &brainstem).await?;
    let mut files = vec![values_path.clone()];
    let mut levels = Vec::new();
    let mut overlap_clusters = None;
    for &k in &analysis.threshold_multipliers {
        let threshold = stats.mean + k * stats.std_dev;
        let mask = env
            .toolkit
            .lesions
            .threshold(&ThresholdRequest {
                image: image.clone(),
                mask: brainstem.clone(),
                threshold,
                output: env.path(
                    &env.key(ModuleDir::HyperintensityThresholds, modality)
                        .suffix(level_suffix("_thresh", k)),
                ),
            })
            .await?;

        let clusters: Vec<Cluster> = env
            .toolkit
            .lesions
            .clusters(&mask)
            .await?
            .into_iter()
            .filter(|c| c.voxels >= analysis.min_cluster_voxels)
            .collect();
        let table = env.path(
            &env.key(ModuleDir::HyperintensityClusters, modality)
                .suffix(level_suffix("_clusters", k))
                .ext("tsv"),
        );
        tokio::fs::write(&table, render_cluster_table(&clusters)).await?;

        levels.push(ThresholdLevel {
            multiplier: k,
            threshold,
            mask: relative_to(env.root(), &mask),
            cluster_table: relative_to(env.root(), &table),
            clusters: clusters.len(),
            lesion_voxels: clusters.iter().map(|c| c.voxels).sum(),
        });
        if (k - analysis.overlap_multiplier).abs() < 1e-9 {
            overlap_clusters = Some(clusters);
        }
        files.push(mask);
        files.push(table);
    }

    let report = HyperintensityReport {
        modality,
        image: relative_to(env.root(), &image),
        brainstem_mask: relative_to(env.root(), &brainstem),
        brainstem_mean: stats.mean,
        brainstem_std_dev: stats.std_dev,
        min_cluster_voxels: analysis.min_cluster_voxels,
        levels,
        voxel_values: relative_to(env.root(), &values_path),
        voxel_value_count,
    };
    let report_path = env.path(
        &env.key(ModuleDir::ValidationHyperintensities, modality)
            .suffix("_hyperintensities")
            .ext("json"),
    );
    write_json(&report_path, &report).await?;
    files.push(report_path);

    Ok(ModalityResult {
        files,
        overlap_clusters,
    })
}

#[async_trait]
impl StageBody for Analysis {
    fn stage(&self) -> PipelineStage {
        PipelineStage::Analysis
    }

    async fn run(&self, env: &StageEnv) -> Result<StageOutput> {
        let brainstem = require_file(
            &env.path(&env.subject_key(ModuleDir::SegmentationBrainstem).suffix("_brainstem")),
            PipelineStage::Segmentation,
        )?;
        let analysis = &env.config.analysis;
        let modalities = present(
            env,
            analysis.modalities.iter().copied(),
            ModuleDir::Registered,
            "_reg",
            PipelineStage::Registration,
        )?;
        if modalities.is_empty() {
            return Err(BrainxError::DataMissing(
                "no registered image for any analyzed modality".to_string(),
            ));
        }
        env.ensure(ModuleDir::HyperintensityThresholds)?;
        env.ensure(ModuleDir::HyperintensityClusters)?;
        env.ensure(ModuleDir::ValidationHyperintensities)?;

        let job_env = env.clone();
        let report = dispatch(
            env.batch("hyperintensity_analysis", modalities),
            &env.pool,
            move |modality: Modality| analyze(job_env.clone(), modality, brainstem.clone()),
        )
        .await?;
        let analyzed = settle(report, env.config.parallel.halt_policy)?;

        let mut output = StageOutput::default();
        let mut overlap_input = Vec::new();
        for (modality, result) in analyzed {
            output.extend(result.files);
            if let Some(clusters) = result.overlap_clusters {
                overlap_input.push((modality, clusters));
            }
        }

        if overlap_input.len() >= 2 {
            let overlaps = find_overlaps(&overlap_input, analysis.overlap_distance_mm);
            let csv = env.path(
                &ArtifactKey::new(ModuleDir::HyperintensityClusters, OVERLAP_FILE).ext("csv"),
            );
            tokio::fs::write(&csv, render_csv(&overlaps)).await?;
            info!(pairs = overlaps.len(), "cluster overlap tabulated");
            output.push(csv);
        } else if analysis.modalities.len() >= 2 {
            warn!(
                multiplier = analysis.overlap_multiplier,
                "overlap needs clusters from two modalities at the overlap multiplier"
            );
        }
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_suffix_has_one_decimal() {
        assert_eq!(level_suffix("_thresh", 2.0), "_thresh2.0");
        assert_eq!(level_suffix("_clusters", 1.5), "_clusters1.5");
    }

    #[test]
    fn test_voxel_values_drop_background_and_nan() {
        let (text, count) = render_voxel_values(&[412.5, 0.0, 388.25, f64::NAN, -3.0, f64::INFINITY]);
        assert_eq!(count, 3);
        assert_eq!(text, "412.500000\n388.250000\n-3.000000\n");
        assert_eq!(render_voxel_values(&[0.0, f64::NAN]), (String::new(), 0));
    }
}
