//! Stage 7: QC overlays and their manifest. Best-effort by default.

use std::path::PathBuf;

use async_trait::async_trait;
use brainx_core::{
    dispatch, relative_to, ArtifactKey, BrainxError, Modality, ModuleDir, PipelineStage, Result,
    ScanSelection,
};
use brainx_toolkit::OverlayRequest;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::env::{settle, StageEnv};
use crate::stage::{StageBody, StageOutput};
use crate::steps::{present, require_file, write_json};

pub struct Visualization;

pub const MANIFEST_FILE: &str = "qc_manifest";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QcOverlay {
    pub modality: Modality,
    pub label: String,
    pub base: PathBuf,
    pub overlay: PathBuf,
    pub image: PathBuf,
}

/// `reports/qc_manifest.json`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QcManifest {
    pub subject: String,
    pub overlays: Vec<QcOverlay>,
}

async fn render(env: StageEnv, modality: Modality, brainstem: PathBuf) -> Result<Vec<QcOverlay>> {
    let base = env.path(&env.key(ModuleDir::Registered, modality).suffix("_reg"));
    let mut layers = vec![("brainstem".to_string(), brainstem)];

    // hyperintensities at the overlap multiplier, when analysis produced them
    let multiplier = env.config.analysis.overlap_multiplier;
    let lesions = env.path(
        &env.key(ModuleDir::HyperintensityThresholds, modality)
            .suffix(format!("_thresh{multiplier:.1}")),
    );
    if lesions.is_file() {
        layers.push(("hyperintensities".to_string(), lesions));
    }

    let mut rendered = Vec::new();
    for (label, overlay) in layers {
        let output = env.path(
            &env.key(ModuleDir::QcVisualizations, modality)
                .suffix(format!("_{label}"))
                .ext("png"),
        );
        let image = env
            .toolkit
            .renderer
            .render_overlay(&OverlayRequest {
                base: base.clone(),
                overlay: Some(overlay.clone()),
                output,
            })
            .await?;
        rendered.push(QcOverlay {
            modality,
            label,
            base: relative_to(env.root(), &base),
            overlay: relative_to(env.root(), &overlay),
            image: relative_to(env.root(), &image),
        });
    }
    Ok(rendered)
}

#[async_trait]
impl StageBody for Visualization {
    fn stage(&self) -> PipelineStage {
        PipelineStage::Visualization
    }

    async fn run(&self, env: &StageEnv) -> Result<StageOutput> {
        let brainstem = require_file(
            &env.path(&env.subject_key(ModuleDir::SegmentationBrainstem).suffix("_brainstem")),
            PipelineStage::Segmentation,
        )?;
        let selection = ScanSelection::load(env.root()).await?;
        let modalities = present(
            env,
            selection.modalities(),
            ModuleDir::Registered,
            "_reg",
            PipelineStage::Registration,
        )?;
        env.ensure(ModuleDir::QcVisualizations)?;
        env.ensure(ModuleDir::Reports)?;

        let job_env = env.clone();
        let report = dispatch(
            env.batch("qc_render", modalities),
            &env.pool,
            move |modality: Modality| render(job_env.clone(), modality, brainstem.clone()),
        )
        .await?;

        let mut manifest = QcManifest {
            subject: env.subject.clone(),
            overlays: Vec::new(),
        };
        for (_, overlays) in settle(report, env.config.parallel.halt_policy)? {
            manifest.overlays.extend(overlays);
        }
        if manifest.overlays.is_empty() {
            return Err(BrainxError::DataMissing("no QC overlay was rendered".to_string()));
        }

        let mut output = StageOutput::default();
        output.extend(manifest.overlays.iter().map(|o| env.root().join(&o.image)));
        let manifest_path = env.path(&ArtifactKey::new(ModuleDir::Reports, MANIFEST_FILE).ext("json"));
        output.push(write_json(&manifest_path, &manifest).await?);

        info!(overlays = manifest.overlays.len(), "QC overlays rendered");
        Ok(output)
    }
}
