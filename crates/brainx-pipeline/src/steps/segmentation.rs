//! Stage 5: atlas-based brainstem and pons segmentation in reference space.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use brainx_core::{relative_to, BrainxError, Modality, ModuleDir, PipelineStage, Result};
use brainx_toolkit::{SegmentationRequest, StatsQuery};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::env::StageEnv;
use crate::stage::{StageBody, StageOutput};
use crate::steps::write_json;

pub struct Segmentation;

/// Labelled structures, in the order they are written.
const STRUCTURES: [&str; 4] = ["brainstem", "pons", "dorsal_pons", "ventral_pons"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructureVolume {
    pub mask: PathBuf,
    pub voxels: u64,
    pub volume_mm3: f64,
}

/// `validation/segmentation/<subject>_segmentation.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentationQc {
    pub image: PathBuf,
    pub modality: Modality,
    pub structures: BTreeMap<String, StructureVolume>,
}

impl Segmentation {
    /// Registered T1 when present, else the registered FLAIR.
    fn source_image(env: &StageEnv) -> Result<(Modality, PathBuf)> {
        for modality in [Modality::T1, Modality::Flair] {
            let path = env.path(&env.key(ModuleDir::Registered, modality).suffix("_reg"));
            if path.is_file() {
                return Ok((modality, path));
            }
        }
        Err(BrainxError::DataMissing(format!(
            "no registered T1 or FLAIR under {} (produced by {})",
            ModuleDir::Registered.dir(env.root()).display(),
            PipelineStage::Registration
        )))
    }

    async fn measure(env: &StageEnv, name: &str, mask: &Path) -> Result<StructureVolume> {
        let stats = env
            .toolkit
            .stats
            .stats(&StatsQuery::new(mask).window(Some(0.5), None))
            .await?;
        if name == "brainstem" && stats.voxels == 0 {
            return Err(BrainxError::DataCorrupt(format!(
                "brainstem mask {} is empty",
                mask.display()
            )));
        }
        Ok(StructureVolume {
            mask: relative_to(env.root(), mask),
            voxels: stats.voxels,
            volume_mm3: stats.volume_mm3,
        })
    }
}

#[async_trait]
impl StageBody for Segmentation {
    fn stage(&self) -> PipelineStage {
        PipelineStage::Segmentation
    }

    async fn run(&self, env: &StageEnv) -> Result<StageOutput> {
        let (modality, image) = Self::source_image(env)?;
        env.ensure(ModuleDir::SegmentationBrainstem)?;
        env.ensure(ModuleDir::SegmentationPons)?;
        env.ensure(ModuleDir::ValidationSegmentation)?;

        let brainstem_key = env.subject_key(ModuleDir::SegmentationBrainstem);
        let pons_key = env.subject_key(ModuleDir::SegmentationPons);
        let request = SegmentationRequest {
            image: image.clone(),
            atlas: env.config.tools.atlas.clone(),
            brainstem_output: env.path(&brainstem_key.suffix("_brainstem")),
            pons_output: env.path(&pons_key.clone().suffix("_pons")),
            dorsal_pons_output: env.path(&pons_key.clone().suffix("_dorsal_pons")),
            ventral_pons_output: env.path(&pons_key.suffix("_ventral_pons")),
        };
        let segmented = env.toolkit.segmenter.segment(&request).await?;

        let masks = [
            &segmented.brainstem,
            &segmented.pons,
            &segmented.dorsal_pons,
            &segmented.ventral_pons,
        ];
        let mut structures = BTreeMap::new();
        for (name, mask) in STRUCTURES.iter().zip(masks) {
            structures.insert(name.to_string(), Self::measure(env, name, mask).await?);
        }

        let qc = SegmentationQc {
            image: relative_to(env.root(), &image),
            modality,
            structures,
        };
        let qc_path = env.path(
            &env
                .subject_key(ModuleDir::ValidationSegmentation)
                .suffix("_segmentation")
                .ext("json"),
        );
        write_json(&qc_path, &qc).await?;

        info!(
            source = %modality,
            brainstem_voxels = qc.structures.get("brainstem").map_or(0, |v| v.voxels),
            "segmentation complete"
        );

        let mut output = StageOutput::default();
        output.extend(masks.into_iter().cloned());
        output.push(qc_path);
        Ok(output)
    }
}
