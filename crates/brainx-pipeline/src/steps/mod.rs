//! The eight stage bodies.

mod analysis;
mod brain_extraction;
mod import;
mod preprocess;
mod registration;
mod segmentation;
mod tracking;
mod visualization;

use std::path::{Path, PathBuf};

use brainx_core::{BrainxError, Modality, ModuleDir, PipelineStage, Result};
use serde::Serialize;

use crate::env::StageEnv;
use crate::stage::StageBody;

pub use analysis::{Analysis, HyperintensityReport, ThresholdLevel};
pub use brain_extraction::BrainExtraction;
pub use import::{discover_dicom, Import};
pub use preprocess::Preprocess;
pub use registration::Registration;
pub use segmentation::Segmentation;
pub use tracking::Tracking;
pub use visualization::Visualization;

/// The body that implements `stage`.
pub fn body_for(stage: PipelineStage) -> Box<dyn StageBody> {
    match stage {
        PipelineStage::Import => Box::new(Import),
        PipelineStage::Preprocess => Box::new(Preprocess),
        PipelineStage::BrainExtraction => Box::new(BrainExtraction),
        PipelineStage::Registration => Box::new(Registration),
        PipelineStage::Segmentation => Box::new(Segmentation),
        PipelineStage::Analysis => Box::new(Analysis),
        PipelineStage::Visualization => Box::new(Visualization),
        PipelineStage::Tracking => Box::new(Tracking),
    }
}

pub(crate) async fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<PathBuf> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, serde_json::to_vec_pretty(value)?).await?;
    Ok(path.to_path_buf())
}

/// An input this stage needs that an earlier stage should have produced.
pub(crate) fn require_file(path: &Path, produced_by: PipelineStage) -> Result<PathBuf> {
    if path.is_file() {
        Ok(path.to_path_buf())
    } else {
        Err(BrainxError::DataMissing(format!(
            "{} not found (produced by {produced_by})",
            path.display()
        )))
    }
}

/// Modalities from `candidates` whose `<module>/<base><suffix>.nii.gz`
/// exists. A missing required modality is an error; a missing optional one
/// was dropped by an earlier best-effort batch and is skipped.
pub(crate) fn present(
    env: &StageEnv,
    candidates: impl IntoIterator<Item = Modality>,
    module: ModuleDir,
    suffix: &str,
    produced_by: PipelineStage,
) -> Result<Vec<Modality>> {
    let mut found = Vec::new();
    for modality in candidates {
        let path = env.path(&env.key(module, modality).suffix(suffix));
        if path.is_file() {
            found.push(modality);
        } else if modality.is_required() {
            require_file(&path, produced_by)?;
        } else {
            tracing::debug!(modality = %modality, path = %path.display(), "optional input absent, skipping");
        }
    }
    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_stage_has_a_body() {
        for stage in PipelineStage::ALL {
            assert_eq!(body_for(stage).stage(), stage);
        }
    }

    #[test]
    fn test_require_file_missing_is_data_missing() {
        let dir = tempfile::tempdir().unwrap();
        let err = require_file(&dir.path().join("x_n4.nii.gz"), PipelineStage::Preprocess)
            .unwrap_err();
        assert_eq!(err.exit_code(), 31);
    }
}
