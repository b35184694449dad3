//! Reference-space decision and per-modality scan selection.
//!
//! Both are computed once in the preprocess stage and persisted under
//! `metadata/`; later stages (and resumed runs) only read them back.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::artifact::{ArtifactKey, ModuleDir};
use crate::domain::error::{BrainxError, Result};
use crate::domain::modality::Modality;

/// How the reference modality is chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReferenceStrategy {
    #[default]
    Adaptive,
    AlwaysPrimary,
    AlwaysSecondary,
}

impl fmt::Display for ReferenceStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ReferenceStrategy::Adaptive => "adaptive",
            ReferenceStrategy::AlwaysPrimary => "always-primary",
            ReferenceStrategy::AlwaysSecondary => "always-secondary",
        })
    }
}

impl FromStr for ReferenceStrategy {
    type Err = BrainxError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().replace('_', "-").as_str() {
            "adaptive" => Ok(ReferenceStrategy::Adaptive),
            "always-primary" => Ok(ReferenceStrategy::AlwaysPrimary),
            "always-secondary" => Ok(ReferenceStrategy::AlwaysSecondary),
            _ => Err(BrainxError::InvalidArgument(format!(
                "unknown reference strategy {s:?}"
            ))),
        }
    }
}

/// The modality and file whose grid anchors the run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferenceDecision {
    pub modality: Modality,
    /// Path relative to the output root.
    pub file: PathBuf,
    pub strategy: ReferenceStrategy,
    pub rationale: String,
}

/// The file chosen for one modality.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectedScan {
    /// Path relative to the output root.
    pub file: PathBuf,
    /// `None` when the single-candidate shortcut skipped scoring.
    pub score: Option<f64>,
    pub candidates: usize,
}

/// Best file per modality present in the run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScanSelection {
    pub scans: BTreeMap<Modality, SelectedScan>,
}

impl ScanSelection {
    pub fn get(&self, modality: Modality) -> Option<&SelectedScan> {
        self.scans.get(&modality)
    }

    pub fn modalities(&self) -> impl Iterator<Item = Modality> + '_ {
        self.scans.keys().copied()
    }
}

pub const REFERENCE_FILE: &str = "reference_space";
pub const SELECTION_FILE: &str = "selected_scans";

async fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, serde_json::to_string_pretty(value)?).await?;
    Ok(())
}

async fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T> {
    let bytes = tokio::fs::read(path).await.map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => {
            BrainxError::DataMissing(format!("{} not found", path.display()))
        }
        _ => BrainxError::Io(e),
    })?;
    serde_json::from_slice(&bytes)
        .map_err(|e| BrainxError::DataCorrupt(format!("{}: {e}", path.display())))
}

impl ReferenceDecision {
    pub fn artifact() -> ArtifactKey {
        ArtifactKey::new(ModuleDir::Metadata, REFERENCE_FILE).ext("json")
    }

    pub async fn persist(&self, output_root: &Path) -> Result<PathBuf> {
        let path = Self::artifact().path(output_root);
        write_json(&path, self).await?;
        Ok(path)
    }

    pub async fn load(output_root: &Path) -> Result<Self> {
        read_json(&Self::artifact().path(output_root)).await
    }

    pub fn absolute_file(&self, output_root: &Path) -> PathBuf {
        output_root.join(&self.file)
    }
}

impl ScanSelection {
    pub fn artifact() -> ArtifactKey {
        ArtifactKey::new(ModuleDir::Metadata, SELECTION_FILE).ext("json")
    }

    pub async fn persist(&self, output_root: &Path) -> Result<PathBuf> {
        let path = Self::artifact().path(output_root);
        write_json(&path, self).await?;
        Ok(path)
    }

    pub async fn load(output_root: &Path) -> Result<Self> {
        read_json(&Self::artifact().path(output_root)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strategy_parse() {
        assert_eq!(
            "always-secondary".parse::<ReferenceStrategy>().unwrap(),
            ReferenceStrategy::AlwaysSecondary
        );
        assert_eq!(
            "ALWAYS_PRIMARY".parse::<ReferenceStrategy>().unwrap(),
            ReferenceStrategy::AlwaysPrimary
        );
        assert!("best".parse::<ReferenceStrategy>().is_err());
    }

    #[tokio::test]
    async fn test_decision_persist_and_load() {
        let root = tempfile::tempdir().unwrap();
        let decision = ReferenceDecision {
            modality: Modality::Flair,
            file: PathBuf::from("extracted/T2_SPACE_FLAIR_3.nii.gz"),
            strategy: ReferenceStrategy::Adaptive,
            rationale: "smaller voxel volume".into(),
        };
        let path = decision.persist(root.path()).await.unwrap();
        assert!(path.ends_with("metadata/reference_space.json"));
        assert_eq!(ReferenceDecision::load(root.path()).await.unwrap(), decision);
    }

    #[tokio::test]
    async fn test_missing_decision_is_data_missing() {
        let root = tempfile::tempdir().unwrap();
        assert!(matches!(
            ReferenceDecision::load(root.path()).await,
            Err(BrainxError::DataMissing(_))
        ));
    }

    #[tokio::test]
    async fn test_corrupt_selection_is_data_corrupt() {
        let root = tempfile::tempdir().unwrap();
        let path = ScanSelection::artifact().path(root.path());
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, b"{not json").unwrap();
        assert!(matches!(
            ScanSelection::load(root.path()).await,
            Err(BrainxError::DataCorrupt(_))
        ));
    }
}
