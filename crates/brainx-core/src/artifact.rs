//! Artifact & path model.
//!
//! The filesystem is the registry: an artifact is identified by
//! `(module, basename, suffix, extension)` and lives at
//! `<output_root>/<module>/<basename><suffix>.<ext>`. Any two callers that
//! agree on the key agree on the path.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::domain::error::{BrainxError, Result};

/// The closed set of module directories under an output root.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModuleDir {
    Extracted,
    Metadata,
    BiasCorrected,
    BrainExtraction,
    Standardized,
    Registered,
    SegmentationBrainstem,
    SegmentationPons,
    HyperintensityThresholds,
    HyperintensityClusters,
    ValidationRegistration,
    ValidationSegmentation,
    ValidationHyperintensities,
    QcVisualizations,
    Reports,
    Summary,
}

impl ModuleDir {
    pub const ALL: [ModuleDir; 16] = [
        ModuleDir::Extracted,
        ModuleDir::Metadata,
        ModuleDir::BiasCorrected,
        ModuleDir::BrainExtraction,
        ModuleDir::Standardized,
        ModuleDir::Registered,
        ModuleDir::SegmentationBrainstem,
        ModuleDir::SegmentationPons,
        ModuleDir::HyperintensityThresholds,
        ModuleDir::HyperintensityClusters,
        ModuleDir::ValidationRegistration,
        ModuleDir::ValidationSegmentation,
        ModuleDir::ValidationHyperintensities,
        ModuleDir::QcVisualizations,
        ModuleDir::Reports,
        ModuleDir::Summary,
    ];

    /// Path of this module relative to the output root.
    pub fn relative_path(&self) -> &'static str {
        match self {
            ModuleDir::Extracted => "extracted",
            ModuleDir::Metadata => "metadata",
            ModuleDir::BiasCorrected => "bias_corrected",
            ModuleDir::BrainExtraction => "brain_extraction",
            ModuleDir::Standardized => "standardized",
            ModuleDir::Registered => "registered",
            ModuleDir::SegmentationBrainstem => "segmentation/brainstem",
            ModuleDir::SegmentationPons => "segmentation/pons",
            ModuleDir::HyperintensityThresholds => "hyperintensities/thresholds",
            ModuleDir::HyperintensityClusters => "hyperintensities/clusters",
            ModuleDir::ValidationRegistration => "validation/registration",
            ModuleDir::ValidationSegmentation => "validation/segmentation",
            ModuleDir::ValidationHyperintensities => "validation/hyperintensities",
            ModuleDir::QcVisualizations => "qc_visualizations",
            ModuleDir::Reports => "reports",
            ModuleDir::Summary => "summary",
        }
    }

    pub fn dir(&self, output_root: &Path) -> PathBuf {
        output_root.join(self.relative_path())
    }

    /// Create the module directory (and parents) if it does not exist.
    pub fn ensure(&self, output_root: &Path) -> Result<PathBuf> {
        let dir = self.dir(output_root);
        std::fs::create_dir_all(&dir).map_err(|e| match e.kind() {
            std::io::ErrorKind::PermissionDenied => BrainxError::Permission(dir.clone()),
            _ => BrainxError::Io(e),
        })?;
        Ok(dir)
    }
}

impl fmt::Display for ModuleDir {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.relative_path())
    }
}

/// Coarse classification of an artifact, inferred from its file name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Volume,
    Mask,
    Tabular,
    Transform,
    Visual,
    Report,
}

const MASK_SUFFIXES: [&str; 5] = ["_mask", "_brainstem", "_pons", "_dorsal_pons", "_ventral_pons"];

impl ArtifactKind {
    pub fn infer(path: &Path) -> Option<ArtifactKind> {
        let name = path.file_name()?.to_str()?.to_ascii_lowercase();
        if let Some(stem) = name
            .strip_suffix(".nii.gz")
            .or_else(|| name.strip_suffix(".nii"))
        {
            let is_mask =
                MASK_SUFFIXES.iter().any(|s| stem.ends_with(s)) || stem.contains("_thresh");
            return Some(if is_mask {
                ArtifactKind::Mask
            } else {
                ArtifactKind::Volume
            });
        }
        let ext = name.rsplit('.').next()?;
        match ext {
            "tsv" | "csv" => Some(ArtifactKind::Tabular),
            "mat" | "h5" | "txt" => Some(ArtifactKind::Transform),
            "png" | "jpg" | "jpeg" => Some(ArtifactKind::Visual),
            "json" | "md" | "html" => Some(ArtifactKind::Report),
            _ => None,
        }
    }

    /// Volumetric artifacts are subject to structural sanity checks.
    pub fn is_volumetric(&self) -> bool {
        matches!(self, ArtifactKind::Volume | ArtifactKind::Mask)
    }
}

/// Key of one artifact in the output tree.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ArtifactKey {
    pub module: ModuleDir,
    pub basename: String,
    pub suffix: String,
    pub extension: String,
}

impl ArtifactKey {
    /// A NIfTI artifact with no suffix.
    pub fn new(module: ModuleDir, basename: impl Into<String>) -> Self {
        Self {
            module,
            basename: basename.into(),
            suffix: String::new(),
            extension: "nii.gz".to_string(),
        }
    }

    pub fn suffix(mut self, suffix: impl Into<String>) -> Self {
        self.suffix = suffix.into();
        self
    }

    pub fn ext(mut self, extension: impl Into<String>) -> Self {
        self.extension = extension.into();
        self
    }

    pub fn file_name(&self) -> String {
        format!("{}{}.{}", self.basename, self.suffix, self.extension)
    }

    pub fn path(&self, output_root: &Path) -> PathBuf {
        self.module.dir(output_root).join(self.file_name())
    }

    pub fn kind(&self) -> Option<ArtifactKind> {
        ArtifactKind::infer(Path::new(&self.file_name()))
    }
}

/// Per-subject basename: `<subject>_<MODALITY>`.
pub fn subject_basename(subject: &str, modality_tag: &str) -> String {
    format!("{subject}_{modality_tag}")
}

/// Strip NIfTI extensions from a file name.
pub fn image_stem(path: &Path) -> String {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    name.strip_suffix(".nii.gz")
        .or_else(|| name.strip_suffix(".nii"))
        .map(str::to_string)
        .unwrap_or(name)
}

/// Files under `dir` matching a shell pattern, in lexical order.
///
/// A missing directory yields no matches rather than an error.
pub fn glob_in(dir: &Path, pattern: &str) -> Result<Vec<PathBuf>> {
    let full = format!(
        "{}/{}",
        glob::Pattern::escape(&dir.to_string_lossy()),
        pattern
    );
    let paths = glob::glob(&full)
        .map_err(|e| BrainxError::InvalidArgument(format!("bad pattern {pattern:?}: {e}")))?;

    let mut matches = Vec::new();
    for entry in paths {
        let path = entry.map_err(|e| BrainxError::Io(e.into()))?;
        if path.is_file() {
            matches.push(path);
        }
    }
    matches.sort();
    Ok(matches)
}

/// Rediscover artifacts of one module by pattern.
pub fn discover(output_root: &Path, module: ModuleDir, pattern: &str) -> Result<Vec<PathBuf>> {
    glob_in(&module.dir(output_root), pattern)
}

/// `path` relative to `root`, or `path` itself when it is elsewhere.
pub fn relative_to(root: &Path, path: &Path) -> PathBuf {
    path.strip_prefix(root)
        .map(Path::to_path_buf)
        .unwrap_or_else(|_| path.to_path_buf())
}
