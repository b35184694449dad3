//! Stage 1: DICOM discovery, conversion, de-duplication and scanner
//! metadata.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use brainx_core::{dedupe, glob_in, BrainxError, ModuleDir, PipelineStage, Result};
use brainx_toolkit::ConvertRequest;
use tracing::{debug, info, warn};

use crate::env::StageEnv;
use crate::scanner::ScannerParams;
use crate::stage::{StageBody, StageOutput};
use crate::steps::write_json;

pub struct Import;

/// DICOM files under `input_dir` (recursively) for the first pattern in
/// `patterns` that matches anything.
pub fn discover_dicom(input_dir: &Path, patterns: &[String]) -> Result<Option<(String, Vec<PathBuf>)>> {
    for pattern in patterns {
        let files = glob_in(input_dir, &format!("**/{pattern}"))?;
        if !files.is_empty() {
            return Ok(Some((pattern.clone(), files)));
        }
    }
    Ok(None)
}

#[async_trait]
impl StageBody for Import {
    fn stage(&self) -> PipelineStage {
        PipelineStage::Import
    }

    async fn run(&self, env: &StageEnv) -> Result<StageOutput> {
        if !env.input_dir.is_dir() {
            return Err(BrainxError::FileNotFound(env.input_dir.clone()));
        }

        let patterns = &env.config.import.dicom_patterns;
        let (pattern, dicom_files) = discover_dicom(&env.input_dir, patterns)?.ok_or_else(|| {
            BrainxError::DataMissing(format!(
                "no DICOM files matching {patterns:?} under {}",
                env.input_dir.display()
            ))
        })?;
        info!(pattern = %pattern, files = dicom_files.len(), "DICOM files found");

        // a rerun must not leave earlier conversions behind as candidates
        let stale = ModuleDir::Extracted.dir(env.root());
        match tokio::fs::remove_dir_all(&stale).await {
            Ok(()) => debug!(dir = %stale.display(), "cleared previous conversion"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        let extracted = env.ensure(ModuleDir::Extracted)?;
        let converted = env
            .toolkit
            .converter
            .convert(&ConvertRequest {
                input_dir: env.input_dir.clone(),
                file_pattern: pattern,
                output_dir: extracted,
            })
            .await?;
        if converted.count == 0 {
            return Err(BrainxError::DataMissing(format!(
                "converter produced no volumes from {}",
                env.input_dir.display()
            )));
        }

        let deduped = dedupe(env.root(), &converted.files).await?;
        info!(
            converted = converted.count,
            kept = deduped.kept.len(),
            removed = deduped.removed.len(),
            "series converted"
        );

        // headers of the first file stand in for the whole study
        let scanner = match env.toolkit.dicom_headers.read_header(&dicom_files[0]).await {
            Ok(header) => ScannerParams::from_header(&header),
            Err(e) => {
                warn!(file = %dicom_files[0].display(), error = %e, "DICOM header unreadable, using defaults");
                ScannerParams::fallback()
            }
        };
        let scanner_path = env.path(&ScannerParams::artifact());
        write_json(&scanner_path, &scanner).await?;

        let mut output = StageOutput::default();
        output.extend(deduped.kept);
        output.push(scanner_path);
        Ok(output)
    }
}
