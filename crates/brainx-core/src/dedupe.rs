//! Byte-identical de-duplication of converter output.
//!
//! Runs only after the producing batch has fully completed. Files are hashed
//! with SHA-256; within each group of identical files the first in lexical
//! order is kept and the rest (plus their `.json` sidecars) are removed. The
//! digest manifest is written to a scratch directory under the output root,
//! which is removed when this function returns, on success or failure.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info};

use crate::domain::candidate::sidecar_path;
use crate::domain::error::Result;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DedupeReport {
    pub kept: Vec<PathBuf>,
    pub removed: Vec<PathBuf>,
}

/// SHA-256 of a file's contents, streamed.
pub async fn file_digest(path: &Path) -> Result<String> {
    let mut file = File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

pub async fn dedupe(output_root: &Path, files: &[PathBuf]) -> Result<DedupeReport> {
    let mut ordered: Vec<&PathBuf> = files.iter().collect();
    ordered.sort();
    ordered.dedup();

    tokio::fs::create_dir_all(output_root).await?;
    let scratch = tempfile::Builder::new()
        .prefix(".dedupe-")
        .tempdir_in(output_root)?;
    let mut manifest = File::create(scratch.path().join("digests.tsv")).await?;

    let mut first_by_digest: HashMap<String, PathBuf> = HashMap::new();
    let mut report = DedupeReport::default();
    for path in ordered {
        let digest = file_digest(path).await?;
        manifest
            .write_all(format!("{digest}\t{}\n", path.display()).as_bytes())
            .await?;

        match first_by_digest.get(&digest) {
            Some(original) => {
                debug!(duplicate = %path.display(), original = %original.display(), "removing byte-identical duplicate");
                tokio::fs::remove_file(path).await?;
                let sidecar = sidecar_path(path);
                if sidecar.is_file() {
                    tokio::fs::remove_file(&sidecar).await?;
                }
                report.removed.push(path.clone());
            }
            None => {
                first_by_digest.insert(digest, path.clone());
                report.kept.push(path.clone());
            }
        }
    }
    manifest.flush().await?;

    if !report.removed.is_empty() {
        info!(
            kept = report.kept.len(),
            removed = report.removed.len(),
            "removed duplicate series"
        );
    }
    Ok(report)
}
