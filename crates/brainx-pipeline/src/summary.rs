//! Pipeline summary written by the tracking stage.
//!
//! Lists, per module directory, the artifacts present under the output root
//! plus the persisted reference decision. It carries no timestamps or run
//! ids, so re-running over the same tree reproduces it byte for byte.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use brainx_core::{glob_in, relative_to, BrainxError, ModuleDir, ReferenceDecision, Result};
use serde::Serialize;

use crate::overlap::OVERLAP_FILE;

pub const SUMMARY_FILE: &str = "pipeline_summary";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PipelineSummary {
    pub subject: String,
    pub reference: Option<ReferenceDecision>,
    /// Module path -> sorted artifact paths relative to the output root.
    pub modules: BTreeMap<String, Vec<String>>,
}

impl PipelineSummary {
    /// Collect everything currently in the module tree, excluding the
    /// summary files themselves.
    pub async fn collect(output_root: &Path, subject: &str) -> Result<Self> {
        let reference = match ReferenceDecision::load(output_root).await {
            Ok(decision) => Some(decision),
            Err(BrainxError::DataMissing(_)) => None,
            Err(e) => return Err(e),
        };

        let mut modules = BTreeMap::new();
        for module in ModuleDir::ALL {
            let mut files: Vec<String> = glob_in(&module.dir(output_root), "*")?
                .into_iter()
                .filter(|p| !is_summary_file(module, p))
                .map(|p| relative_to(output_root, &p).to_string_lossy().replace('\\', "/"))
                .collect();
            files.sort();
            modules.insert(module.relative_path().to_string(), files);
        }

        Ok(Self {
            subject: subject.to_string(),
            reference,
            modules,
        })
    }

    pub fn artifact_count(&self) -> usize {
        self.modules.values().map(Vec::len).sum()
    }

    pub fn to_markdown(&self) -> String {
        let mut md = String::new();
        let _ = writeln!(md, "# Pipeline summary: {}\n", self.subject);
        match &self.reference {
            Some(r) => {
                let _ = writeln!(md, "## Reference space\n");
                let _ = writeln!(md, "- modality: {}", r.modality);
                let _ = writeln!(md, "- file: `{}`", r.file.display());
                let _ = writeln!(md, "- strategy: {}", r.strategy);
                let _ = writeln!(md, "- rationale: {}\n", r.rationale);
            }
            None => {
                let _ = writeln!(md, "## Reference space\n\nnot decided\n");
            }
        }
        let _ = writeln!(md, "## Artifacts ({})\n", self.artifact_count());
        for (module, files) in &self.modules {
            let _ = writeln!(md, "### {module} ({})\n", files.len());
            for f in files {
                let _ = writeln!(md, "- `{f}`");
            }
            md.push('\n');
        }
        if self
            .modules
            .get(ModuleDir::HyperintensityClusters.relative_path())
            .is_some_and(|files| files.iter().any(|f| f.contains(OVERLAP_FILE)))
        {
            let _ = writeln!(md, "Cross-modality cluster overlap tabulated.");
        }
        md
    }

    /// Write `summary/pipeline_summary.{json,md}`.
    pub async fn write(&self, output_root: &Path) -> Result<Vec<PathBuf>> {
        let dir = ModuleDir::Summary.ensure(output_root)?;
        let json = dir.join(format!("{SUMMARY_FILE}.json"));
        let md = dir.join(format!("{SUMMARY_FILE}.md"));
        tokio::fs::write(&json, serde_json::to_string_pretty(self)?).await?;
        tokio::fs::write(&md, self.to_markdown()).await?;
        Ok(vec![json, md])
    }
}

fn is_summary_file(module: ModuleDir, path: &Path) -> bool {
    module == ModuleDir::Summary
        && path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.starts_with(SUMMARY_FILE))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_collect_is_sorted_and_excludes_itself() {
        let root = tempfile::tempdir().unwrap();
        let reg = ModuleDir::Registered.ensure(root.path()).unwrap();
        std::fs::write(reg.join("s_T1_reg.nii.gz"), b"x").unwrap();
        std::fs::write(reg.join("s_FLAIR_reg.nii.gz"), b"x").unwrap();
        std::fs::create_dir_all(root.path().join("logs")).unwrap();
        std::fs::write(root.path().join("logs/run.log"), b"x").unwrap();

        let summary = PipelineSummary::collect(root.path(), "s").await.unwrap();
        summary.write(root.path()).await.unwrap();
        let again = PipelineSummary::collect(root.path(), "s").await.unwrap();

        assert_eq!(summary, again);
        assert_eq!(
            summary.modules["registered"],
            vec!["registered/s_FLAIR_reg.nii.gz", "registered/s_T1_reg.nii.gz"]
        );
        assert_eq!(summary.artifact_count(), 2);
        assert!(summary.reference.is_none());
    }

    #[tokio::test]
    async fn test_write_is_reproducible() {
        let root = tempfile::tempdir().unwrap();
        let summary = PipelineSummary::collect(root.path(), "s").await.unwrap();
        let paths = summary.write(root.path()).await.unwrap();
        let first = std::fs::read(&paths[0]).unwrap();
        PipelineSummary::collect(root.path(), "s")
            .await
            .unwrap()
            .write(root.path())
            .await
            .unwrap();
        assert_eq!(std::fs::read(&paths[0]).unwrap(), first);
        assert!(std::fs::read_to_string(&paths[1]).unwrap().contains("not decided"));
    }
}
