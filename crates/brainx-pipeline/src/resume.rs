//! Resuming a run from a later stage.
//!
//! Stages before the start stage are not re-run; their outputs are found by
//! globbing the module directories. Every prerequisite of a stage that will
//! run, when produced by a skipped stage, must match at least one file.

use std::path::{Path, PathBuf};

use brainx_core::{discover, obs, BrainxError, PipelineKind, PipelineStage, Result};
use tracing::debug;

/// A prerequisite found on disk.
#[derive(Debug, Clone, PartialEq)]
pub struct Rediscovered {
    pub produced_by: PipelineStage,
    pub pattern: String,
    pub files: Vec<PathBuf>,
}

/// Check the prerequisites of every stage from `start` on that `kind` runs.
///
/// Fails with `DataMissing` naming the first unsatisfied prerequisite.
pub fn rediscover(
    output_root: &Path,
    start: PipelineStage,
    kind: PipelineKind,
) -> Result<Vec<Rediscovered>> {
    let mut found: Vec<Rediscovered> = Vec::new();
    for stage in PipelineStage::ALL {
        if stage < start || !stage.included_in(kind) {
            continue;
        }
        for prereq in stage.prerequisites() {
            if prereq.produced_by >= start {
                continue;
            }
            let pattern = format!("{}/{}", prereq.output.module, prereq.output.pattern);
            if found.iter().any(|r| r.pattern == pattern) {
                continue;
            }

            let files = discover(output_root, prereq.output.module, prereq.output.pattern)?;
            if files.is_empty() {
                return Err(BrainxError::DataMissing(format!(
                    "cannot start at {start}: {stage} needs {pattern} from {}, found none under {}",
                    prereq.produced_by,
                    output_root.display()
                )));
            }
            debug!(stage = %stage, pattern = %pattern, count = files.len(), "prerequisite found");
            obs::emit_stage_rediscovered(prereq.produced_by.name(), &pattern);
            found.push(Rediscovered {
                produced_by: prereq.produced_by,
                pattern,
                files,
            });
        }
    }
    Ok(found)
}
