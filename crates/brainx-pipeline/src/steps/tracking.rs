//! Stage 8: the cluster-to-DICOM trace and the pipeline summary.

use async_trait::async_trait;
use brainx_core::{PipelineStage, Result};
use tracing::info;

use crate::env::StageEnv;
use crate::stage::{StageBody, StageOutput};
use crate::steps::write_json;
use crate::summary::PipelineSummary;
use crate::trace::{self, ClusterDicomTrace};

pub struct Tracking;

#[async_trait]
impl StageBody for Tracking {
    fn stage(&self) -> PipelineStage {
        PipelineStage::Tracking
    }

    async fn run(&self, env: &StageEnv) -> Result<StageOutput> {
        let traced = trace::build(env).await?;
        let trace_path = write_json(&env.path(&ClusterDicomTrace::artifact()), &traced).await?;

        // the summary lists the trace, so it goes last
        let summary = PipelineSummary::collect(env.root(), &env.subject).await?;
        let written = summary.write(env.root()).await?;
        info!(artifacts = summary.artifact_count(), "summary written");

        let mut output = StageOutput::default();
        output.push(trace_path);
        output.extend(written);
        Ok(output)
    }
}
