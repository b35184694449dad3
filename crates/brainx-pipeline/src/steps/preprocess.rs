//! Stage 2: pick one scan per modality, decide the reference space and
//! bias-correct every selected scan.

use std::path::PathBuf;

use async_trait::async_trait;
use brainx_core::{dispatch, BrainxError, Modality, ModuleDir, PipelineStage, ReferenceSelector, Result};
use brainx_toolkit::BiasCorrectionRequest;
use tracing::info;

use crate::env::{settle, StageEnv};
use crate::stage::{StageBody, StageOutput};

pub struct Preprocess;

#[async_trait]
impl StageBody for Preprocess {
    fn stage(&self) -> PipelineStage {
        PipelineStage::Preprocess
    }

    async fn run(&self, env: &StageEnv) -> Result<StageOutput> {
        let selector = ReferenceSelector::new(
            env.toolkit.info.clone(),
            env.toolkit.stats.clone(),
            env.config.scoring.clone(),
            env.config.modalities.compile()?,
        );
        let outcome = selector
            .select_scans(env.root(), env.config.reference_strategy)
            .await?;

        let mut output = StageOutput::default();
        output.push(outcome.decision.persist(env.root()).await?);
        output.push(outcome.selection.persist(env.root()).await?);
        info!(
            reference = %outcome.decision.modality,
            modalities = outcome.chosen.len(),
            "scans selected"
        );

        env.ensure(ModuleDir::BiasCorrected)?;
        let inputs: Vec<Modality> = outcome.chosen.iter().map(|c| c.modality).collect();
        let sources: Vec<(Modality, PathBuf)> =
            outcome.chosen.iter().map(|c| (c.modality, c.path.clone())).collect();
        let params = env.params();

        let job_env = env.clone();
        let batch = env.batch("bias_correction", inputs);
        let report = dispatch(batch, &env.pool, move |modality: Modality| {
            let env = job_env.clone();
            let params = params.clone();
            let input = sources
                .iter()
                .find(|(m, _)| *m == modality)
                .map(|(_, p)| p.clone());
            async move {
                let input = input.ok_or_else(|| {
                    BrainxError::DataMissing(format!("no selected {modality} scan"))
                })?;
                let request = BiasCorrectionRequest {
                    input,
                    mask: None,
                    output: env.path(&env.key(ModuleDir::BiasCorrected, modality).suffix("_n4")),
                    shrink_factor: params.bias_shrink_factor,
                    iterations: params.bias_iterations,
                };
                Ok::<_, BrainxError>(env.toolkit.bias.correct(&request).await?)
            }
        })
        .await?;

        for (_, corrected) in settle(report, env.config.parallel.halt_policy)? {
            output.push(corrected);
        }
        Ok(output)
    }
}
