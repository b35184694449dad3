//! Stage 3: skull stripping, then every brain resampled onto the
//! reference modality's grid.

use async_trait::async_trait;
use brainx_core::{
    dispatch, BrainxError, Modality, ModuleDir, PipelineStage, ReferenceDecision, Result,
    ScanSelection,
};
use brainx_toolkit::{BrainExtractionRequest, Interpolation, ResampleRequest};
use tracing::info;

use crate::env::{settle, StageEnv};
use crate::stage::{StageBody, StageOutput};
use crate::steps::present;

pub struct BrainExtraction;

#[async_trait]
impl StageBody for BrainExtraction {
    fn stage(&self) -> PipelineStage {
        PipelineStage::BrainExtraction
    }

    async fn run(&self, env: &StageEnv) -> Result<StageOutput> {
        let selection = ScanSelection::load(env.root()).await?;
        let reference = ReferenceDecision::load(env.root()).await?;

        let modalities = present(
            env,
            selection.modalities(),
            ModuleDir::BiasCorrected,
            "_n4",
            PipelineStage::Preprocess,
        )?;
        env.ensure(ModuleDir::BrainExtraction)?;
        env.ensure(ModuleDir::Standardized)?;

        let fractional_intensity = env.params().fractional_intensity;
        let job_env = env.clone();
        let report = dispatch(
            env.batch("brain_extraction", modalities),
            &env.pool,
            move |modality: Modality| {
                let env = job_env.clone();
                async move {
                    let request = BrainExtractionRequest {
                        input: env.path(&env.key(ModuleDir::BiasCorrected, modality).suffix("_n4")),
                        output: env.path(&env.key(ModuleDir::BrainExtraction, modality).suffix("_brain")),
                        fractional_intensity,
                    };
                    Ok::<_, BrainxError>(env.toolkit.brain.extract(&request).await?)
                }
            },
        )
        .await?;
        let extracted = settle(report, env.config.parallel.halt_policy)?;

        let mut output = StageOutput::default();
        for (_, brain) in &extracted {
            output.push(brain.brain.clone());
            output.push(brain.mask.clone());
        }

        let reference_brain = extracted
            .iter()
            .find(|(m, _)| *m == reference.modality)
            .map(|(_, b)| b.brain.clone())
            .ok_or_else(|| {
                BrainxError::DataMissing(format!(
                    "no extracted brain for reference modality {}",
                    reference.modality
                ))
            })?;

        // the reference already sits on its own grid
        let reference_std = env.path(&env.key(ModuleDir::Standardized, reference.modality).suffix("_std"));
        tokio::fs::copy(&reference_brain, &reference_std).await?;
        output.push(reference_std);

        let moving: Vec<Modality> = extracted
            .iter()
            .map(|(m, _)| *m)
            .filter(|m| *m != reference.modality)
            .collect();
        let job_env = env.clone();
        let report = dispatch(env.batch("standardize", moving), &env.pool, move |modality: Modality| {
            let env = job_env.clone();
            let reference_brain = reference_brain.clone();
            async move {
                let request = ResampleRequest {
                    input: env.path(&env.key(ModuleDir::BrainExtraction, modality).suffix("_brain")),
                    reference: reference_brain,
                    output: env.path(&env.key(ModuleDir::Standardized, modality).suffix("_std")),
                    interpolation: Interpolation::Linear,
                };
                Ok::<_, BrainxError>(env.toolkit.registrar.resample(&request).await?)
            }
        })
        .await?;
        for (_, standardized) in settle(report, env.config.parallel.halt_policy)? {
            output.push(standardized);
        }

        info!(
            reference = %reference.modality,
            modalities = extracted.len(),
            "brains extracted and standardized"
        );
        Ok(output)
    }
}
