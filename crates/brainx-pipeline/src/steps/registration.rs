//! Stage 4: every non-reference modality registered to the reference, with
//! a per-modality correlation QC record.

use std::path::PathBuf;

use async_trait::async_trait;
use brainx_core::{
    dispatch, relative_to, BrainxError, Modality, ModuleDir, PipelineStage, ReferenceDecision,
    Result, ScanSelection,
};
use brainx_toolkit::{RegistrationRequest, TransformModel};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::env::{settle, StageEnv};
use crate::stage::{StageBody, StageOutput};
use crate::steps::{present, require_file, write_json};

pub struct Registration;

/// `validation/registration/<base>_registration.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistrationQc {
    pub modality: Modality,
    pub fixed: PathBuf,
    pub moving: PathBuf,
    pub registered: PathBuf,
    pub model: TransformModel,
    pub transforms: Vec<PathBuf>,
    pub correlation: f64,
    pub min_correlation: f64,
    pub passed: bool,
}

#[async_trait]
impl StageBody for Registration {
    fn stage(&self) -> PipelineStage {
        PipelineStage::Registration
    }

    async fn run(&self, env: &StageEnv) -> Result<StageOutput> {
        let reference = ReferenceDecision::load(env.root()).await?;
        let selection = ScanSelection::load(env.root()).await?;

        let fixed = require_file(
            &env.path(&env.key(ModuleDir::Standardized, reference.modality).suffix("_std")),
            PipelineStage::BrainExtraction,
        )?;
        let moving = present(
            env,
            selection.modalities().filter(|m| *m != reference.modality),
            ModuleDir::Standardized,
            "_std",
            PipelineStage::BrainExtraction,
        )?;
        env.ensure(ModuleDir::Registered)?;
        env.ensure(ModuleDir::ValidationRegistration)?;

        let mut output = StageOutput::default();
        let reference_reg = env.path(&env.key(ModuleDir::Registered, reference.modality).suffix("_reg"));
        tokio::fs::copy(&fixed, &reference_reg).await?;
        output.push(reference_reg);

        let model = env.params().registration_model;
        let batch = env.batch("registration", moving);
        let threads = env.threads_per_job(batch.degree);
        let min_correlation = env.config.validation.min_registration_correlation;

        let job_env = env.clone();
        let job_fixed = fixed.clone();
        let report = dispatch(batch, &env.pool, move |modality: Modality| {
            let env = job_env.clone();
            let fixed = job_fixed.clone();
            async move {
                let moving = env.path(&env.key(ModuleDir::Standardized, modality).suffix("_std"));
                let prefix = ModuleDir::Registered
                    .dir(env.root())
                    .join(format!("{}_", env.basename(modality)));
                let registered = env
                    .toolkit
                    .registrar
                    .register(&RegistrationRequest {
                        fixed: fixed.clone(),
                        moving: moving.clone(),
                        output_prefix: prefix,
                        model,
                        threads,
                    })
                    .await?;

                let reg_path = env.path(&env.key(ModuleDir::Registered, modality).suffix("_reg"));
                tokio::fs::rename(&registered.warped, &reg_path).await?;

                let correlation = env.toolkit.similarity.correlation(&reg_path, &fixed).await?;
                let root = env.root();
                let qc = RegistrationQc {
                    modality,
                    fixed: relative_to(root, &fixed),
                    moving: relative_to(root, &moving),
                    registered: relative_to(root, &reg_path),
                    model,
                    transforms: registered
                        .transforms
                        .iter()
                        .map(|t| relative_to(root, t))
                        .collect(),
                    correlation,
                    min_correlation,
                    passed: correlation >= min_correlation,
                };
                if !qc.passed {
                    warn!(
                        modality = %modality,
                        correlation,
                        min_correlation,
                        "registration correlation below threshold"
                    );
                }
                let qc_path = env.path(
                    &env.key(ModuleDir::ValidationRegistration, modality)
                        .suffix("_registration")
                        .ext("json"),
                );
                write_json(&qc_path, &qc).await?;

                let mut files = vec![reg_path, qc_path];
                files.extend(registered.transforms);
                Ok::<_, BrainxError>(files)
            }
        })
        .await?;

        let registered = settle(report, env.config.parallel.halt_policy)?;
        info!(
            reference = %reference.modality,
            registered = registered.len(),
            model = ?model,
            "modalities registered"
        );
        for (_, files) in registered {
            output.extend(files);
        }
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_qc_round_trips_through_json() {
        let qc = RegistrationQc {
            modality: Modality::Flair,
            fixed: PathBuf::from("standardized/s_T1_std.nii.gz"),
            moving: PathBuf::from("standardized/s_FLAIR_std.nii.gz"),
            registered: PathBuf::from("registered/s_FLAIR_reg.nii.gz"),
            model: TransformModel::Rigid,
            transforms: vec![PathBuf::from("registered/s_FLAIR_0GenericAffine.mat")],
            correlation: 0.42,
            min_correlation: 0.5,
            passed: false,
        };
        let json = serde_json::to_value(&qc).unwrap();
        assert_eq!(json["model"], "rigid");
        assert_eq!(json["passed"], false);
        let back: RegistrationQc = serde_json::from_value(json).unwrap();
        assert_eq!(back, qc);
    }
}
