//! The resumable stage orchestrator.
//!
//! Stages run in fixed order starting at the context's start stage. Stages
//! before it are not re-run; their outputs are rediscovered on disk. Every
//! stage that runs passes the validation gate before the next one begins.
//! A failing strict stage fails the run; a failing best-effort stage is
//! counted and the run continues.

use std::sync::Arc;
use std::time::Instant;

use brainx_core::{obs, BrainxError, PipelineConfig, PipelineStage, Result, RunContext, RunState, WorkerPool};
use brainx_toolkit::Toolkit;
use serde::Serialize;
use tracing::{error, info, Instrument};
use uuid::Uuid;

use crate::env::StageEnv;
use crate::resume::rediscover;
use crate::stage::{StageOutput, StageReport, StageStatus};
use crate::steps::body_for;

/// How a single-subject run ended.
#[derive(Debug, Serialize)]
pub struct RunOutcome {
    pub run_id: Uuid,
    pub subject: String,
    pub state: RunState,
    pub error_count: u32,
    pub duration_ms: u64,
    pub stages: Vec<StageReport>,
    /// The error that failed the run, if any.
    #[serde(skip)]
    pub failure: Option<BrainxError>,
}

impl RunOutcome {
    pub fn success(&self) -> bool {
        self.state == RunState::Completed
    }

    /// Process exit code for this run.
    pub fn exit_code(&self) -> i32 {
        match &self.failure {
            Some(e) => e.exit_code(),
            None if self.success() => 0,
            None => brainx_core::exit::GENERAL,
        }
    }

    pub fn report(&self, stage: PipelineStage) -> Option<&StageReport> {
        self.stages.iter().find(|r| r.stage == stage)
    }
}

pub struct Orchestrator {
    config: Arc<PipelineConfig>,
    toolkit: Toolkit,
    pool: WorkerPool,
}

impl Orchestrator {
    /// Worker availability is detected from `[parallel] enabled` and the host.
    pub fn new(config: PipelineConfig, toolkit: Toolkit) -> Self {
        let pool = WorkerPool::detect(config.parallel.enabled);
        Self {
            config: Arc::new(config),
            toolkit,
            pool,
        }
    }

    pub fn with_pool(mut self, pool: WorkerPool) -> Self {
        self.pool = pool;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Run one subject to completion or failure. Never panics on stage
    /// errors; the outcome carries them.
    pub async fn run(&self, ctx: &mut RunContext) -> RunOutcome {
        let span = obs::run_span(&ctx.run_id.to_string(), &ctx.subject);
        self.run_stages(ctx).instrument(span).await
    }

    async fn run_stages(&self, ctx: &mut RunContext) -> RunOutcome {
        let started = Instant::now();
        let run_id = ctx.run_id.to_string();
        obs::emit_run_started(
            &run_id,
            &ctx.subject,
            &ctx.pipeline.to_string(),
            ctx.start_stage.name(),
        );

        let env = StageEnv::for_run(ctx, self.config.clone(), self.toolkit.clone(), self.pool);
        let mut stages = Vec::with_capacity(PipelineStage::ALL.len());
        let mut failure = self.prepare(ctx).err();
        if let Some(e) = &failure {
            ctx.record_error();
            error!(error = %e, exit_code = e.exit_code(), "run could not start");
        }

        for stage in PipelineStage::ALL {
            if failure.is_some() {
                stages.push(StageReport::new(stage, StageStatus::NotRun));
                continue;
            }
            if stage < ctx.start_stage {
                stages.push(StageReport::new(stage, StageStatus::Rediscovered));
                continue;
            }
            if !stage.included_in(ctx.pipeline) {
                obs::emit_stage_skipped(stage.name(), &format!("not part of {} pipeline", ctx.pipeline));
                stages.push(StageReport::new(stage, StageStatus::Skipped));
                continue;
            }

            let (report, error) = self.run_stage(ctx, &env, stage).await;
            stages.push(report);
            let Some(e) = error else { continue };

            let count = ctx.record_error();
            if self.config.is_best_effort(stage) {
                obs::emit_stage_error_counted(stage.name(), &e, count);
            } else {
                error!(stage = %stage, error = %e, exit_code = e.exit_code(), "stage failed");
                failure = Some(e);
            }
        }

        let finished = if failure.is_some() {
            ctx.fail()
        } else {
            ctx.complete()
        };
        if let Err(e) = finished {
            error!(error = %e, "run state transition rejected");
        }

        let duration_ms = started.elapsed().as_millis() as u64;
        obs::emit_run_finished(&run_id, duration_ms, ctx.error_count(), ctx.success());
        RunOutcome {
            run_id: ctx.run_id,
            subject: ctx.subject.clone(),
            state: ctx.state(),
            error_count: ctx.error_count(),
            duration_ms,
            stages,
            failure,
        }
    }

    /// Output root exists and, when resuming, earlier outputs are on disk.
    fn prepare(&self, ctx: &RunContext) -> Result<()> {
        std::fs::create_dir_all(&ctx.output_root).map_err(|e| match e.kind() {
            std::io::ErrorKind::PermissionDenied => BrainxError::Permission(ctx.output_root.clone()),
            _ => BrainxError::Io(e),
        })?;
        if ctx.start_stage > PipelineStage::Import {
            let found = rediscover(&ctx.output_root, ctx.start_stage, ctx.pipeline)?;
            info!(
                start_stage = %ctx.start_stage,
                prerequisites = found.len(),
                "resuming from earlier outputs"
            );
        }
        Ok(())
    }

    async fn run_stage(
        &self,
        ctx: &mut RunContext,
        env: &StageEnv,
        stage: PipelineStage,
    ) -> (StageReport, Option<BrainxError>) {
        let started = Instant::now();
        obs::emit_stage_started(stage.name(), stage.ordinal());

        let result = match ctx.begin(stage) {
            Ok(()) => self.execute(env, stage).await,
            Err(e) => Err(e),
        };

        let duration_ms = started.elapsed().as_millis() as u64;
        obs::emit_stage_finished(stage.name(), duration_ms, result.is_ok());

        let mut report = StageReport::new(stage, StageStatus::Succeeded);
        report.duration_ms = duration_ms;
        match result {
            Ok(output) => {
                report.artifacts = output.artifacts.len();
                (report, None)
            }
            Err(e) => {
                report.status = StageStatus::Failed;
                report.error = Some(e.to_string());
                (report, Some(e))
            }
        }
    }

    /// Stage body, then the validation gate over its outputs.
    async fn execute(&self, env: &StageEnv, stage: PipelineStage) -> Result<StageOutput> {
        let output = body_for(stage).run(env).await?;
        env.gate
            .validate_stage(env.root(), stage, &output.artifacts)
            .await?
            .into_result(stage)?;
        Ok(output)
    }
}
