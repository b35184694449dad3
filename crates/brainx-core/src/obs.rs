//! Structured lifecycle events for pipeline runs.
//!
//! Every event carries an `event` field (`run.started`, `stage.finished`, ...)
//! so JSON log consumers can filter on it. Verbosity follows `RUST_LOG`, or
//! the level passed to [`crate::telemetry::init_tracing`].

use tracing::{info, warn};

/// Span carrying `run_id` and `subject`, attached to a run's future.
///
/// ```ignore
/// orchestrator.run(&mut ctx).instrument(obs::run_span(&run_id, &subject)).await
/// ```
pub fn run_span(run_id: &str, subject: &str) -> tracing::Span {
    tracing::info_span!("brainx.run", run_id = %run_id, subject = %subject)
}

pub fn emit_run_started(run_id: &str, subject: &str, pipeline: &str, start_stage: &str) {
    info!(
        event = "run.started",
        run_id = %run_id,
        subject = %subject,
        pipeline = %pipeline,
        start_stage = %start_stage,
    );
}

pub fn emit_stage_started(stage: &str, ordinal: u8) {
    info!(event = "stage.started", stage = %stage, ordinal);
}

pub fn emit_stage_finished(stage: &str, duration_ms: u64, success: bool) {
    info!(event = "stage.finished", stage = %stage, duration_ms, success);
}

/// A resumed run found an earlier stage's output on disk.
pub fn emit_stage_rediscovered(stage: &str, artifact: &str) {
    info!(event = "stage.rediscovered", stage = %stage, artifact = %artifact);
}

pub fn emit_stage_skipped(stage: &str, reason: &str) {
    info!(event = "stage.skipped", stage = %stage, reason = %reason);
}

/// A best-effort stage failed; the run continues.
pub fn emit_stage_error_counted(stage: &str, error: &dyn std::fmt::Display, error_count: u32) {
    warn!(event = "stage.error_counted", stage = %stage, error = %error, error_count);
}

pub fn emit_batch_finished(
    operation: &str,
    succeeded: usize,
    failed: usize,
    not_attempted: usize,
    parallel: bool,
) {
    info!(
        event = "batch.finished",
        operation = %operation,
        succeeded,
        failed,
        not_attempted,
        parallel,
    );
}

pub fn emit_reference_decided(modality: &str, file: &str, strategy: &str, rationale: &str) {
    info!(
        event = "reference.decided",
        modality = %modality,
        file = %file,
        strategy = %strategy,
        rationale = %rationale,
    );
}

pub fn emit_run_finished(run_id: &str, duration_ms: u64, error_count: u32, success: bool) {
    info!(
        event = "run.finished",
        run_id = %run_id,
        duration_ms,
        error_count,
        success,
    );
}
