//! Lifecycle events carry the fields log consumers filter on.

use brainx_core::obs;
use tracing_test::traced_test;

#[traced_test]
#[test]
fn test_run_lifecycle_events_are_tagged() {
    let span = obs::run_span("run-1", "sub01");
    let _entered = span.enter();
    obs::emit_run_started("run-1", "sub01", "FULL", "import");
    obs::emit_stage_started("import", 1);
    obs::emit_stage_finished("import", 12, true);
    obs::emit_run_finished("run-1", 40, 0, true);

    assert!(logs_contain("subject=sub01"));
    assert!(logs_contain("run_id=run-1"));
    assert!(logs_contain("success=true"));
    logs_assert(|lines: &[&str]| {
        let tags = ["run.started", "stage.started", "stage.finished", "run.finished"];
        let positions: Vec<Option<usize>> = tags
            .iter()
            .map(|tag| lines.iter().position(|l| l.contains(tag)))
            .collect();
        if positions.iter().any(Option::is_none) {
            return Err(format!("missing lifecycle events: {positions:?}"));
        }
        if positions.windows(2).all(|w| w[0] < w[1]) {
            Ok(())
        } else {
            Err(format!("out of order: {positions:?}"))
        }
    });
}

#[traced_test]
#[test]
fn test_counted_stage_error_is_a_warning() {
    obs::emit_stage_error_counted("visualization", &"renderer crashed", 1);

    assert!(logs_contain("renderer crashed"));
    assert!(logs_contain("error_count=1"));
    logs_assert(|lines: &[&str]| {
        match lines
            .iter()
            .filter(|l| l.contains("stage.error_counted"))
            .collect::<Vec<_>>()[..]
        {
            [line] if line.contains("WARN") => Ok(()),
            ref other => Err(format!("expected one WARN line, got {other:?}")),
        }
    });
}

#[traced_test]
#[test]
fn test_batch_summary_counts() {
    obs::emit_batch_finished("registration", 2, 1, 3, true);

    assert!(logs_contain("batch.finished"));
    assert!(logs_contain("succeeded=2"));
    assert!(logs_contain("failed=1"));
    assert!(logs_contain("not_attempted=3"));
}
