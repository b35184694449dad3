//! Batch halt semantics and timeouts of the dispatch framework.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use brainx_core::{dispatch, BrainxError, DispatchError, HaltPolicy, ItemStatus, JobBatch, WorkerPool};

fn injected(i: usize) -> BrainxError {
    BrainxError::DataCorrupt(format!("item {i}"))
}

#[tokio::test]
async fn test_sequential_stop_on_first_failure() {
    let batch = JobBatch::new("n4", vec![0usize, 1, 2, 3]);
    let report = dispatch(batch, &WorkerPool::unavailable(), |i: usize| async move {
        if i == 1 {
            Err(injected(i))
        } else {
            Ok(i * 10)
        }
    })
    .await
    .unwrap();

    assert!(!report.parallel);
    assert!(matches!(report.items[0].status, ItemStatus::Succeeded(0)));
    assert!(matches!(report.items[1].status, ItemStatus::Failed(_)));
    assert!(matches!(report.items[2].status, ItemStatus::NotAttempted));
    assert!(matches!(report.items[3].status, ItemStatus::NotAttempted));
    assert!(matches!(report.into_result(), Err(BrainxError::DataCorrupt(_))));
}

#[tokio::test]
async fn test_sequential_best_effort_attempts_everything() {
    let batch = JobBatch::new("n4", vec![0usize, 1, 2, 3]).halt(HaltPolicy::BestEffort);
    let report = dispatch(batch, &WorkerPool::unavailable(), |i: usize| async move {
        if i % 2 == 1 {
            Err(injected(i))
        } else {
            Ok(i)
        }
    })
    .await
    .unwrap();

    assert_eq!(report.succeeded(), 2);
    assert_eq!(report.failed(), 2);
    assert_eq!(report.not_attempted(), 0);
    let (ok, failed) = report.partition();
    assert_eq!(ok, vec![0, 2]);
    assert_eq!(failed.iter().map(|(i, _)| *i).collect::<Vec<_>>(), vec![1, 3]);
}

#[tokio::test]
async fn test_parallel_stop_on_first_failure_skips_unstarted() {
    let batch = JobBatch::new("bet", (0usize..6).collect()).degree(2);
    let report = dispatch(batch, &WorkerPool::available(4), |i: usize| async move {
        if i == 0 {
            return Err(injected(i));
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        Ok(i)
    })
    .await
    .unwrap();

    assert!(report.parallel);
    assert_eq!(report.items.len(), 6);
    assert_eq!(report.failed(), 1);
    assert!(report.not_attempted() >= 1);
    assert_eq!(report.succeeded() + report.failed() + report.not_attempted(), 6);
    assert!(!report.is_success());
}

#[tokio::test]
async fn test_parallel_best_effort_reports_in_input_order() {
    let batch = JobBatch::new("bet", (0usize..8).collect())
        .degree(3)
        .halt(HaltPolicy::BestEffort);
    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let (r, p) = (running.clone(), peak.clone());
    let report = dispatch(batch, &WorkerPool::available(4), move |i: usize| {
        let (running, peak) = (r.clone(), p.clone());
        async move {
            let now = running.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            // later items finish first
            tokio::time::sleep(Duration::from_millis(40 - 4 * i as u64)).await;
            running.fetch_sub(1, Ordering::SeqCst);
            if i == 5 {
                Err(injected(i))
            } else {
                Ok(i)
            }
        }
    })
    .await
    .unwrap();

    let inputs: Vec<usize> = report.items.iter().map(|item| item.input).collect();
    assert_eq!(inputs, (0..8).collect::<Vec<_>>());
    assert_eq!(report.succeeded(), 7);
    assert_eq!(report.failed(), 1);
    let peak = peak.load(Ordering::SeqCst);
    assert!(peak > 1 && peak <= 3, "peak concurrency {peak}");
}

#[tokio::test(start_paused = true)]
async fn test_batch_timeout_aborts_workers() {
    let batch = JobBatch::new("registration", vec![1usize, 2, 3])
        .degree(3)
        .timeout(Some(Duration::from_secs(5)));
    let err = dispatch(batch, &WorkerPool::available(4), |i: usize| async move {
        tokio::time::sleep(Duration::from_secs(60)).await;
        Ok(i)
    })
    .await
    .unwrap_err();

    assert!(matches!(err, DispatchError::TimedOut { secs: 5, .. }));
    let err: BrainxError = err.into();
    assert_eq!(err.exit_code(), 6);
}

#[tokio::test(start_paused = true)]
async fn test_sequential_timeout() {
    let batch = JobBatch::new("n4", vec![1usize, 2]).timeout(Some(Duration::from_secs(1)));
    let result = dispatch(batch, &WorkerPool::unavailable(), |i: usize| async move {
        tokio::time::sleep(Duration::from_secs(2)).await;
        Ok(i)
    })
    .await;
    assert!(matches!(result, Err(DispatchError::TimedOut { .. })));
}
