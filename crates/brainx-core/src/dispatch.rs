//! Parallel dispatch of one operation over many inputs.
//!
//! Work runs on a bounded pool (semaphore-limited tokio tasks) or, when the
//! pool is unavailable or the degree is 1, strictly sequentially in input
//! order. Every input is attempted at most once and reported exactly once,
//! in input order, whatever order the workers finished in.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{instrument, warn};

use crate::domain::error::BrainxError;
use crate::obs;

/// What happens to the rest of a batch after one item fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HaltPolicy {
    /// No new item starts after a failure; running items finish.
    #[default]
    StopOnFirstFailure,
    /// Every item is attempted.
    BestEffort,
}

/// One operation over an ordered list of inputs.
#[derive(Debug, Clone)]
pub struct JobBatch<T> {
    pub operation: String,
    pub inputs: Vec<T>,
    pub degree: usize,
    pub halt: HaltPolicy,
    pub timeout: Option<Duration>,
}

impl<T> JobBatch<T> {
    pub fn new(operation: impl Into<String>, inputs: Vec<T>) -> Self {
        Self {
            operation: operation.into(),
            inputs,
            degree: 1,
            halt: HaltPolicy::default(),
            timeout: None,
        }
    }

    pub fn degree(mut self, degree: usize) -> Self {
        self.degree = degree;
        self
    }

    pub fn halt(mut self, halt: HaltPolicy) -> Self {
        self.halt = halt;
        self
    }

    /// `None` or zero means unbounded.
    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout.filter(|t| !t.is_zero());
        self
    }
}

/// Whether concurrent workers can be used on this host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerPool {
    available: bool,
    max_workers: usize,
}

impl WorkerPool {
    /// Usable when enabled, inside a tokio runtime, and the host has more
    /// than one core.
    pub fn detect(enabled: bool) -> Self {
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        let in_runtime = tokio::runtime::Handle::try_current().is_ok();
        Self {
            available: enabled && in_runtime && cores > 1,
            max_workers: cores,
        }
    }

    pub fn available(max_workers: usize) -> Self {
        Self {
            available: max_workers > 1,
            max_workers: max_workers.max(1),
        }
    }

    pub fn unavailable() -> Self {
        Self {
            available: false,
            max_workers: 1,
        }
    }

    pub fn is_available(&self) -> bool {
        self.available
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    /// Resolve a configured job count (0 = one per core).
    pub fn degree_for(&self, jobs: usize) -> usize {
        if !self.available {
            1
        } else if jobs == 0 {
            self.max_workers
        } else {
            jobs
        }
    }
}

#[derive(Debug)]
pub enum ItemStatus<R> {
    Succeeded(R),
    Failed(BrainxError),
    NotAttempted,
}

#[derive(Debug)]
pub struct ItemReport<T, R> {
    pub input: T,
    pub status: ItemStatus<R>,
}

/// Per-item outcomes in input order.
#[derive(Debug)]
pub struct BatchReport<T, R> {
    pub operation: String,
    pub items: Vec<ItemReport<T, R>>,
    pub parallel: bool,
}

impl<T, R> BatchReport<T, R> {
    pub fn succeeded(&self) -> usize {
        self.count(|s| matches!(s, ItemStatus::Succeeded(_)))
    }

    pub fn failed(&self) -> usize {
        self.count(|s| matches!(s, ItemStatus::Failed(_)))
    }

    pub fn not_attempted(&self) -> usize {
        self.count(|s| matches!(s, ItemStatus::NotAttempted))
    }

    pub fn is_success(&self) -> bool {
        self.succeeded() == self.items.len()
    }

    fn count(&self, pred: impl Fn(&ItemStatus<R>) -> bool) -> usize {
        self.items.iter().filter(|i| pred(&i.status)).count()
    }

    /// All results, or the first failure in input order.
    pub fn into_result(self) -> Result<Vec<R>, BrainxError> {
        let mut out = Vec::with_capacity(self.items.len());
        let mut first_failure = None;
        let mut skipped = 0;
        for item in self.items {
            match item.status {
                ItemStatus::Succeeded(r) => out.push(r),
                ItemStatus::Failed(e) => {
                    if first_failure.is_none() {
                        first_failure = Some(e);
                    }
                }
                ItemStatus::NotAttempted => skipped += 1,
            }
        }
        match first_failure {
            Some(e) => Err(e),
            None if skipped > 0 => Err(BrainxError::Io(std::io::Error::other(format!(
                "{}: {skipped} items not attempted",
                self.operation
            )))),
            None => Ok(out),
        }
    }

    /// Successes plus the failures, for best-effort callers.
    pub fn partition(self) -> (Vec<R>, Vec<(T, BrainxError)>) {
        let mut ok = Vec::new();
        let mut failed = Vec::new();
        for item in self.items {
            match item.status {
                ItemStatus::Succeeded(r) => ok.push(r),
                ItemStatus::Failed(e) => failed.push((item.input, e)),
                ItemStatus::NotAttempted => {}
            }
        }
        (ok, failed)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("batch {operation} timed out after {secs}s")]
    TimedOut { operation: String, secs: u64 },
}

impl From<DispatchError> for BrainxError {
    fn from(err: DispatchError) -> Self {
        match err {
            DispatchError::TimedOut { operation, secs } => BrainxError::Timeout { operation, secs },
        }
    }
}

type Slots<R> = Vec<Option<ItemStatus<R>>>;

/// Run `op` over every input of `batch`.
///
/// Item failures are reported in the [`BatchReport`]; only a batch timeout
/// is an `Err`. On timeout in-flight workers are aborted, which drops (and
/// so kills) any child process they were waiting on.
#[instrument(skip_all, fields(operation = %batch.operation, items = batch.inputs.len()))]
pub async fn dispatch<T, R, F, Fut>(
    batch: JobBatch<T>,
    pool: &WorkerPool,
    op: F,
) -> Result<BatchReport<T, R>, DispatchError>
where
    T: Clone + Send + Sync + 'static,
    R: Send + 'static,
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R, BrainxError>> + Send + 'static,
{
    let parallel = pool.is_available() && batch.degree > 1 && batch.inputs.len() > 1;
    let op = Arc::new(op);
    let mut slots: Slots<R> = batch.inputs.iter().map(|_| None).collect();

    let finished = if parallel {
        run_parallel(&batch, op, &mut slots).await
    } else {
        run_sequential(&batch, op, &mut slots).await
    };

    if !finished {
        let secs = batch.timeout.map_or(0, |t| t.as_secs());
        warn!(operation = %batch.operation, secs, "batch timed out");
        return Err(DispatchError::TimedOut {
            operation: batch.operation,
            secs,
        });
    }

    let items: Vec<ItemReport<T, R>> = batch
        .inputs
        .into_iter()
        .zip(slots)
        .map(|(input, slot)| ItemReport {
            input,
            status: slot.unwrap_or_else(|| {
                ItemStatus::Failed(BrainxError::Io(std::io::Error::other(
                    "worker terminated without reporting",
                )))
            }),
        })
        .collect();

    let report = BatchReport {
        operation: batch.operation,
        items,
        parallel,
    };
    obs::emit_batch_finished(
        &report.operation,
        report.succeeded(),
        report.failed(),
        report.not_attempted(),
        parallel,
    );
    Ok(report)
}

/// Returns `false` when the batch timeout fired.
async fn run_sequential<T, R, F, Fut>(batch: &JobBatch<T>, op: Arc<F>, slots: &mut Slots<R>) -> bool
where
    T: Clone,
    F: Fn(T) -> Fut,
    Fut: Future<Output = Result<R, BrainxError>>,
{
    let halt = batch.halt;
    let work = async {
        let mut halted = false;
        for (idx, input) in batch.inputs.iter().enumerate() {
            if halted {
                slots[idx] = Some(ItemStatus::NotAttempted);
                continue;
            }
            slots[idx] = Some(match op(input.clone()).await {
                Ok(r) => ItemStatus::Succeeded(r),
                Err(e) => {
                    halted = halt == HaltPolicy::StopOnFirstFailure;
                    ItemStatus::Failed(e)
                }
            });
        }
    };

    match batch.timeout {
        Some(limit) => tokio::time::timeout(limit, work).await.is_ok(),
        None => {
            work.await;
            true
        }
    }
}

async fn run_parallel<T, R, F, Fut>(batch: &JobBatch<T>, op: Arc<F>, slots: &mut Slots<R>) -> bool
where
    T: Clone + Send + Sync + 'static,
    R: Send + 'static,
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R, BrainxError>> + Send + 'static,
{
    let semaphore = Arc::new(Semaphore::new(batch.degree));
    let halted = Arc::new(AtomicBool::new(false));
    let stop_on_failure = batch.halt == HaltPolicy::StopOnFirstFailure;
    let mut set = JoinSet::new();

    for (idx, input) in batch.inputs.iter().cloned().enumerate() {
        let semaphore = Arc::clone(&semaphore);
        let halted = Arc::clone(&halted);
        let op = Arc::clone(&op);
        set.spawn(async move {
            let _permit = semaphore.acquire_owned().await.ok();
            if stop_on_failure && halted.load(Ordering::SeqCst) {
                return (idx, ItemStatus::NotAttempted);
            }
            match op(input).await {
                Ok(r) => (idx, ItemStatus::Succeeded(r)),
                Err(e) => {
                    if stop_on_failure {
                        halted.store(true, Ordering::SeqCst);
                    }
                    (idx, ItemStatus::Failed(e))
                }
            }
        });
    }

    let drain = async {
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((idx, status)) => slots[idx] = Some(status),
                Err(e) => warn!(error = %e, "dispatch worker panicked or was cancelled"),
            }
        }
    };

    let finished = match batch.timeout {
        Some(limit) => tokio::time::timeout(limit, drain).await.is_ok(),
        None => {
            drain.await;
            true
        }
    };

    if !finished {
        set.abort_all();
        while set.join_next().await.is_some() {}
    }
    finished
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_degree_resolution() {
        assert_eq!(WorkerPool::unavailable().degree_for(8), 1);
        assert_eq!(WorkerPool::available(4).degree_for(0), 4);
        assert_eq!(WorkerPool::available(4).degree_for(2), 2);
        assert!(!WorkerPool::available(1).is_available());
    }

    #[test]
    fn test_zero_timeout_means_unbounded() {
        let batch = JobBatch::new("n4", vec![1]).timeout(Some(Duration::ZERO));
        assert!(batch.timeout.is_none());
    }

    #[tokio::test]
    async fn test_sequential_preserves_order() {
        let batch = JobBatch::new("double", vec![3, 1, 2]);
        let report = dispatch(batch, &WorkerPool::unavailable(), |x: i32| async move {
            Ok::<_, BrainxError>(x * 2)
        })
        .await
        .unwrap();
        assert!(!report.parallel);
        assert_eq!(report.into_result().unwrap(), vec![6, 2, 4]);
    }
}
