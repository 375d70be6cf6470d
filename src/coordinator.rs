use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::domain::{AnnotationRecord, FailureReason, FetchOutcome};
use crate::error::KiraError;
use crate::retry::RetryPolicy;

pub const DEFAULT_WORKERS: usize = 4;

/// Run-level cancellation flag. Workers stop taking new items once it is set;
/// items already in flight run to completion or time out.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    pub succeeded: usize,
    pub failed: usize,
    pub cancelled: usize,
}

#[derive(Debug, Clone)]
pub struct Coordinator {
    workers: usize,
    item_timeout: Option<Duration>,
    item_retry: RetryPolicy,
    cancel: CancelToken,
}

impl Default for Coordinator {
    fn default() -> Self {
        Self::new(DEFAULT_WORKERS)
    }
}

impl Coordinator {
    pub fn new(workers: usize) -> Self {
        Self {
            workers: workers.max(1),
            item_timeout: None,
            item_retry: RetryPolicy::single_attempt(),
            cancel: CancelToken::new(),
        }
    }

    pub fn with_item_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.item_timeout = timeout;
        self
    }

    /// Whole-item retry, applied to `network` and `timeout` failures only.
    pub fn with_item_retry(mut self, retry: RetryPolicy) -> Self {
        self.item_retry = retry;
        self
    }

    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// Runs `fetch` over `records` with at most `workers` calls in flight and
    /// hands every outcome to `on_outcome` on the calling thread, in the order
    /// of `records`. An error from `on_outcome` stops the batch: no new items
    /// are started, in-flight ones drain, and the error is returned.
    pub fn run<T, F, W>(
        &self,
        records: &[AnnotationRecord],
        fetch: F,
        mut on_outcome: W,
    ) -> Result<BatchReport, KiraError>
    where
        T: Send + 'static,
        F: Fn(&AnnotationRecord) -> FetchOutcome<T> + Send + Sync + 'static,
        W: FnMut(usize, &AnnotationRecord, FetchOutcome<T>) -> Result<(), KiraError>,
    {
        let mut report = BatchReport::default();
        if records.is_empty() {
            return Ok(report);
        }

        let fetch = Arc::new(fetch);
        let cursor = AtomicUsize::new(0);
        let stop = AtomicBool::new(false);
        let workers = self.workers.min(records.len());
        let (tx, rx) = mpsc::channel::<(usize, FetchOutcome<T>)>();
        let mut write_error = None;

        thread::scope(|scope| {
            for worker in 0..workers {
                let tx = tx.clone();
                let fetch = Arc::clone(&fetch);
                let cursor = &cursor;
                let stop = &stop;
                scope.spawn(move || {
                    loop {
                        if stop.load(Ordering::SeqCst) || self.cancel.is_cancelled() {
                            break;
                        }
                        let index = cursor.fetch_add(1, Ordering::SeqCst);
                        let Some(record) = records.get(index) else {
                            break;
                        };
                        debug!(worker, index, key = %record.key(), "fetch started");
                        let outcome = self.fetch_item(&fetch, record);
                        if tx.send((index, outcome)).is_err() {
                            break;
                        }
                    }
                });
            }
            drop(tx);

            // Outcomes arrive in completion order; release them in input order.
            let mut pending = BTreeMap::new();
            let mut next = 0usize;
            for (index, outcome) in rx {
                pending.insert(index, outcome);
                while let Some(outcome) = pending.remove(&next) {
                    if write_error.is_none() {
                        let success = outcome.is_success();
                        match on_outcome(next, &records[next], outcome) {
                            Ok(()) if success => report.succeeded += 1,
                            Ok(()) => report.failed += 1,
                            Err(err) => {
                                warn!(index = next, error = %err, "stopping batch after write failure");
                                stop.store(true, Ordering::SeqCst);
                                write_error = Some(err);
                            }
                        }
                    }
                    next += 1;
                }
            }
        });

        let started = cursor.load(Ordering::SeqCst).min(records.len());
        report.cancelled = records.len() - started;
        if let Some(err) = write_error {
            return Err(err);
        }
        info!(
            succeeded = report.succeeded,
            failed = report.failed,
            cancelled = report.cancelled,
            "batch finished"
        );
        Ok(report)
    }

    fn fetch_item<T, F>(&self, fetch: &Arc<F>, record: &AnnotationRecord) -> FetchOutcome<T>
    where
        T: Send + 'static,
        F: Fn(&AnnotationRecord) -> FetchOutcome<T> + Send + Sync + 'static,
    {
        let attempt = self.item_retry.run_when(
            |_| {
                let outcome = self.fetch_once(fetch, record);
                match outcome.failure_reason() {
                    Some(reason) if reason.is_transient() => Err(outcome),
                    _ => Ok(outcome),
                }
            },
            |_| true,
        );
        match attempt {
            Ok(outcome) => outcome,
            Err(exhausted) => exhausted.last_error,
        }
    }

    fn fetch_once<T, F>(&self, fetch: &Arc<F>, record: &AnnotationRecord) -> FetchOutcome<T>
    where
        T: Send + 'static,
        F: Fn(&AnnotationRecord) -> FetchOutcome<T> + Send + Sync + 'static,
    {
        let Some(limit) = self.item_timeout else {
            return guarded(fetch.as_ref(), record);
        };

        let (tx, rx) = mpsc::channel();
        let task = Arc::clone(fetch);
        let owned = record.clone();
        let spawned = thread::Builder::new()
            .name("kira-rdb-fetch".to_string())
            .spawn(move || {
                let _ = tx.send(guarded(task.as_ref(), &owned));
            });
        if let Err(err) = spawned {
            warn!(error = %err, "could not spawn fetch thread; running inline");
            return guarded(fetch.as_ref(), record);
        }

        // A timed-out fetch keeps running detached; its late result is dropped.
        match rx.recv_timeout(limit) {
            Ok(outcome) => outcome,
            Err(RecvTimeoutError::Timeout) => FetchOutcome::failure(
                record.key(),
                FailureReason::Timeout,
                format!("no response within {}s", limit.as_secs_f64()),
            ),
            Err(RecvTimeoutError::Disconnected) => FetchOutcome::failure(
                record.key(),
                FailureReason::Network,
                "fetch thread exited without a result",
            ),
        }
    }
}

fn guarded<T, F>(fetch: &F, record: &AnnotationRecord) -> FetchOutcome<T>
where
    F: Fn(&AnnotationRecord) -> FetchOutcome<T>,
{
    panic::catch_unwind(AssertUnwindSafe(|| fetch(record))).unwrap_or_else(|_| {
        FetchOutcome::failure(record.key(), FailureReason::Network, "fetch panicked")
    })
}
