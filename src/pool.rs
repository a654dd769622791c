//! Bounded, work-conserving executor for submitted jobs.
//!
//! `submit` never blocks: it appends to an unbounded FIFO queue and returns.
//! A dispatch pass runs right after every submit and right after every worker
//! finish, so a freed slot picks up queued work immediately instead of
//! waiting for a polling tick. At most `max_workers` job bodies run at once;
//! a body's failure (or panic) is contained to its own job and recorded in
//! the store, never propagated to the submitter.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::error::{Error, Result};
use crate::store::{JobStore, JobStatus};

/// The pluggable job body: invoked by exactly one worker, reports progress
/// zero or more times with non-decreasing values in `[0, 1]`, and returns
/// either the path of the produced artifact or an error.
pub type JobBody =
    Box<dyn FnOnce(ProgressReporter) -> BoxFuture<'static, Result<PathBuf>> + Send>;

/// Caller-supplied cleanup for a job's private working files. Runs after the
/// body regardless of outcome, and for queued jobs cancelled at shutdown.
pub type CleanupFn = Box<dyn FnOnce() + Send>;

/// Handed to the job body; forwards progress into the job store. Store
/// failures are logged, not surfaced, since a job may legitimately outlive
/// its record (reclaimed mid-flight).
#[derive(Clone)]
pub struct ProgressReporter {
    store: JobStore,
    job_id: String,
}

impl ProgressReporter {
    pub fn new(store: JobStore, job_id: impl Into<String>) -> Self {
        Self {
            store,
            job_id: job_id.into(),
        }
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub async fn report(&self, progress: f64) {
        match self
            .store
            .update_status(&self.job_id, JobStatus::Processing, Some(progress), None, None)
            .await
        {
            Ok(_) => {}
            Err(Error::JobNotFound(_)) => {
                tracing::debug!(job_id = %self.job_id, "Progress update for reclaimed job dropped");
            }
            Err(err) => {
                tracing::warn!(job_id = %self.job_id, error = %err, "Progress update failed");
            }
        }
    }
}

struct QueuedJob {
    job_id: String,
    body: JobBody,
    cleanup: Option<CleanupFn>,
}

struct PoolState {
    queue: VecDeque<QueuedJob>,
    active_workers: usize,
    shutting_down: bool,
}

/// Point-in-time pool snapshot; both counters are read under one lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    pub queue_size: usize,
    pub active_workers: usize,
    pub max_workers: usize,
    pub available_workers: usize,
}

struct PoolInner {
    state: Mutex<PoolState>,
    max_workers: usize,
    store: JobStore,
    worker_done: Notify,
}

/// Cloneable handle to the worker pool; all clones share one queue.
#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

impl WorkerPool {
    pub fn new(store: JobStore, max_workers: usize) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                state: Mutex::new(PoolState {
                    queue: VecDeque::new(),
                    active_workers: 0,
                    shutting_down: false,
                }),
                max_workers: max_workers.max(1),
                store,
                worker_done: Notify::new(),
            }),
        }
    }

    /// Enqueue a job for execution and return immediately, even when every
    /// worker slot is busy. The job must already exist in the store.
    pub fn submit(&self, job_id: impl Into<String>, body: JobBody) -> String {
        self.submit_with_cleanup(job_id, body, None)
    }

    pub fn submit_with_cleanup(
        &self,
        job_id: impl Into<String>,
        body: JobBody,
        cleanup: Option<CleanupFn>,
    ) -> String {
        let job_id = job_id.into();
        let rejected = {
            let mut state = self.inner.state.lock();
            if state.shutting_down {
                true
            } else {
                state.queue.push_back(QueuedJob {
                    job_id: job_id.clone(),
                    body,
                    cleanup,
                });
                false
            }
        };

        if rejected {
            tracing::warn!(job_id = %job_id, "Submit during shutdown, cancelling job");
            let store = self.inner.store.clone();
            let id = job_id.clone();
            tokio::spawn(async move {
                if let Err(err) = store
                    .update_status(&id, JobStatus::Cancelled, None, Some("shutdown"), None)
                    .await
                {
                    tracing::warn!(job_id = %id, error = %err, "Failed to cancel job");
                }
            });
            return job_id;
        }

        self.dispatch();
        job_id
    }

    /// Work-conserving dispatch: start queued jobs while a worker slot is
    /// free. Runs after every submit and after every worker finish.
    fn dispatch(&self) {
        loop {
            let job = {
                let mut state = self.inner.state.lock();
                if state.shutting_down || state.active_workers >= self.inner.max_workers {
                    return;
                }
                match state.queue.pop_front() {
                    Some(job) => {
                        state.active_workers += 1;
                        job
                    }
                    None => return,
                }
            };
            let pool = self.clone();
            tokio::spawn(async move {
                pool.run_worker(job).await;
            });
        }
    }

    async fn run_worker(&self, job: QueuedJob) {
        let QueuedJob {
            job_id,
            body,
            cleanup,
        } = job;

        self.execute(&job_id, body).await;

        if let Some(cleanup) = cleanup {
            cleanup();
        }

        {
            let mut state = self.inner.state.lock();
            state.active_workers -= 1;
        }
        self.inner.worker_done.notify_waiters();
        self.dispatch();
    }

    async fn execute(&self, job_id: &str, body: JobBody) {
        let store = &self.inner.store;

        match store
            .update_status(job_id, JobStatus::Processing, Some(0.0), None, None)
            .await
        {
            Ok(_) => {}
            Err(Error::JobNotFound(_)) => {
                // Reclaimed between dispatch and start; nothing to run against.
                tracing::debug!(job_id, "Job record gone before start, skipping");
                return;
            }
            Err(err) => {
                tracing::error!(job_id, error = %err, "Failed to mark job processing");
                self.record_failure(job_id, "internal error: job store unavailable")
                    .await;
                return;
            }
        }

        tracing::info!(job_id, "Job started");
        let reporter = ProgressReporter::new(store.clone(), job_id);

        // The body runs in its own task so a panic inside an opaque external
        // call is contained and recorded like any other failure.
        let outcome = match tokio::spawn(body(reporter)).await {
            Ok(result) => result,
            Err(join_err) => Err(Error::Execution(format!("job body panicked: {join_err}"))),
        };

        match outcome {
            Ok(result_path) => {
                tracing::info!(job_id, result_path = %result_path.display(), "Job completed");
                let result_path = result_path.to_string_lossy().into_owned();
                if let Err(err) = store
                    .update_status(
                        job_id,
                        JobStatus::Completed,
                        Some(1.0),
                        None,
                        Some(&result_path),
                    )
                    .await
                {
                    tracing::warn!(job_id, error = %err, "Failed to record job completion");
                }
            }
            Err(err) => {
                tracing::warn!(job_id, error = %err, "Job failed");
                self.record_failure(job_id, &err.to_string()).await;
            }
        }
    }

    async fn record_failure(&self, job_id: &str, message: &str) {
        if let Err(err) = self
            .inner
            .store
            .update_status(job_id, JobStatus::Failed, None, Some(message), None)
            .await
        {
            tracing::warn!(job_id, error = %err, "Failed to record job failure");
        }
    }

    pub fn status(&self) -> PoolStatus {
        let state = self.inner.state.lock();
        PoolStatus {
            queue_size: state.queue.len(),
            active_workers: state.active_workers,
            max_workers: self.inner.max_workers,
            available_workers: self.inner.max_workers - state.active_workers,
        }
    }

    /// Stop admitting dispatches, wait up to `timeout` for active workers to
    /// finish naturally, then cancel every job still queued (never started)
    /// with a "shutdown" reason. Returns the number of jobs cancelled.
    ///
    /// Workers that outlive the timeout are abandoned; their eventual store
    /// updates may arrive late or not at all.
    pub async fn shutdown(&self, timeout: Duration) -> usize {
        {
            let mut state = self.inner.state.lock();
            state.shutting_down = true;
        }

        let deadline = Instant::now() + timeout;
        loop {
            if self.inner.state.lock().active_workers == 0 {
                break;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                let active = self.inner.state.lock().active_workers;
                tracing::warn!(active, "Shutdown timeout reached, abandoning active workers");
                break;
            }
            let _ = tokio::time::timeout(remaining, self.inner.worker_done.notified()).await;
        }

        let drained: Vec<QueuedJob> = {
            let mut state = self.inner.state.lock();
            state.queue.drain(..).collect()
        };
        let cancelled = drained.len();
        for job in drained {
            tracing::info!(job_id = %job.job_id, "Cancelling queued job at shutdown");
            if let Err(err) = self
                .inner
                .store
                .update_status(&job.job_id, JobStatus::Cancelled, None, Some("shutdown"), None)
                .await
            {
                tracing::warn!(job_id = %job.job_id, error = %err, "Failed to cancel queued job");
            }
            if let Some(cleanup) = job.cleanup {
                cleanup();
            }
        }
        if cancelled > 0 {
            tracing::info!(cancelled, "Cancelled queued jobs at shutdown");
        }
        cancelled
    }
}
