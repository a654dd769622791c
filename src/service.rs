//! Composition root: constructs every component once, wires them together
//! explicitly, and exposes the narrow surface the ingress and operator
//! tooling are allowed to touch. No process-wide singletons.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use uuid::Uuid;

use crate::cache::Cache;
use crate::config::Config;
use crate::error::Result;
use crate::pipeline::{GenerationRequest, Pipeline};
use crate::pool::{CleanupFn, JobBody, PoolStatus, WorkerPool};
use crate::ratelimit::RateLimiter;
use crate::reclaimer::{Reclaimer, ReclaimerHandle};
use crate::store::{Job, JobStatus, JobStore};

/// Outcome of an admission check. A rejected caller gets an explicit retry
/// hint rather than a bare refusal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Granted,
    Limited { retry_after: Duration },
}

pub struct Service {
    config: Config,
    store: JobStore,
    pool: WorkerPool,
    limiter: Arc<RateLimiter>,
    cache: Arc<Cache>,
    pipeline: Pipeline,
    reclaimer: Mutex<Option<ReclaimerHandle>>,
}

impl Service {
    /// Construct every component from the configuration. Nothing starts
    /// running in the background until [`Service::start`].
    pub async fn new(config: Config) -> Result<Self> {
        let store = JobStore::new(&config.store.db_path).await?;
        let pool = WorkerPool::new(store.clone(), config.pool.max_workers);
        let limiter = Arc::new(RateLimiter::new(&config.rate_limit));
        let cache = Arc::new(Cache::new(&config.cache).await?);
        let pipeline = Pipeline::new(config.pipeline.clone());
        Ok(Self {
            config,
            store,
            pool,
            limiter,
            cache,
            pipeline,
            reclaimer: Mutex::new(None),
        })
    }

    /// Spawn the periodic reclaimer. Idempotent.
    pub fn start(&self) {
        let mut handle = self.reclaimer.lock();
        if handle.is_none() {
            let reclaimer = Reclaimer::new(
                self.store.clone(),
                self.limiter.clone(),
                self.cache.clone(),
                self.config.reclaimer.clone(),
            );
            *handle = Some(reclaimer.start());
            tracing::info!(
                interval_secs = self.config.reclaimer.interval.as_secs(),
                "Reclaimer started"
            );
        }
    }

    /// Admission check for the ingress path, one call per inbound request.
    pub fn admit(&self, client_key: &str) -> Admission {
        if self.limiter.allow(client_key) {
            Admission::Granted
        } else {
            Admission::Limited {
                retry_after: self.limiter.retry_after(client_key),
            }
        }
    }

    /// Accept a generation request: create the job record, enqueue the
    /// pipeline body, and return the job id immediately. Completion is
    /// observed by polling [`Service::job`].
    pub async fn submit_generation(&self, request: GenerationRequest) -> Result<String> {
        let job_id = Uuid::new_v4().to_string();
        self.store.create(&job_id, request.metadata()).await?;
        let body = self.pipeline.job_body(request);
        let cleanup = self.pipeline.cleanup_for(&job_id);
        self.pool.submit_with_cleanup(&job_id, body, Some(cleanup));
        Ok(job_id)
    }

    /// Accept an arbitrary job body under a generated id.
    pub async fn submit(
        &self,
        metadata: HashMap<String, String>,
        body: JobBody,
    ) -> Result<String> {
        let job_id = Uuid::new_v4().to_string();
        self.submit_with_id(&job_id, metadata, body, None).await?;
        Ok(job_id)
    }

    /// Accept a job body under a caller-supplied id. Fails with
    /// [`crate::Error::DuplicateJob`] if the id is taken.
    pub async fn submit_with_id(
        &self,
        job_id: &str,
        metadata: HashMap<String, String>,
        body: JobBody,
        cleanup: Option<CleanupFn>,
    ) -> Result<()> {
        self.store.create(job_id, metadata).await?;
        self.pool.submit_with_cleanup(job_id, body, cleanup);
        Ok(())
    }

    /// Read-only job lookup for status polling.
    pub async fn job(&self, job_id: &str) -> Result<Job> {
        self.store.get(job_id).await
    }

    /// Read-only job listing, most recent first.
    pub async fn jobs(&self, status: Option<JobStatus>, limit: u32) -> Result<Vec<Job>> {
        self.store.list(status, limit).await
    }

    pub fn pool_status(&self) -> PoolStatus {
        self.pool.status()
    }

    pub fn cache(&self) -> &Cache {
        &self.cache
    }

    // Operator surface: manual maintenance outside the reclaimer's schedule.

    pub async fn purge_jobs(&self, older_than: Duration) -> Result<u64> {
        self.store.delete_older_than(older_than).await
    }

    pub fn purge_buckets(&self, older_than: Duration) -> usize {
        self.limiter.cleanup_stale(older_than)
    }

    pub async fn clear_cache(&self) {
        self.cache.clear().await;
    }

    /// Graceful teardown: stop the reclaimer, then shut the pool down,
    /// cancelling whatever never started. Returns the cancelled count.
    pub async fn shutdown(&self, timeout: Duration) -> usize {
        let handle = self.reclaimer.lock().take();
        if let Some(handle) = handle {
            handle.stop().await;
        }
        let cancelled = self.pool.shutdown(timeout).await;
        tracing::info!(cancelled, "Service shut down");
        cancelled
    }
}
