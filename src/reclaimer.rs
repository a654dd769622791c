//! Periodic reclamation of expired jobs, stale rate-limit buckets, orphaned
//! temporary files and dead cache entries.
//!
//! One sweep runs immediately at start, then once per configured interval.
//! Each step is caught and logged on its own so one failing step never
//! prevents the others from running.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::cache::Cache;
use crate::config::ReclaimerConfig;
use crate::ratelimit::RateLimiter;
use crate::store::JobStore;

pub struct Reclaimer {
    store: JobStore,
    limiter: Arc<RateLimiter>,
    cache: Arc<Cache>,
    config: ReclaimerConfig,
}

/// Handle to a running reclaimer loop.
pub struct ReclaimerHandle {
    token: CancellationToken,
    task: JoinHandle<()>,
}

impl ReclaimerHandle {
    /// Ask the loop to exit at its next wake-up and wait briefly for the
    /// in-flight sweep to finish.
    pub async fn stop(self) {
        self.token.cancel();
        if tokio::time::timeout(Duration::from_secs(5), self.task)
            .await
            .is_err()
        {
            tracing::warn!("Reclaimer did not stop within 5s, abandoning");
        }
    }
}

impl Reclaimer {
    pub fn new(
        store: JobStore,
        limiter: Arc<RateLimiter>,
        cache: Arc<Cache>,
        config: ReclaimerConfig,
    ) -> Self {
        Self {
            store,
            limiter,
            cache,
            config,
        }
    }

    /// Spawn the periodic loop. The first sweep runs immediately.
    pub fn start(self) -> ReclaimerHandle {
        let token = CancellationToken::new();
        let loop_token = token.clone();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = loop_token.cancelled() => {
                        tracing::debug!("Reclaimer stopping");
                        break;
                    }
                    _ = ticker.tick() => {
                        self.sweep().await;
                    }
                }
            }
        });
        ReclaimerHandle { token, task }
    }

    /// One full maintenance pass. Public so the operator surface can trigger
    /// it outside the schedule.
    pub async fn sweep(&self) {
        match self.store.delete_older_than(self.config.job_retention).await {
            Ok(0) => {}
            Ok(deleted) => tracing::info!(deleted, "Reclaimed expired jobs"),
            Err(err) => tracing::error!(error = %err, "Job reclamation failed"),
        }

        let stale = self.limiter.cleanup_stale(self.config.bucket_max_age);
        if stale > 0 {
            tracing::debug!(removed = stale, "Dropped stale rate-limit buckets");
        }

        match self.sweep_temp_files().await {
            Ok(0) => {}
            Ok(removed) => tracing::info!(removed, "Removed orphaned temporary files"),
            Err(err) => tracing::error!(error = %err, "Temporary file sweep failed"),
        }

        let evicted = self.cache.evict_expired().await;
        if evicted > 0 {
            tracing::debug!(evicted, "Evicted expired cache entries");
        }
    }

    /// Delete files in the temp area whose mtime exceeds the age threshold.
    /// Files that are concurrently in use or unreadable are skipped, not
    /// treated as sweep failures.
    async fn sweep_temp_files(&self) -> std::io::Result<usize> {
        let mut entries = match tokio::fs::read_dir(&self.config.temp_dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(err) => return Err(err),
        };

        let now = SystemTime::now();
        let mut removed = 0;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let Ok(metadata) = entry.metadata().await else {
                continue;
            };
            if !metadata.is_file() {
                continue;
            }
            let Ok(modified) = metadata.modified() else {
                continue;
            };
            let age = now.duration_since(modified).unwrap_or_default();
            if age < self.config.temp_max_age {
                continue;
            }
            match tokio::fs::remove_file(&path).await {
                Ok(()) => removed += 1,
                Err(err) => {
                    tracing::debug!(path = %path.display(), error = %err, "Skipping busy temp file");
                }
            }
        }
        Ok(removed)
    }
}
