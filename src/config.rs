use std::path::PathBuf;
use std::time::Duration;

/// Configuration for the durable job store.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Path to the SQLite database file. Created if missing.
    pub db_path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("jobs.db"),
        }
    }
}

/// Configuration for the bounded worker pool.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum number of jobs executing concurrently.
    pub max_workers: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self { max_workers: 2 }
    }
}

/// Configuration for per-client token-bucket rate limiting.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Steady-state admission rate. Refill is `requests_per_minute / 60` tokens per second.
    pub requests_per_minute: u32,
    /// Bucket capacity. Defaults to `requests_per_minute` when unset, allowing a
    /// short burst up to one minute's allowance.
    pub burst_size: Option<u32>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_minute: 60,
            burst_size: None,
        }
    }
}

impl RateLimitConfig {
    pub fn refill_per_second(&self) -> f64 {
        f64::from(self.requests_per_minute) / 60.0
    }

    pub fn burst(&self) -> f64 {
        f64::from(self.burst_size.unwrap_or(self.requests_per_minute))
    }
}

/// Configuration for the two-tier TTL cache.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Directory holding the durable tier (one `.cache` file per key).
    pub dir: PathBuf,
    /// TTL applied when `set` is called without an explicit one.
    pub default_ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("cache"),
            default_ttl: Duration::from_secs(3600),
        }
    }
}

/// Configuration for the periodic reclaimer sweep.
#[derive(Debug, Clone)]
pub struct ReclaimerConfig {
    /// Time between sweeps. The first sweep runs immediately on start.
    pub interval: Duration,
    /// Jobs whose `created_at` is older than this are deleted.
    pub job_retention: Duration,
    /// Rate-limiter buckets idle longer than this are dropped.
    pub bucket_max_age: Duration,
    /// Directory scanned for orphaned temporary artifacts.
    pub temp_dir: PathBuf,
    /// Temporary files with an mtime older than this are deleted.
    pub temp_max_age: Duration,
}

impl Default for ReclaimerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(3600),
            job_retention: Duration::from_secs(7 * 24 * 3600),
            bucket_max_age: Duration::from_secs(3600),
            temp_dir: PathBuf::from("temp"),
            temp_max_age: Duration::from_secs(3600),
        }
    }
}

/// Configuration for the external generation pipeline.
///
/// The synthesis and rendering steps are opaque external collaborators invoked
/// as subprocesses. Command templates are split on whitespace, then each token
/// has its `{placeholder}` markers substituted, so a `{text}` containing spaces
/// stays a single argument.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Synthesis command. Placeholders: `{text}`, `{voice}`, `{speed}`, `{output}`.
    pub synthesize_command: String,
    /// Rendering command. Placeholders: `{audio}`, `{image}`, `{output}`.
    pub render_command: String,
    /// Directory for intermediate artifacts (synthesized audio). Swept by the
    /// reclaimer, so nothing a job's `result_path` points at may live here.
    pub temp_dir: PathBuf,
    /// Directory for finished result videos. Kept out of the reclaimer's
    /// temp sweep; results live as long as their job records do.
    pub output_dir: PathBuf,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            synthesize_command: "synthesize {text} {voice} {speed} {output}".to_string(),
            render_command: "render {audio} {image} {output}".to_string(),
            temp_dir: PathBuf::from("temp"),
            output_dir: PathBuf::from("results"),
        }
    }
}

/// Top-level configuration, assembled once at process start and handed to
/// [`Service::new`](crate::service::Service::new).
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub store: StoreConfig,
    pub pool: PoolConfig,
    pub rate_limit: RateLimitConfig,
    pub cache: CacheConfig,
    pub reclaimer: ReclaimerConfig,
    pub pipeline: PipelineConfig,
}

impl Config {
    pub fn with_max_workers(mut self, max_workers: usize) -> Self {
        self.pool.max_workers = max_workers;
        self
    }

    pub fn with_db_path(mut self, db_path: impl Into<PathBuf>) -> Self {
        self.store.db_path = db_path.into();
        self
    }

    pub fn with_rate_limit(mut self, requests_per_minute: u32, burst_size: Option<u32>) -> Self {
        self.rate_limit.requests_per_minute = requests_per_minute;
        self.rate_limit.burst_size = burst_size;
        self
    }

    pub fn with_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache.dir = dir.into();
        self
    }

    pub fn with_temp_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        self.reclaimer.temp_dir = dir.clone();
        self.pipeline.temp_dir = dir;
        self
    }

    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.pipeline.output_dir = dir.into();
        self
    }
}
