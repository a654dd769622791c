use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use renderq::cache::Cache;
use renderq::config::{CacheConfig, RateLimitConfig, ReclaimerConfig};
use renderq::ratelimit::RateLimiter;
use renderq::reclaimer::Reclaimer;
use renderq::store::JobStore;
use renderq::Error;

struct Fixture {
    _dir: TempDir,
    store: JobStore,
    limiter: Arc<RateLimiter>,
    cache: Arc<Cache>,
    config: ReclaimerConfig,
}

async fn fixture(config_fn: impl FnOnce(&TempDir) -> ReclaimerConfig) -> Fixture {
    let dir = TempDir::new().unwrap();
    let store = JobStore::new(dir.path().join("jobs.db")).await.unwrap();
    let limiter = Arc::new(RateLimiter::new(&RateLimitConfig::default()));
    let cache = Arc::new(
        Cache::new(&CacheConfig {
            dir: dir.path().join("cache"),
            default_ttl: Duration::from_secs(60),
        })
        .await
        .unwrap(),
    );
    let config = config_fn(&dir);
    Fixture {
        _dir: dir,
        store,
        limiter,
        cache,
        config,
    }
}

fn reclaimer(f: &Fixture) -> Reclaimer {
    Reclaimer::new(
        f.store.clone(),
        f.limiter.clone(),
        f.cache.clone(),
        f.config.clone(),
    )
}

#[tokio::test]
async fn test_sweep_removes_old_jobs_and_keeps_fresh_ones() {
    let f = fixture(|dir| ReclaimerConfig {
        job_retention: Duration::from_millis(50),
        temp_dir: dir.path().join("temp"),
        ..ReclaimerConfig::default()
    })
    .await;

    f.store.create("old", HashMap::new()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(80)).await;
    f.store.create("fresh", HashMap::new()).await.unwrap();

    reclaimer(&f).sweep().await;

    assert!(matches!(
        f.store.get("old").await.unwrap_err(),
        Error::JobNotFound(_)
    ));
    assert!(f.store.get("fresh").await.is_ok());
}

#[tokio::test]
async fn test_sweep_drops_stale_rate_limit_buckets() {
    let f = fixture(|dir| ReclaimerConfig {
        bucket_max_age: Duration::from_millis(40),
        temp_dir: dir.path().join("temp"),
        ..ReclaimerConfig::default()
    })
    .await;

    assert!(f.limiter.allow("idle-client"));
    tokio::time::sleep(Duration::from_millis(70)).await;
    assert!(f.limiter.allow("active-client"));

    reclaimer(&f).sweep().await;

    assert_eq!(f.limiter.bucket_count(), 1);
}

#[tokio::test]
async fn test_sweep_deletes_old_temp_files_only() {
    let f = fixture(|dir| ReclaimerConfig {
        temp_max_age: Duration::from_millis(50),
        temp_dir: dir.path().join("temp"),
        ..ReclaimerConfig::default()
    })
    .await;

    let temp_dir = &f.config.temp_dir;
    std::fs::create_dir_all(temp_dir).unwrap();
    let old_file = temp_dir.join("temp_audio_old.wav");
    std::fs::write(&old_file, b"stale").unwrap();
    tokio::time::sleep(Duration::from_millis(80)).await;
    let new_file = temp_dir.join("temp_audio_new.wav");
    std::fs::write(&new_file, b"in use").unwrap();

    reclaimer(&f).sweep().await;

    assert!(!old_file.exists(), "aged-out temp file should be removed");
    assert!(new_file.exists(), "recent temp file must survive");
}

#[tokio::test]
async fn test_sweep_tolerates_missing_temp_dir() {
    let f = fixture(|dir| ReclaimerConfig {
        temp_dir: dir.path().join("never-created"),
        ..ReclaimerConfig::default()
    })
    .await;

    // Must not error or skip the other steps.
    assert!(f.limiter.allow("client"));
    reclaimer(&f).sweep().await;
    assert_eq!(f.limiter.bucket_count(), 1);
}

#[tokio::test]
async fn test_sweep_evicts_expired_cache_entries() {
    let f = fixture(|dir| ReclaimerConfig {
        temp_dir: dir.path().join("temp"),
        ..ReclaimerConfig::default()
    })
    .await;

    f.cache
        .set("short-lived", &"value", Some(Duration::from_millis(30)))
        .await;
    f.cache.set("long-lived", &"value", None).await;
    tokio::time::sleep(Duration::from_millis(60)).await;

    reclaimer(&f).sweep().await;

    assert_eq!(f.cache.get::<String>("short-lived").await, None);
    assert_eq!(
        f.cache.get::<String>("long-lived").await,
        Some("value".to_string())
    );
}

#[tokio::test]
async fn test_periodic_loop_runs_first_sweep_immediately() {
    let f = fixture(|dir| ReclaimerConfig {
        interval: Duration::from_secs(3600),
        job_retention: Duration::from_millis(10),
        temp_dir: dir.path().join("temp"),
        ..ReclaimerConfig::default()
    })
    .await;

    f.store.create("old", HashMap::new()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;

    let handle = reclaimer(&f).start();
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(matches!(
        f.store.get("old").await.unwrap_err(),
        Error::JobNotFound(_)
    ));
    handle.stop().await;
}

#[tokio::test]
async fn test_stop_terminates_the_loop() {
    let f = fixture(|dir| ReclaimerConfig {
        interval: Duration::from_millis(20),
        temp_dir: dir.path().join("temp"),
        ..ReclaimerConfig::default()
    })
    .await;

    let handle = reclaimer(&f).start();
    tokio::time::sleep(Duration::from_millis(60)).await;
    handle.stop().await;
}
