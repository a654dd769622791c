use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tempfile::TempDir;

use renderq::pool::{JobBody, WorkerPool};
use renderq::store::{Job, JobStatus, JobStore};
use renderq::Error;

async fn temp_store() -> (TempDir, JobStore) {
    let dir = TempDir::new().unwrap();
    let store = JobStore::new(dir.path().join("jobs.db")).await.unwrap();
    (dir, store)
}

async fn create_job(store: &JobStore, id: &str) {
    store.create(id, HashMap::new()).await.unwrap();
}

/// Poll the store until the job reaches a terminal state.
async fn wait_for_terminal(store: &JobStore, id: &str) -> Job {
    for _ in 0..200 {
        let job = store.get(id).await.unwrap();
        if job.status.is_terminal() {
            return job;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("job {id} never reached a terminal state");
}

fn body_returning(path: &str) -> JobBody {
    let path = PathBuf::from(path);
    Box::new(move |_reporter| Box::pin(async move { Ok(path) }))
}

fn body_sleeping(millis: u64) -> JobBody {
    Box::new(move |_reporter| {
        Box::pin(async move {
            tokio::time::sleep(Duration::from_millis(millis)).await;
            Ok(PathBuf::from("/out/slow.mp4"))
        })
    })
}

#[tokio::test]
async fn test_submit_returns_immediately_and_job_completes() {
    let (_dir, store) = temp_store().await;
    let pool = WorkerPool::new(store.clone(), 2);
    create_job(&store, "job-1").await;

    pool.submit("job-1", body_returning("/out/final.mp4"));

    let job = wait_for_terminal(&store, "job-1").await;
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.progress, 1.0);
    assert_eq!(job.result_path.as_deref(), Some("/out/final.mp4"));
    assert!(job.completed_at.is_some());
}

#[tokio::test]
async fn test_concurrency_never_exceeds_max_workers() {
    let (_dir, store) = temp_store().await;
    let pool = WorkerPool::new(store.clone(), 2);

    let active = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    for i in 0..6 {
        let id = format!("job-{i}");
        create_job(&store, &id).await;
        let active = active.clone();
        let peak = peak.clone();
        let body: JobBody = Box::new(move |_reporter| {
            Box::pin(async move {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(50)).await;
                active.fetch_sub(1, Ordering::SeqCst);
                Ok(PathBuf::from("/out/done.mp4"))
            })
        });
        pool.submit(id, body);
    }

    for i in 0..6 {
        let job = wait_for_terminal(&store, &format!("job-{i}")).await;
        assert_eq!(job.status, JobStatus::Completed);
    }
    assert!(peak.load(Ordering::SeqCst) <= 2, "peak={}", peak.load(Ordering::SeqCst));
    assert!(peak.load(Ordering::SeqCst) >= 2, "pool should actually use both slots");
}

#[tokio::test]
async fn test_jobs_start_in_submission_order() {
    let (_dir, store) = temp_store().await;
    let pool = WorkerPool::new(store.clone(), 1);

    let starts: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    for i in 0..4 {
        let id = format!("job-{i}");
        create_job(&store, &id).await;
        let starts = starts.clone();
        let marker = id.clone();
        let body: JobBody = Box::new(move |_reporter| {
            Box::pin(async move {
                starts.lock().push(marker);
                tokio::time::sleep(Duration::from_millis(10)).await;
                Ok(PathBuf::from("/out/done.mp4"))
            })
        });
        pool.submit(id, body);
    }

    for i in 0..4 {
        wait_for_terminal(&store, &format!("job-{i}")).await;
    }
    assert_eq!(
        *starts.lock(),
        vec!["job-0", "job-1", "job-2", "job-3"],
        "single worker drains the queue in FIFO order"
    );
}

#[tokio::test]
async fn test_failure_is_contained_and_recorded() {
    let (_dir, store) = temp_store().await;
    let pool = WorkerPool::new(store.clone(), 2);

    create_job(&store, "bad").await;
    create_job(&store, "good").await;

    let failing: JobBody = Box::new(|_reporter| {
        Box::pin(async { Err(Error::Execution("synthesis exited with status 1".into())) })
    });
    pool.submit("bad", failing);
    pool.submit("good", body_returning("/out/good.mp4"));

    let bad = wait_for_terminal(&store, "bad").await;
    assert_eq!(bad.status, JobStatus::Failed);
    assert!(bad
        .error_message
        .unwrap()
        .contains("synthesis exited with status 1"));

    let good = wait_for_terminal(&store, "good").await;
    assert_eq!(good.status, JobStatus::Completed);
}

#[tokio::test]
async fn test_panicking_body_fails_only_its_own_job() {
    let (_dir, store) = temp_store().await;
    let pool = WorkerPool::new(store.clone(), 1);

    create_job(&store, "panicky").await;
    create_job(&store, "after").await;

    let panicking: JobBody = Box::new(|_reporter| {
        Box::pin(async { panic!("model crashed") })
    });
    pool.submit("panicky", panicking);
    pool.submit("after", body_returning("/out/after.mp4"));

    let panicky = wait_for_terminal(&store, "panicky").await;
    assert_eq!(panicky.status, JobStatus::Failed);
    assert!(panicky.error_message.unwrap().contains("panicked"));

    // The worker slot is released; subsequent jobs still run.
    let after = wait_for_terminal(&store, "after").await;
    assert_eq!(after.status, JobStatus::Completed);
}

#[tokio::test]
async fn test_cleanup_runs_on_success_and_failure() {
    let (_dir, store) = temp_store().await;
    let pool = WorkerPool::new(store.clone(), 2);

    let cleaned = Arc::new(AtomicUsize::new(0));

    create_job(&store, "ok").await;
    let c = cleaned.clone();
    pool.submit_with_cleanup(
        "ok",
        body_returning("/out/ok.mp4"),
        Some(Box::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        })),
    );

    create_job(&store, "fail").await;
    let c = cleaned.clone();
    let failing: JobBody =
        Box::new(|_reporter| Box::pin(async { Err(Error::Execution("boom".into())) }));
    pool.submit_with_cleanup(
        "fail",
        failing,
        Some(Box::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        })),
    );

    wait_for_terminal(&store, "ok").await;
    wait_for_terminal(&store, "fail").await;
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(cleaned.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_progress_is_visible_while_running() {
    let (_dir, store) = temp_store().await;
    let pool = WorkerPool::new(store.clone(), 1);
    create_job(&store, "job-1").await;

    let body: JobBody = Box::new(|reporter| {
        Box::pin(async move {
            reporter.report(0.5).await;
            tokio::time::sleep(Duration::from_millis(150)).await;
            Ok(PathBuf::from("/out/done.mp4"))
        })
    });
    pool.submit("job-1", body);

    // Observe the mid-run state before the job finishes.
    let mut seen_midpoint = false;
    for _ in 0..50 {
        let job = store.get("job-1").await.unwrap();
        if job.status == JobStatus::Processing && job.progress >= 0.5 {
            seen_midpoint = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(seen_midpoint, "progress report should be observable mid-run");

    let job = wait_for_terminal(&store, "job-1").await;
    assert_eq!(job.progress, 1.0);
}

#[tokio::test]
async fn test_status_snapshot_reflects_queue_and_workers() {
    let (_dir, store) = temp_store().await;
    let pool = WorkerPool::new(store.clone(), 1);

    for i in 0..3 {
        let id = format!("job-{i}");
        create_job(&store, &id).await;
        pool.submit(id, body_sleeping(100));
    }
    tokio::time::sleep(Duration::from_millis(20)).await;

    let status = pool.status();
    assert_eq!(status.max_workers, 1);
    assert_eq!(status.active_workers, 1);
    assert_eq!(status.available_workers, 0);
    assert_eq!(status.queue_size, 2);
}

#[tokio::test]
async fn test_shutdown_cancels_queued_jobs() {
    let (_dir, store) = temp_store().await;
    let pool = WorkerPool::new(store.clone(), 1);

    for i in 0..5 {
        let id = format!("job-{i}");
        create_job(&store, &id).await;
        pool.submit(id, body_sleeping(100));
    }
    // Let the first job start.
    tokio::time::sleep(Duration::from_millis(20)).await;

    let cancelled = pool.shutdown(Duration::from_millis(50)).await;
    assert_eq!(cancelled, 4, "the four never-started jobs are cancelled");

    for i in 1..5 {
        let job = store.get(&format!("job-{i}")).await.unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);
        assert_eq!(job.error_message.as_deref(), Some("shutdown"));
    }
}

#[tokio::test]
async fn test_shutdown_waits_for_active_workers() {
    let (_dir, store) = temp_store().await;
    let pool = WorkerPool::new(store.clone(), 1);

    create_job(&store, "job-1").await;
    pool.submit("job-1", body_sleeping(50));
    tokio::time::sleep(Duration::from_millis(20)).await;

    let cancelled = pool.shutdown(Duration::from_secs(2)).await;
    assert_eq!(cancelled, 0);

    let job = store.get("job-1").await.unwrap();
    assert_eq!(job.status, JobStatus::Completed);
}

#[tokio::test]
async fn test_submit_after_shutdown_is_cancelled() {
    let (_dir, store) = temp_store().await;
    let pool = WorkerPool::new(store.clone(), 1);
    pool.shutdown(Duration::from_millis(10)).await;

    create_job(&store, "late").await;
    pool.submit("late", body_returning("/out/late.mp4"));

    let job = wait_for_terminal(&store, "late").await;
    assert_eq!(job.status, JobStatus::Cancelled);
    assert_eq!(job.error_message.as_deref(), Some("shutdown"));
}
