use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::engine::Engine;
use crate::jobs::{DurableJobQueue, JobProcessor};
use crate::observability;

/// Consume due jobs forever. Each failure is recorded on the queue and logged;
/// it never stops the loop.
pub async fn run_expiry_worker(queue: Arc<DurableJobQueue>, processor: Arc<dyn JobProcessor>) {
    loop {
        let job = queue.next_due().await;
        match processor.process(&job).await {
            Ok(()) => {
                debug!(job_id = %job.id, job = %job.name, "job completed");
                if let Err(e) = queue.complete(job.id).await {
                    error!(job_id = %job.id, "could not record job completion: {e}");
                }
            }
            Err(e) => {
                warn!(job_id = %job.id, job = %job.name, "job failed: {e}");
                metrics::counter!(observability::JOBS_FAILED_TOTAL, "job" => job.name.clone())
                    .increment(1);
                if let Err(log_err) = queue.fail(job.id, e.to_string()).await {
                    error!(job_id = %job.id, "could not record job failure: {log_err}");
                }
            }
        }
    }
}

/// Periodically compact the engine WAL and the job log once either has
/// taken more than `threshold` appends since its last compaction.
pub async fn run_compactor(engine: Arc<Engine>, queue: Arc<DurableJobQueue>, threshold: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(60));
    loop {
        interval.tick().await;
        compact_if_needed(&engine, &queue, threshold).await;
    }
}

async fn compact_if_needed(engine: &Engine, queue: &DurableJobQueue, threshold: u64) {
    let appends = engine.wal_appends_since_compact().await;
    if appends > threshold {
        match engine.compact_wal().await {
            Ok(()) => info!("compacted engine WAL after {appends} appends"),
            Err(e) => error!("engine WAL compaction failed: {e}"),
        }
    }
    let appends = queue.appends_since_compact().await;
    if appends > threshold {
        match queue.compact().await {
            Ok(()) => info!("compacted job log after {appends} appends"),
            Err(e) => error!("job log compaction failed: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};

    use crate::clock::FixedClock;
    use crate::jobs::{Job, JobError, JobOptions, JobQueue};

    fn test_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("staybook_test_reaper");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    struct Counting {
        seen: AtomicUsize,
        fail_on: Option<&'static str>,
    }

    #[async_trait]
    impl JobProcessor for Counting {
        async fn process(&self, job: &Job) -> Result<(), JobError> {
            self.seen.fetch_add(1, Ordering::SeqCst);
            if self.fail_on == Some(job.name.as_str()) {
                return Err(JobError::Failed("boom".into()));
            }
            Ok(())
        }
    }

    async fn wait_until(mut done: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !done() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    fn clock() -> Arc<FixedClock> {
        Arc::new(FixedClock::new(Utc.with_ymd_and_hms(2024, 11, 1, 12, 0, 0).unwrap()))
    }

    #[tokio::test]
    async fn worker_completes_and_fails_jobs_without_stopping() {
        let queue = Arc::new(DurableJobQueue::open(test_path("worker.log"), clock()).unwrap());
        let processor = Arc::new(Counting { seen: AtomicUsize::new(0), fail_on: Some("bad") });
        let worker = tokio::spawn(run_expiry_worker(queue.clone(), processor.clone()));

        let now = JobOptions { delay: Duration::ZERO, remove_on_complete: false, remove_on_fail: false };
        queue.enqueue("bad", serde_json::json!({}), now).await.unwrap();
        queue.enqueue("good", serde_json::json!({}), now).await.unwrap();

        wait_until(|| queue.completed_len() == 1 && queue.failed_jobs().len() == 1).await;
        assert_eq!(processor.seen.load(Ordering::SeqCst), 2);
        assert_eq!(queue.failed_jobs()[0].error, "boom");
        assert_eq!(queue.pending_len(), 0);
        worker.abort();
    }

    #[tokio::test]
    async fn worker_leaves_future_jobs_pending() {
        let queue = Arc::new(DurableJobQueue::open(test_path("future.log"), clock()).unwrap());
        let processor = Arc::new(Counting { seen: AtomicUsize::new(0), fail_on: None });
        let worker = tokio::spawn(run_expiry_worker(queue.clone(), processor.clone()));

        let later = JobOptions {
            delay: Duration::from_secs(15 * 60),
            remove_on_complete: true,
            remove_on_fail: false,
        };
        queue.enqueue("good", serde_json::json!({}), later).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(processor.seen.load(Ordering::SeqCst), 0);
        assert_eq!(queue.pending_len(), 1);
        worker.abort();
    }
}
