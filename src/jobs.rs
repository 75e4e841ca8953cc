//! Durable delayed-job queue backed by its own WAL.
//!
//! Jobs survive restarts: enqueue, completion and failure are logged, and
//! replay re-arms everything still pending. A job that was handed to a worker
//! but never finished before a crash is delivered again, so processors must be
//! idempotent.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{Notify, RwLock};
use ulid::Ulid;

use crate::clock::Clock;
use crate::model::Ms;
use crate::wal::{Wal, WalWriter};

pub const EXPIRE_RESERVATION: &str = "expire-reservation";

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("job log unavailable: {0}")]
    Log(String),
    #[error("bad job payload: {0}")]
    Payload(String),
}

#[derive(Debug, Error)]
pub enum JobError {
    #[error("unknown job: {0}")]
    UnknownJob(String),
    #[error("bad payload: {0}")]
    Payload(String),
    #[error("{0}")]
    Failed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobOptions {
    pub delay: Duration,
    pub remove_on_complete: bool,
    pub remove_on_fail: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: Ulid,
    pub name: String,
    /// JSON document.
    pub payload: String,
    pub run_at: Ms,
    pub remove_on_complete: bool,
    pub remove_on_fail: bool,
}

impl Job {
    pub fn payload_as<T: serde::de::DeserializeOwned>(&self) -> Result<T, JobError> {
        serde_json::from_str(&self.payload).map_err(|e| JobError::Payload(e.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedJob {
    pub job: Job,
    pub error: String,
    pub failed_at: Ms,
}

/// Payload of the `expire-reservation` job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpireReservation {
    pub reservation_id: Ulid,
}

/// Producer side of the queue.
#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn enqueue(
        &self,
        name: &str,
        payload: serde_json::Value,
        options: JobOptions,
    ) -> Result<Ulid, QueueError>;
}

/// Consumer contract: an `Err` marks the job failed. Failed jobs are never retried.
#[async_trait]
pub trait JobProcessor: Send + Sync {
    async fn process(&self, job: &Job) -> Result<(), JobError>;
}

/// Job log record format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum JobRecord {
    Enqueued { job: Job },
    Completed { id: Ulid, at: Ms },
    Failed { id: Ulid, error: String, at: Ms },
}

#[derive(Default)]
struct QueueState {
    /// Ordered by (run_at, id).
    pending: BTreeMap<(Ms, Ulid), Job>,
    /// Handed to a worker, not yet finished.
    running: HashMap<Ulid, Job>,
    completed: HashMap<Ulid, Job>,
    failed: HashMap<Ulid, FailedJob>,
}

impl QueueState {
    fn apply(&mut self, record: JobRecord) {
        match record {
            JobRecord::Enqueued { job } => {
                self.pending.insert((job.run_at, job.id), job);
            }
            JobRecord::Completed { id, .. } => {
                if let Some(job) = self.take(id)
                    && !job.remove_on_complete
                {
                    self.completed.insert(id, job);
                }
            }
            JobRecord::Failed { id, error, at } => {
                if let Some(job) = self.take(id)
                    && !job.remove_on_fail
                {
                    self.failed.insert(id, FailedJob { job, error, failed_at: at });
                }
            }
        }
    }

    fn take(&mut self, id: Ulid) -> Option<Job> {
        if let Some(job) = self.running.remove(&id) {
            return Some(job);
        }
        let key = self.pending.keys().find(|(_, jid)| *jid == id).copied()?;
        self.pending.remove(&key)
    }
}

pub struct DurableJobQueue {
    state: Mutex<QueueState>,
    log: WalWriter<JobRecord>,
    /// Appends hold it shared from log write to apply; compaction holds it
    /// exclusively so its snapshot covers every acknowledged record.
    compaction_gate: RwLock<()>,
    wakeup: Notify,
    clock: Arc<dyn Clock>,
}

impl DurableJobQueue {
    /// Replay the job log at `path` and start its writer. Needs a tokio runtime.
    pub fn open(path: PathBuf, clock: Arc<dyn Clock>) -> std::io::Result<Self> {
        let records = Wal::<JobRecord>::replay(&path)?;
        let mut state = QueueState::default();
        for record in records {
            state.apply(record);
        }
        if !state.pending.is_empty() {
            tracing::info!(pending = state.pending.len(), "re-armed pending jobs from log");
        }
        let log = WalWriter::spawn(Wal::open(&path)?);
        Ok(Self {
            state: Mutex::new(state),
            log,
            compaction_gate: RwLock::new(()),
            wakeup: Notify::new(),
            clock,
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Wait until a job is due and hand it out.
    pub async fn next_due(&self) -> Job {
        loop {
            let notified = self.wakeup.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let wait = {
                let mut state = self.lock();
                let now = self.clock.now_ms();
                match state.pending.first_key_value().map(|(k, _)| *k) {
                    Some(key) if key.0 <= now => {
                        if let Some(job) = state.pending.remove(&key) {
                            state.running.insert(job.id, job.clone());
                            return job;
                        }
                        continue;
                    }
                    Some((run_at, _)) => Some(Duration::from_millis((run_at - now) as u64)),
                    None => None,
                }
            };

            match wait {
                Some(d) => {
                    tokio::select! {
                        _ = tokio::time::sleep(d) => {}
                        _ = &mut notified => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    pub async fn complete(&self, id: Ulid) -> Result<(), QueueError> {
        let record = JobRecord::Completed { id, at: self.clock.now_ms() };
        let _gate = self.compaction_gate.read().await;
        self.log.append(record.clone()).await.map_err(|e| QueueError::Log(e.to_string()))?;
        self.lock().apply(record);
        Ok(())
    }

    pub async fn fail(&self, id: Ulid, error: String) -> Result<(), QueueError> {
        let record = JobRecord::Failed { id, error, at: self.clock.now_ms() };
        let _gate = self.compaction_gate.read().await;
        self.log.append(record.clone()).await.map_err(|e| QueueError::Log(e.to_string()))?;
        self.lock().apply(record);
        Ok(())
    }

    pub fn pending_len(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn pending_jobs(&self) -> Vec<Job> {
        self.lock().pending.values().cloned().collect()
    }

    pub fn failed_jobs(&self) -> Vec<FailedJob> {
        self.lock().failed.values().cloned().collect()
    }

    pub fn completed_len(&self) -> usize {
        self.lock().completed.len()
    }

    pub async fn appends_since_compact(&self) -> u64 {
        self.log.appends_since_compact().await
    }

    /// Rewrite the job log as the minimal set of records for the current state.
    /// Running jobs are written back as pending.
    pub async fn compact(&self) -> Result<(), QueueError> {
        let _gate = self.compaction_gate.write().await;
        let records = {
            let state = self.lock();
            let mut records: Vec<JobRecord> = state
                .pending
                .values()
                .chain(state.running.values())
                .chain(state.completed.values())
                .map(|job| JobRecord::Enqueued { job: job.clone() })
                .collect();
            records.extend(state.failed.values().map(|f| JobRecord::Enqueued { job: f.job.clone() }));
            records.extend(state.completed.keys().map(|id| JobRecord::Completed { id: *id, at: 0 }));
            records.extend(state.failed.values().map(|f| JobRecord::Failed {
                id: f.job.id,
                error: f.error.clone(),
                at: f.failed_at,
            }));
            records
        };
        self.log.compact(records).await.map_err(|e| QueueError::Log(e.to_string()))
    }
}

#[async_trait]
impl JobQueue for DurableJobQueue {
    async fn enqueue(
        &self,
        name: &str,
        payload: serde_json::Value,
        options: JobOptions,
    ) -> Result<Ulid, QueueError> {
        let delay_ms = Ms::try_from(options.delay.as_millis())
            .map_err(|_| QueueError::Payload("delay out of range".into()))?;
        let job = Job {
            id: Ulid::new(),
            name: name.to_string(),
            payload: payload.to_string(),
            run_at: self.clock.now_ms().saturating_add(delay_ms),
            remove_on_complete: options.remove_on_complete,
            remove_on_fail: options.remove_on_fail,
        };
        let id = job.id;
        let record = JobRecord::Enqueued { job };
        let _gate = self.compaction_gate.read().await;
        self.log.append(record.clone()).await.map_err(|e| QueueError::Log(e.to_string()))?;
        self.lock().apply(record);
        self.wakeup.notify_one();
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use chrono::{TimeZone, Utc};

    fn test_log_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("staybook_test_jobs");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    fn clock() -> Arc<FixedClock> {
        Arc::new(FixedClock::new(Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap()))
    }

    fn opts(delay_ms: u64) -> JobOptions {
        JobOptions {
            delay: Duration::from_millis(delay_ms),
            remove_on_complete: true,
            remove_on_fail: false,
        }
    }

    #[tokio::test]
    async fn due_job_is_handed_out() {
        let queue = DurableJobQueue::open(test_log_path("due.wal"), clock()).unwrap();
        let id = queue
            .enqueue(EXPIRE_RESERVATION, serde_json::json!({"reservation_id": Ulid::nil()}), opts(0))
            .await
            .unwrap();
        let job = tokio::time::timeout(Duration::from_secs(1), queue.next_due()).await.unwrap();
        assert_eq!(job.id, id);
        assert_eq!(job.name, EXPIRE_RESERVATION);
        let payload: ExpireReservation = job.payload_as().unwrap();
        assert_eq!(payload.reservation_id, Ulid::nil());
    }

    #[tokio::test]
    async fn delayed_job_waits_for_clock() {
        let clock = clock();
        let queue = DurableJobQueue::open(test_log_path("delayed.wal"), clock.clone()).unwrap();
        queue.enqueue("x", serde_json::json!({}), opts(60_000)).await.unwrap();

        let early = tokio::time::timeout(Duration::from_millis(50), queue.next_due()).await;
        assert!(early.is_err());

        clock.set(Utc.with_ymd_and_hms(2025, 1, 1, 0, 1, 0).unwrap());
        let job = tokio::time::timeout(Duration::from_secs(1), queue.next_due()).await;
        assert!(job.is_ok());
    }

    #[tokio::test]
    async fn pending_jobs_survive_restart() {
        let path = test_log_path("restart.wal");
        let clock = clock();
        {
            let queue = DurableJobQueue::open(path.clone(), clock.clone()).unwrap();
            let done = queue.enqueue("a", serde_json::json!({}), opts(0)).await.unwrap();
            queue.enqueue("b", serde_json::json!({}), opts(5_000)).await.unwrap();
            let job = queue.next_due().await;
            assert_eq!(job.id, done);
            queue.complete(done).await.unwrap();
        }
        let reopened = DurableJobQueue::open(path, clock).unwrap();
        let pending = reopened.pending_jobs();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].name, "b");
        assert_eq!(reopened.completed_len(), 0);
    }

    #[tokio::test]
    async fn failed_jobs_are_retained_not_retried() {
        let path = test_log_path("failed.wal");
        let clock = clock();
        let queue = DurableJobQueue::open(path.clone(), clock.clone()).unwrap();
        let id = queue.enqueue("x", serde_json::json!({}), opts(0)).await.unwrap();
        let job = queue.next_due().await;
        queue.fail(job.id, "boom".into()).await.unwrap();

        assert_eq!(queue.pending_len(), 0);
        let failed = queue.failed_jobs();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].job.id, id);
        assert_eq!(failed[0].error, "boom");

        queue.compact().await.unwrap();
        let reopened = DurableJobQueue::open(path, clock).unwrap();
        assert_eq!(reopened.pending_len(), 0);
        assert_eq!(reopened.failed_jobs().len(), 1);
    }

    #[tokio::test]
    async fn compaction_keeps_pending_jobs() {
        let path = test_log_path("compact.wal");
        let clock = clock();
        let queue = DurableJobQueue::open(path.clone(), clock.clone()).unwrap();
        for _ in 0..5 {
            let id = queue.enqueue("done", serde_json::json!({}), opts(0)).await.unwrap();
            let job = queue.next_due().await;
            assert_eq!(job.id, id);
            queue.complete(id).await.unwrap();
        }
        queue.enqueue("later", serde_json::json!({}), opts(10_000)).await.unwrap();
        assert_eq!(queue.appends_since_compact().await, 11);

        queue.compact().await.unwrap();
        assert_eq!(queue.appends_since_compact().await, 0);

        let reopened = DurableJobQueue::open(path, clock).unwrap();
        assert_eq!(reopened.pending_jobs().len(), 1);
        assert_eq!(reopened.pending_jobs()[0].name, "later");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn compaction_racing_enqueues_keeps_every_job() {
        let path = test_log_path("compact_race.wal");
        let clock = clock();
        let queue = Arc::new(DurableJobQueue::open(path.clone(), clock.clone()).unwrap());

        let mut handles = Vec::new();
        for _ in 0..20 {
            let queue = queue.clone();
            handles.push(tokio::spawn(async move {
                queue.enqueue("hold", serde_json::json!({}), opts(60_000)).await.unwrap();
            }));
        }
        for _ in 0..3 {
            let queue = queue.clone();
            handles.push(tokio::spawn(async move {
                queue.compact().await.unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(queue.pending_len(), 20);
        drop(queue);

        let reopened = DurableJobQueue::open(path, clock).unwrap();
        assert_eq!(reopened.pending_len(), 20);
    }
}
