//! The Job Queue: named queues, delayed enqueue, at-least-once delivery,
//! per-message retry with exponential backoff, and a dead-letter queue (§2.3).
//!
//! Per `SPEC_FULL.md`'s workspace notes, this rides on the same Postgres pool
//! as the state store (`StateStore::claim_due_jobs` does the `FOR UPDATE SKIP
//! LOCKED` poll) rather than introducing a second broker dependency. The
//! queue layer itself is therefore a thin, backend-agnostic wrapper generic
//! over any `StateStore` — one implementation serves both the in-memory
//! fakes and Postgres.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::error::{QueueError, StoreError};
use crate::model::{DeadLetter, Job, JobQueueKind, JobStatus, RunId};
use crate::store::StateStore;

#[async_trait::async_trait]
pub trait JobQueue: Send + Sync {
    async fn enqueue(&self, job: Job) -> Result<(), QueueError>;
    async fn claim(&self, queue: JobQueueKind, limit: usize, worker_id: &str) -> Result<Vec<Job>, QueueError>;
    async fn complete(&self, job: Job) -> Result<(), QueueError>;
    /// Reschedules `job` `delay` from now, incrementing its attempt counter
    /// (§2.3 "per-message retry with exponential backoff").
    async fn retry(&self, job: Job, delay: Duration) -> Result<(), QueueError>;
    async fn dead_letter(&self, job: Job, reason: String) -> Result<(), QueueError>;
    /// Cancels every pending/processing job belonging to `run_id` (§5
    /// cancellation semantics).
    async fn cancel_for_run(&self, run_id: &RunId) -> Result<(), QueueError>;
}

impl From<StoreError> for QueueError {
    fn from(e: StoreError) -> Self {
        QueueError::Backend(e.to_string())
    }
}

pub struct StoreBackedQueue {
    store: Arc<dyn StateStore>,
}

impl StoreBackedQueue {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        StoreBackedQueue { store }
    }
}

#[async_trait::async_trait]
impl JobQueue for StoreBackedQueue {
    async fn enqueue(&self, job: Job) -> Result<(), QueueError> {
        self.store.create_job(job).await?;
        Ok(())
    }

    async fn claim(&self, queue: JobQueueKind, limit: usize, worker_id: &str) -> Result<Vec<Job>, QueueError> {
        Ok(self.store.claim_due_jobs(queue, Utc::now(), limit, worker_id).await?)
    }

    async fn complete(&self, mut job: Job) -> Result<(), QueueError> {
        job.status = JobStatus::Completed;
        job.completed_at = Some(Utc::now());
        self.store.update_job(job).await?;
        Ok(())
    }

    async fn retry(&self, mut job: Job, delay: Duration) -> Result<(), QueueError> {
        job.status = JobStatus::Pending;
        job.scheduled_for = Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default();
        self.store.update_job(job).await?;
        Ok(())
    }

    async fn dead_letter(&self, mut job: Job, reason: String) -> Result<(), QueueError> {
        job.status = JobStatus::Failed;
        self.store.update_job(job.clone()).await?;
        self.store
            .push_dead_letter(DeadLetter { id: uuid::Uuid::new_v4().to_string(), job, reason, created_at: Utc::now() })
            .await?;
        Ok(())
    }

    async fn cancel_for_run(&self, run_id: &RunId) -> Result<(), QueueError> {
        let jobs = self.store.jobs_for_run(run_id).await?;
        for mut job in jobs {
            if matches!(job.status, JobStatus::Pending | JobStatus::Processing | JobStatus::Waiting) {
                job.status = JobStatus::Cancelled;
                self.store.update_job(job).await?;
            }
        }
        Ok(())
    }
}

/// Exponential backoff with ±20% jitter (§7): `2^attempt` seconds, base
/// configurable via `RetryConfig`.
pub fn backoff_delay(attempt: u32, base_seconds: u64, jitter_pct: f64) -> Duration {
    let base = base_seconds.saturating_pow(attempt.min(16));
    let jitter_span = (base as f64) * jitter_pct;
    let jitter = rand::random::<f64>() * 2.0 * jitter_span - jitter_span;
    let secs = (base as f64 + jitter).max(0.0);
    Duration::from_secs_f64(secs)
}

/// Computed `scheduledFor` for a delayed enqueue (§4.1 step f).
pub fn scheduled_for(delay_seconds: i64) -> DateTime<Utc> {
    Utc::now() + chrono::Duration::seconds(delay_seconds.max(0))
}
