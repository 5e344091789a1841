//! The Supervisor (§4.5): periodic reclaim of stuck runs, pruning of old
//! terminal runs/jobs, and the health-score computation behind
//! `GET /workflows/health`.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::config::{RetentionConfig, SupervisorConfig};
use crate::error::ExecutorError;
use crate::model::{JobStatus, Run, RunId, RunStatus};
use crate::queue::JobQueue;
use crate::resumer::Resumer;
use crate::store::{HealthCounts, StateStore};

pub struct Supervisor {
    store: Arc<dyn StateStore>,
    queue: Arc<dyn JobQueue>,
    resumer: Arc<Resumer>,
    config: SupervisorConfig,
    retention: RetentionConfig,
}

/// What `reclaim_one` did for a single stuck run, so the caller can roll it
/// up into `ReclaimReport`'s per-outcome counters.
enum ReclaimAction {
    NoOp,
    TimeoutFired,
    MarkedFailed,
}

/// Outcome of one reclaim pass (§6 `POST /workflows/recover`), for the
/// caller to log/report.
#[derive(Debug, Clone, Default)]
pub struct ReclaimReport {
    pub scanned: u64,
    pub jobs_reset: u64,
    pub timeouts_fired: u64,
    pub failed_stuck: u64,
}

/// Outcome of one prune pass (§6 `POST /workflows/cleanup`).
#[derive(Debug, Clone, Default)]
pub struct PruneReport {
    pub runs_deleted: u64,
    pub jobs_deleted: u64,
}

/// Preview counts under the retention policy (§6 `GET /workflows/cleanup-stats`).
#[derive(Debug, Clone, Default)]
pub struct CleanupStats {
    pub prunable_runs: u64,
    pub orphaned_or_old_jobs_estimate: u64,
}

#[derive(Debug, Clone)]
pub struct HealthReport {
    pub totals: u64,
    pub active: u64,
    pub waiting: u64,
    pub completed_24h: u64,
    pub failed_24h: u64,
    pub stuck: u64,
    pub pending_jobs: u64,
    pub processing_jobs: u64,
    pub health_score: u8,
}

impl Supervisor {
    pub fn new(
        store: Arc<dyn StateStore>,
        queue: Arc<dyn JobQueue>,
        resumer: Arc<Resumer>,
        config: SupervisorConfig,
        retention: RetentionConfig,
    ) -> Self {
        Supervisor { store, queue, resumer, config, retention }
    }

    pub fn scan_interval(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.config.scan_interval_minutes)
    }

    /// Reclaim pass (§4.5 "Reclaim"): runs last updated more than `hours` ago
    /// (default `stuck_threshold_hours`) are examined and nudged forward.
    pub async fn reclaim(&self, hours: Option<i64>) -> Result<ReclaimReport, ExecutorError> {
        let threshold_hours = hours.unwrap_or(self.config.stuck_threshold_hours);
        let threshold = Utc::now() - chrono::Duration::hours(threshold_hours);

        let mut report = ReclaimReport::default();

        // Stuck `processing` jobs with no live worker (§8 S6): reset to pending.
        let stuck_jobs = self.store.list_stuck_processing_jobs(threshold).await?;
        for mut job in stuck_jobs {
            job.status = JobStatus::Pending;
            job.scheduled_for = Utc::now();
            self.store.update_job(job).await?;
            report.jobs_reset += 1;
        }

        let stuck_runs = self.store.list_stuck_runs(threshold).await?;
        for run in stuck_runs {
            report.scanned += 1;
            match self.reclaim_one(&run, Utc::now()).await {
                Ok(ReclaimAction::TimeoutFired) => report.timeouts_fired += 1,
                Ok(ReclaimAction::MarkedFailed) => report.failed_stuck += 1,
                Ok(ReclaimAction::NoOp) => {}
                Err(err) => warn!(run_id = %run.id, %err, "failed to reclaim stuck run"),
            }
        }

        Ok(report)
    }

    async fn reclaim_one(&self, run: &Run, now: DateTime<Utc>) -> Result<ReclaimAction, ExecutorError> {
        let jobs = self.store.jobs_for_run(&run.id).await?;
        let has_due_pending = jobs.iter().any(|j| j.status == JobStatus::Pending && j.scheduled_for <= now);
        if has_due_pending {
            // A pending job exists and is due; the executor/timeout pools
            // will pick it up on their next poll. Nothing further to do.
            return Ok(ReclaimAction::NoOp);
        }

        if let Some(wait) = &run.waiting_for_reply {
            info!(run_id = %run.id, node_id = %wait.node_id, "reclaiming stuck reply wait via timeout path");
            self.resumer.handle_timeout(&run.id, &wait.node_id).await?;
            return Ok(ReclaimAction::TimeoutFired);
        }
        if let Some(wait) = &run.waiting_for_call {
            info!(run_id = %run.id, node_id = %wait.node_id, "reclaiming stuck call wait via timeout path");
            self.resumer.handle_timeout(&run.id, &wait.node_id).await?;
            return Ok(ReclaimAction::TimeoutFired);
        }
        if run.waiting_for_task.is_some() {
            // No implicit timeout for human tasks unless the node itself
            // configured one, which surfaces as a normal Timeout-queue job;
            // nothing to reclaim here beyond the job reset above.
            return Ok(ReclaimAction::NoOp);
        }

        let outstanding = jobs
            .iter()
            .any(|j| matches!(j.status, JobStatus::Pending | JobStatus::Processing | JobStatus::Waiting));
        if !outstanding {
            warn!(run_id = %run.id, "run stuck with no pending work, marking failed");
            let mut updated = run.clone();
            updated.status = RunStatus::Failed;
            updated.error = Some("stuck with no pending work".to_string());
            updated.completed_at = Some(now);
            self.store.cas_update_run(updated).await?;
            return Ok(ReclaimAction::MarkedFailed);
        }
        Ok(ReclaimAction::NoOp)
    }

    /// Prune pass (§4.5 "Prune"): deletes terminal runs and old/orphaned jobs
    /// past the retention windows.
    pub async fn prune(&self, completed_days: Option<i64>, failed_days: Option<i64>) -> Result<PruneReport, ExecutorError> {
        let completed_before = Utc::now() - chrono::Duration::days(completed_days.unwrap_or(self.retention.completed_days));
        let failed_before = Utc::now() - chrono::Duration::days(failed_days.unwrap_or(self.retention.failed_days));

        let prunable: Vec<RunId> = self.store.list_prunable_runs(completed_before, failed_before).await?;
        let mut report = PruneReport::default();
        for run_id in prunable {
            self.queue.cancel_for_run(&run_id).await.ok();
            self.store.delete_run(&run_id).await?;
            report.runs_deleted += 1;
        }

        let job_completed_before = Utc::now() - chrono::Duration::days(self.retention.job_completed_days);
        report.jobs_deleted = self.store.delete_orphaned_and_old_jobs(job_completed_before).await?;

        Ok(report)
    }

    /// Preview counts under the retention policy without deleting anything
    /// (§6 `GET /workflows/cleanup-stats`).
    pub async fn cleanup_stats(&self, completed_days: Option<i64>, failed_days: Option<i64>) -> Result<CleanupStats, ExecutorError> {
        let completed_before = Utc::now() - chrono::Duration::days(completed_days.unwrap_or(self.retention.completed_days));
        let failed_before = Utc::now() - chrono::Duration::days(failed_days.unwrap_or(self.retention.failed_days));
        let prunable = self.store.list_prunable_runs(completed_before, failed_before).await?;
        Ok(CleanupStats { prunable_runs: prunable.len() as u64, orphaned_or_old_jobs_estimate: 0 })
    }

    /// Health counts and score (§4.5 "Health", §6 scoring rules).
    pub async fn health(&self) -> Result<HealthReport, ExecutorError> {
        let now = Utc::now();
        let counts = self.store.health_counts(now).await?;
        Ok(HealthReport {
            totals: counts.total_runs,
            active: counts.active_runs,
            waiting: counts.waiting_runs,
            completed_24h: counts.completed_24h,
            failed_24h: counts.failed_24h,
            stuck: counts.stuck_runs,
            pending_jobs: counts.pending_jobs,
            processing_jobs: counts.processing_jobs,
            health_score: health_score(&counts),
        })
    }
}

/// §6 health score: starts at 100, deducts per threshold crossed.
fn health_score(counts: &HealthCounts) -> u8 {
    let mut score: i32 = 100;

    score -= if counts.failed_24h > 10 {
        20
    } else if counts.failed_24h >= 5 {
        10
    } else if counts.failed_24h > 0 {
        5
    } else {
        0
    };

    score -= if counts.processing_jobs > 10 {
        15
    } else if counts.processing_jobs >= 5 {
        10
    } else {
        0
    };

    score -= if counts.failed_jobs_last_hour > 5 {
        20
    } else if counts.failed_jobs_last_hour > 0 {
        10
    } else {
        0
    };

    score -= if counts.pending_jobs > 100 {
        10
    } else if counts.pending_jobs > 50 {
        5
    } else {
        0
    };

    score.clamp(0, 100) as u8
}
