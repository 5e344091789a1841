//! In-memory `StateStore`, used by `workflow-core::testing` and by the
//! scenario integration tests (§8 S1-S6) so engine semantics can be verified
//! without a live Postgres instance.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::StoreError;
use crate::model::{
    DeadLetter, DefinitionId, ExecutionLogEntry, Job, JobId, JobQueueKind, JobStatus, LeadId, Run,
    RunId, RunStatus, TenantId, TriggerType, WorkflowDefinition,
};

use super::{HealthCounts, StateStore};

#[derive(Default)]
struct Inner {
    definitions: HashMap<DefinitionId, WorkflowDefinition>,
    runs: HashMap<RunId, Run>,
    jobs: HashMap<JobId, Job>,
    dead_letters: HashMap<String, DeadLetter>,
    log: Vec<ExecutionLogEntry>,
}

/// A `Mutex`-guarded in-memory store. Single-process only; sufficient for
/// tests, not for horizontal scaling (§5 assumes a shared Postgres backend
/// there).
pub struct InMemoryStore {
    inner: Mutex<Inner>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        InMemoryStore { inner: Mutex::new(Inner::default()) }
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poison| poison.into_inner())
    }
}

#[async_trait]
impl StateStore for InMemoryStore {
    async fn get_definition(&self, id: &DefinitionId) -> Result<Option<WorkflowDefinition>, StoreError> {
        Ok(self.lock().definitions.get(id).cloned())
    }

    async fn save_definition(&self, definition: WorkflowDefinition) -> Result<(), StoreError> {
        self.lock().definitions.insert(definition.id.clone(), definition);
        Ok(())
    }

    async fn list_candidate_definitions(
        &self,
        tenant_id: &TenantId,
        trigger_type: TriggerType,
    ) -> Result<Vec<WorkflowDefinition>, StoreError> {
        let wanted = trigger_type.normalized();
        Ok(self
            .lock()
            .definitions
            .values()
            .filter(|d| d.tenant_id == *tenant_id && d.is_active && d.trigger_type.normalized() == wanted)
            .cloned()
            .collect())
    }

    async fn increment_runs_count(&self, id: &DefinitionId, at: DateTime<Utc>) -> Result<(), StoreError> {
        let mut guard = self.lock();
        let def = guard
            .definitions
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(format!("definition {id}")))?;
        def.stats.runs_count += 1;
        def.stats.last_run_at = Some(at);
        Ok(())
    }

    async fn increment_success_count(&self, id: &DefinitionId) -> Result<(), StoreError> {
        let mut guard = self.lock();
        let def = guard
            .definitions
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(format!("definition {id}")))?;
        def.stats.success_count += 1;
        Ok(())
    }

    async fn increment_failure_count(&self, id: &DefinitionId) -> Result<(), StoreError> {
        let mut guard = self.lock();
        let def = guard
            .definitions
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(format!("definition {id}")))?;
        def.stats.failure_count += 1;
        Ok(())
    }

    async fn get_run(&self, id: &RunId) -> Result<Option<Run>, StoreError> {
        Ok(self.lock().runs.get(id).cloned())
    }

    async fn create_run(&self, run: Run) -> Result<(), StoreError> {
        self.lock().runs.insert(run.id.clone(), run);
        Ok(())
    }

    async fn cas_update_run(&self, mut run: Run) -> Result<Run, StoreError> {
        let mut guard = self.lock();
        let current = guard
            .runs
            .get(&run.id)
            .ok_or_else(|| StoreError::NotFound(format!("run {}", run.id)))?;
        if current.version != run.version {
            return Err(StoreError::VersionConflict { entity: "run", id: run.id.clone() });
        }
        run.version += 1;
        run.updated_at = Utc::now();
        guard.runs.insert(run.id.clone(), run.clone());
        Ok(run)
    }

    async fn runs_for_definition_lead(
        &self,
        definition_id: &DefinitionId,
        lead_id: &LeadId,
    ) -> Result<Vec<Run>, StoreError> {
        Ok(self
            .lock()
            .runs
            .values()
            .filter(|r| r.definition_id == *definition_id && r.lead_id == *lead_id)
            .cloned()
            .collect())
    }

    async fn find_waiting_for_reply_by_phone(
        &self,
        tenant_id: &TenantId,
        _normalized_phone: &str,
    ) -> Result<Vec<Run>, StoreError> {
        // The in-memory store has no lead table to join against; callers
        // (trigger matcher/resumer tests) pre-filter by phone via context.
        let mut runs: Vec<Run> = self
            .lock()
            .runs
            .values()
            .filter(|r| r.tenant_id == *tenant_id && r.waiting_for_reply.is_some())
            .cloned()
            .collect();
        runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(runs)
    }

    async fn find_waiting_for_call(
        &self,
        provider_call_id: Option<&str>,
        provider_conversation_id: Option<&str>,
        callback_run_id: Option<&RunId>,
    ) -> Result<Option<Run>, StoreError> {
        let guard = self.lock();
        if let Some(cid) = provider_call_id {
            if let Some(r) = guard.runs.values().find(|r| {
                r.waiting_for_call.as_ref().and_then(|w| w.provider_call_id.as_deref()) == Some(cid)
            }) {
                return Ok(Some(r.clone()));
            }
        }
        if let Some(convo) = provider_conversation_id {
            if let Some(r) = guard.runs.values().find(|r| {
                r.waiting_for_call.as_ref().and_then(|w| w.provider_conversation_id.as_deref()) == Some(convo)
            }) {
                return Ok(Some(r.clone()));
            }
        }
        if let Some(run_id) = callback_run_id {
            if let Some(r) = guard.runs.get(run_id) {
                if r.waiting_for_call.is_some() {
                    return Ok(Some(r.clone()));
                }
            }
        }
        Ok(None)
    }

    async fn find_waiting_for_task(&self, task_id: &str) -> Result<Option<Run>, StoreError> {
        Ok(self
            .lock()
            .runs
            .values()
            .find(|r| r.waiting_for_task.as_ref().map(|w| w.task_id.as_str()) == Some(task_id))
            .cloned())
    }

    async fn list_waiting_for_call_runs(&self) -> Result<Vec<Run>, StoreError> {
        Ok(self.lock().runs.values().filter(|r| r.waiting_for_call.is_some()).cloned().collect())
    }

    async fn list_stuck_runs(&self, threshold: DateTime<Utc>) -> Result<Vec<Run>, StoreError> {
        Ok(self
            .lock()
            .runs
            .values()
            .filter(|r| r.status.is_active() && r.updated_at < threshold)
            .cloned()
            .collect())
    }

    async fn list_prunable_runs(
        &self,
        completed_before: DateTime<Utc>,
        failed_or_cancelled_before: DateTime<Utc>,
    ) -> Result<Vec<RunId>, StoreError> {
        Ok(self
            .lock()
            .runs
            .values()
            .filter(|r| match r.status {
                RunStatus::Completed => r.completed_at.map(|t| t < completed_before).unwrap_or(false),
                RunStatus::Failed | RunStatus::Cancelled => {
                    r.completed_at.map(|t| t < failed_or_cancelled_before).unwrap_or(false)
                }
                _ => false,
            })
            .map(|r| r.id.clone())
            .collect())
    }

    async fn delete_run(&self, id: &RunId) -> Result<(), StoreError> {
        self.lock().runs.remove(id);
        Ok(())
    }

    async fn get_job(&self, id: &JobId) -> Result<Option<Job>, StoreError> {
        Ok(self.lock().jobs.get(id).cloned())
    }

    async fn create_job(&self, job: Job) -> Result<(), StoreError> {
        self.lock().jobs.insert(job.id.clone(), job);
        Ok(())
    }

    async fn update_job(&self, job: Job) -> Result<(), StoreError> {
        self.lock().jobs.insert(job.id.clone(), job);
        Ok(())
    }

    async fn jobs_for_run(&self, run_id: &RunId) -> Result<Vec<Job>, StoreError> {
        Ok(self.lock().jobs.values().filter(|j| j.run_id == *run_id).cloned().collect())
    }

    async fn claim_due_jobs(
        &self,
        queue: JobQueueKind,
        now: DateTime<Utc>,
        limit: usize,
        _worker_id: &str,
    ) -> Result<Vec<Job>, StoreError> {
        let mut guard = self.lock();
        let due_ids: Vec<JobId> = guard
            .jobs
            .values()
            .filter(|j| j.queue == queue && j.is_due(now))
            .map(|j| j.id.clone())
            .take(limit)
            .collect();
        let mut claimed = Vec::with_capacity(due_ids.len());
        for id in due_ids {
            if let Some(job) = guard.jobs.get_mut(&id) {
                job.status = JobStatus::Processing;
                job.last_attempt_at = Some(now);
                claimed.push(job.clone());
            }
        }
        Ok(claimed)
    }

    async fn list_stuck_processing_jobs(&self, threshold: DateTime<Utc>) -> Result<Vec<Job>, StoreError> {
        Ok(self
            .lock()
            .jobs
            .values()
            .filter(|j| j.status == JobStatus::Processing && j.last_attempt_at.map(|t| t < threshold).unwrap_or(true))
            .cloned()
            .collect())
    }

    async fn delete_orphaned_and_old_jobs(&self, completed_before: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut guard = self.lock();
        let run_ids: std::collections::HashSet<RunId> = guard.runs.keys().cloned().collect();
        let to_remove: Vec<JobId> = guard
            .jobs
            .values()
            .filter(|j| {
                !run_ids.contains(&j.run_id)
                    || (j.status == JobStatus::Completed
                        && j.completed_at.map(|t| t < completed_before).unwrap_or(false))
            })
            .map(|j| j.id.clone())
            .collect();
        let count = to_remove.len() as u64;
        for id in to_remove {
            guard.jobs.remove(&id);
        }
        Ok(count)
    }

    async fn push_dead_letter(&self, dead_letter: DeadLetter) -> Result<(), StoreError> {
        self.lock().dead_letters.insert(dead_letter.id.clone(), dead_letter);
        Ok(())
    }

    async fn list_dead_letters(&self) -> Result<Vec<DeadLetter>, StoreError> {
        Ok(self.lock().dead_letters.values().cloned().collect())
    }

    async fn get_dead_letter(&self, id: &str) -> Result<Option<DeadLetter>, StoreError> {
        Ok(self.lock().dead_letters.get(id).cloned())
    }

    async fn remove_dead_letter(&self, id: &str) -> Result<(), StoreError> {
        self.lock().dead_letters.remove(id);
        Ok(())
    }

    async fn append_log_entry(&self, entry: ExecutionLogEntry) -> Result<(), StoreError> {
        self.lock().log.push(entry);
        Ok(())
    }

    async fn log_for_run(&self, run_id: &RunId) -> Result<Vec<ExecutionLogEntry>, StoreError> {
        let mut entries: Vec<ExecutionLogEntry> =
            self.lock().log.iter().filter(|e| e.run_id == *run_id).cloned().collect();
        entries.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
        Ok(entries)
    }

    async fn health_counts(&self, now: DateTime<Utc>) -> Result<HealthCounts, StoreError> {
        let guard = self.lock();
        let day_ago = now - chrono::Duration::hours(24);
        let hour_ago = now - chrono::Duration::hours(1);
        let mut counts = HealthCounts::default();
        counts.total_runs = guard.runs.len() as u64;
        for r in guard.runs.values() {
            if r.status.is_active() {
                counts.active_runs += 1;
                // Mirrors the Supervisor's default reclaim threshold (§4.5):
                // an active run not touched in 24h counts as stuck here too.
                if r.updated_at < day_ago {
                    counts.stuck_runs += 1;
                }
            }
            if r.status.is_waiting() {
                counts.waiting_runs += 1;
            }
            if r.status == RunStatus::Completed && r.completed_at.map(|t| t >= day_ago).unwrap_or(false) {
                counts.completed_24h += 1;
            }
            if r.status == RunStatus::Failed && r.completed_at.map(|t| t >= day_ago).unwrap_or(false) {
                counts.failed_24h += 1;
            }
        }
        for j in guard.jobs.values() {
            match j.status {
                JobStatus::Pending => counts.pending_jobs += 1,
                JobStatus::Processing => counts.processing_jobs += 1,
                JobStatus::Failed => {
                    if j.last_attempt_at.map(|t| t >= hour_ago).unwrap_or(false) {
                        counts.failed_jobs_last_hour += 1;
                    }
                }
                _ => {}
            }
        }
        Ok(counts)
    }
}
