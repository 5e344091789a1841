//! The State Store repository: durable storage of definitions, runs, jobs,
//! and the execution log (§2.2, §6 "Persisted state layout"). A small
//! get/put/query-by-indexed-field interface, implemented once in memory (for
//! tests and the in-memory `testing` harness) and once over Postgres.

pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::StoreError;
use crate::model::{
    DeadLetter, DefinitionId, ExecutionLogEntry, Job, JobId, JobQueueKind, LeadId, Run, RunId,
    TenantId, TriggerType, WorkflowDefinition,
};

/// Outcome of a per-definition trigger-matching pass, kept for observability
/// (§4.1 step 4 "record the error per candidate and continue").
#[derive(Debug, Clone)]
pub struct MatchSkip {
    pub definition_id: DefinitionId,
    pub reason: String,
}

#[async_trait]
pub trait StateStore: Send + Sync {
    // --- Definitions ---------------------------------------------------
    async fn get_definition(&self, id: &DefinitionId) -> Result<Option<WorkflowDefinition>, StoreError>;

    async fn save_definition(&self, definition: WorkflowDefinition) -> Result<(), StoreError>;

    /// `tenantId`-scoped, `isActive = true`, `triggerType` matching candidates
    /// (§4.1 step 2). Callers apply the trigger-type backward-compat mapping
    /// before calling, so this is a plain equality scan server-side.
    async fn list_candidate_definitions(
        &self,
        tenant_id: &TenantId,
        trigger_type: TriggerType,
    ) -> Result<Vec<WorkflowDefinition>, StoreError>;

    async fn increment_runs_count(&self, id: &DefinitionId, at: DateTime<Utc>) -> Result<(), StoreError>;
    async fn increment_success_count(&self, id: &DefinitionId) -> Result<(), StoreError>;
    async fn increment_failure_count(&self, id: &DefinitionId) -> Result<(), StoreError>;

    // --- Runs ------------------------------------------------------------
    async fn get_run(&self, id: &RunId) -> Result<Option<Run>, StoreError>;

    async fn create_run(&self, run: Run) -> Result<(), StoreError>;

    /// Compare-and-set write keyed on `run.version` (§5 "Concurrent mutation
    /// is prevented by a compare-and-set on... a monotonic version field").
    /// `run.version` must equal the currently stored version; the store bumps
    /// it by one and updates `updated_at`. Losers get `VersionConflict` and
    /// must retry their read-modify-write cycle.
    async fn cas_update_run(&self, run: Run) -> Result<Run, StoreError>;

    /// All runs ever created for a (definition, lead) pair, used by the
    /// `runOncePerLead` / `preventDuplicates` / cooldown checks (§4.1).
    async fn runs_for_definition_lead(
        &self,
        definition_id: &DefinitionId,
        lead_id: &LeadId,
    ) -> Result<Vec<Run>, StoreError>;

    /// Active run matching `(tenantId, phone)` with `waitingForReply` set,
    /// most-recently-started first (§4.3 "most recent wins").
    async fn find_waiting_for_reply_by_phone(
        &self,
        tenant_id: &TenantId,
        normalized_phone: &str,
    ) -> Result<Vec<Run>, StoreError>;

    async fn find_waiting_for_call(
        &self,
        provider_call_id: Option<&str>,
        provider_conversation_id: Option<&str>,
        callback_run_id: Option<&RunId>,
    ) -> Result<Option<Run>, StoreError>;

    async fn find_waiting_for_task(&self, task_id: &str) -> Result<Option<Run>, StoreError>;

    /// Every run currently in `waitingForCall` (§6 `POST /webhook/voice/poll`
    /// polling fallback over `VoiceAdapter::fetch_outcome`).
    async fn list_waiting_for_call_runs(&self) -> Result<Vec<Run>, StoreError>;

    /// Runs in an active state whose `updated_at` is older than `threshold`
    /// (§4.5 reclaim scan).
    async fn list_stuck_runs(&self, threshold: DateTime<Utc>) -> Result<Vec<Run>, StoreError>;

    /// Terminal runs eligible for pruning (§4.5).
    async fn list_prunable_runs(
        &self,
        completed_before: DateTime<Utc>,
        failed_or_cancelled_before: DateTime<Utc>,
    ) -> Result<Vec<RunId>, StoreError>;

    async fn delete_run(&self, id: &RunId) -> Result<(), StoreError>;

    // --- Jobs --------------------------------------------------------------
    async fn get_job(&self, id: &JobId) -> Result<Option<Job>, StoreError>;
    async fn create_job(&self, job: Job) -> Result<(), StoreError>;
    async fn update_job(&self, job: Job) -> Result<(), StoreError>;
    async fn jobs_for_run(&self, run_id: &RunId) -> Result<Vec<Job>, StoreError>;

    /// Pending jobs due at or before `now` on `queue`, claimed by no one yet.
    /// Implementations should claim atomically (e.g. `FOR UPDATE SKIP
    /// LOCKED`) so two workers never dequeue the same job.
    async fn claim_due_jobs(
        &self,
        queue: JobQueueKind,
        now: DateTime<Utc>,
        limit: usize,
        worker_id: &str,
    ) -> Result<Vec<Job>, StoreError>;

    /// Jobs stuck `processing` past `threshold` with no live worker (§4.5 S6).
    async fn list_stuck_processing_jobs(&self, threshold: DateTime<Utc>) -> Result<Vec<Job>, StoreError>;

    async fn delete_orphaned_and_old_jobs(
        &self,
        completed_before: DateTime<Utc>,
    ) -> Result<u64, StoreError>;

    // --- Dead letters --------------------------------------------------------
    async fn push_dead_letter(&self, dead_letter: DeadLetter) -> Result<(), StoreError>;
    async fn list_dead_letters(&self) -> Result<Vec<DeadLetter>, StoreError>;
    async fn get_dead_letter(&self, id: &str) -> Result<Option<DeadLetter>, StoreError>;
    async fn remove_dead_letter(&self, id: &str) -> Result<(), StoreError>;

    // --- Execution log -------------------------------------------------------
    async fn append_log_entry(&self, entry: ExecutionLogEntry) -> Result<(), StoreError>;
    async fn log_for_run(&self, run_id: &RunId) -> Result<Vec<ExecutionLogEntry>, StoreError>;

    // --- Health --------------------------------------------------------------
    async fn health_counts(&self, now: DateTime<Utc>) -> Result<HealthCounts, StoreError>;
}

/// Raw counts the admin health endpoint (§6) assembles a score from.
#[derive(Debug, Clone, Default)]
pub struct HealthCounts {
    pub total_runs: u64,
    pub active_runs: u64,
    pub waiting_runs: u64,
    pub completed_24h: u64,
    pub failed_24h: u64,
    pub stuck_runs: u64,
    pub pending_jobs: u64,
    pub processing_jobs: u64,
    pub failed_jobs_last_hour: u64,
}
