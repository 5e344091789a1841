//! Job: a durable record mirroring a queue message, used for observability
//! and for the Supervisor's stuck-run reclamation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::definition::{DefinitionId, LeadId, NodeId, TenantId};
use super::run::RunId;

pub type JobId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum JobStatus {
    Pending,
    Processing,
    Waiting,
    Completed,
    Failed,
    Cancelled,
}

/// Which queue a job is logically destined for; used for pool routing and
/// health reporting (§5: trigger / executor / timeout pools).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum JobQueueKind {
    Execute,
    Timeout,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: JobId,
    pub run_id: RunId,
    pub definition_id: DefinitionId,
    pub lead_id: LeadId,
    pub tenant_id: TenantId,
    pub node_id: NodeId,
    pub kind: String,
    /// Snapshot of the node's config at enqueue time (§4.2 input shape).
    pub config: serde_json::Value,
    pub queue: JobQueueKind,
    pub status: JobStatus,
    pub scheduled_for: DateTime<Utc>,
    pub attempts: u32,
    pub max_attempts: u32,
    #[serde(default)]
    pub last_attempt_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Job {
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Pending && self.scheduled_for <= now
    }
}

/// A job payload pushed to the dead-letter queue after all retries exhaust
/// (§7), kept verbatim for manual inspection or replay.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetter {
    pub id: String,
    pub job: Job,
    pub reason: String,
    pub created_at: DateTime<Utc>,
}
