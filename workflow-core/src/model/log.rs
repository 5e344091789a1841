//! ExecutionLog: an append-only record retained separately from `Run` for
//! analytics, kept outside the mutable entity for audit purposes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::definition::{NodeId, TenantId};
use super::run::RunId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LogStatus {
    Running,
    Success,
    Failed,
    Retrying,
    Timeout,
    Waiting,
    Skipped,
    DeadLetter,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionLogEntry {
    pub tenant_id: TenantId,
    pub run_id: RunId,
    pub node_id: NodeId,
    pub node_kind: String,
    pub label: String,
    pub status: LogStatus,
    pub message: String,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub duration_ms: Option<i64>,
    pub attempt: u32,
    pub worker_id: String,
    #[serde(default)]
    pub metadata: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}
