//! A Run: one execution instance of one definition against one lead.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::definition::{DefinitionId, ExpectedOutcome, ExpectedResponse, LeadId, NodeId, TenantId};

pub type RunId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RunStatus {
    Pending,
    Running,
    WaitingForReply,
    WaitingForCall,
    WaitingForTask,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled)
    }

    pub fn is_active(self) -> bool {
        !self.is_terminal()
    }

    pub fn is_waiting(self) -> bool {
        matches!(
            self,
            RunStatus::WaitingForReply | RunStatus::WaitingForCall | RunStatus::WaitingForTask
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PathEntryStatus {
    Pending,
    Running,
    Waiting,
    Completed,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionPathEntry {
    pub node_id: NodeId,
    pub kind: String,
    pub label: String,
    pub status: PathEntryStatus,
    pub scheduled_for: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WaitingForReply {
    pub node_id: NodeId,
    pub timeout_at: DateTime<Utc>,
    pub expected_responses: Vec<ExpectedResponse>,
    pub timeout_handle: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WaitingForCall {
    pub node_id: NodeId,
    pub provider_call_id: Option<String>,
    pub provider_conversation_id: Option<String>,
    pub timeout_at: DateTime<Utc>,
    pub expected_outcomes: Vec<ExpectedOutcome>,
    pub timeout_handle: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WaitingForTask {
    pub node_id: NodeId,
    pub task_id: String,
}

/// Free-form key/value bag: last message id, last call outcome, captured
/// reply variables, counters. Stored as JSON; callers pull typed values out
/// through the small accessor helpers below.
pub type RunContext = HashMap<String, serde_json::Value>;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Run {
    pub id: RunId,
    pub tenant_id: TenantId,
    pub definition_id: DefinitionId,
    pub lead_id: LeadId,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub current_node_id: Option<NodeId>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub context: RunContext,
    #[serde(default)]
    pub execution_path: Vec<ExecutionPathEntry>,
    #[serde(default)]
    pub waiting_for_reply: Option<WaitingForReply>,
    #[serde(default)]
    pub waiting_for_call: Option<WaitingForCall>,
    #[serde(default)]
    pub waiting_for_task: Option<WaitingForTask>,
    /// Monotonic version used for compare-and-set writes (§5). Every mutating
    /// store call must be given the version it read and bumps it by one.
    #[serde(default)]
    pub version: i64,
    /// Last time any field on this run changed; the Supervisor's reclaim scan
    /// keys off this (§4.5).
    pub updated_at: DateTime<Utc>,
}

impl Run {
    pub fn new(id: RunId, tenant_id: TenantId, definition_id: DefinitionId, lead_id: LeadId, now: DateTime<Utc>) -> Self {
        Run {
            id,
            tenant_id,
            definition_id,
            lead_id,
            status: RunStatus::Pending,
            started_at: now,
            completed_at: None,
            current_node_id: None,
            error: None,
            context: RunContext::new(),
            execution_path: Vec::new(),
            waiting_for_reply: None,
            waiting_for_call: None,
            waiting_for_task: None,
            version: 0,
            updated_at: now,
        }
    }

    pub fn path_entry_mut(&mut self, node_id: &str) -> Option<&mut ExecutionPathEntry> {
        self.execution_path.iter_mut().find(|e| e.node_id == node_id)
    }

    pub fn is_waiting_on(&self, node_id: &str) -> bool {
        self.waiting_for_reply.as_ref().map(|w| w.node_id.as_str()) == Some(node_id)
            || self.waiting_for_call.as_ref().map(|w| w.node_id.as_str()) == Some(node_id)
            || self.waiting_for_task.as_ref().map(|w| w.node_id.as_str()) == Some(node_id)
    }

    pub fn clear_waits(&mut self) {
        self.waiting_for_reply = None;
        self.waiting_for_call = None;
        self.waiting_for_task = None;
    }
}
