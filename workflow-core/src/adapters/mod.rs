//! Adapter Ports (§4.4): narrow outbound interfaces to external systems.
//! Concrete Meta Cloud/Twilio/ElevenLabs/SMTP implementations are external
//! collaborators and out of scope (§1); this module defines the contracts
//! plus in-memory fakes used by tests.

pub mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::AdapterError;
use crate::model::TenantId;

/// Deterministic string passed to an adapter so it (and/or the upstream
/// provider) can suppress duplicate side effects across retries (glossary).
pub type IdempotencyKey = String;

pub fn idempotency_key(run_id: &str, node_id: &str, attempt: u32) -> IdempotencyKey {
    // Attempts 2+ reuse attempt 1's key when the adapter supports replay
    // dedup (§4.2); adapters that don't still receive a stable key per run+node.
    let _ = attempt;
    format!("run:{run_id}:node:{node_id}:attempt:1")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagingSendRequest {
    pub channel: String,
    pub tenant_id: TenantId,
    pub to: String,
    pub template_id: Option<String>,
    pub variables: HashMap<String, serde_json::Value>,
    pub body: Option<String>,
    pub buttons: Vec<String>,
    pub idempotency_key: IdempotencyKey,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagingSendResult {
    pub provider_message_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailSendRequest {
    pub tenant_id: TenantId,
    pub to: String,
    pub subject: String,
    pub body: String,
    pub idempotency_key: IdempotencyKey,
}

#[async_trait]
pub trait MessagingAdapter: Send + Sync {
    async fn send(&self, request: MessagingSendRequest) -> Result<MessagingSendResult, AdapterError>;
    async fn send_email(&self, request: EmailSendRequest) -> Result<MessagingSendResult, AdapterError>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoicePlaceRequest {
    pub tenant_id: TenantId,
    pub to: String,
    pub agent_ref: String,
    pub variables: HashMap<String, serde_json::Value>,
    /// Echoed back by the provider in the completion callback (§4.4).
    pub metadata: HashMap<String, serde_json::Value>,
    pub idempotency_key: IdempotencyKey,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoicePlaceResult {
    pub provider_call_id: String,
    pub provider_conversation_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoiceOutcome {
    pub status: String,
    pub duration_secs: Option<i64>,
    pub analysis: Option<serde_json::Value>,
}

#[async_trait]
pub trait VoiceAdapter: Send + Sync {
    async fn place(&self, request: VoicePlaceRequest) -> Result<VoicePlaceResult, AdapterError>;
    /// Polling fallback (§4.4), used by `POST /webhook/voice/poll`.
    async fn fetch_outcome(&self, provider_conversation_id: &str) -> Result<VoiceOutcome, AdapterError>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskCreateRequest {
    pub tenant_id: TenantId,
    pub run_id: String,
    pub node_id: String,
    pub lead_id: String,
    pub task_kind: String,
    pub due_at: chrono::DateTime<chrono::Utc>,
    pub assignment: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskCreateResult {
    pub task_id: String,
}

#[async_trait]
pub trait TaskAdapter: Send + Sync {
    async fn create(&self, request: TaskCreateRequest) -> Result<TaskCreateResult, AdapterError>;
}

/// Admin notification payload (§7 "User-visible surfaces"), dispatched via
/// the messaging adapter's email path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminNotification {
    pub definition_id: String,
    pub lead_id: String,
    pub node_id: String,
    pub error: String,
    pub attempts: u32,
    pub run_id: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

pub struct AdminNotifier {
    messaging: std::sync::Arc<dyn MessagingAdapter>,
    admin_email: String,
}

impl AdminNotifier {
    pub fn new(messaging: std::sync::Arc<dyn MessagingAdapter>, admin_email: impl Into<String>) -> Self {
        AdminNotifier { messaging, admin_email: admin_email.into() }
    }

    pub async fn notify(&self, tenant_id: &TenantId, notification: AdminNotification) {
        let body = serde_json::to_string_pretty(&notification).unwrap_or_default();
        let request = EmailSendRequest {
            tenant_id: tenant_id.clone(),
            to: self.admin_email.clone(),
            subject: format!("Workflow run {} failed on node {}", notification.run_id, notification.node_id),
            body,
            idempotency_key: format!("admin-notify:{}:{}", notification.run_id, notification.node_id),
        };
        if let Err(err) = self.messaging.send_email(request).await {
            tracing::error!(%err, run_id = %notification.run_id, "failed to dispatch admin notification");
        }
    }
}
