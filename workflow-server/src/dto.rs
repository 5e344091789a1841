//! Request/response DTOs for the §6 webhook and admin routes.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncomingMessage {
    pub kind: String,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub button_payload: Option<String>,
    #[serde(default)]
    pub button_text: Option<String>,
    #[serde(default)]
    pub provider_message_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagingReplyPayload {
    pub tenant_id: String,
    pub from: String,
    #[serde(default)]
    pub received_at: Option<chrono::DateTime<chrono::Utc>>,
    pub messages: Vec<IncomingMessage>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagingReplyResult {
    pub processed: usize,
    pub resumed: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VerifyQuery {
    #[serde(rename = "hub.mode")]
    pub mode: Option<String>,
    #[serde(rename = "hub.verify_token")]
    pub verify_token: Option<String>,
    #[serde(rename = "hub.challenge")]
    pub challenge: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoiceOutcomePayload {
    #[serde(default)]
    pub provider_conversation_id: Option<String>,
    #[serde(default)]
    pub provider_call_id: Option<String>,
    #[serde(default)]
    pub callback_run_id: Option<String>,
    pub status: String,
    #[serde(default)]
    pub duration_secs: Option<i64>,
    #[serde(default)]
    pub analysis: Option<serde_json::Value>,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskCompletedPayload {
    pub task_id: String,
    pub completion_result: String,
    #[serde(default)]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RecoverQuery {
    pub hours: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CleanupQuery {
    pub days: Option<i64>,
    #[serde(rename = "failedDays")]
    pub failed_days: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmitLeadPayload {
    pub tenant_id: String,
    pub lead_id: String,
    pub lead: serde_json::Value,
    #[serde(default)]
    pub changes: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmitAppointmentPayload {
    pub tenant_id: String,
    pub lead_id: String,
    pub lead: serde_json::Value,
    pub appointment: serde_json::Value,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmitManualPayload {
    pub tenant_id: String,
    pub lead_id: String,
    pub lead: serde_json::Value,
    pub definition_id: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EmitResult {
    pub event_id: String,
    pub created_run_ids: Vec<String>,
    pub skips: Vec<(String, String)>,
    pub errors: Vec<(String, String)>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoverResult {
    pub scanned: u64,
    pub jobs_reset: u64,
    pub failed_stuck: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupResult {
    pub runs_deleted: u64,
    pub jobs_deleted: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupStatsResponse {
    pub prunable_runs: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub totals: u64,
    pub active: u64,
    pub waiting: u64,
    #[serde(rename = "completed24h")]
    pub completed_24h: u64,
    #[serde(rename = "failed24h")]
    pub failed_24h: u64,
    pub stuck: u64,
    pub pending_jobs: u64,
    pub processing_jobs: u64,
    pub health_score: u8,
}
