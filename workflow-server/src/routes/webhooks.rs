//! Webhook routes the engine exposes to external providers (§6).

use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use tracing::{info, warn};

use workflow_core::resumer::decompose_reply;

use crate::dto::{
    MessagingReplyPayload, MessagingReplyResult, TaskCompletedPayload, VerifyQuery, VoiceOutcomePayload,
};
use crate::signature;
use crate::state::AppState;

/// `POST /webhook/messaging/reply` (§6). Verifies the tenant's HMAC
/// signature when a secret is configured, then resumes one waiting run per
/// message in the batch.
pub async fn messaging_reply(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> impl IntoResponse {
    let payload: MessagingReplyPayload = match serde_json::from_slice(&body) {
        Ok(p) => p,
        Err(err) => {
            warn!(%err, "malformed messaging reply payload");
            return (StatusCode::BAD_REQUEST, Json(serde_json::json!({ "error": err.to_string() }))).into_response();
        }
    };

    if let Some(secret) = state.secrets.secret_for(&payload.tenant_id) {
        let header_name = &state.config.signature_header;
        let signature = headers.get(header_name.as_str()).and_then(|v| v.to_str().ok());
        let valid = signature.map(|sig| signature::verify(&secret, &body, sig)).unwrap_or(false);
        if !valid {
            warn!(tenant_id = %payload.tenant_id, "messaging reply signature verification failed");
            return (StatusCode::UNAUTHORIZED, Json(serde_json::json!({ "error": "invalid signature" }))).into_response();
        }
    } else {
        warn!(tenant_id = %payload.tenant_id, "no webhook secret configured for tenant, skipping signature verification");
    }

    let default_prefix = &state.config.default_country_prefix;
    let normalized_from = normalize(&payload.from, default_prefix);

    let mut resumed = 0usize;
    for message in &payload.messages {
        let reply = decompose_reply(&message.kind, message.text.clone(), message.button_payload.clone(), message.button_text.clone());
        match state.resumer.handle_reply(&payload.tenant_id, &normalized_from, &reply).await {
            Ok(workflow_core::resumer::ResumeOutcome::Resumed { run_id, handle }) => {
                info!(run_id = %run_id, handle = %handle, "messaging reply resumed run");
                resumed += 1;
            }
            Ok(workflow_core::resumer::ResumeOutcome::NoMatch) => {}
            Err(err) => warn!(%err, "failed to process messaging reply"),
        }
    }

    Json(MessagingReplyResult { processed: payload.messages.len(), resumed }).into_response()
}

fn normalize(raw: &str, default_prefix: &str) -> String {
    let digits: String = raw.chars().filter(|c| c.is_ascii_digit() || *c == '+').collect();
    if digits.starts_with('+') || digits.is_empty() {
        digits
    } else {
        format!("{default_prefix}{digits}")
    }
}

/// `GET /webhook/messaging/verify` (§6): provider handshake challenge echo.
pub async fn messaging_verify(Query(query): Query<VerifyQuery>) -> impl IntoResponse {
    let expected = std::env::var("WF_VERIFY_TOKEN").unwrap_or_default();
    match (query.mode.as_deref(), query.verify_token, query.challenge) {
        (Some("subscribe"), Some(token), Some(challenge)) if token == expected => (StatusCode::OK, challenge).into_response(),
        _ => (StatusCode::FORBIDDEN, "verification failed").into_response(),
    }
}

/// `POST /webhook/voice/outcome` (§6): always responds 2xx even when the
/// payload cannot be matched to a waiting run, to avoid provider retry storms.
pub async fn voice_outcome(State(state): State<AppState>, Json(payload): Json<VoiceOutcomePayload>) -> impl IntoResponse {
    let result = state
        .resumer
        .handle_call_outcome(
            payload.provider_call_id.as_deref(),
            payload.provider_conversation_id.as_deref(),
            payload.callback_run_id.as_ref(),
            &payload.status,
            payload.analysis.as_ref(),
        )
        .await;

    match result {
        Ok(workflow_core::resumer::ResumeOutcome::Resumed { run_id, handle }) => {
            info!(run_id = %run_id, handle = %handle, "voice outcome resumed run");
        }
        Ok(workflow_core::resumer::ResumeOutcome::NoMatch) => {
            info!(?payload.provider_call_id, ?payload.provider_conversation_id, "voice outcome matched no waiting run");
        }
        Err(err) => warn!(%err, "voice outcome processing error"),
    }

    StatusCode::OK
}

/// `POST /webhook/voice/poll` (§6): protected by a shared secret, triggers a
/// polling pass over `waitingForCall` runs using `VoiceAdapter::fetch_outcome`.
pub async fn voice_poll(State(state): State<AppState>, headers: HeaderMap) -> impl IntoResponse {
    let expected = std::env::var("WF_VOICE_POLL_SECRET").unwrap_or_default();
    let provided = headers.get("x-poll-secret").and_then(|v| v.to_str().ok()).unwrap_or_default();
    if expected.is_empty() || provided != expected {
        return StatusCode::FORBIDDEN;
    }

    let waiting = match state.store.list_waiting_for_call_runs().await {
        Ok(runs) => runs,
        Err(err) => {
            warn!(%err, "voice poll: failed to list waiting runs");
            return StatusCode::OK;
        }
    };
    for run in waiting {
        let Some(wait) = &run.waiting_for_call else { continue };
        let Some(convo) = &wait.provider_conversation_id else { continue };
        match state.voice.fetch_outcome(convo).await {
            Ok(outcome) => {
                if let Err(err) = state
                    .resumer
                    .handle_call_outcome(wait.provider_call_id.as_deref(), Some(convo.as_str()), Some(&run.id), &outcome.status, outcome.analysis.as_ref())
                    .await
                {
                    warn!(run_id = %run.id, %err, "voice poll resume failed");
                }
            }
            Err(err) => warn!(run_id = %run.id, %err, "voice poll fetch_outcome failed"),
        }
    }
    StatusCode::OK
}

/// `POST /webhook/task/completed` (§6).
pub async fn task_completed(State(state): State<AppState>, Json(payload): Json<TaskCompletedPayload>) -> impl IntoResponse {
    match state
        .resumer
        .handle_task_completion(&payload.task_id, &payload.completion_result, payload.notes.as_deref())
        .await
    {
        Ok(workflow_core::resumer::ResumeOutcome::Resumed { run_id, handle }) => {
            info!(run_id = %run_id, handle = %handle, "task completion resumed run");
            StatusCode::OK
        }
        Ok(workflow_core::resumer::ResumeOutcome::NoMatch) => StatusCode::OK,
        Err(err) => {
            warn!(%err, "task completion processing error");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}
