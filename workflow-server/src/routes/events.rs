//! Domain event intake (§6): the surface the surrounding CRM calls to notify
//! the engine of `leadCreated` / `leadUpdated` / `appointmentScheduled` /
//! manual-trigger events. Thin adapters over `TriggerMatcher::handle_event`.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use chrono::Utc;
use tracing::warn;

use workflow_core::trigger_matcher::SkipReason;
use workflow_core::model::{DomainEvent, EventKind};

use crate::dto::{EmitAppointmentPayload, EmitLeadPayload, EmitManualPayload, EmitResult};
use crate::state::AppState;

fn skip_reason_str(reason: &SkipReason) -> &'static str {
    match reason {
        SkipReason::FilterMismatch => "filterMismatch",
        SkipReason::RunOnce => "runOnce",
        SkipReason::Duplicate => "duplicate",
        SkipReason::Cooldown => "cooldown",
    }
}

async fn emit(state: &AppState, event: DomainEvent) -> impl IntoResponse {
    let event_id = uuid::Uuid::new_v4().to_string();
    match state.trigger_matcher.handle_event(event).await {
        Ok(outcome) => {
            let result = EmitResult {
                event_id,
                created_run_ids: outcome.created_run_ids,
                skips: outcome.skips.into_iter().map(|(id, reason)| (id, skip_reason_str(&reason).to_string())).collect(),
                errors: outcome.errors,
            };
            (StatusCode::OK, Json(result)).into_response()
        }
        Err(err) => {
            warn!(%err, "domain event handling failed");
            (StatusCode::INTERNAL_SERVER_ERROR, Json(serde_json::json!({ "error": err.to_string() }))).into_response()
        }
    }
}

pub async fn lead_created(State(state): State<AppState>, Json(payload): Json<EmitLeadPayload>) -> impl IntoResponse {
    let event = DomainEvent {
        kind: EventKind::LeadCreated,
        tenant_id: payload.tenant_id,
        lead_id: payload.lead_id,
        payload: payload.lead,
        changes: payload.changes,
        appointment: None,
        force_definition_id: None,
        occurred_at: Utc::now(),
    };
    emit(&state, event).await.into_response()
}

pub async fn lead_updated(State(state): State<AppState>, Json(payload): Json<EmitLeadPayload>) -> impl IntoResponse {
    let event = DomainEvent {
        kind: EventKind::LeadUpdated,
        tenant_id: payload.tenant_id,
        lead_id: payload.lead_id,
        payload: payload.lead,
        changes: payload.changes,
        appointment: None,
        force_definition_id: None,
        occurred_at: Utc::now(),
    };
    emit(&state, event).await.into_response()
}

pub async fn appointment_scheduled(State(state): State<AppState>, Json(payload): Json<EmitAppointmentPayload>) -> impl IntoResponse {
    let event = DomainEvent {
        kind: EventKind::AppointmentScheduled,
        tenant_id: payload.tenant_id,
        lead_id: payload.lead_id,
        payload: payload.lead,
        changes: None,
        appointment: Some(payload.appointment),
        force_definition_id: None,
        occurred_at: Utc::now(),
    };
    emit(&state, event).await.into_response()
}

/// A manual trigger bypasses filter/dedup checks against every active
/// definition and targets exactly `definitionId` (§4.1 "Manual trigger").
pub async fn manual(State(state): State<AppState>, Json(payload): Json<EmitManualPayload>) -> impl IntoResponse {
    let event = DomainEvent {
        kind: EventKind::Manual,
        tenant_id: payload.tenant_id,
        lead_id: payload.lead_id,
        payload: payload.lead,
        changes: None,
        appointment: None,
        force_definition_id: Some(payload.definition_id),
        occurred_at: Utc::now(),
    };
    emit(&state, event).await.into_response()
}
