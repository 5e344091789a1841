//! HTTP surface: webhook callbacks from external providers, the admin/ops
//! endpoints, and the domain event intake surface (§6).

pub mod admin;
pub mod events;
pub mod webhooks;

use axum::routing::{get, post};
use axum::Router;

use crate::state::AppState;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/webhook/messaging/reply", post(webhooks::messaging_reply))
        .route("/webhook/messaging/verify", get(webhooks::messaging_verify))
        .route("/webhook/voice/outcome", post(webhooks::voice_outcome))
        .route("/webhook/voice/poll", post(webhooks::voice_poll))
        .route("/webhook/task/completed", post(webhooks::task_completed))
        .route("/events/lead-created", post(events::lead_created))
        .route("/events/lead-updated", post(events::lead_updated))
        .route("/events/appointment-scheduled", post(events::appointment_scheduled))
        .route("/events/manual", post(events::manual))
        .route("/workflows/health", get(admin::health))
        .route("/workflows/cleanup-stats", get(admin::cleanup_stats))
        .route("/workflows/cleanup", post(admin::cleanup))
        .route("/workflows/recover", post(admin::recover))
        .with_state(state)
}
