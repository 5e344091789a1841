//! Operator/admin routes (§6): health, retention preview, cleanup, and
//! manual recovery. These are not exposed to external providers and should
//! sit behind whatever ingress auth the deployment already terminates.

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use tracing::{error, info};

use crate::dto::{CleanupQuery, CleanupResult, CleanupStatsResponse, HealthResponse, RecoverQuery, RecoverResult};
use crate::state::AppState;

pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    match state.supervisor.health().await {
        Ok(report) => Json(HealthResponse {
            totals: report.totals,
            active: report.active,
            waiting: report.waiting,
            completed_24h: report.completed_24h,
            failed_24h: report.failed_24h,
            stuck: report.stuck,
            pending_jobs: report.pending_jobs,
            processing_jobs: report.processing_jobs,
            health_score: report.health_score,
        })
        .into_response(),
        Err(err) => {
            error!(%err, "health check failed");
            (StatusCode::INTERNAL_SERVER_ERROR, Json(serde_json::json!({ "error": err.to_string() }))).into_response()
        }
    }
}

pub async fn cleanup_stats(State(state): State<AppState>, Query(query): Query<CleanupQuery>) -> impl IntoResponse {
    match state.supervisor.cleanup_stats(query.days, query.failed_days).await {
        Ok(stats) => Json(CleanupStatsResponse { prunable_runs: stats.prunable_runs }).into_response(),
        Err(err) => {
            error!(%err, "cleanup-stats failed");
            (StatusCode::INTERNAL_SERVER_ERROR, Json(serde_json::json!({ "error": err.to_string() }))).into_response()
        }
    }
}

pub async fn cleanup(State(state): State<AppState>, Query(query): Query<CleanupQuery>) -> impl IntoResponse {
    match state.supervisor.prune(query.days, query.failed_days).await {
        Ok(report) => {
            info!(runs_deleted = report.runs_deleted, jobs_deleted = report.jobs_deleted, "cleanup pass complete");
            Json(CleanupResult { runs_deleted: report.runs_deleted, jobs_deleted: report.jobs_deleted }).into_response()
        }
        Err(err) => {
            error!(%err, "cleanup failed");
            (StatusCode::INTERNAL_SERVER_ERROR, Json(serde_json::json!({ "error": err.to_string() }))).into_response()
        }
    }
}

pub async fn recover(State(state): State<AppState>, Query(query): Query<RecoverQuery>) -> impl IntoResponse {
    match state.supervisor.reclaim(query.hours).await {
        Ok(report) => {
            info!(scanned = report.scanned, jobs_reset = report.jobs_reset, "recover pass complete");
            Json(RecoverResult { scanned: report.scanned, jobs_reset: report.jobs_reset, failed_stuck: report.failed_stuck }).into_response()
        }
        Err(err) => {
            error!(%err, "recover failed");
            (StatusCode::INTERNAL_SERVER_ERROR, Json(serde_json::json!({ "error": err.to_string() }))).into_response()
        }
    }
}
