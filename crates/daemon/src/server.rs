//! HTTP surface: webhook admission and the control plane.
//!
//! A thin axum layer over the store and the worker handle. Admission returns
//! only after the job row is durably inserted; control-plane handlers are
//! direct queries. Every error body carries a stable `error_kind` alongside
//! the human-readable message.

use crate::admission::{Admission, AdmissionOutcome, MAX_WEBHOOK_BYTES};
use crate::auth::{ApiKeys, AuthError};
use crate::store::{JobStatus, Store, StoreError};
use crate::worker::WorkerHandle;
use arm_transcoder_config::Settings;
use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

/// Shared state for all handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<Store>,
    pub settings: Arc<Settings>,
    pub admission: Arc<Admission>,
    pub api_keys: Arc<ApiKeys>,
    pub worker: WorkerHandle,
}

/// Builds the application router.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/webhook/arm", post(webhook))
        .route("/jobs", get(list_jobs))
        .route("/stats", get(stats))
        .route("/jobs/:id/retry", post(retry_job))
        .route("/jobs/:id", delete(delete_job))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn error_response(status: StatusCode, kind: &str, message: &str) -> Response {
    (
        status,
        Json(json!({ "error": message, "error_kind": kind })),
    )
        .into_response()
}

fn auth_error_response(err: AuthError) -> Response {
    let status = match err {
        AuthError::MissingKey | AuthError::BadWebhookSecret => StatusCode::UNAUTHORIZED,
        AuthError::InvalidKey | AuthError::AdminRequired => StatusCode::FORBIDDEN,
    };
    error_response(status, "unauthorized", &err.to_string())
}

fn store_error_response(err: StoreError) -> Response {
    match err {
        StoreError::NotFound(_) => {
            error_response(StatusCode::NOT_FOUND, "not_found", &err.to_string())
        }
        StoreError::InvalidTransition { .. }
        | StoreError::RetryExhausted(_)
        | StoreError::DeleteWhileRunning(_) => {
            error_response(StatusCode::CONFLICT, "conflict", &err.to_string())
        }
        other => error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal",
            &other.to_string(),
        ),
    }
}

fn api_key_header(headers: &HeaderMap) -> Option<&str> {
    headers.get("x-api-key").and_then(|v| v.to_str().ok())
}

async fn health(State(state): State<AppState>) -> Response {
    let queue = state.store.queue_size().unwrap_or(0);
    Json(json!({
        "status": "healthy",
        "worker_running": state.worker.is_running(),
        "queue_size": queue,
    }))
    .into_response()
}

async fn webhook(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Response {
    let secret_header = headers
        .get("x-webhook-secret")
        .and_then(|v| v.to_str().ok());
    if let Err(e) =
        crate::auth::verify_webhook_secret(&state.settings.auth.webhook_secret, secret_header)
    {
        return auth_error_response(e);
    }

    if body.len() > MAX_WEBHOOK_BYTES {
        return error_response(
            StatusCode::PAYLOAD_TOO_LARGE,
            "oversized",
            "webhook payload exceeds 10 KiB",
        );
    }

    match state.admission.parse(&body) {
        Ok(AdmissionOutcome::Accepted(new_job)) => match state.store.insert(new_job) {
            Ok(job) => {
                tracing::info!(job = job.id, title = %job.title, "job admitted");
                state.worker.notify();
                (
                    StatusCode::OK,
                    Json(json!({ "job_id": job.id, "queue_size": state.store.queue_size().unwrap_or(0) })),
                )
                    .into_response()
            }
            Err(e) => store_error_response(e),
        },
        Ok(AdmissionOutcome::Ignored { reason }) => {
            Json(json!({ "status": "ignored", "reason": reason })).into_response()
        }
        Err(e) => error_response(StatusCode::BAD_REQUEST, "malformed", &e.to_string()),
    }
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    status: Option<String>,
    limit: Option<u32>,
    offset: Option<u32>,
}

async fn list_jobs(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<ListQuery>,
) -> Response {
    if let Err(e) = state.api_keys.verify(api_key_header(&headers)) {
        return auth_error_response(e);
    }

    let status = match query.status.as_deref() {
        None | Some("") => None,
        Some(s) => match JobStatus::parse(s) {
            Some(status) => Some(status),
            None => {
                return error_response(
                    StatusCode::BAD_REQUEST,
                    "malformed",
                    &format!("unknown status filter: {s}"),
                );
            }
        },
    };

    match state
        .store
        .list(status, query.limit.unwrap_or(100), query.offset.unwrap_or(0))
    {
        Ok((items, total)) => Json(json!({ "items": items, "total": total })).into_response(),
        Err(e) => store_error_response(e),
    }
}

async fn stats(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Err(e) = state.api_keys.verify(api_key_header(&headers)) {
        return auth_error_response(e);
    }

    match state.store.stats() {
        Ok(stats) => Json(json!({
            "pending": stats.pending,
            "running": stats.running,
            "completed": stats.completed,
            "failed": stats.failed,
            "cancelled": stats.cancelled,
            "total_processed": stats.total_processed,
            "avg_duration_secs": stats.avg_duration_secs,
            "worker_running": state.worker.is_running(),
            "current_job": state.worker.current_job(),
        }))
        .into_response(),
        Err(e) => store_error_response(e),
    }
}

async fn retry_job(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Response {
    if let Err(e) = state.api_keys.require_admin(api_key_header(&headers)) {
        return auth_error_response(e);
    }

    match state
        .store
        .requeue(id, state.settings.runtime.max_retry_count)
    {
        Ok(job) => {
            tracing::info!(job = id, retry = job.retry_count, "job requeued");
            state.worker.notify();
            Json(json!({ "job": job })).into_response()
        }
        Err(e) => store_error_response(e),
    }
}

async fn delete_job(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Response {
    if let Err(e) = state.api_keys.require_admin(api_key_header(&headers)) {
        return auth_error_response(e);
    }

    match state.store.delete(id) {
        Ok(()) => {
            tracing::info!(job = id, "job deleted");
            Json(json!({})).into_response()
        }
        Err(e) => store_error_response(e),
    }
}
