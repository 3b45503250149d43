//! REST endpoints for triggering and inspecting automation jobs.
//!
//! This is the operator surface, not a UI: start and cancel bulk scans,
//! cancel scheduled actions, force a digest send, inspect progress.

use std::sync::Arc;

use axum::Router;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::cors::CorsLayer;
use uuid::Uuid;

use crate::bulk::fetcher::BulkFetcher;
use crate::actions::scheduler::ActionScheduler;
use crate::queue::{DurableQueue, EnqueueOptions, JobPayload};
use crate::store::Database;

/// Shared state for automation routes.
#[derive(Clone)]
pub struct ApiState {
    pub store: Arc<dyn Database>,
    pub queue: Arc<dyn DurableQueue>,
    pub fetcher: Arc<BulkFetcher>,
    pub scheduler: Arc<ActionScheduler>,
}

#[derive(Debug, Deserialize)]
struct StartBulkRequest {
    account_id: String,
    start_date: DateTime<Utc>,
    #[serde(default)]
    end_date: Option<DateTime<Utc>>,
    #[serde(default)]
    only_unread: bool,
    #[serde(default)]
    force_reprocess: bool,
}

#[derive(Debug, Serialize)]
struct BulkJobResponse {
    id: Uuid,
    account_id: String,
    status: String,
    pages_fetched: u32,
    total_discovered: u64,
    total_queued: u64,
    processed_count: u64,
    failed_count: u64,
}

/// POST /api/bulk
async fn start_bulk(
    State(state): State<ApiState>,
    Json(request): Json<StartBulkRequest>,
) -> impl IntoResponse {
    if request.account_id.trim().is_empty() {
        return (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(json!({"error": "account_id is required"})),
        )
            .into_response();
    }

    match state
        .fetcher
        .start(
            &request.account_id,
            request.start_date,
            request.end_date,
            request.only_unread,
            request.force_reprocess,
        )
        .await
    {
        Ok(job) => (
            StatusCode::CREATED,
            Json(json!({"id": job.id, "status": job.status.as_str()})),
        )
            .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": e.to_string()})),
        )
            .into_response(),
    }
}

/// GET /api/bulk/{id}
async fn get_bulk(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> impl IntoResponse {
    match state.store.get_bulk_job(id).await {
        Ok(Some(job)) => Json(BulkJobResponse {
            id: job.id,
            account_id: job.account_id,
            status: job.status.as_str().to_string(),
            pages_fetched: job.pages_fetched,
            total_discovered: job.total_discovered,
            total_queued: job.total_queued,
            processed_count: job.processed_count,
            failed_count: job.failed_count,
        })
        .into_response(),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(json!({"error": "bulk job not found"})),
        )
            .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": e.to_string()})),
        )
            .into_response(),
    }
}

/// POST /api/bulk/{id}/cancel
async fn cancel_bulk(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> impl IntoResponse {
    match state.fetcher.cancel(id).await {
        Ok(true) => Json(json!({"cancelled": true})).into_response(),
        Ok(false) => (
            StatusCode::CONFLICT,
            Json(json!({"cancelled": false, "error": "job is not running"})),
        )
            .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": e.to_string()})),
        )
            .into_response(),
    }
}

/// POST /api/actions/{id}/cancel
async fn cancel_action(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> impl IntoResponse {
    match state.scheduler.cancel(id).await {
        Ok(true) => Json(json!({"cancelled": true})).into_response(),
        Ok(false) => (
            StatusCode::CONFLICT,
            Json(json!({"cancelled": false, "error": "action is not pending"})),
        )
            .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": e.to_string()})),
        )
            .into_response(),
    }
}

#[derive(Debug, Deserialize, Default)]
struct DigestSendRequest {
    #[serde(default)]
    force: bool,
}

/// POST /api/digests/{account_id}/send
///
/// Enqueues a digest-send job rather than sending inline: delivery runs
/// under the queue's retry policy and timeout like every other job.
async fn trigger_digest_send(
    State(state): State<ApiState>,
    Path(account_id): Path<String>,
    body: Option<Json<DigestSendRequest>>,
) -> impl IntoResponse {
    let force = body.map(|Json(b)| b.force).unwrap_or(false);
    let payload = JobPayload::DigestSend {
        account_id: account_id.clone(),
        force,
    };
    let options = EnqueueOptions {
        idempotency_key: Some(format!("digest-send-{account_id}")),
        ..Default::default()
    };
    match state.queue.enqueue(payload, options).await {
        Ok(job_id) => (
            StatusCode::ACCEPTED,
            Json(json!({"job_id": job_id})),
        )
            .into_response(),
        Err(e) => (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(json!({"error": e.to_string()})),
        )
            .into_response(),
    }
}

/// GET /api/health
async fn health() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

/// Build the automation REST routes.
pub fn api_routes(state: ApiState) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/bulk", post(start_bulk))
        .route("/api/bulk/{id}", get(get_bulk))
        .route("/api/bulk/{id}/cancel", post(cancel_bulk))
        .route("/api/actions/{id}/cancel", post(cancel_action))
        .route("/api/digests/{account_id}/send", post(trigger_digest_send))
        .layer(CorsLayer::permissive())
        .with_state(state)
}
