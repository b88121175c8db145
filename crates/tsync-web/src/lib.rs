//! Axum JSON surface for the tender sync operator triggers and read views.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::info;
use tsync_sync::{
    classify, failure_note, BackfillRequest, FailureKind, SyncRequest, SyncService,
};
use uuid::Uuid;

pub const CRATE_NAME: &str = "tsync-web";

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<SyncService>,
}

impl AppState {
    pub fn new(service: Arc<SyncService>) -> Self {
        Self { service }
    }
}

#[derive(Debug, Deserialize)]
struct JobsQuery {
    limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct ProgressQuery {
    days: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct EnrichTodayBody {
    #[serde(default)]
    cap_override: Option<usize>,
}

#[derive(Debug, Serialize)]
struct Accepted {
    status: &'static str,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/api/sync-state", get(sync_state_handler))
        .route("/api/jobs", get(jobs_handler))
        .route("/api/enrichment-progress", get(progress_handler))
        .route("/api/sync", post(sync_handler))
        .route("/api/sync/{run_id}/resume", post(resume_handler))
        .route("/api/enrich-today", post(enrich_today_handler))
        .route("/api/backfill", post(backfill_handler))
        .route("/api/backfill/cancel", post(cancel_backfill_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(service: Arc<SyncService>, bind_addr: &str) -> anyhow::Result<()> {
    let shutdown = service.shutdown_token().clone();
    let listener = TcpListener::bind(bind_addr).await?;
    info!(addr = bind_addr, "serving operator api");
    axum::serve(listener, app(AppState::new(service)))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}

async fn sync_state_handler(State(state): State<Arc<AppState>>) -> Response {
    respond(state.service.sync_status().await)
}

async fn jobs_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<JobsQuery>,
) -> Response {
    respond(state.service.recent_jobs(query.limit.unwrap_or(50)).await)
}

async fn progress_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ProgressQuery>,
) -> Response {
    respond(state.service.enrichment_progress(query.days.unwrap_or(30)).await)
}

async fn sync_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<SyncRequest>,
) -> Response {
    respond(state.service.run_sync(&request).await)
}

async fn resume_handler(
    State(state): State<Arc<AppState>>,
    Path(run_id): Path<Uuid>,
) -> Response {
    respond(state.service.resume_durable(run_id).await)
}

async fn enrich_today_handler(
    State(state): State<Arc<AppState>>,
    Json(body): Json<EnrichTodayBody>,
) -> Response {
    respond(state.service.enrich_today(body.cap_override).await)
}

async fn backfill_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<BackfillRequest>,
) -> Response {
    respond(state.service.run_backfill(&request).await)
}

async fn cancel_backfill_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.service.cancel_backfill().await {
        Ok(()) => (
            StatusCode::ACCEPTED,
            Json(Accepted {
                status: "cancel requested",
            }),
        )
            .into_response(),
        Err(err) => server_error(err),
    }
}

fn respond<T: Serialize>(result: anyhow::Result<T>) -> Response {
    match result {
        Ok(body) => Json(body).into_response(),
        Err(err) => server_error(err),
    }
}

/// Upstream outages map to 503 so callers can tell them from our bugs.
fn server_error(err: anyhow::Error) -> Response {
    let status = match classify(&err) {
        FailureKind::UpstreamUnavailable => StatusCode::SERVICE_UNAVAILABLE,
        FailureKind::Application => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (
        status,
        Json(serde_json::json!({ "error": failure_note(&err) })),
    )
        .into_response()
}
