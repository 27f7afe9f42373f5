//! JSON admin surface over the sync runtime: manual syncs, logs, stats and source refresh.

use std::sync::Arc;

use anyhow::Context;
use axum::{
    extract::{Path as AxumPath, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use vidpub_api::ApiError;
use vidpub_core::EntryId;
use vidpub_sync::{maybe_build_scheduler, SyncError, SyncRuntime};

pub const CRATE_NAME: &str = "vidpub-web";

#[derive(Clone)]
pub struct AppState {
    pub runtime: Arc<SyncRuntime>,
}

impl AppState {
    pub fn new(runtime: Arc<SyncRuntime>) -> Self {
        Self { runtime }
    }
}

#[derive(Debug, Default, Deserialize)]
struct LogsQuery {
    limit: Option<usize>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/sync", post(sync_handler))
        .route("/sync/full", post(full_sync_handler))
        .route("/logs", get(logs_handler))
        .route("/logs/clear", post(clear_logs_handler))
        .route("/connection/test", post(connection_test_handler))
        .route("/stats", get(stats_handler))
        .route("/videos/{entry_id}/source", get(video_source_handler))
        .with_state(Arc::new(state))
}

/// Serves the admin surface and, when enabled, the recurring sync job beside it.
pub async fn serve_from_env() -> anyhow::Result<()> {
    let runtime = Arc::new(SyncRuntime::from_env().await?);
    let scheduler = maybe_build_scheduler(runtime.clone()).await?;
    if let Some(sched) = &scheduler {
        sched.start().await.context("starting scheduler")?;
        info!(
            cron = runtime.settings().sync_interval.cron_expression(),
            "scheduled sync enabled"
        );
    }

    let port = runtime.config().web_port;
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "admin surface listening");
    axum::serve(listener, app(AppState::new(runtime))).await?;
    Ok(())
}

async fn sync_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.runtime.manual_sync().await {
        Ok(result) => success(
            format!("Sync completed: {result}"),
            json!({ "result": result }),
        ),
        Err(err) => sync_error(err),
    }
}

async fn full_sync_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.runtime.run_force_sync(true, None).await {
        Ok(result) => success(
            format!("Full sync completed: {result}"),
            json!({ "result": result }),
        ),
        Err(err) => sync_error(err),
    }
}

async fn logs_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<LogsQuery>,
) -> Response {
    match state.runtime.activity().entries().await {
        Ok(mut logs) => {
            if let Some(limit) = query.limit {
                logs.truncate(limit);
            }
            success(format!("{} log entries", logs.len()), json!({ "logs": logs }))
        }
        Err(err) => server_error(err),
    }
}

async fn clear_logs_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.runtime.clear_logs().await {
        Ok(()) => success("Logs cleared successfully.", json!({})),
        Err(err) => server_error(err),
    }
}

async fn connection_test_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.runtime.test_connection().await {
        Ok(()) => success("API connection successful!", json!({})),
        Err(ApiError::NotConfigured) => failure(
            StatusCode::BAD_REQUEST,
            format!("API connection failed: {}", ApiError::NotConfigured),
        ),
        Err(err) => failure(
            StatusCode::BAD_GATEWAY,
            format!("API connection failed: {err}"),
        ),
    }
}

async fn stats_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.runtime.stats().await {
        Ok(stats) => success(
            format!("{} synced videos", stats.total),
            json!({ "stats": stats }),
        ),
        Err(err) => server_error(err),
    }
}

async fn video_source_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(entry_id): AxumPath<u64>,
) -> Response {
    let entry = EntryId(entry_id);
    if state.runtime.store().entry(entry).await.is_none() {
        return failure(
            StatusCode::NOT_FOUND,
            format!("Video entry {entry} not found"),
        );
    }

    let resolved = match state.runtime.refresher().resolve(entry).await {
        Ok(resolved) => resolved,
        Err(err) => return server_error(err),
    };
    if resolved.refreshed {
        if let Err(err) = state.runtime.persist().await {
            return server_error(err);
        }
    }
    success("Video source resolved", json!({ "source": resolved }))
}

fn success(message: impl Into<String>, extra: JsonValue) -> Response {
    let mut body = json!({ "status": "success", "message": message.into() });
    if let (Some(body), JsonValue::Object(extra)) = (body.as_object_mut(), extra) {
        body.extend(extra);
    }
    (StatusCode::OK, Json(body)).into_response()
}

fn failure(status: StatusCode, message: String) -> Response {
    warn!(%status, "{message}");
    (
        status,
        Json(json!({ "status": "error", "message": message })),
    )
        .into_response()
}

fn sync_error(err: SyncError) -> Response {
    let status = match &err {
        SyncError::TimedOut(_) => StatusCode::GATEWAY_TIMEOUT,
        err if err.is_upstream() => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    let message = match &err {
        SyncError::RemoteTrigger(_) => format!("API sync failed: {err}"),
        _ => format!("Sync failed: {err}"),
    };
    failure(status, message)
}

fn server_error(err: anyhow::Error) -> Response {
    error!("admin request failed: {err:#}");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "status": "error", "message": format!("Server error: {err:#}") })),
    )
        .into_response()
}
