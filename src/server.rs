//! HTTP control surface for the Drive sync machine.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/api/health` | Liveness: `{ok, service, time}` |
//! | `GET`  | `/api/mcp/status` | Sync status snapshot (mode, guard, persisted state) |
//! | `POST` | `/api/mcp/sync` | Run one sync now: `{ok, result, status}` |
//! | `POST` | `/api/mcp/drive/webhook` | Drive change notification; always `200` |
//!
//! # Error Contract
//!
//! A failed manual sync returns `500` with:
//!
//! ```json
//! { "error": { "code": "sync_failed", "message": "LLM extraction failed for source 'drive_budget': ..." } }
//! ```
//!
//! Error codes: `config_error`, `upstream_error`, `sync_failed`.
//!
//! The webhook never returns an error status: providers retry on non-2xx,
//! so ignored and failed notifications are reported in the body instead.
//!
//! # CORS
//!
//! Any origin; methods `GET`, `POST`, `OPTIONS`.

use axum::{
    extract::State,
    http::{HeaderMap, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use crate::config::Config;
use crate::error::PipelineError;
use crate::sync::{DriveSync, SyncStatus, WebhookHeaders};

pub const SERVICE_NAME: &str = "event-harvest";

#[derive(Clone)]
struct AppState {
    sync: Arc<DriveSync>,
}

/// Starts the sync timers and serves the control surface on `[server].bind`
/// until the process is terminated.
pub async fn run_server(config: &Config, sync: Arc<DriveSync>) -> anyhow::Result<()> {
    let bind_addr = config.server.bind.clone();
    let _timers = sync.start().await?;

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!(addr = %bind_addr, mode = ?sync.mode(), "control server listening");
    println!("Listening on http://{}", bind_addr);

    axum::serve(listener, router(sync)).await?;
    Ok(())
}

/// The route table, without binding. Timers are not started.
pub fn router(sync: Arc<DriveSync>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/api/health", get(handle_health))
        .route("/api/mcp/status", get(handle_status))
        .route("/api/mcp/sync", post(handle_sync))
        .route("/api/mcp/drive/webhook", post(handle_webhook))
        .layer(cors)
        .with_state(AppState { sync })
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

/// Every sync failure is a 500; the code says which class it was.
fn classify_sync_error(err: anyhow::Error) -> AppError {
    let code = match err.chain().find_map(|e| e.downcast_ref::<PipelineError>()) {
        Some(PipelineError::MissingConfig(_)) | Some(PipelineError::MissingCredential(_)) => {
            "config_error"
        }
        Some(PipelineError::Http { .. }) => "upstream_error",
        _ => "sync_failed",
    };
    AppError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        code: code.to_string(),
        message: format!("{:#}", err),
    }
}

// ============ Handlers ============

#[derive(Serialize)]
struct HealthResponse {
    ok: bool,
    service: &'static str,
    time: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        ok: true,
        service: SERVICE_NAME,
        time: chrono::Utc::now().to_rfc3339(),
    })
}

async fn handle_status(State(state): State<AppState>) -> Json<SyncStatus> {
    Json(state.sync.status().await)
}

async fn handle_sync(State(state): State<AppState>) -> Result<Json<Value>, AppError> {
    let result = state
        .sync
        .process_pending_changes("manual_api")
        .await
        .map_err(classify_sync_error)?;
    let status = state.sync.status().await;
    Ok(Json(json!({ "ok": true, "result": result, "status": status })))
}

async fn handle_webhook(State(state): State<AppState>, headers: HeaderMap) -> Json<Value> {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string())
    };
    let hook = WebhookHeaders {
        channel_id: header("x-goog-channel-id"),
        channel_token: header("x-goog-channel-token"),
        resource_state: header("x-goog-resource-state"),
        message_number: header("x-goog-message-number"),
    };
    Json(state.sync.handle_webhook(&hook).await)
}
