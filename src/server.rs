//! HTTP surface for triggering sync runs.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/sync` | Run a sync; streams NDJSON events or returns one JSON result |
//! | `GET`  | `/health` | Health check (returns version) |
//!
//! # Streaming
//!
//! When the request's `Accept` header includes `application/x-ndjson`, the
//! response body is a sequence of newline-terminated JSON event records
//! (`start`, `progress`, `done`) produced while the run executes, with
//! `Cache-Control: no-cache`. Otherwise the handler runs the pipeline to
//! completion and returns the final result as a single JSON object —
//! identical to the `done` event's payload.
//!
//! # Error Contract
//!
//! Request-level failures use the envelope
//! `{ "error": { "code": "...", "message": "..." } }` with codes
//! `auth_required` (401), `not_authorized` (403), `invalid_request` (400),
//! and `internal` (500). Run-level failures are *not* HTTP errors: they
//! arrive inside the terminal result with their own uppercase codes
//! (`FORCED_FAILURE`, `SYNC_PARTIAL_FAILURE`, `SYNC_FATAL_ERROR`).
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted so the admin page can
//! trigger syncs cross-origin.

use axum::{
    body::{Body, Bytes},
    extract::State,
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tower_http::cors::{Any, CorsLayer};
use tracing::Instrument;
use uuid::Uuid;

use crate::auth::{allowed_tokens_from_env, bearer_token, is_allowed_token};
use crate::config::Config;
use crate::embedding::{create_embedder, Embedder};
use crate::models::{SyncLimit, SyncOptions};
use crate::notion::NotionClient;
use crate::store::{create_store, MemoStore};
use crate::stream::encode_event;
use crate::sync::{clamp_preview_count, run_sync, run_sync_collect};

/// Shared application state passed to all route handlers.
#[derive(Clone)]
struct AppState {
    config: Arc<Config>,
    store: Arc<dyn MemoStore>,
    embedder: Arc<dyn Embedder>,
    allowed_tokens: Arc<Vec<String>>,
}

/// Starts the sync HTTP server.
///
/// Binds to `[server].bind` and runs until the process is terminated.
/// The store and embedder are constructed once and shared across requests;
/// the Notion client is constructed per run so its related-book cache never
/// outlives a run.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let bind_addr = config.server.bind.clone();

    let store = create_store(&config.store).await?;
    let embedder = create_embedder(&config.embedding)?;
    let allowed_tokens = allowed_tokens_from_env();
    if allowed_tokens.is_empty() {
        tracing::warn!("{} is empty; every sync request will be rejected", crate::auth::ALLOWED_TOKENS_ENV);
    }

    let state = AppState {
        config: Arc::new(config.clone()),
        store,
        embedder,
        allowed_tokens: Arc::new(allowed_tokens),
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/sync", post(handle_sync))
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(state);

    tracing::info!("sync server listening on http://{}", bind_addr);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

// ============ Error response ============

/// JSON error envelope for request-level failures.
#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

/// Internal error type that converts into an HTTP response.
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

/// 401: the caller presented no identity at all.
fn auth_required() -> AppError {
    AppError {
        status: StatusCode::UNAUTHORIZED,
        code: "auth_required".to_string(),
        message: "authentication required".to_string(),
    }
}

/// 403: identity present but not in the allow-list.
fn not_authorized() -> AppError {
    AppError {
        status: StatusCode::FORBIDDEN,
        code: "not_authorized".to_string(),
        message: "caller is not authorized to trigger sync".to_string(),
    }
}

fn invalid_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "invalid_request".to_string(),
        message: message.into(),
    }
}

fn internal(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        code: "internal".to_string(),
        message: message.into(),
    }
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ POST /sync ============

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SyncRequest {
    #[serde(default)]
    limit: Option<serde_json::Value>,
    #[serde(default)]
    force_fail: Option<bool>,
    #[serde(default)]
    preview_count: Option<f64>,
}

/// Handler for `POST /sync`.
///
/// Resolves caller identity, validates the request, then either streams the
/// run's events or runs to completion and returns the final result.
async fn handle_sync(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, AppError> {
    // Identity checks precede all other work.
    let token = bearer_token(&headers).ok_or_else(auth_required)?;
    if !is_allowed_token(&token, &state.allowed_tokens) {
        return Err(not_authorized());
    }

    let request: SyncRequest =
        serde_json::from_slice(&body).map_err(|_| invalid_request("body must be valid JSON"))?;

    // `limit` is the one required field; absent is as invalid as malformed.
    let limit = request
        .limit
        .as_ref()
        .and_then(SyncLimit::parse)
        .ok_or_else(|| invalid_request("limit must be 50 or \"all\""))?;

    let opts = SyncOptions {
        limit,
        force_fail: request.force_fail.unwrap_or(false),
        preview_count: clamp_preview_count(request.preview_count),
    };

    // Fresh client per run: the related-book cache must not leak across runs.
    let source = NotionClient::new(&state.config.source).map_err(|e| internal(e.to_string()))?;

    let run_id = Uuid::new_v4();
    let span = tracing::info_span!("sync_run", %run_id, streaming = wants_stream(&headers));

    if !wants_stream(&headers) {
        let result = async {
            run_sync_collect(
                &source,
                state.embedder.as_ref(),
                state.store.as_ref(),
                opts,
            )
            .await
        }
        .instrument(span)
        .await;
        return Ok(Json(result).into_response());
    }

    let (tx, rx) = mpsc::channel(32);
    let embedder = state.embedder.clone();
    let store = state.store.clone();

    // The producer owns event ordering and closes the channel by returning;
    // this task keeps running even if the client disconnects mid-stream.
    tokio::spawn(
        async move {
            run_sync(&source, embedder.as_ref(), store.as_ref(), opts, tx).await;
        }
        .instrument(span),
    );

    let stream = futures_util::stream::unfold(rx, |mut rx| async move {
        let event = rx.recv().await?;
        let bytes = match encode_event(&event) {
            Ok(bytes) => bytes,
            Err(err) => {
                tracing::warn!(error = %err, "dropping unencodable event");
                Vec::new()
            }
        };
        Some((Ok::<_, std::convert::Infallible>(Bytes::from(bytes)), rx))
    });

    Ok((
        [
            (
                header::CONTENT_TYPE,
                "application/x-ndjson; charset=utf-8",
            ),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        Body::from_stream(stream),
    )
        .into_response())
}

/// Did the caller signal streaming support?
fn wants_stream(headers: &HeaderMap) -> bool {
    headers
        .get(header::ACCEPT)
        .and_then(|value| value.to_str().ok())
        .map(|accept| accept.contains("application/x-ndjson"))
        .unwrap_or(false)
}
