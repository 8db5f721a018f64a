//! HTTP Surface
//!
//! Routes:
//!
//! - `POST /generate-multi`: one prompt, many models, merged event stream
//! - `POST /generate/{model}`: single-model passthrough of upstream lines
//! - `GET /models`: upstream model list
//! - `POST /query`: non-streaming completion with timing
//! - `GET /health`: backend reachability and active session count
//!
//! ```text
//!   browser ──POST /generate-multi──► generate_multi
//!                                          │
//!                                 Aggregator::start ──► SessionGuard
//!                                          │            (registry entry)
//!                                  SessionEventStream
//!                                          │
//!                                   EventEncoder ──► text/event-stream
//! ```
//!
//! Each streaming response owns its session; when the client goes away the
//! body is dropped, which drops the session and aborts its workers.

use std::convert::Infallible;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, HeaderName, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use dashmap::DashMap;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use chorus_core::encoder::EVENT_STREAM_CONTENT_TYPE;
use chorus_core::{
    encode_data, Aggregator, BackendError, EventEncoder, GenerationRequest, LlmBackend,
    LlmRequest, SessionError, SessionId,
};

const X_ACCEL_BUFFERING: HeaderName = HeaderName::from_static("x-accel-buffering");

// ============================================================================
// Application State
// ============================================================================

/// Bookkeeping for one in-flight multi-model session
#[derive(Clone, Debug)]
pub struct SessionInfo {
    /// Models the session fans out to
    pub models: Vec<String>,
    /// When the session was started
    pub started_at: Instant,
}

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    aggregator: Aggregator,
    default_model: String,
    sessions: Arc<DashMap<SessionId, SessionInfo>>,
}

impl AppState {
    /// Create handler state around an aggregator
    pub fn new(aggregator: Aggregator, default_model: impl Into<String>) -> Self {
        Self {
            aggregator,
            default_model: default_model.into(),
            sessions: Arc::new(DashMap::new()),
        }
    }

    fn backend(&self) -> &Arc<dyn LlmBackend> {
        self.aggregator.backend()
    }

    /// Number of multi-model sessions currently streaming
    pub fn active_sessions(&self) -> usize {
        self.sessions.len()
    }

    fn register(&self, id: SessionId, models: Vec<String>) -> SessionGuard {
        self.sessions.insert(
            id,
            SessionInfo {
                models,
                started_at: Instant::now(),
            },
        );
        SessionGuard {
            id,
            sessions: Arc::clone(&self.sessions),
        }
    }
}

/// Removes a session from the registry when its response body is dropped
struct SessionGuard {
    id: SessionId,
    sessions: Arc<DashMap<SessionId, SessionInfo>>,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if let Some((id, info)) = self.sessions.remove(&self.id) {
            debug!(
                session = %id,
                models = ?info.models,
                elapsed_ms = info.started_at.elapsed().as_millis() as u64,
                "Session released"
            );
        }
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Handler errors, rendered as `{"error": "..."}`
#[derive(Debug)]
enum AppError {
    BadRequest(String),
    Upstream(BackendError),
}

impl From<SessionError> for AppError {
    fn from(err: SessionError) -> Self {
        Self::BadRequest(err.to_string())
    }
}

impl From<BackendError> for AppError {
    fn from(err: BackendError) -> Self {
        Self::Upstream(err)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AppError::BadRequest(message) => (StatusCode::BAD_REQUEST, message),
            AppError::Upstream(err) => {
                warn!(error = %err, "Upstream request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
            }
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

// ============================================================================
// Request Bodies
// ============================================================================

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct MultiBody {
    prompt: String,
    models: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct PromptBody {
    prompt: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct QueryBody {
    prompt: Option<String>,
    model: Option<String>,
}

// ============================================================================
// Router
// ============================================================================

/// Build the router with CORS and request tracing
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/generate-multi", post(generate_multi))
        .route("/generate/{model}", post(generate_single))
        .route("/models", get(list_models))
        .route("/query", post(query))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serve until `shutdown` resolves
pub async fn serve(
    listener: TcpListener,
    state: AppState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let addr = listener.local_addr().context("Listener has no local address")?;
    info!(addr = %addr, "Listening for HTTP requests");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
        .context("HTTP server failed")
}

fn event_stream_response(body: Body) -> Response {
    (
        [
            (header::CONTENT_TYPE, EVENT_STREAM_CONTENT_TYPE),
            (header::CACHE_CONTROL, "no-cache"),
            (X_ACCEL_BUFFERING, "no"),
        ],
        body,
    )
        .into_response()
}

// ============================================================================
// Handlers
// ============================================================================

async fn generate_multi(
    State(state): State<AppState>,
    Json(body): Json<MultiBody>,
) -> Result<Response, AppError> {
    let request = GenerationRequest::new(body.prompt, body.models);
    let session = state.aggregator.start(&request)?;
    let guard = state.register(session.id(), session.models());

    let encoder = EventEncoder::new();
    let frames = session.into_events().map(move |event| {
        let _registered = &guard;
        Ok::<_, Infallible>(encoder.encode(&event))
    });

    Ok(event_stream_response(Body::from_stream(frames)))
}

async fn generate_single(
    State(state): State<AppState>,
    Path(model): Path<String>,
    Json(body): Json<PromptBody>,
) -> Response {
    let request = LlmRequest::new(body.prompt, model.clone());

    let frames = match state.backend().stream_completion(&request).await {
        Ok(fragments) => fragments
            .map(|fragment| Ok::<_, Infallible>(encode_data(fragment.raw())))
            .boxed(),
        Err(e) => {
            warn!(model = %model, error = %e, "Passthrough stream failed to start");
            let frame = encode_data(&json!({ "error": e.to_string() }));
            futures::stream::once(async move { Ok::<_, Infallible>(frame) }).boxed()
        }
    };

    event_stream_response(Body::from_stream(frames))
}

async fn list_models(State(state): State<AppState>) -> Result<Response, AppError> {
    let models = state.backend().list_models().await?;
    Ok(Json(models).into_response())
}

async fn query(
    State(state): State<AppState>,
    Json(body): Json<QueryBody>,
) -> Result<Response, AppError> {
    let prompt = body
        .prompt
        .filter(|p| !p.trim().is_empty())
        .ok_or_else(|| AppError::BadRequest("Prompt is required".into()))?;
    let model = body
        .model
        .filter(|m| !m.trim().is_empty())
        .unwrap_or_else(|| state.default_model.clone());

    let completion = state
        .backend()
        .generate(&LlmRequest::new(prompt, model).with_stream(false))
        .await?;

    info!(
        model = %completion.model,
        elapsed_ms = completion.elapsed.as_millis() as u64,
        eval_count = ?completion.eval_count,
        "Query answered"
    );

    Ok(Json(json!({
        "model": completion.model,
        "response": completion.content,
        "response_time_seconds": completion.elapsed.as_secs_f64(),
        "eval_count": completion.eval_count,
    }))
    .into_response())
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    let reachable = state.backend().health_check().await;
    Json(json!({
        "status": if reachable { "ok" } else { "degraded" },
        "backend_reachable": reachable,
        "active_sessions": state.active_sessions(),
    }))
}

// ============================================================================
// Tests
// ============================================================================
