//! HTTP API.
//!
//! - POST /v1/generate
//! - POST /v1/generate/stream
//! - GET /metrics
//! - GET /health
//! - GET /v1/cache/stats

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::State;
use axum::http::header::CONTENT_TYPE;
use axum::http::StatusCode;
use axum::response::sse::{KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::adapters::AdapterStats;
use crate::error::ServeError;
use crate::inference::{GenerationRequest, DEFAULT_TENANT};
use crate::kv_cache::KvStats;
use crate::scheduler::ENDPOINT_GENERATE;
use crate::server::streaming::chunks_to_sse_stream;
use crate::service::LoraServe;

/// Application state shared across handlers.
pub struct AppState {
    pub serve: Arc<LoraServe>,
}

impl AppState {
    pub fn new(serve: Arc<LoraServe>) -> Self {
        Self { serve }
    }
}

/// Build the axum router with all API routes.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/generate", post(generate))
        .route("/v1/generate/stream", post(generate_stream))
        .route("/metrics", get(metrics))
        .route("/health", get(health))
        .route("/v1/cache/stats", get(cache_stats))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
        .with_state(state)
}

// ─── Request/Response Types ────────────────────────────────────────────────

/// Generation request body.
#[derive(Debug, Deserialize)]
pub struct GenerateRequest {
    pub prompt: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_top_p")]
    pub top_p: f32,
    #[serde(default)]
    pub adapter_id: Option<String>,
    #[serde(default)]
    pub tenant_id: Option<String>,
}

fn default_max_tokens() -> usize {
    64
}
fn default_temperature() -> f32 {
    0.7
}
fn default_top_p() -> f32 {
    0.95
}

impl GenerateRequest {
    fn into_generation_request(self) -> GenerationRequest {
        let mut req = GenerationRequest::new(self.prompt, self.max_tokens)
            .with_sampling(self.temperature, self.top_p)
            .with_tenant(self.tenant_id.unwrap_or_else(|| DEFAULT_TENANT.to_string()));
        req.adapter_id = self.adapter_id;
        req
    }
}

/// Blocking generation response.
#[derive(Debug, Serialize, Deserialize)]
pub struct GenerateResponse {
    pub text: String,
    pub tokens: usize,
}

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub uptime_secs: u64,
    pub queue_depth: usize,
    pub speculative: bool,
}

/// Cache statistics response.
#[derive(Debug, Serialize)]
pub struct CacheStatsResponse {
    pub kv: KvStats,
    pub adapters: AdapterStats,
    pub queue_depth: usize,
    pub active_tenants: Vec<String>,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: ErrorBody,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    message: String,
    kind: &'static str,
    retryable: bool,
}

/// Errors surfaced by the HTTP layer.
#[derive(Debug)]
pub enum ApiError {
    Serve(ServeError),
    Timeout(Duration),
    Metrics(String),
}

impl From<ServeError> for ApiError {
    fn from(err: ServeError) -> Self {
        ApiError::Serve(err)
    }
}

pub fn status_for(err: &ServeError) -> StatusCode {
    match err {
        ServeError::AdapterNotFound(_) => StatusCode::NOT_FOUND,
        ServeError::CapacityExceeded(_) | ServeError::CacheRace(_) | ServeError::ShuttingDown => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        ServeError::AdmissionTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        ServeError::Engine(_) => StatusCode::BAD_GATEWAY,
        ServeError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        ServeError::Cancelled => StatusCode::CONFLICT,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            ApiError::Serve(err) => (
                status_for(&err),
                ErrorBody {
                    message: err.to_string(),
                    kind: err.kind(),
                    retryable: err.is_retryable(),
                },
            ),
            ApiError::Timeout(after) => (
                StatusCode::GATEWAY_TIMEOUT,
                ErrorBody {
                    message: format!("request did not complete within {}s", after.as_secs()),
                    kind: "request_timeout",
                    retryable: true,
                },
            ),
            ApiError::Metrics(message) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                ErrorBody {
                    message,
                    kind: "metrics_error",
                    retryable: false,
                },
            ),
        };
        (status, Json(ErrorResponse { error: body })).into_response()
    }
}

// ─── Route Handlers ────────────────────────────────────────────────────────

async fn generate(
    State(state): State<Arc<AppState>>,
    Json(req): Json<GenerateRequest>,
) -> Result<Json<GenerateResponse>, ApiError> {
    let started = Instant::now();
    let request = req.into_generation_request();
    info!(
        request_id = %request.request_id,
        tenant = %request.tenant_id,
        adapter_id = ?request.adapter_id,
        max_tokens = request.max_tokens,
        "Generate request"
    );

    let timeout = Duration::from_secs(state.serve.config().server.request_timeout_secs);
    let handle = state.serve.submit(request).await;
    let result = match tokio::time::timeout(timeout, handle).await {
        Ok(outcome) => outcome?,
        Err(_) => {
            warn!(timeout_secs = timeout.as_secs(), "Generate request timed out");
            return Err(ApiError::Timeout(timeout));
        }
    };

    state
        .serve
        .metrics()
        .request_latency_ms
        .with_label_values(&[ENDPOINT_GENERATE])
        .observe(started.elapsed().as_secs_f64() * 1000.0);

    Ok(Json(GenerateResponse {
        text: result.text,
        tokens: result.tokens,
    }))
}

async fn generate_stream(
    State(state): State<Arc<AppState>>,
    Json(req): Json<GenerateRequest>,
) -> impl IntoResponse {
    let request = req.into_generation_request();
    info!(
        request_id = %request.request_id,
        tenant = %request.tenant_id,
        adapter_id = ?request.adapter_id,
        "Streaming generate request"
    );

    let (handle, rx) = state.serve.submit_streaming(request).await;
    Sse::new(chunks_to_sse_stream(rx, handle)).keep_alive(KeepAlive::default())
}

async fn metrics(State(state): State<Arc<AppState>>) -> Result<Response, ApiError> {
    let metrics = state.serve.metrics();
    metrics.record_kv(&state.serve.kv_stats());
    metrics.record_adapters(&state.serve.adapter_stats());
    metrics.queue_depth.set(state.serve.queue_depth() as i64);

    let body = metrics
        .encode()
        .map_err(|e| ApiError::Metrics(e.to_string()))?;
    Ok(([(CONTENT_TYPE, metrics.content_type())], body).into_response())
}

async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: if state.serve.is_accepting() {
            "ok"
        } else {
            "shutting_down"
        },
        uptime_secs: state.serve.uptime_secs(),
        queue_depth: state.serve.queue_depth(),
        speculative: state.serve.speculative_enabled(),
    })
}

async fn cache_stats(State(state): State<Arc<AppState>>) -> Json<CacheStatsResponse> {
    Json(CacheStatsResponse {
        kv: state.serve.kv_stats(),
        adapters: state.serve.adapter_stats(),
        queue_depth: state.serve.queue_depth(),
        active_tenants: state.serve.active_tenants(),
    })
}
