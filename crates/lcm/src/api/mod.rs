//! RPC surface: the six retrieval/operator verbs over HTTP JSON.
//!
//! Handlers are thin wrappers over the tools module; every error comes
//! back structured as a status code + message rather than a transport
//! failure.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::State,
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::Value;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};
use tracing::info;

use crate::compaction::CompactionEngine;
use crate::config::Config;
use crate::errors::LcmError;
use crate::llm::LlmClient;
use crate::store::Store;
use crate::tools;

pub struct AppState {
    pub store: Arc<Store>,
    pub engine: Arc<CompactionEngine>,
    pub llm: Arc<dyn LlmClient>,
    pub cfg: Config,
}

type SharedState = Arc<AppState>;

pub async fn serve(state: SharedState) -> anyhow::Result<()> {
    let addr = state.cfg.api_addr.clone();
    info!("Starting RPC server on {}", addr);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let app = build_router(state);
    axum::serve(listener, app).await?;
    Ok(())
}

fn build_router(state: SharedState) -> Router {
    Router::new()
        .route("/tools/status", post(status_handler))
        .route("/tools/grep", post(grep_handler))
        .route("/tools/describe", post(describe_handler))
        .route("/tools/expand", post(expand_handler))
        .route("/tools/llm_map", post(llm_map_handler))
        .route("/tools/agentic_map", post(agentic_map_handler))
        .route("/healthz", get(|| async { "OK" }))
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(Duration::from_secs(600)))
        .with_state(state)
}

fn into_http(err: LcmError) -> (StatusCode, String) {
    let status = match &err {
        LcmError::InputError(_) => StatusCode::BAD_REQUEST,
        LcmError::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        LcmError::LlmUnavailable { .. } => StatusCode::BAD_GATEWAY,
        LcmError::TranscriptUnreadable { .. } => StatusCode::NOT_FOUND,
        LcmError::InvariantViolation(_) | LcmError::Other(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    (status, err.to_string())
}

fn default_session() -> String {
    "default".to_string()
}

#[derive(Debug, Deserialize)]
struct StatusRequest {
    #[serde(default = "default_session")]
    session_id: String,
}

async fn status_handler(
    State(state): State<SharedState>,
    Json(payload): Json<StatusRequest>,
) -> Result<Json<tools::StatusReport>, (StatusCode, String)> {
    tools::status(&state.store, &payload.session_id)
        .map(Json)
        .map_err(into_http)
}

#[derive(Debug, Deserialize)]
struct GrepRequest {
    #[serde(default = "default_session")]
    session_id: String,
    query: String,
    #[serde(default = "GrepRequest::default_mode")]
    mode: String,
    #[serde(default = "GrepRequest::default_scope")]
    scope: String,
    /// Restrict the scan to the messages one summary covers.
    summary_id: Option<i64>,
    page: Option<String>,
}

impl GrepRequest {
    fn default_mode() -> String {
        "fts".to_string()
    }
    fn default_scope() -> String {
        "both".to_string()
    }
}

async fn grep_handler(
    State(state): State<SharedState>,
    Json(payload): Json<GrepRequest>,
) -> Result<Json<tools::GrepResponse>, (StatusCode, String)> {
    let mode = tools::SearchMode::parse(&payload.mode).map_err(into_http)?;
    let scope = tools::memory::parse_scope(&payload.scope).map_err(into_http)?;
    tools::grep(
        &state.store,
        &state.cfg,
        &payload.session_id,
        &payload.query,
        mode,
        scope,
        payload.summary_id,
        payload.page.as_deref(),
    )
    .map(Json)
    .map_err(into_http)
}

#[derive(Debug, Deserialize)]
struct DescribeRequest {
    id: String,
}

async fn describe_handler(
    State(state): State<SharedState>,
    Json(payload): Json<DescribeRequest>,
) -> Result<Json<Value>, (StatusCode, String)> {
    tools::describe(&state.store, &payload.id)
        .map(Json)
        .map_err(into_http)
}

#[derive(Debug, Deserialize)]
struct ExpandRequest {
    id: String,
    #[serde(default = "ExpandRequest::default_page")]
    page: usize,
}

impl ExpandRequest {
    fn default_page() -> usize {
        1
    }
}

async fn expand_handler(
    State(state): State<SharedState>,
    Json(payload): Json<ExpandRequest>,
) -> Result<Json<Value>, (StatusCode, String)> {
    tools::expand(&state.store, &state.cfg, &payload.id, payload.page)
        .map(Json)
        .map_err(into_http)
}

#[derive(Debug, Deserialize)]
struct LlmMapRequest {
    input_path: String,
    prompt: String,
    output_schema: Option<Value>,
    #[serde(default = "LlmMapRequest::default_concurrency")]
    concurrency: usize,
}

impl LlmMapRequest {
    fn default_concurrency() -> usize {
        16
    }
}

async fn llm_map_handler(
    State(state): State<SharedState>,
    Json(payload): Json<LlmMapRequest>,
) -> Result<Json<tools::MapReport>, (StatusCode, String)> {
    tools::llm_map(
        Arc::clone(&state.llm),
        std::path::Path::new(&payload.input_path),
        &payload.prompt,
        payload.output_schema,
        payload.concurrency,
    )
    .await
    .map(Json)
    .map_err(into_http)
}

#[derive(Debug, Deserialize)]
struct AgenticMapRequest {
    input_path: String,
    prompt: String,
    output_schema: Option<Value>,
    #[serde(default = "AgenticMapRequest::default_read_only")]
    read_only: bool,
    #[serde(default = "AgenticMapRequest::default_concurrency")]
    concurrency: usize,
}

impl AgenticMapRequest {
    fn default_read_only() -> bool {
        true
    }
    fn default_concurrency() -> usize {
        4
    }
}

async fn agentic_map_handler(
    State(state): State<SharedState>,
    Json(payload): Json<AgenticMapRequest>,
) -> Result<Json<tools::MapReport>, (StatusCode, String)> {
    tools::agentic_map(
        Arc::clone(&state.llm),
        std::path::Path::new(&payload.input_path),
        &payload.prompt,
        payload.output_schema,
        payload.read_only,
        payload.concurrency,
    )
    .await
    .map(Json)
    .map_err(into_http)
}
