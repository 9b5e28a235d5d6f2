//! HTTP API server.
//!
//! Exposes search and retrieval over a small JSON API. Request validation
//! happens before any processing; validation failures return 400 with a
//! structured body, storage failures during a search return 500 with code
//! `search_failed` (distinct from an empty result set, which is a 200).
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/search` | Ranked message search (lexical, semantic, hybrid) |
//! | `GET`  | `/search/conversations` | Conversation-metadata listing |
//! | `GET`  | `/search/stats` | Search-log summary (counts, avg latency, recent queries) |
//! | `GET`  | `/messages/{id}` | One message with conversation context |
//! | `GET`  | `/health` | Health check (returns version) |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "query must not be empty" } }
//! ```
//!
//! Error codes: `bad_request` (400), `not_found` (404), `search_failed` (500),
//! `internal` (500).
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted to support browser-based
//! clients.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use crate::config::Config;
use crate::db;
use crate::get::get_message;
use crate::models::{Provider, Role, SearchMode};
use crate::search::{self, SearchFilters, SearchParams};

#[derive(Clone)]
struct AppState {
    config: Arc<Config>,
    pool: SqlitePool,
}

/// Start the HTTP server on `[server].bind` and run until the process is
/// terminated.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let bind_addr = config.server.bind.clone();
    let pool = db::connect(config).await?;
    let state = AppState {
        config: Arc::new(config.clone()),
        pool,
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/search", get(handle_search))
        .route("/search/conversations", get(handle_search_conversations))
        .route("/search/stats", get(handle_search_stats))
        .route("/messages/{id}", get(handle_get_message))
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(state);

    println!("chatvault server listening on http://{}", bind_addr);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
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

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request".to_string(),
        message: message.into(),
    }
}

fn not_found(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::NOT_FOUND,
        code: "not_found".to_string(),
        message: message.into(),
    }
}

fn search_failed(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        code: "search_failed".to_string(),
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

fn default_owner() -> String {
    "local".to_string()
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

// ============ GET /search ============

#[derive(Deserialize)]
struct SearchQuery {
    q: String,
    #[serde(default = "default_mode")]
    mode: String,
    limit: Option<i64>,
    #[serde(default)]
    offset: i64,
    provider: Option<String>,
    role: Option<String>,
    project_id: Option<String>,
    /// Inclusive epoch-seconds bounds on message timestamp.
    after: Option<i64>,
    before: Option<i64>,
    alpha: Option<f64>,
    threshold: Option<f64>,
    #[serde(default)]
    context: bool,
    #[serde(default = "default_owner")]
    owner: String,
}

fn default_mode() -> String {
    "hybrid".to_string()
}

#[derive(Serialize)]
struct SearchResponseBody {
    results: Vec<crate::models::SearchResult>,
    total: usize,
    execution_time_ms: u64,
}

/// Validate and convert raw query parameters into [`SearchParams`], before
/// touching the database.
fn validate_search_query(config: &Config, q: &SearchQuery) -> Result<SearchParams, AppError> {
    if q.q.trim().is_empty() {
        return Err(bad_request("query must not be empty"));
    }

    let mode = SearchMode::parse(&q.mode)
        .ok_or_else(|| bad_request("mode must be lexical, semantic, or hybrid"))?;

    let limit = q.limit.unwrap_or(config.retrieval.default_limit);
    if limit < 1 || limit > config.retrieval.max_limit {
        return Err(bad_request(format!(
            "limit must be between 1 and {}",
            config.retrieval.max_limit
        )));
    }
    if q.offset < 0 {
        return Err(bad_request("offset must be >= 0"));
    }

    let provider = match &q.provider {
        Some(p) => Some(
            Provider::parse(p).ok_or_else(|| bad_request("provider must be chatgpt or claude"))?,
        ),
        None => None,
    };
    let role = match &q.role {
        Some(r) => Some(Role::parse(r).ok_or_else(|| {
            bad_request("role must be user, assistant, system, or unknown")
        })?),
        None => None,
    };

    if let Some(alpha) = q.alpha {
        if !(0.0..=1.0).contains(&alpha) {
            return Err(bad_request("alpha must be in [0.0, 1.0]"));
        }
    }
    if let Some(threshold) = q.threshold {
        if !(0.0..=1.0).contains(&threshold) {
            return Err(bad_request("threshold must be in [0.0, 1.0]"));
        }
    }

    Ok(SearchParams {
        query: q.q.clone(),
        mode,
        filters: SearchFilters {
            provider,
            role,
            project_id: q.project_id.clone(),
            after: q.after,
            before: q.before,
        },
        limit,
        offset: q.offset,
        alpha: q.alpha,
        threshold: q.threshold,
        include_context: q.context,
    })
}

async fn handle_search(
    State(state): State<AppState>,
    Query(query): Query<SearchQuery>,
) -> Result<Json<SearchResponseBody>, AppError> {
    let params = validate_search_query(&state.config, &query)?;

    let response = search::execute_search(&state.pool, &state.config, &query.owner, &params)
        .await
        .map_err(|e| search_failed(e.to_string()))?;

    Ok(Json(SearchResponseBody {
        results: response.results,
        total: response.total,
        execution_time_ms: response.execution_time_ms,
    }))
}

// ============ GET /search/conversations ============

#[derive(Deserialize)]
struct ConversationQuery {
    q: Option<String>,
    provider: Option<String>,
    project_id: Option<String>,
    limit: Option<i64>,
    #[serde(default)]
    offset: i64,
    #[serde(default = "default_owner")]
    owner: String,
}

#[derive(Serialize)]
struct ConversationListResponse {
    conversations: Vec<crate::models::ConversationSummary>,
    total: usize,
}

async fn handle_search_conversations(
    State(state): State<AppState>,
    Query(query): Query<ConversationQuery>,
) -> Result<Json<ConversationListResponse>, AppError> {
    let limit = query.limit.unwrap_or(state.config.retrieval.default_limit);
    if limit < 1 || limit > state.config.retrieval.max_limit {
        return Err(bad_request(format!(
            "limit must be between 1 and {}",
            state.config.retrieval.max_limit
        )));
    }
    if query.offset < 0 {
        return Err(bad_request("offset must be >= 0"));
    }
    let provider = match &query.provider {
        Some(p) => Some(
            Provider::parse(p).ok_or_else(|| bad_request("provider must be chatgpt or claude"))?,
        ),
        None => None,
    };

    let conversations = search::search_conversations(
        &state.pool,
        &query.owner,
        query.q.as_deref(),
        provider,
        query.project_id.as_deref(),
        limit,
        query.offset,
    )
    .await
    .map_err(|e| internal(e.to_string()))?;

    Ok(Json(ConversationListResponse {
        total: conversations.len(),
        conversations,
    }))
}

// ============ GET /search/stats ============

#[derive(Deserialize)]
struct SearchStatsQuery {
    #[serde(default = "default_owner")]
    owner: String,
}

async fn handle_search_stats(
    State(state): State<AppState>,
    Query(query): Query<SearchStatsQuery>,
) -> Result<Json<crate::stats::SearchLogSummary>, AppError> {
    let summary = crate::stats::search_log_summary(&state.pool, &query.owner)
        .await
        .map_err(|e| internal(e.to_string()))?;

    Ok(Json(summary))
}

// ============ GET /messages/{id} ============

#[derive(Deserialize)]
struct MessageQuery {
    #[serde(default = "default_owner")]
    owner: String,
}

async fn handle_get_message(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<MessageQuery>,
) -> Result<Json<crate::get::MessageResponse>, AppError> {
    let message = get_message(&state.pool, &query.owner, &id).await.map_err(|e| {
        let msg = e.to_string();
        if msg.contains("not found") {
            not_found(msg)
        } else {
            internal(msg)
        }
    })?;

    Ok(Json(message))
}
