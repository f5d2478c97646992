//! HTTP API.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/ask` | Answer `{"question": "..."}`; returns the full answer record |
//! | `GET`  | `/tables` | Catalog tables with comments and column counts |
//! | `GET`  | `/health` | Health check (returns version) |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "question must not be empty" } }
//! ```
//!
//! A question that ends in `exhausted-retries`, `rejected-unsafe` or
//! `execution-error-fatal` is still a `200`: the terminal status and the
//! explanation are part of the answer record. Error bodies are reserved for
//! requests that never reach the pipeline.
//!
//! When a client disconnects, axum drops the handler future, which drops the
//! in-flight model call or database execution and returns its connection to
//! the pool.

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use crate::config::Config;
use crate::controller::QueryAgent;
use crate::models::AnswerResult;

#[derive(Clone)]
struct AppState {
    agent: Arc<QueryAgent>,
}

/// Build the agent from `config` and serve until the process exits.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let agent = Arc::new(QueryAgent::from_config(config).await?);
    let app = router(agent);

    let bind_addr = config.server.bind.clone();
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!(bind = %bind_addr, "listening");
    println!("pq server listening on http://{}", bind_addr);

    axum::serve(listener, app).await?;
    Ok(())
}

pub fn router(agent: Arc<QueryAgent>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/ask", post(handle_ask))
        .route("/tables", get(handle_tables))
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(AppState { agent })
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

// ============ GET /tables ============

#[derive(Serialize)]
struct TableSummary {
    name: String,
    comment: String,
    columns: usize,
}

#[derive(Serialize)]
struct TablesResponse {
    tables: Vec<TableSummary>,
}

async fn handle_tables(State(state): State<AppState>) -> Json<TablesResponse> {
    let tables = state
        .agent
        .catalog()
        .tables()
        .iter()
        .map(|t| TableSummary {
            name: t.name.clone(),
            comment: t.comment.clone(),
            columns: t.columns.len(),
        })
        .collect();
    Json(TablesResponse { tables })
}

// ============ POST /ask ============

#[derive(Deserialize)]
struct AskRequest {
    question: String,
}

async fn handle_ask(
    State(state): State<AppState>,
    Json(request): Json<AskRequest>,
) -> Result<Json<AnswerResult>, AppError> {
    let question = request.question.trim();
    if question.is_empty() {
        return Err(bad_request("question must not be empty"));
    }
    Ok(Json(state.agent.ask(question).await))
}
