//! HTTP server.
//!
//! Exposes the knowledge-base tools as a plain JSON API and as an MCP
//! Streamable HTTP endpoint. Every tool is registered in one
//! [`ToolRegistry`] and dispatched through the same handler.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/tools/list` | List tools with input and output schemas |
//! | `POST` | `/tools/{name}` | Call a tool; body is its input object |
//! | `GET`  | `/health` | Health check (returns version and index state) |
//! | `*`    | `/mcp` | MCP Streamable HTTP transport |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "index_unavailable", "message": "..." } }
//! ```
//!
//! | Code | Status |
//! |------|--------|
//! | `invalid_request` | 400 |
//! | `permission_denied` | 403 |
//! | `not_found` | 404 |
//! | `ingestion_in_progress` | 409 |
//! | `rate_limited` | 429 |
//! | `source_unavailable`, `embedding_failed` | 502 |
//! | `index_unavailable`, `index_busy` | 503 |
//! | `configuration_error`, `internal` | 500 |

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use rmcp::transport::streamable_http_server::{
    session::local::LocalSessionManager, StreamableHttpService,
};
use serde::Serialize;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use crate::error::{error_body, ErrorBody as KbErrorBody};
use crate::kb::KnowledgeBase;
use crate::mcp::McpBridge;
use crate::traits::{ToolContext, ToolRegistry};

#[derive(Clone)]
struct AppState {
    kb: Arc<KnowledgeBase>,
    tools: Arc<ToolRegistry>,
}

/// Build the router. Split out so tests can serve it on an ephemeral port.
pub fn router(kb: Arc<KnowledgeBase>, tools: Arc<ToolRegistry>) -> Router {
    let bridge = McpBridge::new(kb.clone(), tools.clone());
    let mcp = StreamableHttpService::new(
        move || Ok(bridge.clone()),
        LocalSessionManager::default().into(),
        Default::default(),
    );

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/tools/list", get(handle_list_tools))
        .route("/tools/{name}", post(handle_tool_call))
        .route("/health", get(handle_health))
        .nest_service("/mcp", mcp)
        .layer(cors)
        .with_state(AppState { kb, tools })
}

/// Serve on `[server].bind` until the process is terminated.
pub async fn run_server(kb: Arc<KnowledgeBase>) -> anyhow::Result<()> {
    let bind_addr = kb.config().server.bind.clone();
    let tools = Arc::new(ToolRegistry::with_builtins());
    for t in tools.tools() {
        info!(tool = t.name(), "registered tool");
    }

    let app = router(kb, tools);
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!(addr = %bind_addr, "HTTP server listening (MCP at /mcp)");
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
    body: KbErrorBody,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.body.kind,
                message: self.body.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn status_for(kind: &str) -> StatusCode {
    match kind {
        "invalid_request" => StatusCode::BAD_REQUEST,
        "permission_denied" => StatusCode::FORBIDDEN,
        "not_found" => StatusCode::NOT_FOUND,
        "ingestion_in_progress" => StatusCode::CONFLICT,
        "rate_limited" => StatusCode::TOO_MANY_REQUESTS,
        "source_unavailable" | "embedding_failed" => StatusCode::BAD_GATEWAY,
        "index_unavailable" | "index_busy" => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn classify_tool_error(tool_name: &str, err: anyhow::Error) -> AppError {
    let body = error_body(&err);
    warn!(tool = tool_name, kind = %body.kind, "tool call failed: {}", body.message);
    AppError {
        status: status_for(&body.kind),
        body,
    }
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
    index: String,
}

async fn handle_health(State(state): State<AppState>) -> Json<HealthResponse> {
    let index = match state.kb.stats().await {
        Ok(stats) => stats.state.as_str().to_string(),
        Err(e) => e.kind().to_string(),
    };
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        index,
    })
}

// ============ GET /tools/list ============

#[derive(Serialize)]
struct ToolInfo {
    name: String,
    description: String,
    builtin: bool,
    parameters: serde_json::Value,
    output: serde_json::Value,
}

#[derive(Serialize)]
struct ToolListResponse {
    tools: Vec<ToolInfo>,
}

async fn handle_list_tools(State(state): State<AppState>) -> Json<ToolListResponse> {
    let tools = state
        .tools
        .tools()
        .iter()
        .map(|t| ToolInfo {
            name: t.name().to_string(),
            description: t.description().to_string(),
            builtin: t.is_builtin(),
            parameters: t.parameters_schema(),
            output: t.output_schema(),
        })
        .collect();
    Json(ToolListResponse { tools })
}

// ============ POST /tools/{name} ============

async fn handle_tool_call(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(params): Json<serde_json::Value>,
) -> Result<Json<serde_json::Value>, AppError> {
    let tool = state.tools.find(&name).ok_or_else(|| AppError {
        status: StatusCode::NOT_FOUND,
        body: KbErrorBody {
            kind: "not_found".to_string(),
            message: format!("no tool registered with name: {}", name),
        },
    })?;

    if !params.is_object() {
        return Err(AppError {
            status: StatusCode::BAD_REQUEST,
            body: KbErrorBody {
                kind: "invalid_request".to_string(),
                message: format!("{}: request body must be a JSON object", name),
            },
        });
    }

    let ctx = ToolContext::new(state.kb.clone());
    let result = tool
        .execute(params, &ctx)
        .await
        .map_err(|e| classify_tool_error(&name, e))?;

    Ok(Json(serde_json::json!({ "result": result })))
}
