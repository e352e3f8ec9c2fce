//! HTTP Transport
//!
//! Loopback JSON-RPC endpoint for the LLM runtime: `POST /` carries one
//! request, `GET /health` reports liveness. Bodies are read in full and
//! decoded here so malformed JSON still gets a JSON-RPC parse error.

use anyhow::{Context, Result};
use axum::{
    body::Bytes,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use pulse_core::{spawn_guarded, Cancellation, Lifecycle};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::{debug, error, info, Level};

use crate::protocol::{JsonRpcError, McpRequest, McpResponse};
use crate::server::McpServer;

/// Upper bound for one request; command tools wait on remote agents
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(300);

/// Router serving `server`
pub fn router(server: Arc<McpServer>) -> Router {
    Router::new()
        .route("/", post(mcp_handler))
        .route("/health", get(health_handler))
        .with_state(server)
        .layer(TimeoutLayer::new(REQUEST_TIMEOUT))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::DEBUG))
                .on_response(DefaultOnResponse::new().level(Level::DEBUG)),
        )
}

async fn health_handler() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

async fn mcp_handler(State(server): State<Arc<McpServer>>, body: Bytes) -> Response {
    let raw: Value = match serde_json::from_slice(&body) {
        Ok(v) => v,
        Err(e) => {
            return Json(McpResponse::error(None, JsonRpcError::parse_error(e.to_string())))
                .into_response()
        }
    };
    let id = raw.get("id").cloned();
    let request: McpRequest = match serde_json::from_value(raw) {
        Ok(r) => r,
        Err(e) => {
            return Json(McpResponse::error(id, JsonRpcError::invalid_request(e.to_string())))
                .into_response()
        }
    };

    debug!(method = %request.method, "HTTP MCP request");
    match server.handle_request(request).await {
        Some(response) => Json(response).into_response(),
        None => StatusCode::ACCEPTED.into_response(),
    }
}

struct Running {
    addr: SocketAddr,
    cancel: Cancellation,
    handle: JoinHandle<()>,
}

/// Owns the listener task; `start` and `stop` are idempotent
pub struct HttpTransport {
    server: Arc<McpServer>,
    bind: String,
    lifecycle: Lifecycle,
    running: Mutex<Option<Running>>,
}

impl HttpTransport {
    pub fn new(server: Arc<McpServer>, bind: impl Into<String>) -> Self {
        Self {
            server,
            bind: bind.into(),
            lifecycle: Lifecycle::new(),
            running: Mutex::new(None),
        }
    }

    /// Bind and serve in the background. Returns the bound address; a
    /// second call while running returns the existing address.
    pub async fn start(&self) -> Result<SocketAddr> {
        let mut running = self.running.lock().await;
        if let Some(r) = running.as_ref() {
            return Ok(r.addr);
        }
        if !self.lifecycle.begin_start() {
            anyhow::bail!("MCP transport is {}", self.lifecycle.state());
        }

        let listener = match tokio::net::TcpListener::bind(&self.bind).await {
            Ok(l) => l,
            Err(e) => {
                self.lifecycle.mark_failed();
                return Err(e).with_context(|| format!("failed to bind MCP server on {}", self.bind));
            }
        };
        let addr = listener.local_addr()?;

        let cancel = Cancellation::new();
        let app = router(self.server.clone());
        let shutdown = cancel.clone();
        let handle = spawn_guarded("mcp-http", async move {
            let served = axum::serve(listener, app)
                .with_graceful_shutdown(async move { shutdown.cancelled().await })
                .await;
            if let Err(e) = served {
                error!(error = %e, "MCP HTTP server failed");
            }
        });

        info!(addr = %addr, "MCP HTTP server listening");
        *running = Some(Running { addr, cancel, handle });
        self.lifecycle.mark_running();
        Ok(addr)
    }

    pub async fn stop(&self) {
        let Some(running) = self.running.lock().await.take() else {
            return;
        };
        self.lifecycle.begin_stop();
        running.cancel.cancel();
        if let Err(e) = running.handle.await {
            error!(error = %e, "MCP HTTP server task join failed");
        }
        self.lifecycle.mark_stopped();
        info!(addr = %running.addr, "MCP HTTP server stopped");
    }

    pub async fn addr(&self) -> Option<SocketAddr> {
        self.running.lock().await.as_ref().map(|r| r.addr)
    }

    /// URL the LLM runtime should be configured with
    pub async fn url(&self) -> Option<String> {
        self.addr().await.map(|a| format!("http://{}/", a))
    }
}
