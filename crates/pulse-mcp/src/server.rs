//! MCP request handling
//!
//! Transport-agnostic: takes a decoded JSON-RPC request and answers it from
//! the current tool executor. The executor can be swapped at runtime, e.g.
//! when a patrol run wires its own finding creator.

use pulse_tools::{ToolExecutor, ToolResult};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::protocol::{JsonRpcError, McpRequest, McpResponse};
use crate::{PROTOCOL_VERSION, SERVER_NAME, SERVER_VERSION};

pub struct McpServer {
    executor: RwLock<Arc<ToolExecutor>>,
}

impl McpServer {
    pub fn new(executor: Arc<ToolExecutor>) -> Self {
        Self {
            executor: RwLock::new(executor),
        }
    }

    pub async fn set_executor(&self, executor: Arc<ToolExecutor>) {
        *self.executor.write().await = executor;
    }

    pub async fn executor(&self) -> Arc<ToolExecutor> {
        self.executor.read().await.clone()
    }

    /// Answer one request; `None` for notifications that take no reply
    pub async fn handle_request(&self, request: McpRequest) -> Option<McpResponse> {
        debug!(method = %request.method, "Handling MCP request");

        if request.jsonrpc != "2.0" {
            return Some(McpResponse::error(
                request.id,
                JsonRpcError::invalid_request("jsonrpc must be \"2.0\""),
            ));
        }

        let response = match request.method.as_str() {
            "initialize" => self.handle_initialize(request),
            "initialized" | "notifications/initialized" => return None,
            "ping" => McpResponse::success(request.id, json!({})),
            "tools/list" => self.handle_tools_list(request).await,
            "tools/call" => self.handle_tools_call(request).await,
            "resources/list" => McpResponse::success(request.id, json!({"resources": []})),
            "prompts/list" => McpResponse::success(request.id, json!({"prompts": []})),
            _ => McpResponse::error(request.id, JsonRpcError::method_not_found(&request.method)),
        };
        Some(response)
    }

    fn handle_initialize(&self, request: McpRequest) -> McpResponse {
        let client = request
            .params
            .as_ref()
            .and_then(|p| p.get("clientInfo"))
            .and_then(|ci| ci.get("name"))
            .and_then(Value::as_str)
            .unwrap_or("unknown");
        info!(client = %client, "MCP client connected");

        McpResponse::success(
            request.id,
            json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": {
                    "tools": {"listChanged": false}
                },
                "serverInfo": {
                    "name": SERVER_NAME,
                    "version": SERVER_VERSION
                }
            }),
        )
    }

    async fn handle_tools_list(&self, request: McpRequest) -> McpResponse {
        let tools = self.executor().await.list_tools().await;
        McpResponse::success(request.id, json!({"tools": tools}))
    }

    async fn handle_tools_call(&self, request: McpRequest) -> McpResponse {
        let Some(params) = request.params.as_ref() else {
            return McpResponse::error(request.id, JsonRpcError::invalid_params("Missing params"));
        };
        let Some(name) = params.get("name").and_then(Value::as_str) else {
            return McpResponse::error(request.id, JsonRpcError::invalid_params("Missing tool name"));
        };
        let arguments = params.get("arguments").cloned().unwrap_or_else(|| json!({}));

        let executor = self.executor().await;
        let result = match executor.execute_tool(name, arguments).await {
            Ok(result) => result,
            Err(e) => {
                // Surface to the model as a failed tool result so it can recover
                warn!(tool = %name, error = %e, "Tool execution failed");
                ToolResult::error(e.to_string())
            }
        };

        match serde_json::to_value(&result) {
            Ok(value) => McpResponse::success(request.id, value),
            Err(e) => McpResponse::error(request.id, JsonRpcError::internal_error(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pulse_tools::Providers;

    fn server() -> McpServer {
        McpServer::new(Arc::new(ToolExecutor::new(Providers::default())))
    }

    #[tokio::test]
    async fn test_initialize_advertises_tools_only() {
        let resp = server()
            .handle_request(McpRequest::new("initialize").with_id(1))
            .await
            .unwrap();
        let result = resp.result.unwrap();
        assert_eq!(result["protocolVersion"], PROTOCOL_VERSION);
        assert!(result["capabilities"]["tools"].is_object());
        assert!(result["capabilities"].get("resources").is_none());
        assert_eq!(result["serverInfo"]["name"], SERVER_NAME);
    }

    #[tokio::test]
    async fn test_initialized_gets_no_reply() {
        assert!(server()
            .handle_request(McpRequest::new("notifications/initialized"))
            .await
            .is_none());
    }

    #[tokio::test]
    async fn test_unknown_method() {
        let resp = server()
            .handle_request(McpRequest::new("sampling/createMessage").with_id(2))
            .await
            .unwrap();
        assert_eq!(resp.error.unwrap().code, crate::protocol::METHOD_NOT_FOUND);
    }

    #[tokio::test]
    async fn test_tool_errors_are_results() {
        let resp = server()
            .handle_request(
                McpRequest::new("tools/call")
                    .with_id(3)
                    .with_params(json!({"name": "pulse_run_command", "arguments": {"command": "ls"}})),
            )
            .await
            .unwrap();
        assert!(resp.error.is_none());
        let result = resp.result.unwrap();
        assert_eq!(result["isError"], true);
        assert!(result["content"][0]["text"]
            .as_str()
            .unwrap()
            .contains("Control tools are disabled"));
    }

    #[tokio::test]
    async fn test_stub_lists() {
        let s = server();
        let resources = s
            .handle_request(McpRequest::new("resources/list").with_id(4))
            .await
            .unwrap();
        assert_eq!(resources.result.unwrap()["resources"], json!([]));
        let prompts = s
            .handle_request(McpRequest::new("prompts/list").with_id(5))
            .await
            .unwrap();
        assert_eq!(prompts.result.unwrap()["prompts"], json!([]));
    }
}
