//! Core Tool trait and result types
//!
//! Every tool the agent can call implements [`Tool`]. Handlers receive the
//! executor so they can reach whichever providers are wired at call time.

use async_trait::async_trait;
use futures::future::BoxFuture;
use pulse_core::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

use crate::executor::ToolExecutor;

/// Tool definition metadata as advertised over `tools/list`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    #[serde(rename = "inputSchema")]
    pub input_schema: Value,
    /// Hidden and refused at `read_only`
    #[serde(skip)]
    pub require_control: bool,
}

/// One content part of a tool result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentPart {
    #[serde(rename = "type")]
    pub kind: String,
    pub text: String,
}

/// Result handed back to the model. Failures the model can act on are
/// carried here with `is_error` set rather than raised as errors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub content: Vec<ContentPart>,
    #[serde(rename = "isError", default)]
    pub is_error: bool,
}

impl ToolResult {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content: vec![ContentPart {
                kind: "text".to_string(),
                text: text.into(),
            }],
            is_error: false,
        }
    }

    pub fn error(text: impl Into<String>) -> Self {
        Self {
            is_error: true,
            ..Self::text(text)
        }
    }

    /// JSON-encode a structured payload into a single text part
    pub fn json<T: Serialize>(value: &T) -> Result<Self> {
        Ok(Self::text(serde_json::to_string(value)?))
    }

    /// Concatenated text of all parts
    pub fn text_content(&self) -> String {
        self.content
            .iter()
            .map(|c| c.text.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Core trait for all tools
#[async_trait]
pub trait Tool: Send + Sync {
    /// Get the tool name (unique identifier)
    fn name(&self) -> &str;

    /// Get the LLM-facing description
    fn description(&self) -> &str;

    /// Get JSON schema for input validation
    fn input_schema(&self) -> Value;

    /// Whether the tool mutates infrastructure
    fn requires_control(&self) -> bool {
        false
    }

    /// Execute the tool with given input
    async fn execute(&self, executor: &ToolExecutor, input: Value) -> Result<ToolResult>;

    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name().to_string(),
            description: self.description().to_string(),
            input_schema: self.input_schema(),
            require_control: self.requires_control(),
        }
    }
}

/// Type alias for boxed tools
pub type BoxedTool = Arc<dyn Tool>;

type Handler = dyn for<'a> Fn(&'a ToolExecutor, Value) -> BoxFuture<'a, Result<ToolResult>> + Send + Sync;

/// Tool backed by an executor method
#[derive(Clone)]
pub struct FnTool {
    name: String,
    description: String,
    schema: Value,
    require_control: bool,
    handler: Arc<Handler>,
}

impl FnTool {
    pub fn new<F>(name: &str, description: &str, schema: Value, handler: F) -> Self
    where
        F: for<'a> Fn(&'a ToolExecutor, Value) -> BoxFuture<'a, Result<ToolResult>> + Send + Sync + 'static,
    {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            schema,
            require_control: false,
            handler: Arc::new(handler),
        }
    }

    /// Mark as mutating
    pub fn mutating(mut self) -> Self {
        self.require_control = true;
        self
    }
}

#[async_trait]
impl Tool for FnTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn input_schema(&self) -> Value {
        self.schema.clone()
    }

    fn requires_control(&self) -> bool {
        self.require_control
    }

    async fn execute(&self, executor: &ToolExecutor, input: Value) -> Result<ToolResult> {
        (self.handler)(executor, input).await
    }
}

// ============================================================================
// ARGUMENT HELPERS
// ============================================================================

pub(crate) fn str_arg<'a>(args: &'a Value, key: &str) -> &'a str {
    args.get(key).and_then(Value::as_str).unwrap_or("").trim()
}

pub(crate) fn bool_arg(args: &Value, key: &str) -> bool {
    match args.get(key) {
        Some(Value::Bool(b)) => *b,
        Some(Value::String(s)) => s.eq_ignore_ascii_case("true"),
        _ => false,
    }
}

/// Integer argument; models sometimes send numbers as strings or floats
pub(crate) fn int_arg(args: &Value, key: &str, default: usize) -> usize {
    match args.get(key) {
        Some(Value::Number(n)) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64))
            .map(|v| v as usize)
            .unwrap_or(default),
        Some(Value::String(s)) => s.trim().parse().unwrap_or(default),
        _ => default,
    }
}

pub(crate) fn paginate<T>(items: Vec<T>, offset: usize, limit: usize) -> Vec<T> {
    items.into_iter().skip(offset).take(limit).collect()
}
