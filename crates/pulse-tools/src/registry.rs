//! Tool Registry
//!
//! Holds every tool the executor exposes and centralizes control-level
//! gating: mutating tools are hidden from `tools/list` and refused by
//! [`ToolRegistry::execute`] while the level is `read_only`. Individual tool
//! handlers never re-check the level for visibility.
//!
//! The registry is filled once while the executor is built and is immutable
//! afterwards, so dispatch takes no lock around the handler call.

use pulse_core::{ControlLevel, Error, Result};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

use crate::executor::ToolExecutor;
use crate::tool::{BoxedTool, Tool, ToolDefinition, ToolResult};

/// Text returned for mutating tools at `read_only`
pub const CONTROL_DISABLED: &str =
    "Control tools are disabled. Enable them in Settings > AI > Control Level.";

#[derive(Default)]
pub struct ToolRegistry {
    tools: BTreeMap<String, BoxedTool>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool; a later registration with the same name replaces it
    pub fn register(&mut self, tool: impl Tool + 'static) {
        let name = tool.name().to_string();
        if self.tools.insert(name.clone(), Arc::new(tool)).is_some() {
            debug!(tool = %name, "Replaced tool registration");
        }
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<BoxedTool> {
        self.tools.get(name).cloned()
    }

    /// Definitions visible at `level`, sorted by name
    pub fn list(&self, level: ControlLevel) -> Vec<ToolDefinition> {
        self.tools
            .values()
            .filter(|t| !t.requires_control() || level.allows_control())
            .map(|t| t.definition())
            .collect()
    }

    /// Look up and run a tool
    pub async fn execute(
        &self,
        executor: &ToolExecutor,
        level: ControlLevel,
        name: &str,
        args: Value,
    ) -> Result<ToolResult> {
        let tool = self
            .get(name)
            .ok_or_else(|| Error::not_found(format!("Method not found: {}", name)))?;

        if tool.requires_control() && !level.allows_control() {
            return Err(Error::unauthorized(CONTROL_DISABLED));
        }

        let args = if args.is_null() {
            Value::Object(Default::default())
        } else {
            args
        };
        tool.execute(executor, args).await
    }
}
