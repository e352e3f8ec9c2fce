//! pulse-tools: the tool surface of the Pulse AI agent
//!
//! The agent sees infrastructure only through this crate. A
//! [`ToolExecutor`] owns an immutable [`ToolRegistry`] of named tools plus a
//! set of optional [`Providers`]; every tool degrades to a readable
//! "not available" answer when its provider is missing.
//!
//! Mutating tools are hidden at `read_only` and go through the command gate
//! (policy, suggestion text, approval sentinel) at the other levels.

pub mod adapters;
pub mod approval;
pub mod executor;
pub mod providers;
pub mod registry;
pub mod sanitize;
pub mod tool;
pub mod tools;

pub use adapters::SnapshotProviders;
pub use approval::{ApprovalRecord, ApprovalRequest, ApprovalStatus, ApprovalStore, APPROVAL_PREFIX};
pub use executor::{ExecutionContext, Providers, ToolExecutor};
pub use providers::*;
pub use registry::{ToolRegistry, CONTROL_DISABLED};
pub use tool::{ContentPart, Tool, ToolDefinition, ToolResult};
pub use tools::{format_command_output, TOOL_PREFIX};
