//! Built-in tool groups
//!
//! Each submodule adds `impl ToolExecutor` handlers plus a `register`
//! function wiring them into the registry.

mod control;
mod findings;
mod infrastructure;
mod knowledge;
mod patrol;
mod profile;
mod query;

use crate::registry::ToolRegistry;

/// Prefix shared by every tool name the agent sees
pub const TOOL_PREFIX: &str = "pulse_";

pub(crate) const STATE_UNAVAILABLE: &str = "State information not available.";

pub(crate) fn register_all(registry: &mut ToolRegistry) {
    query::register(registry);
    patrol::register(registry);
    infrastructure::register(registry);
    profile::register(registry);
    control::register(registry);
    knowledge::register(registry);
    findings::register(registry);
}

pub use control::format_command_output;
