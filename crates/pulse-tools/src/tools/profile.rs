//! Agent scope tools: read and change the configuration profile assigned to
//! a unified host agent

use futures::FutureExt;
use pulse_core::{ControlLevel, Result, StateSnapshot};
use serde_json::{json, Map, Value};

use crate::executor::ToolExecutor;
use crate::registry::ToolRegistry;
use crate::tool::{str_arg, FnTool, ToolResult};

pub(super) fn register(registry: &mut ToolRegistry) {
    let agent_props = json!({
        "agent_id": {"type": "string", "description": "Unified agent ID (preferred if known)"},
        "hostname": {"type": "string", "description": "Hostname or display name to resolve the agent ID"}
    });

    registry.register(FnTool::new(
        "pulse_get_agent_scope",
        "Get the current unified agent scope (profile assignment and settings).",
        json!({"type": "object", "properties": agent_props.clone()}),
        |e, args| e.get_agent_scope(args).boxed(),
    ));

    let mut set_props = agent_props;
    set_props["profile_id"] = json!({
        "type": "string",
        "description": "Assign an existing profile ID (optional; omit to use settings)"
    });
    set_props["settings"] = json!({
        "type": "object",
        "description": "Profile settings (e.g., enable_host, enable_docker, enable_kubernetes, enable_proxmox, docker_runtime, disable_auto_update, log_level, interval)"
    });
    registry.register(
        FnTool::new(
            "pulse_set_agent_scope",
            "Update a unified agent's scope via safe profile settings. Use this instead of running raw commands to enable/disable modules like Docker, Kubernetes, or Proxmox.",
            json!({"type": "object", "properties": set_props}),
            |e, args| e.set_agent_scope(args).boxed(),
        )
        .mutating(),
    );
}

/// Agent id and label for a hostname, checking host agents before Docker
/// hosts
fn agent_from_hostname(state: &StateSnapshot, hostname: &str) -> Option<(String, String)> {
    let needle = hostname.trim();
    if needle.is_empty() {
        return None;
    }
    if let Some(host) = state
        .hosts
        .iter()
        .find(|h| h.hostname.eq_ignore_ascii_case(needle) || h.id.eq_ignore_ascii_case(needle))
    {
        return Some((host.id.clone(), first_non_empty(&[&host.hostname, &host.id])));
    }
    state
        .docker_hosts
        .iter()
        .find(|h| {
            h.hostname.eq_ignore_ascii_case(needle)
                || h.display_name.eq_ignore_ascii_case(needle)
                || h.id.eq_ignore_ascii_case(needle)
        })
        .map(|h| {
            let agent_id = if h.agent_id.trim().is_empty() {
                h.id.clone()
            } else {
                h.agent_id.trim().to_string()
            };
            (agent_id, first_non_empty(&[&h.display_name, &h.hostname, &h.id]))
        })
}

fn agent_label(state: &StateSnapshot, agent_id: &str) -> Option<String> {
    if let Some(host) = state.hosts.iter().find(|h| h.id.eq_ignore_ascii_case(agent_id)) {
        return Some(first_non_empty(&[&host.hostname, &host.id]));
    }
    state
        .docker_hosts
        .iter()
        .find(|h| h.agent_id.eq_ignore_ascii_case(agent_id) || h.id.eq_ignore_ascii_case(agent_id))
        .map(|h| first_non_empty(&[&h.display_name, &h.hostname, &h.id]))
}

/// Modules observed in state for an agent
fn observed_modules(state: &StateSnapshot, agent_id: &str) -> Vec<&'static str> {
    let mut modules = Vec::new();
    if state.hosts.iter().any(|h| h.id.eq_ignore_ascii_case(agent_id)) {
        modules.push("host");
    }
    if state
        .docker_hosts
        .iter()
        .any(|h| h.agent_id.eq_ignore_ascii_case(agent_id) || h.id.eq_ignore_ascii_case(agent_id))
    {
        modules.push("docker");
    }
    modules
}

fn first_non_empty(values: &[&String]) -> String {
    values
        .iter()
        .map(|v| v.trim())
        .find(|v| !v.is_empty())
        .unwrap_or_default()
        .to_string()
}

fn display_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// `key=value, ...` in key order
fn settings_summary(settings: &Map<String, Value>) -> String {
    if settings.is_empty() {
        return "none".to_string();
    }
    let mut keys: Vec<&String> = settings.keys().collect();
    keys.sort();
    keys.iter()
        .map(|k| format!("{}={}", k, display_value(&settings[k.as_str()])))
        .collect::<Vec<_>>()
        .join(", ")
}

enum AgentRef {
    Resolved { id: String, label: String },
    Respond(ToolResult),
}

impl ToolExecutor {
    async fn resolve_agent(&self, args: &Value) -> AgentRef {
        let agent_id = str_arg(args, "agent_id");
        let hostname = str_arg(args, "hostname");
        if agent_id.is_empty() && hostname.is_empty() {
            return AgentRef::Respond(ToolResult::error("agent_id or hostname is required"));
        }

        let state = self.snapshot().await;
        if agent_id.is_empty() {
            let Some(state) = state else {
                return AgentRef::Respond(ToolResult::error(
                    "state provider not available to resolve hostname",
                ));
            };
            return match agent_from_hostname(&state, hostname) {
                Some((id, label)) => AgentRef::Resolved { id, label },
                None => AgentRef::Respond(ToolResult::text(format!(
                    "No agent found for hostname '{}'.",
                    hostname
                ))),
            };
        }

        let label = state
            .as_ref()
            .and_then(|s| agent_label(s, agent_id))
            .unwrap_or_else(|| agent_id.to_string());
        AgentRef::Resolved {
            id: agent_id.to_string(),
            label,
        }
    }

    async fn get_agent_scope(&self, args: Value) -> Result<ToolResult> {
        let (agent_id, label) = match self.resolve_agent(&args).await {
            AgentRef::Resolved { id, label } => (id, label),
            AgentRef::Respond(result) => return Ok(result),
        };

        let scope = match self.providers().await.agent_profiles {
            Some(manager) => match manager.agent_scope(&agent_id).await {
                Ok(scope) => scope,
                Err(e) => {
                    return Ok(ToolResult::text(format!(
                        "Failed to load agent scope for {}: {}",
                        label, e
                    )))
                }
            },
            None => None,
        };
        let observed = self
            .snapshot()
            .await
            .map(|s| observed_modules(&s, &agent_id))
            .unwrap_or_default();

        let mut summary = format!("Agent: {}\nAgent ID: {}\n", label, agent_id);
        match &scope {
            None => summary.push_str("Assigned profile: none\n"),
            Some(scope) => {
                summary.push_str(&format!(
                    "Assigned profile: {} ({})\n",
                    scope.profile_name, scope.profile_id
                ));
                if scope.profile_version > 0 {
                    summary.push_str(&format!("Profile version: {}\n", scope.profile_version));
                }
            }
        }
        if !observed.is_empty() {
            summary.push_str(&format!("Observed modules: {}\n", observed.join(", ")));
        }
        match scope.as_ref().filter(|s| !s.settings.is_empty()) {
            Some(scope) => {
                summary.push_str("Profile settings:\n");
                let mut keys: Vec<&String> = scope.settings.keys().collect();
                keys.sort();
                for key in keys {
                    summary.push_str(&format!(
                        "  - {}: {}\n",
                        key,
                        display_value(&scope.settings[key.as_str()])
                    ));
                }
            }
            None => summary.push_str("Profile settings: none\n"),
        }
        summary.push_str("Note: profile changes apply after the agent restarts.");

        Ok(ToolResult::text(summary))
    }

    async fn set_agent_scope(&self, args: Value) -> Result<ToolResult> {
        let Some(manager) = self.providers().await.agent_profiles else {
            return Ok(ToolResult::text("Agent scope management is not available."));
        };

        let profile_id = str_arg(&args, "profile_id").to_string();
        let settings: Map<String, Value> = args
            .get("settings")
            .and_then(Value::as_object)
            .map(|m| {
                m.iter()
                    .filter(|(_, v)| !v.is_null())
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect()
            })
            .unwrap_or_default();

        let (agent_id, label) = match self.resolve_agent(&args).await {
            AgentRef::Resolved { id, label } => (id, label),
            AgentRef::Respond(result) => return Ok(result),
        };

        if !profile_id.is_empty() && !settings.is_empty() {
            return Ok(ToolResult::error("use either profile_id or settings, not both"));
        }
        if profile_id.is_empty() && settings.is_empty() {
            return Ok(ToolResult::error(
                "settings are required when profile_id is not provided",
            ));
        }

        if self.effective_level().await == ControlLevel::Suggest {
            return Ok(ToolResult::text(if profile_id.is_empty() {
                format!(
                    "Suggestion: apply agent scope to {} with settings: {}",
                    label,
                    settings_summary(&settings)
                )
            } else {
                format!("Suggestion: assign profile {} to agent {}.", profile_id, label)
            }));
        }

        if !profile_id.is_empty() {
            return Ok(match manager.assign_profile(&agent_id, &profile_id).await {
                Ok(name) => ToolResult::text(format!(
                    "Assigned profile '{}' ({}) to agent {}. Restart the agent to apply changes.",
                    name, profile_id, label
                )),
                Err(e) => ToolResult::error(e.to_string()),
            });
        }

        let applied = match manager.apply_agent_scope(&agent_id, &label, settings.clone()).await {
            Ok(applied) => applied,
            Err(e) => return Ok(ToolResult::error(e.to_string())),
        };
        let action = if applied.created { "Created" } else { "Updated" };
        Ok(ToolResult::text(format!(
            "{} profile '{}' ({}) and assigned to agent {}. Restart the agent to apply changes. Settings: {}",
            action,
            applied.profile_name,
            applied.profile_id,
            label,
            settings_summary(&settings)
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_summary_sorted() {
        let mut settings = Map::new();
        settings.insert("enable_docker".into(), json!(false));
        settings.insert("docker_runtime".into(), json!("podman"));
        assert_eq!(
            settings_summary(&settings),
            "docker_runtime=podman, enable_docker=false"
        );
        assert_eq!(settings_summary(&Map::new()), "none");
    }

    #[test]
    fn test_agent_from_docker_host_prefers_agent_id() {
        let mut state = StateSnapshot::default();
        state.docker_hosts.push(pulse_core::snapshot::DockerHost {
            id: "dh-1".into(),
            agent_id: "agent-9".into(),
            hostname: "box".into(),
            ..Default::default()
        });
        assert_eq!(
            agent_from_hostname(&state, "BOX"),
            Some(("agent-9".to_string(), "box".to_string()))
        );
        assert!(agent_from_hostname(&state, "other").is_none());
    }
}
