//! Control tools: command dispatch plus guest and Docker lifecycle
//!
//! Every mutating action goes through [`ToolExecutor::gate_command`]:
//! policy first, then the control level decides between a suggestion, an
//! approval sentinel or actually running the command.

use futures::FutureExt;
use pulse_core::{ControlLevel, Result};
use serde_json::{json, Map, Value};
use tracing::{info, warn};
use uuid::Uuid;

use super::STATE_UNAVAILABLE;
use crate::approval::{ApprovalRequest, APPROVAL_PREFIX};
use crate::executor::ToolExecutor;
use crate::providers::{CommandRequest, CommandResult, PolicyDecision};
use crate::registry::ToolRegistry;
use crate::sanitize::shell_quote;
use crate::tool::{bool_arg, str_arg, FnTool, ToolResult};

const COMMAND_TIMEOUT_SECS: u64 = 60;

pub(super) fn register(registry: &mut ToolRegistry) {
    registry.register(
        FnTool::new(
            "pulse_run_command",
            "Run a shell command on a monitored host or the current target through its agent. Subject to the command policy and the configured control level.",
            json!({
                "type": "object",
                "properties": {
                    "command": {"type": "string", "description": "Shell command to run"},
                    "run_on_host": {"type": "boolean", "description": "Run on the host itself rather than inside the current target"},
                    "target_host": {"type": "string", "description": "Hostname or agent id to run on"}
                },
                "required": ["command"]
            }),
            |e, args| e.run_command(args).boxed(),
        )
        .mutating(),
    );

    registry.register(
        FnTool::new(
            "pulse_control_guest",
            "Start, stop, shutdown or restart a Proxmox VM or LXC container.",
            json!({
                "type": "object",
                "properties": {
                    "guest_id": {"type": "string", "description": "VMID or guest name"},
                    "action": {"type": "string", "enum": ["start", "stop", "shutdown", "restart"]},
                    "force": {"type": "boolean", "description": "Skip lock when stopping"}
                },
                "required": ["guest_id", "action"]
            }),
            |e, args| e.control_guest(args).boxed(),
        )
        .mutating(),
    );

    registry.register(
        FnTool::new(
            "pulse_control_docker",
            "Start, stop or restart a Docker container.",
            json!({
                "type": "object",
                "properties": {
                    "container": {"type": "string", "description": "Container name or id"},
                    "host": {"type": "string", "description": "Docker host name (optional)"},
                    "action": {"type": "string", "enum": ["start", "stop", "restart"]}
                },
                "required": ["container", "action"]
            }),
            |e, args| e.control_docker(args).boxed(),
        )
        .mutating(),
    );
}

/// A mutating action ready to be gated
pub(crate) struct CommandPlan {
    pub tool: &'static str,
    pub command: String,
    pub target_type: String,
    pub target_id: String,
    pub target_name: String,
    pub target_host: String,
    pub run_on_host: bool,
    /// Text returned at `suggest`
    pub suggestion: String,
    /// Action-specific fields added to the approval payload
    pub extra: Map<String, Value>,
}

pub(crate) enum Gate {
    /// Go ahead and execute
    Proceed,
    /// Answer the model with this instead
    Respond(ToolResult),
}

/// Stdout and stderr joined, prefixed with the exit code when it is not zero
pub fn format_command_output(result: &CommandResult) -> String {
    let mut output = result.stdout.clone();
    if !result.stderr.is_empty() {
        output.push('\n');
        output.push_str(&result.stderr);
    }
    if result.exit_code != 0 {
        output = format!("Exit code {}:\n{}", result.exit_code, output);
    }
    output
}

fn policy_blocked(command: &str) -> String {
    let payload = json!({
        "type": "policy_blocked",
        "command": command,
        "reason": "This command is blocked by security policy",
        "do_not_retry": true,
    });
    format!("POLICY_BLOCKED: {}", payload)
}

impl ToolExecutor {
    pub(crate) async fn gate_command(&self, plan: &CommandPlan) -> Result<Gate> {
        let policy = self.providers().await.policy;
        let decision = policy
            .map(|p| p.evaluate(&plan.command))
            .unwrap_or(PolicyDecision::Allow);

        if decision == PolicyDecision::Deny {
            warn!(tool = plan.tool, command = %plan.command, "Command blocked by policy");
            return Ok(Gate::Respond(ToolResult::text(policy_blocked(&plan.command))));
        }

        let level = self.effective_level().await;
        match level {
            ControlLevel::ReadOnly | ControlLevel::Suggest => {
                Ok(Gate::Respond(ToolResult::text(plan.suggestion.clone())))
            }
            ControlLevel::Controlled => {
                let reason = "Control level requires approval";
                Ok(Gate::Respond(self.approval_sentinel(plan, reason).await?))
            }
            ControlLevel::Autonomous if decision == PolicyDecision::RequireApproval => {
                // Autonomous context still honors a policy that wants a human
                if self.context().await.autonomous {
                    return Ok(Gate::Proceed);
                }
                let reason = "Security policy requires approval";
                Ok(Gate::Respond(self.approval_sentinel(plan, reason).await?))
            }
            ControlLevel::Autonomous => Ok(Gate::Proceed),
        }
    }

    async fn approval_sentinel(&self, plan: &CommandPlan, reason: &str) -> Result<ToolResult> {
        let record = self
            .approvals()
            .create(ApprovalRequest {
                tool: plan.tool.to_string(),
                command: plan.command.clone(),
                target_type: plan.target_type.clone(),
                target_id: plan.target_id.clone(),
                target_name: plan.target_name.clone(),
                context: reason.to_string(),
            })
            .await;

        let mut payload = Map::new();
        payload.insert("type".into(), json!("approval_required"));
        payload.insert("approval_id".into(), json!(record.id));
        payload.insert("tool".into(), json!(plan.tool));
        payload.insert("command".into(), json!(plan.command));
        payload.insert("run_on_host".into(), json!(plan.run_on_host));
        payload.insert("target_host".into(), json!(plan.target_host));
        payload.insert("reason".into(), json!(reason));
        payload.insert(
            "how_to_approve".into(),
            json!("Ask the user to click the approval button shown in the UI."),
        );
        for (k, v) in &plan.extra {
            payload.insert(k.clone(), v.clone());
        }
        payload.insert("do_not_retry".into(), json!(true));

        let body = serde_json::to_string(&Value::Object(payload))?;
        Ok(ToolResult::text(format!("{}{}", APPROVAL_PREFIX, body)))
    }

    /// Agent id for `target` (hostname or agent id); first connected agent
    /// when no target is given
    pub(crate) async fn find_agent(&self, target: &str) -> Option<String> {
        let agents = self.providers().await.agents?.connected_agents();
        if target.is_empty() {
            return agents.first().map(|a| a.agent_id.clone());
        }
        agents
            .into_iter()
            .find(|a| a.hostname == target || a.agent_id == target)
            .map(|a| a.agent_id)
    }

    /// Run on an agent; transport failures come back as error results
    async fn dispatch(&self, agent_id: &str, plan: &CommandPlan) -> std::result::Result<CommandResult, ToolResult> {
        let Some(agents) = self.providers().await.agents else {
            return Err(ToolResult::error("no agent server available"));
        };
        let request = CommandRequest {
            request_id: Uuid::new_v4().to_string(),
            command: plan.command.clone(),
            target_type: plan.target_type.clone(),
            target_id: plan.target_id.clone(),
            timeout_secs: COMMAND_TIMEOUT_SECS,
        };
        info!(agent_id = %agent_id, tool = plan.tool, command = %plan.command, "Executing command");
        agents
            .execute_command(agent_id, request)
            .await
            .map_err(|e| ToolResult::error(e.to_string()))
    }

    async fn run_command(&self, args: Value) -> Result<ToolResult> {
        let command = str_arg(&args, "command");
        let run_on_host = bool_arg(&args, "run_on_host");
        let target_host = str_arg(&args, "target_host");
        if command.is_empty() {
            return Ok(ToolResult::error("command is required"));
        }

        let context = self.context().await;
        let target = if !target_host.is_empty() {
            format!("host {}", target_host)
        } else if run_on_host {
            "host".to_string()
        } else {
            "current target".to_string()
        };
        let plan = CommandPlan {
            tool: "pulse_run_command",
            command: command.to_string(),
            target_type: if run_on_host { "host" } else { "container" }.to_string(),
            target_id: context.target_id.clone(),
            target_name: target_host.to_string(),
            target_host: target_host.to_string(),
            run_on_host,
            suggestion: format!("Suggested command for {}:\n{}", target, command),
            extra: Map::new(),
        };

        if let Gate::Respond(result) = self.gate_command(&plan).await? {
            return Ok(result);
        }

        let Some(agent_id) = self.find_agent(target_host).await else {
            return Ok(ToolResult::error("no agent available for target"));
        };
        match self.dispatch(&agent_id, &plan).await {
            Ok(result) => Ok(ToolResult::text(format_command_output(&result))),
            Err(error) => Ok(error),
        }
    }

    async fn control_guest(&self, args: Value) -> Result<ToolResult> {
        let guest_id = str_arg(&args, "guest_id");
        let action = str_arg(&args, "action");
        let force = bool_arg(&args, "force");
        if guest_id.is_empty() {
            return Ok(ToolResult::error("guest_id is required"));
        }
        if action.is_empty() {
            return Ok(ToolResult::error("action is required"));
        }
        let verb = match action {
            "start" | "stop" | "shutdown" => action,
            "restart" => "reboot",
            other => {
                return Ok(ToolResult::error(format!(
                    "invalid action: {}. Use start, stop, shutdown, or restart",
                    other
                )))
            }
        };

        let Some(state) = self.snapshot().await else {
            return Ok(ToolResult::text(STATE_UNAVAILABLE));
        };
        let Some(guest) = state.find_guest(guest_id).cloned() else {
            return Ok(ToolResult::text(format!(
                "Could not find guest '{}': no VM or container found with ID or name '{}'",
                guest_id, guest_id
            )));
        };

        let vmid = guest.vmid.to_string();
        if self
            .protected_guests()
            .await
            .iter()
            .any(|p| *p == vmid || *p == guest.name)
        {
            return Ok(ToolResult::text(format!(
                "Guest {} (VMID {}) is protected and cannot be controlled by AI.",
                guest.name, guest.vmid
            )));
        }

        let cli = if guest.is_lxc() { "pct" } else { "qm" };
        let mut command = format!("{} {} {}", cli, verb, guest.vmid);
        if force && action == "stop" {
            command.push_str(" --skiplock");
        }

        let mut extra = Map::new();
        extra.insert("guest_name".into(), json!(guest.name));
        extra.insert("guest_vmid".into(), json!(guest.vmid));
        extra.insert("action".into(), json!(action));
        let plan = CommandPlan {
            tool: "pulse_control_guest",
            suggestion: format!(
                "To {} {} (VMID {}), run this command on node {}:\n\n{}\n\nCopy and paste this command to execute it manually.",
                action, guest.name, guest.vmid, guest.node, command
            ),
            command,
            target_type: "host".to_string(),
            target_id: guest.id.clone(),
            target_name: guest.name.clone(),
            target_host: guest.node.clone(),
            run_on_host: true,
            extra,
        };

        if let Gate::Respond(result) = self.gate_command(&plan).await? {
            return Ok(result);
        }

        let Some(agent_id) = self.find_agent(&guest.node).await else {
            return Ok(ToolResult::text(format!(
                "No agent available on node '{}'. Install the Pulse agent on the Proxmox host to enable control.",
                guest.node
            )));
        };
        match self.dispatch(&agent_id, &plan).await {
            Ok(result) if result.exit_code == 0 => Ok(ToolResult::text(format!(
                "Successfully executed '{}' on {} (VMID {}).\n{}",
                action,
                guest.name,
                guest.vmid,
                format_command_output(&result)
            ))),
            Ok(result) => Ok(ToolResult::text(format!(
                "Command failed (exit code {}):\n{}",
                result.exit_code,
                format_command_output(&CommandResult { exit_code: 0, ..result })
            ))),
            Err(error) => Ok(error),
        }
    }

    async fn control_docker(&self, args: Value) -> Result<ToolResult> {
        let container = str_arg(&args, "container");
        let host = str_arg(&args, "host");
        let action = str_arg(&args, "action");
        if container.is_empty() {
            return Ok(ToolResult::error("container name is required"));
        }
        if action.is_empty() {
            return Ok(ToolResult::error("action is required"));
        }
        if !matches!(action, "start" | "stop" | "restart") {
            return Ok(ToolResult::error(format!(
                "invalid action: {}. Use start, stop, or restart",
                action
            )));
        }

        let Some(state) = self.snapshot().await else {
            return Ok(ToolResult::text(STATE_UNAVAILABLE));
        };
        let found = state.docker_hosts.iter().find_map(|h| {
            if !host.is_empty() && h.hostname != host && h.display_name != host {
                return None;
            }
            h.containers
                .iter()
                .find(|c| c.name == container || c.id == container || c.id.starts_with(container))
                .map(|c| (h.clone(), c.clone()))
        });
        let Some((docker_host, target)) = found else {
            let where_ = if host.is_empty() {
                "any Docker host".to_string()
            } else {
                format!("host '{}'", host)
            };
            return Ok(ToolResult::text(format!(
                "Could not find Docker container '{}': container not found on {}",
                container, where_
            )));
        };

        let name = target.name.trim_start_matches('/').to_string();
        let command = format!("docker {} {}", action, shell_quote(&name));
        let mut extra = Map::new();
        extra.insert("container_name".into(), json!(name));
        extra.insert("docker_host".into(), json!(docker_host.hostname));
        extra.insert("action".into(), json!(action));
        let plan = CommandPlan {
            tool: "pulse_control_docker",
            suggestion: format!(
                "To {} container '{}' on host {}, run:\n\n{}\n\nCopy and paste this command to execute it manually.",
                action, name, docker_host.hostname, command
            ),
            command,
            target_type: "host".to_string(),
            target_id: target.id.clone(),
            target_name: name.clone(),
            target_host: docker_host.hostname.clone(),
            run_on_host: true,
            extra,
        };

        if let Gate::Respond(result) = self.gate_command(&plan).await? {
            return Ok(result);
        }

        let Some(agent_id) = self.find_agent(&docker_host.hostname).await else {
            return Ok(ToolResult::text(format!(
                "No agent available on Docker host '{}'. Install the Pulse agent on the host to enable control.",
                docker_host.hostname
            )));
        };
        match self.dispatch(&agent_id, &plan).await {
            Ok(result) if result.exit_code == 0 => Ok(ToolResult::text(format!(
                "Successfully executed 'docker {}' on container '{}' (host: {}).\n{}",
                action,
                name,
                docker_host.hostname,
                format_command_output(&result)
            ))),
            Ok(result) => Ok(ToolResult::text(format!(
                "Command failed (exit code {}):\n{}",
                result.exit_code,
                format_command_output(&CommandResult { exit_code: 0, ..result })
            ))),
            Err(error) => Ok(error),
        }
    }
}
