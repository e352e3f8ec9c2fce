//! Patrol reporting tools
//!
//! Only usable while a patrol run has wired a finding creator into the
//! executor. Names carry no `pulse_` prefix so the patrol prompt can refer to
//! them directly.

use futures::FutureExt;
use pulse_core::Result;
use serde_json::{json, Value};

use crate::executor::ToolExecutor;
use crate::providers::PatrolFindingInput;
use crate::registry::ToolRegistry;
use crate::tool::{str_arg, FnTool, ToolResult};

const CREATOR_UNAVAILABLE: &str = "Patrol finding creator not available.";

pub(super) fn register(registry: &mut ToolRegistry) {
    registry.register(FnTool::new(
        "patrol_report_finding",
        "Report a finding (creates a structured finding with validation). Call patrol_get_findings first to avoid duplicates.",
        json!({
            "type": "object",
            "properties": {
                "key": {"type": "string", "description": "Stable short key for the condition, e.g. 'high-cpu' or 'backup-stale'"},
                "severity": {"type": "string", "enum": ["info", "watch", "warning", "critical"]},
                "category": {"type": "string", "enum": ["performance", "capacity", "reliability", "backup", "security", "general"]},
                "resource_id": {"type": "string"},
                "resource_name": {"type": "string"},
                "resource_type": {"type": "string", "description": "node, vm, container, docker, storage, host"},
                "title": {"type": "string"},
                "description": {"type": "string"},
                "recommendation": {"type": "string", "description": "Concrete next step for the operator"},
                "evidence": {"type": "string", "description": "Tool output that supports the finding"}
            },
            "required": ["severity", "category", "resource_id", "resource_name", "resource_type", "title", "description"]
        }),
        |e, args| e.report_patrol_finding(args).boxed(),
    ));

    registry.register(FnTool::new(
        "patrol_resolve_finding",
        "Resolve an existing finding that is no longer an issue.",
        json!({
            "type": "object",
            "properties": {
                "finding_id": {"type": "string"},
                "reason": {"type": "string", "description": "Why the issue no longer applies"}
            },
            "required": ["finding_id", "reason"]
        }),
        |e, args| e.resolve_patrol_finding(args).boxed(),
    ));

    registry.register(FnTool::new(
        "patrol_get_findings",
        "Check currently active findings (use before reporting to avoid duplicates).",
        json!({
            "type": "object",
            "properties": {
                "resource_id": {"type": "string", "description": "Optional: only findings for this resource id or name"},
                "min_severity": {"type": "string", "enum": ["info", "watch", "warning", "critical"]}
            }
        }),
        |e, args| e.get_patrol_findings(args).boxed(),
    ));
}

impl ToolExecutor {
    async fn report_patrol_finding(&self, args: Value) -> Result<ToolResult> {
        let Some(creator) = self.providers().await.patrol_findings else {
            return Ok(ToolResult::text(CREATOR_UNAVAILABLE));
        };
        let input: PatrolFindingInput = match serde_json::from_value(args) {
            Ok(input) => input,
            Err(e) => return Ok(ToolResult::error(format!("invalid finding: {}", e))),
        };
        for (field, value) in [
            ("resource_id", &input.resource_id),
            ("title", &input.title),
            ("description", &input.description),
        ] {
            if value.trim().is_empty() {
                return Ok(ToolResult::error(format!("{} is required", field)));
            }
        }

        match creator.create_finding(input).await {
            Ok(created) => ToolResult::json(&json!({
                "success": true,
                "finding_id": created.id,
                "is_new": created.is_new,
                "message": if created.is_new {
                    "Finding recorded."
                } else {
                    "Finding already known; marked as seen again."
                },
            })),
            Err(e) => Ok(ToolResult::error(e.to_string())),
        }
    }

    async fn resolve_patrol_finding(&self, args: Value) -> Result<ToolResult> {
        let Some(creator) = self.providers().await.patrol_findings else {
            return Ok(ToolResult::text(CREATOR_UNAVAILABLE));
        };
        let finding_id = str_arg(&args, "finding_id");
        let reason = str_arg(&args, "reason");
        if finding_id.is_empty() {
            return Ok(ToolResult::error("finding_id is required"));
        }
        if reason.is_empty() {
            return Ok(ToolResult::error("reason is required"));
        }

        match creator.resolve_finding(finding_id, reason).await {
            Ok(()) => ToolResult::json(&json!({
                "success": true,
                "finding_id": finding_id,
                "action": "resolved",
            })),
            Err(e) => Ok(ToolResult::error(e.to_string())),
        }
    }

    async fn get_patrol_findings(&self, args: Value) -> Result<ToolResult> {
        let Some(creator) = self.providers().await.patrol_findings else {
            return Ok(ToolResult::text(CREATOR_UNAVAILABLE));
        };
        let findings = creator
            .active_findings(str_arg(&args, "resource_id"), str_arg(&args, "min_severity"))
            .await;
        ToolResult::json(&json!({"findings": findings, "count": findings.len()}))
    }
}
