//! Patrol context tools: metrics history, baselines, patterns, alerts and
//! the user-facing findings workflow

use futures::FutureExt;
use pulse_core::Result;
use pulse_store::DismissReason;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::time::Duration;

use crate::executor::ToolExecutor;
use crate::registry::ToolRegistry;
use crate::tool::{bool_arg, int_arg, paginate, str_arg, FnTool, ToolResult};

pub(super) fn register(registry: &mut ToolRegistry) {
    registry.register(FnTool::new(
        "pulse_get_metrics",
        "Get historical metrics (CPU, memory, disk) for resources over 24 hours or 7 days. Use this to understand trends and detect anomalies.",
        json!({
            "type": "object",
            "properties": {
                "period": {
                    "type": "string",
                    "description": "Time period: '24h' for last 24 hours, '7d' for last 7 days",
                    "enum": ["24h", "7d"]
                },
                "resource_id": {
                    "type": "string",
                    "description": "Optional: specific resource ID. If omitted, returns summary for all resources."
                }
            },
            "required": ["period"]
        }),
        |e, args| e.get_metrics(args).boxed(),
    ));

    registry.register(FnTool::new(
        "pulse_get_baselines",
        "Get learned baselines for resources. Baselines represent 'normal' behavior and help detect anomalies.",
        json!({
            "type": "object",
            "properties": {
                "resource_id": {
                    "type": "string",
                    "description": "Optional: specific resource ID. If omitted, returns all baselines."
                }
            }
        }),
        |e, args| e.get_baselines(args).boxed(),
    ));

    registry.register(FnTool::new(
        "pulse_get_patterns",
        "Get detected operational patterns and predictions. Includes recurring spikes, growth trends, and predicted issues.",
        json!({"type": "object", "properties": {}}),
        |e, _| e.get_patterns().boxed(),
    ));

    registry.register(FnTool::new(
        "pulse_list_alerts",
        "List active threshold alerts (CPU > 80%, disk full, etc).\n\nReturns: JSON array of alerts with resource, type, severity, value, threshold.",
        json!({
            "type": "object",
            "properties": {
                "severity": {
                    "type": "string",
                    "description": "Filter: 'critical', 'warning', or 'info'. Omit for all.",
                    "enum": ["critical", "warning", "info"]
                },
                "limit": {"type": "integer", "description": "Max results (default 100)"},
                "offset": {"type": "integer", "description": "Skip N results for pagination"}
            }
        }),
        |e, args| e.list_alerts(args).boxed(),
    ));

    registry.register(FnTool::new(
        "pulse_list_findings",
        "List AI patrol findings - issues detected by automated analysis.\n\nReturns: JSON with active findings (current issues) and counts.",
        json!({
            "type": "object",
            "properties": {
                "include_dismissed": {"type": "boolean", "description": "Include previously dismissed findings"},
                "severity": {
                    "type": "string",
                    "description": "Filter: 'critical', 'warning', or 'info'. Omit for all.",
                    "enum": ["critical", "warning", "info"]
                },
                "limit": {"type": "integer", "description": "Max results (default 100)"},
                "offset": {"type": "integer", "description": "Skip N results for pagination"}
            }
        }),
        |e, args| e.list_findings(args).boxed(),
    ));

    registry.register(FnTool::new(
        "pulse_resolve_finding",
        "Mark an AI patrol finding as resolved after fixing the issue.",
        json!({
            "type": "object",
            "properties": {
                "finding_id": {"type": "string", "description": "The finding ID to resolve"},
                "resolution_note": {"type": "string", "description": "Brief description of how the issue was resolved"}
            },
            "required": ["finding_id", "resolution_note"]
        }),
        |e, args| e.resolve_finding(args).boxed(),
    ));

    registry.register(FnTool::new(
        "pulse_dismiss_finding",
        "Dismiss an AI patrol finding as not an issue or expected behavior.",
        json!({
            "type": "object",
            "properties": {
                "finding_id": {"type": "string", "description": "The finding ID to dismiss"},
                "reason": {
                    "type": "string",
                    "description": "Why the finding is being dismissed",
                    "enum": ["not_an_issue", "expected_behavior", "will_fix_later"]
                },
                "note": {"type": "string", "description": "Explanation of why this is being dismissed"}
            },
            "required": ["finding_id", "reason", "note"]
        }),
        |e, args| e.dismiss_finding(args).boxed(),
    ));
}

/// `24h` or `7d`; anything else falls back to 24 hours
fn parse_period(period: &str) -> (&'static str, Duration) {
    match period {
        "7d" => ("7d", Duration::from_secs(7 * 24 * 3600)),
        _ => ("24h", Duration::from_secs(24 * 3600)),
    }
}

fn pagination(total: usize, limit: usize, offset: usize) -> Option<Value> {
    (offset > 0 || total > limit).then(|| json!({"total": total, "limit": limit, "offset": offset}))
}

impl ToolExecutor {
    async fn get_metrics(&self, args: Value) -> Result<ToolResult> {
        let Some(history) = self.providers().await.metrics_history else {
            return Ok(ToolResult::text(
                "Metrics history not available. The system may still be collecting data.",
            ));
        };
        let (period, duration) = parse_period(str_arg(&args, "period"));
        let resource_id = str_arg(&args, "resource_id");

        if !resource_id.is_empty() {
            return match history.resource_metrics(resource_id, duration) {
                Ok(points) => ToolResult::json(&json!({
                    "period": period,
                    "resource_id": resource_id,
                    "points": points,
                })),
                Err(e) => Ok(ToolResult::error(e.to_string())),
            };
        }

        match history.all_metrics_summary(duration) {
            Ok(summary) => ToolResult::json(&json!({"period": period, "summary": summary})),
            Err(e) => Ok(ToolResult::error(e.to_string())),
        }
    }

    async fn get_baselines(&self, args: Value) -> Result<ToolResult> {
        let Some(provider) = self.providers().await.baselines else {
            return Ok(ToolResult::text(
                "Baseline data not available. The system needs time to learn normal behavior patterns.",
            ));
        };
        let resource_id = str_arg(&args, "resource_id");
        if resource_id.is_empty() {
            return ToolResult::json(&json!({"baselines": provider.all_baselines()}));
        }

        let metrics: HashMap<&str, _> = ["cpu", "memory"]
            .into_iter()
            .filter_map(|m| provider.baseline(resource_id, m).map(|b| (m, b)))
            .collect();
        let mut baselines = HashMap::new();
        if !metrics.is_empty() {
            baselines.insert(resource_id, metrics);
        }
        ToolResult::json(&json!({"resource_id": resource_id, "baselines": baselines}))
    }

    async fn get_patterns(&self) -> Result<ToolResult> {
        let Some(provider) = self.providers().await.patterns else {
            return Ok(ToolResult::text(
                "Pattern detection not available. The system needs more historical data.",
            ));
        };
        ToolResult::json(&json!({
            "patterns": provider.patterns(),
            "predictions": provider.predictions(),
        }))
    }

    async fn list_alerts(&self, args: Value) -> Result<ToolResult> {
        let Some(provider) = self.providers().await.alerts else {
            return Ok(ToolResult::text("Alert data not available."));
        };
        let severity = str_arg(&args, "severity");
        let limit = int_arg(&args, "limit", 100);
        let offset = int_arg(&args, "offset", 0);

        let all = provider.active_alerts();
        let total = all.len();
        let alerts = paginate(
            all.into_iter()
                .filter(|a| severity.is_empty() || a.level == severity)
                .collect(),
            offset,
            limit,
        );

        let mut response = json!({"alerts": alerts, "count": alerts.len()});
        if let Some(p) = pagination(total, limit, offset) {
            response["pagination"] = p;
        }
        ToolResult::json(&response)
    }

    async fn list_findings(&self, args: Value) -> Result<ToolResult> {
        let Some(provider) = self.providers().await.findings else {
            return Ok(ToolResult::text(
                "Patrol findings not available. AI Patrol may not be running.",
            ));
        };
        let include_dismissed = bool_arg(&args, "include_dismissed");
        let severity = str_arg(&args, "severity");
        let limit = int_arg(&args, "limit", 100);
        let offset = int_arg(&args, "offset", 0);

        let all_active = provider.active_findings().await;
        let all_dismissed = if include_dismissed {
            provider.dismissed_findings().await
        } else {
            Vec::new()
        };
        let (active_total, dismissed_total) = (all_active.len(), all_dismissed.len());

        let filter = |list: Vec<pulse_store::Finding>| {
            paginate(
                list.into_iter()
                    .filter(|f| severity.is_empty() || f.severity.as_str() == severity)
                    .collect::<Vec<_>>(),
                offset,
                limit,
            )
        };
        let active = filter(all_active);
        let dismissed = filter(all_dismissed);

        let mut response = json!({
            "active": active,
            "dismissed": dismissed,
            "counts": {"active": active_total, "dismissed": dismissed_total},
        });
        let biggest = active_total.max(dismissed_total);
        if let Some(mut p) = pagination(biggest, limit, offset) {
            p["total"] = json!(active_total + dismissed_total);
            response["pagination"] = p;
        }
        ToolResult::json(&response)
    }

    async fn resolve_finding(&self, args: Value) -> Result<ToolResult> {
        let finding_id = str_arg(&args, "finding_id");
        let note = str_arg(&args, "resolution_note");
        if finding_id.is_empty() {
            return Ok(ToolResult::error("finding_id is required"));
        }
        if note.is_empty() {
            return Ok(ToolResult::error("resolution_note is required"));
        }
        let Some(manager) = self.providers().await.findings_manager else {
            return Ok(ToolResult::text("Findings manager not available."));
        };
        if let Err(e) = manager.resolve_finding(finding_id, note).await {
            return Ok(ToolResult::error(e.to_string()));
        }
        ToolResult::json(&json!({
            "success": true,
            "finding_id": finding_id,
            "action": "resolved",
            "resolution_note": note,
        }))
    }

    async fn dismiss_finding(&self, args: Value) -> Result<ToolResult> {
        let finding_id = str_arg(&args, "finding_id");
        let reason = str_arg(&args, "reason");
        let note = str_arg(&args, "note");
        if finding_id.is_empty() {
            return Ok(ToolResult::error("finding_id is required"));
        }
        if reason.is_empty() {
            return Ok(ToolResult::error("reason is required"));
        }
        if let Err(e) = reason.parse::<DismissReason>() {
            return Ok(ToolResult::error(e.to_string()));
        }
        if note.is_empty() {
            return Ok(ToolResult::error("note is required"));
        }
        let Some(manager) = self.providers().await.findings_manager else {
            return Ok(ToolResult::text("Findings manager not available."));
        };
        if let Err(e) = manager.dismiss_finding(finding_id, reason, note).await {
            return Ok(ToolResult::error(e.to_string()));
        }
        ToolResult::json(&json!({
            "success": true,
            "finding_id": finding_id,
            "action": "dismissed",
            "reason": reason,
            "note": note,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_period() {
        assert_eq!(parse_period("7d").0, "7d");
        assert_eq!(parse_period("24h").1, Duration::from_secs(86_400));
        assert_eq!(parse_period("bogus").0, "24h");
    }

    #[test]
    fn test_pagination_only_when_needed() {
        assert!(pagination(10, 100, 0).is_none());
        assert!(pagination(150, 100, 0).is_some());
        assert!(pagination(10, 100, 5).is_some());
    }
}
