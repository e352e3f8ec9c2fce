//! One patrol run, start to finish
//!
//! ```text
//! budget gate -> seed -> agentic pass -> investigation fallback
//!   -> signal detection -> eval pass -> deterministic findings
//!   -> reconciliation -> run record
//! ```
//!
//! LLM and tool failures never abort a run: it completes with whatever
//! findings were created, is marked `error`, and skips reconciliation.

use chrono::Utc;
use pulse_core::{Error, Result, StateProvider, StateSnapshot};
use pulse_store::{
    generate_finding_id, Finding, FindingCategory, FindingSeverity, FindingsStore, KnowledgeStore,
    PatrolHistoryStore, PatrolRunRecord, PatrolRunStatus,
};
use pulse_tools::{PatrolFindingCreator, ToolExecutor};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::adapter::RunFindingCreator;
use crate::config::{max_turns, PatrolConfig, EVAL_MAX_TURNS};
use crate::providers::{CostTracker, FleetIntelligence, GuestIntel, GuestIntelProvider};
use crate::runner::{collect, PatrolRequest, PatrolRunner, ToolCallRecord, Transcript};
use crate::seed::{build_seed, SeedInputs, PATROL_SERVICE_RESOURCE};
use crate::signals::{dedup, detect_signals, unmatched, unreachable_signal, Signal, SignalThresholds};
use crate::thinking::clean_thinking_tokens;

pub const BUDGET_USE_CASE: &str = "patrol";
pub const MAIN_SESSION: &str = "patrol-main";
pub const EVAL_SESSION: &str = "patrol-eval";

pub const REASON_NOT_DETECTED: &str = "No longer detected by patrol";
pub const REASON_RESOURCE_GONE: &str = "Resource no longer exists in infrastructure";

const ERROR_FINDING_KEY: &str = "ai-patrol-error";
const FINDINGS_RETENTION: Duration = Duration::from_secs(7 * 24 * 3600);
const INVESTIGATION_TOOLS: [&str; 4] = ["query", "metrics", "storage", "read"];
const FALLBACK_TOOL: &str = "pulse_query";

pub struct PatrolEngine {
    config: RwLock<PatrolConfig>,
    state: Arc<dyn StateProvider>,
    executor: Arc<ToolExecutor>,
    runner: Arc<dyn PatrolRunner>,
    findings: Arc<FindingsStore>,
    history: Arc<PatrolHistoryStore>,
    knowledge: Option<Arc<KnowledgeStore>>,
    cost: Option<Arc<dyn CostTracker>>,
    guest_intel: Option<Arc<dyn GuestIntelProvider>>,
    fleet: Option<Arc<dyn FleetIntelligence>>,
    thresholds: SignalThresholds,
    /// Held for the duration of a run
    in_flight: Mutex<()>,
}

/// Outcome of one LLM pass
struct Pass {
    transcript: Transcript,
    error: Option<Error>,
}

impl PatrolEngine {
    pub fn new(
        config: PatrolConfig,
        state: Arc<dyn StateProvider>,
        executor: Arc<ToolExecutor>,
        runner: Arc<dyn PatrolRunner>,
        findings: Arc<FindingsStore>,
        history: Arc<PatrolHistoryStore>,
    ) -> Self {
        Self {
            config: RwLock::new(config),
            state,
            executor,
            runner,
            findings,
            history,
            knowledge: None,
            cost: None,
            guest_intel: None,
            fleet: None,
            thresholds: SignalThresholds::default(),
            in_flight: Mutex::new(()),
        }
    }

    pub fn with_knowledge(mut self, knowledge: Arc<KnowledgeStore>) -> Self {
        self.knowledge = Some(knowledge);
        self
    }

    pub fn with_cost_tracker(mut self, cost: Arc<dyn CostTracker>) -> Self {
        self.cost = Some(cost);
        self
    }

    pub fn with_guest_intel(mut self, intel: Arc<dyn GuestIntelProvider>) -> Self {
        self.guest_intel = Some(intel);
        self
    }

    pub fn with_fleet_intelligence(mut self, fleet: Arc<dyn FleetIntelligence>) -> Self {
        self.fleet = Some(fleet);
        self
    }

    pub fn with_thresholds(mut self, thresholds: SignalThresholds) -> Self {
        self.thresholds = thresholds;
        self
    }

    pub async fn config(&self) -> PatrolConfig {
        self.config.read().await.clone()
    }

    pub async fn set_config(&self, config: PatrolConfig) {
        *self.config.write().await = config;
    }

    pub fn findings(&self) -> &Arc<FindingsStore> {
        &self.findings
    }

    pub fn history(&self) -> &Arc<PatrolHistoryStore> {
        &self.history
    }

    pub fn is_running(&self) -> bool {
        self.in_flight.try_lock().is_err()
    }

    /// Run a patrol now. `scoped` runs get the quick turn budget and never
    /// reconcile. Fails with `Conflict` when a run is already in progress and
    /// with `Unavailable` when patrol is disabled or the budget refuses.
    pub async fn run(&self, trigger: &str, scoped: bool) -> Result<PatrolRunRecord> {
        let Ok(_guard) = self.in_flight.try_lock() else {
            return Err(Error::conflict("patrol run already in progress"));
        };
        let config = self.config().await;
        if !config.enabled {
            return Err(Error::unavailable("patrol is disabled"));
        }
        self.check_budget()?;

        let started = Instant::now();
        let now = Utc::now();
        let state = Arc::new(self.state.snapshot());
        let counts = config.scope.counts(&state);
        let mut record = PatrolRunRecord {
            id: uuid::Uuid::new_v4().to_string(),
            started_at: Some(now),
            run_type: if scoped { "scoped" } else { "full" }.to_string(),
            trigger: trigger.to_string(),
            resources: counts,
            ..Default::default()
        };
        info!(run_id = %record.id, trigger, scoped, resources = counts.total(), "Starting patrol run");

        let providers = self.executor.providers().await;
        let guest_intel = self.guest_intel.as_ref().map(|g| g.guest_intel()).unwrap_or_default();
        let knowledge = match self.knowledge.as_ref().or(providers.knowledge.as_ref()) {
            Some(k) => k.format_all_for_context().await,
            None => String::new(),
        };
        let inputs = SeedInputs {
            now,
            state: state.clone(),
            scope: config.scope,
            previous_run: self.history.last().await,
            guest_intel: guest_intel.clone(),
            disk_health: providers.disk_health.as_ref().map(|d| d.disk_health()).unwrap_or_default(),
            baselines: providers.baselines.as_ref().map(|b| b.all_baselines()).unwrap_or_default(),
            predictions: providers.patterns.as_ref().map(|p| p.predictions()).unwrap_or_default(),
            forecasts: self.fleet.as_ref().map(|f| f.forecasts()).unwrap_or_default(),
            changes: self.fleet.as_ref().map(|f| f.recent_changes()).unwrap_or_default(),
            correlations: self.fleet.as_ref().map(|f| f.correlations()).unwrap_or_default(),
            thresholds: self.thresholds,
            active_findings: self.findings.get_active(FindingSeverity::Info).await,
            dismissed_context: self.findings.get_dismissed_for_context().await,
            knowledge_context: knowledge,
        };
        let seed = build_seed(&inputs);

        let mut auto_resolved = 0;
        for id in &seed.gone_ids {
            if self.findings.resolve_with_reason(id, REASON_RESOURCE_GONE).await {
                info!(finding_id = %id, "Auto-resolved finding for deleted resource");
                auto_resolved += 1;
            }
        }

        let adapter = Arc::new(RunFindingCreator::new(
            self.findings.clone(),
            state.clone(),
            providers.baselines.clone(),
        ));
        let creator: Arc<dyn PatrolFindingCreator> = adapter.clone();
        self.executor.set_patrol_finding_creator(Some(creator)).await;

        let turns = max_turns(counts.total(), scoped || config.quick_scope);
        let main = self
            .pass(PatrolRequest {
                prompt: seed.text,
                system: system_prompt(config.auto_fix),
                session: MAIN_SESSION.to_string(),
                model: config.model.clone(),
                max_turns: turns,
            })
            .await;
        let mut transcript = main.transcript;
        let mut error_count = 0;
        let mut ai_error = None;
        if let Some(e) = main.error {
            warn!(run_id = %record.id, error = %e, "Patrol LLM pass failed");
            error_count += 1;
            ai_error = Some(e.to_string());
        }

        if let Err(e) = self.ensure_investigation(&mut transcript).await {
            warn!(error = %e, "Fallback investigation failed");
            error_count += 1;
        }

        let mut signals = detect_signals(&transcript.full_tool_calls(), &self.thresholds, Utc::now());
        signals.extend(unreachable_signals(&state, &guest_intel));
        let signals = dedup(signals);

        let pending = unmatched(&signals, &adapter.reported_findings().await);
        if !pending.is_empty() {
            debug!(count = pending.len(), "Unmatched signals, running evaluation pass");
            self.evaluate(&pending, &config, &mut transcript).await;
            let remaining = unmatched(&pending, &adapter.reported_findings().await);
            for signal in remaining {
                if let Err(e) = adapter.create_finding(signal.to_finding_input()).await {
                    debug!(signal = %signal.signal_type, resource = %signal.resource_id, error = %e, "Signal finding not created");
                }
            }
        }

        self.executor.set_patrol_finding_creator(None).await;

        match &ai_error {
            Some(message) => self.record_ai_error(message).await,
            None => {
                if self.findings.resolve(&error_finding_id(), true).await {
                    info!("Patrol recovered, resolved service error finding");
                }
            }
        }

        let reported = adapter.reported().await;
        let significant: Vec<_> = reported.iter().filter(|r| r.severity >= FindingSeverity::Warning).collect();
        record.new_findings = significant.iter().filter(|r| r.is_new).count();
        record.existing_findings = significant.iter().filter(|r| !r.is_new).count();
        record.finding_ids = significant.iter().map(|r| r.id.clone()).collect();
        record.rejected_findings = adapter.rejected_count().await;

        let resolved_ids = adapter.resolved_ids().await;
        if error_count == 0 && !scoped {
            let reported_ids = adapter.reported_ids().await;
            for id in &seed.seeded_ids {
                if reported_ids.contains(id) || resolved_ids.contains(id) {
                    continue;
                }
                if self.findings.resolve_with_reason(id, REASON_NOT_DETECTED).await {
                    info!(finding_id = %id, "Reconciled stale finding");
                    auto_resolved += 1;
                }
            }
        }
        record.resolved_findings = resolved_ids.len() + auto_resolved;

        let cleaned = self.findings.cleanup(FINDINGS_RETENTION).await;
        if cleaned > 0 {
            debug!(cleaned, "Removed old resolved findings");
        }

        let active = self.findings.get_active(FindingSeverity::Warning).await;
        let (critical, warning) = active
            .iter()
            .filter(|f| f.resource_id != PATROL_SERVICE_RESOURCE)
            .fold((0, 0), |(c, w), f| match f.severity {
                FindingSeverity::Critical => (c + 1, w),
                _ => (c, w + 1),
            });
        record.critical = critical;
        record.warning = warning;
        record.error_count = error_count;
        (record.status, record.summary) = status_and_summary(critical, warning, error_count);

        record.ai_analysis = clean_thinking_tokens(&transcript.content);
        record.input_tokens = transcript.input_tokens;
        record.output_tokens = transcript.output_tokens;
        record.tool_calls = transcript.tool_calls.len();
        record.completed_at = Some(Utc::now());
        record.duration_ms = started.elapsed().as_millis() as u64;

        info!(
            run_id = %record.id,
            status = ?record.status,
            new = record.new_findings,
            resolved = record.resolved_findings,
            rejected = record.rejected_findings,
            tool_calls = record.tool_calls,
            duration_ms = record.duration_ms,
            "Patrol run complete"
        );
        self.history.add(record.clone()).await;
        Ok(record)
    }

    fn check_budget(&self) -> Result<()> {
        match &self.cost {
            Some(cost) => cost.check_budget(BUDGET_USE_CASE).map_err(|e| {
                info!(error = %e, "Patrol skipped by budget");
                e
            }),
            None => Ok(()),
        }
    }

    async fn pass(&self, request: PatrolRequest) -> Pass {
        let max_turns = request.max_turns;
        let session = request.session.clone();
        let result = match self.runner.start(request).await {
            Ok(stream) => collect(stream.events, max_turns)
                .await
                .map(|transcript| (stream.session_id, transcript)),
            Err(e) => Err(e),
        };
        match result {
            Ok((session_id, transcript)) => {
                if transcript.truncated {
                    if let Err(e) = self.runner.abort(&session_id).await {
                        warn!(session = %session, session_id = %session_id, error = %e, "Failed to abort patrol session");
                    }
                }
                if let Some(cost) = &self.cost {
                    cost.record_usage(BUDGET_USE_CASE, transcript.input_tokens, transcript.output_tokens);
                }
                debug!(session = %session, tool_calls = transcript.tool_calls.len(), truncated = transcript.truncated, "LLM pass finished");
                Pass { transcript, error: None }
            }
            Err(e) => Pass {
                transcript: Transcript::default(),
                error: Some(e),
            },
        }
    }

    /// Guarantee at least one read of live state made it into the run
    async fn ensure_investigation(&self, transcript: &mut Transcript) -> Result<()> {
        if transcript.tool_calls.iter().any(|c| is_investigation_tool(&c.name)) {
            return Ok(());
        }
        debug!("No investigation tool used, running health query");
        let input = json!({"action": "health"});
        let started = Instant::now();
        let result = self.executor.execute_tool(FALLBACK_TOOL, input.clone()).await?;
        let nanos = Utc::now().timestamp_nanos_opt().unwrap_or_default();
        transcript.push_call(ToolCallRecord {
            id: format!("patrol-fallback-{}", nanos),
            name: "query".to_string(),
            input: input.to_string(),
            output: result.text_content(),
            success: !result.is_error,
            duration_ms: started.elapsed().as_millis() as u64,
        });
        Ok(())
    }

    /// Second, focused LLM call over signals nobody reported. Failures are
    /// logged and leave the deterministic fallback to cover the signals.
    async fn evaluate(&self, signals: &[Signal], config: &PatrolConfig, transcript: &mut Transcript) {
        if let Err(e) = self.check_budget() {
            warn!(error = %e, "Skipping evaluation pass");
            return;
        }
        let pass = self
            .pass(PatrolRequest {
                prompt: eval_prompt(signals),
                system: EVAL_SYSTEM_PROMPT.to_string(),
                session: EVAL_SESSION.to_string(),
                model: config.model.clone(),
                max_turns: EVAL_MAX_TURNS,
            })
            .await;
        if let Some(e) = pass.error {
            warn!(error = %e, "Evaluation pass failed");
            return;
        }
        transcript.input_tokens += pass.transcript.input_tokens;
        transcript.output_tokens += pass.transcript.output_tokens;
        for call in pass.transcript.full_tool_calls() {
            transcript.push_call(call);
        }
    }

    async fn record_ai_error(&self, message: &str) {
        let finding = Finding {
            id: error_finding_id(),
            key: ERROR_FINDING_KEY.to_string(),
            severity: FindingSeverity::Warning,
            category: FindingCategory::Reliability,
            resource_id: PATROL_SERVICE_RESOURCE.to_string(),
            resource_name: "Pulse Patrol Service".to_string(),
            resource_type: "service".to_string(),
            title: error_title(message).to_string(),
            description: format!("Pulse Patrol could not complete its analysis: {}", message),
            recommendation: "Check the AI provider configuration, API key and account balance.".to_string(),
            evidence: format!("Error: {}", message),
            source: "ai-patrol".to_string(),
            ..Default::default()
        };
        self.findings.add(finding).await;
    }
}

pub fn error_finding_id() -> String {
    generate_finding_id(PATROL_SERVICE_RESOURCE, FindingCategory::Reliability.as_str(), ERROR_FINDING_KEY)
}

fn error_title(message: &str) -> &'static str {
    let lower = message.to_lowercase();
    if lower.contains("insufficient balance") || message.contains("402") {
        "Pulse Patrol: Insufficient API credits"
    } else if message.contains("401") || lower.contains("unauthorized") {
        "Pulse Patrol: Invalid API key"
    } else if lower.contains("rate limit") || message.contains("429") {
        "Pulse Patrol: Rate limited"
    } else {
        "Pulse Patrol: Analysis failed"
    }
}

fn is_investigation_tool(name: &str) -> bool {
    let lower = name.to_lowercase();
    INVESTIGATION_TOOLS.iter().any(|t| lower.contains(t))
}

fn unreachable_signals(state: &StateSnapshot, intel: &HashMap<String, GuestIntel>) -> Vec<Signal> {
    state
        .guests()
        .filter(|g| g.status == "running")
        .filter(|g| intel.get(&g.id).and_then(|i| i.reachable) == Some(false))
        .map(|g| unreachable_signal(&g.id, &g.name, if g.is_lxc() { "container" } else { "vm" }, &g.node))
        .collect()
}

fn status_and_summary(critical: usize, warning: usize, errors: usize) -> (PatrolRunStatus, String) {
    let mut parts = Vec::new();
    if critical > 0 {
        parts.push(format!("{} critical", critical));
    }
    if warning > 0 {
        parts.push(format!("{} warning", warning));
    }
    let summary = if parts.is_empty() {
        "All healthy".to_string()
    } else {
        parts.join(" and ")
    };

    if errors > 0 {
        let summary = if parts.is_empty() {
            format!("Analysis incomplete ({} errors)", errors)
        } else {
            summary
        };
        return (PatrolRunStatus::Error, summary);
    }
    let status = if critical > 0 {
        PatrolRunStatus::Critical
    } else if warning > 0 {
        PatrolRunStatus::IssuesFound
    } else {
        PatrolRunStatus::Healthy
    };
    (status, summary)
}

// ============================================================================
// PROMPTS
// ============================================================================

const SYSTEM_PROMPT: &str = r#"You are Pulse Patrol, an autonomous infrastructure analysis agent. Your job is to find issues that simple threshold-based alerts cannot catch: trends, capacity risks, misconfigurations, reliability gaps and cross-resource correlations.

## Investigation Tools

- pulse_query, pulse_list_infrastructure, pulse_get_resource: search resources, get details, health overview
- pulse_get_metrics, pulse_get_baselines, pulse_get_patterns: performance history and learned baselines
- pulse_list_storage, pulse_list_backups, pulse_get_disk_health: storage, backups and SMART
- pulse_list_alerts: active alerts
- pulse_run_command: read-only commands and log tailing on connected hosts

## Patrol Reporting

- patrol_get_findings: check active findings before reporting or resolving
- patrol_report_finding: report a confirmed issue
- patrol_resolve_finding: resolve an active finding that is no longer an issue

Report findings only through these tools, never as free text.

## How Patrol Works

The current state of the infrastructure is provided below. Step 1: scan it for anything notable. Step 2: investigate with tools to tell real problems from noise. Always call at least one investigation tool, even when everything looks healthy. Step 3: report or resolve findings.

## Severity

- critical: data loss risk, complete backup failure
- warning: capacity exhausted within 7 days, backup gap over 48h, broken replication
- watch: capacity trending toward limits within 14-30 days, minor drift
- info: almost never

## Final Summary Format

### Infrastructure Status
One sentence overall verdict.

### Key Observations
- One bullet per noteworthy item, resource name in bold

### Actions Taken
- Each finding reported or resolved, or "No findings reported - all clear."

Keep it factual and under 15 lines. Do not narrate your investigation."#;

const OBSERVE_ONLY: &str = r#"

## Observe Only Mode

Use read-only tools to gather diagnostics but do not modify anything. Report findings with clear recommendations for the user to action."#;

const AUTO_FIX: &str = r#"

## Auto-Fix Mode

You may use control tools to attempt safe remediation: restarting services, clearing caches and temp files, rotating logs. Verify every fix with a follow-up command, include the outcome in the finding evidence, and stop and report if the fix does not hold."#;

pub fn system_prompt(auto_fix: bool) -> String {
    format!("{}{}", SYSTEM_PROMPT, if auto_fix { AUTO_FIX } else { OBSERVE_ONLY })
}

const EVAL_SYSTEM_PROMPT: &str = r#"You are a patrol evaluation agent reviewing infrastructure signals that were detected but not reported as findings.

Tools: patrol_report_finding, patrol_get_findings

Instructions:
1. Call patrol_get_findings to check what already exists.
2. For each signal below, determine if it is a genuine issue requiring attention.
3. If yes, call patrol_report_finding with complete details.
4. If not actionable or already covered by an existing finding, skip it.
5. Do not investigate further; use only the evidence provided below."#;

pub fn eval_prompt(signals: &[Signal]) -> String {
    let mut out = String::from(
        "The following infrastructure signals were detected during patrol but were not reported as findings.\n\
         Review each one and report genuine issues using patrol_report_finding.\n\n",
    );
    for (i, s) in signals.iter().enumerate() {
        out.push_str(&format!("## Signal {}: {}\n", i + 1, s.signal_type));
        out.push_str(&format!(
            "- **Resource**: {} (ID: {}, Type: {})\n",
            s.resource_name, s.resource_id, s.resource_type
        ));
        out.push_str(&format!("- **Suggested Severity**: {}\n", s.severity));
        out.push_str(&format!("- **Category**: {}\n", s.category));
        out.push_str(&format!("- **Summary**: {}\n", s.summary));
        out.push_str(&format!("- **Evidence**: ```\n{}\n```\n\n", s.evidence));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_titles() {
        assert_eq!(error_title("status 402: Insufficient Balance"), "Pulse Patrol: Insufficient API credits");
        assert_eq!(error_title("HTTP 401 Unauthorized"), "Pulse Patrol: Invalid API key");
        assert_eq!(error_title("Rate limit exceeded"), "Pulse Patrol: Rate limited");
        assert_eq!(error_title("connection refused"), "Pulse Patrol: Analysis failed");
    }

    #[test]
    fn test_status_and_summary() {
        assert_eq!(status_and_summary(0, 0, 0), (PatrolRunStatus::Healthy, "All healthy".to_string()));
        assert_eq!(
            status_and_summary(1, 2, 0),
            (PatrolRunStatus::Critical, "1 critical and 2 warning".to_string())
        );
        assert_eq!(status_and_summary(0, 3, 0).0, PatrolRunStatus::IssuesFound);
        assert_eq!(
            status_and_summary(0, 0, 2),
            (PatrolRunStatus::Error, "Analysis incomplete (2 errors)".to_string())
        );
        assert_eq!(status_and_summary(0, 1, 1), (PatrolRunStatus::Error, "1 warning".to_string()));
    }

    #[test]
    fn test_investigation_tools() {
        assert!(is_investigation_tool("query"));
        assert!(is_investigation_tool("get_metrics"));
        assert!(is_investigation_tool("list_storage"));
        assert!(!is_investigation_tool("patrol_get_findings"));
        assert!(!is_investigation_tool("list_alerts"));
    }

    #[test]
    fn test_prompts() {
        assert!(system_prompt(false).contains("Observe Only Mode"));
        assert!(system_prompt(true).contains("Auto-Fix Mode"));

        let s = unreachable_signal("qemu/101", "web", "vm", "pve1");
        let prompt = eval_prompt(&[s]);
        assert!(prompt.contains("## Signal 1: guest_unreachable"));
        assert!(prompt.contains("- **Resource**: web (ID: qemu/101, Type: vm)"));
        assert!(prompt.contains("- **Category**: reliability"));
    }
}
