//! Deterministic signal detection over patrol tool outputs
//!
//! After the agentic loop, the outputs of the investigation tools are parsed
//! for conditions that should never go unreported: failing disks, full pools,
//! sustained CPU or memory pressure, failed or stale backups and active
//! alerts. Detection works on the JSON shape of each output (`disks`,
//! `pools`, `summary`, `alerts`, `recent_tasks`) rather than on tool names,
//! so the health overview and the dedicated tools feed the same detectors.

use chrono::{DateTime, Duration as ChronoDuration, NaiveDateTime, TimeZone, Utc};
use pulse_store::{Finding, FindingCategory};
use pulse_tools::PatrolFindingInput;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::time::Duration;
use tracing::debug;

use crate::runner::{truncate, ToolCallRecord};

const MAX_EVIDENCE_LEN: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalType {
    SmartFailure,
    HighCpu,
    HighMemory,
    HighDisk,
    BackupFailed,
    BackupStale,
    ActiveAlert,
    GuestUnreachable,
}

impl SignalType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalType::SmartFailure => "smart_failure",
            SignalType::HighCpu => "high_cpu",
            SignalType::HighMemory => "high_memory",
            SignalType::HighDisk => "high_disk",
            SignalType::BackupFailed => "backup_failed",
            SignalType::BackupStale => "backup_stale",
            SignalType::ActiveAlert => "active_alert",
            SignalType::GuestUnreachable => "guest_unreachable",
        }
    }

    /// Finding key used when the signal becomes a finding
    pub fn key(&self) -> &'static str {
        match self {
            SignalType::SmartFailure => "smart-failure",
            SignalType::HighCpu => "cpu-high",
            SignalType::HighMemory => "memory-high",
            SignalType::HighDisk => "disk-high",
            SignalType::BackupFailed => "backup-failed",
            SignalType::BackupStale => "backup-stale",
            SignalType::ActiveAlert => "active-alert",
            SignalType::GuestUnreachable => "guest-unreachable",
        }
    }

    fn title(&self, resource_name: &str) -> String {
        match self {
            SignalType::SmartFailure => "SMART health check failed".to_string(),
            SignalType::HighCpu => "High CPU usage detected".to_string(),
            SignalType::HighMemory => "High memory usage detected".to_string(),
            SignalType::HighDisk => "Storage usage is high".to_string(),
            SignalType::BackupFailed => "Backup failed".to_string(),
            SignalType::BackupStale => "Backup is stale".to_string(),
            SignalType::ActiveAlert => "Active alert detected".to_string(),
            SignalType::GuestUnreachable => format!("Guest unreachable: {}", resource_name),
        }
    }

    fn recommendation(&self) -> &'static str {
        match self {
            SignalType::SmartFailure => {
                "Inspect the disk for errors and consider replacing it if SMART failures persist."
            }
            SignalType::HighCpu => {
                "Identify processes causing high CPU usage and optimize or scale resources."
            }
            SignalType::HighMemory => {
                "Identify memory-heavy processes and consider increasing memory or tuning workloads."
            }
            SignalType::HighDisk => {
                "Investigate disk usage growth and clean up or expand storage as needed."
            }
            SignalType::BackupFailed => {
                "Review backup logs and fix the underlying error, then rerun the backup."
            }
            SignalType::BackupStale => {
                "Ensure backups are scheduled and completing successfully; run a new backup."
            }
            SignalType::ActiveAlert => "Investigate the active alert and resolve the underlying issue.",
            SignalType::GuestUnreachable => {
                "Investigate why this guest is not responding to ping. Check network configuration, firewall rules, or whether the guest has crashed."
            }
        }
    }
}

impl fmt::Display for SignalType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Signal {
    pub signal_type: SignalType,
    pub resource_id: String,
    pub resource_name: String,
    pub resource_type: String,
    /// `warning` or `critical`
    pub severity: String,
    pub category: FindingCategory,
    pub summary: String,
    pub evidence: String,
    pub tool_call_id: String,
}

impl Signal {
    /// Finding arguments built from the signal-type defaults
    pub fn to_finding_input(&self) -> PatrolFindingInput {
        let resource_name = if self.resource_name.is_empty() {
            self.resource_id.clone()
        } else {
            self.resource_name.clone()
        };
        PatrolFindingInput {
            key: self.signal_type.key().to_string(),
            severity: if self.severity.is_empty() { "warning".into() } else { self.severity.clone() },
            category: self.category.to_string(),
            title: self.signal_type.title(&resource_name),
            resource_id: self.resource_id.clone(),
            resource_name,
            resource_type: self.resource_type.clone(),
            description: self.summary.clone(),
            recommendation: self.signal_type.recommendation().to_string(),
            evidence: self.evidence.clone(),
        }
    }

    fn matches(&self, finding: &Finding) -> bool {
        finding.resource_id == self.resource_id && finding.category == self.category
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SignalThresholds {
    /// Pool usage strictly above this is a warning
    pub storage_warning: f64,
    /// Pool usage strictly above this is critical
    pub storage_critical: f64,
    pub high_cpu: f64,
    pub high_memory: f64,
    pub backup_stale: Duration,
}

impl Default for SignalThresholds {
    fn default() -> Self {
        Self {
            storage_warning: 75.0,
            storage_critical: 95.0,
            high_cpu: 70.0,
            high_memory: 80.0,
            backup_stale: Duration::from_secs(48 * 3600),
        }
    }
}

// ============================================================================
// DETECTION
// ============================================================================

/// Signals found in `calls`, deduplicated by type and resource
pub fn detect_signals(
    calls: &[ToolCallRecord],
    thresholds: &SignalThresholds,
    now: DateTime<Utc>,
) -> Vec<Signal> {
    let mut signals = Vec::new();
    for call in calls {
        if should_skip(&call.output) {
            continue;
        }
        let Some(Value::Object(data)) = parse_output(&call.output) else {
            debug!(tool = %call.name, "Tool output is not a JSON object, no signals");
            continue;
        };
        let ctx = Ctx {
            call,
            evidence: truncate(&call.output, MAX_EVIDENCE_LEN),
        };
        if let Some(disks) = data.get("disks").and_then(Value::as_array) {
            smart_failures(&ctx, disks, &mut signals);
        }
        if let Some(pools) = data.get("pools").and_then(Value::as_array) {
            high_disk(&ctx, pools, thresholds, &mut signals);
        }
        if let Some(summary) = data.get("summary").and_then(Value::as_object) {
            metrics(&ctx, summary, thresholds, &mut signals);
        }
        if let Some(alerts) = data.get("alerts").and_then(Value::as_array) {
            active_alerts(&ctx, alerts, &mut signals);
        }
        if data.contains_key("recent_tasks") {
            backups(&ctx, &data, thresholds, now, &mut signals);
        }
    }
    dedup(signals)
}

/// A signal is matched when some finding has the same resource and category
pub fn unmatched(signals: &[Signal], findings: &[Finding]) -> Vec<Signal> {
    signals
        .iter()
        .filter(|s| !findings.iter().any(|f| s.matches(f)))
        .cloned()
        .collect()
}

/// A guest the probe could not reach
pub fn unreachable_signal(resource_id: &str, resource_name: &str, resource_type: &str, node: &str) -> Signal {
    Signal {
        signal_type: SignalType::GuestUnreachable,
        resource_id: resource_id.to_string(),
        resource_name: resource_name.to_string(),
        resource_type: resource_type.to_string(),
        severity: "warning".to_string(),
        category: FindingCategory::Reliability,
        summary: format!(
            "Guest {} is running but did not respond to ping from node {}",
            resource_name, node
        ),
        evidence: String::new(),
        tool_call_id: String::new(),
    }
}

pub fn dedup(signals: Vec<Signal>) -> Vec<Signal> {
    let mut seen = HashSet::new();
    signals
        .into_iter()
        .filter(|s| seen.insert((s.signal_type, s.resource_id.clone())))
        .collect()
}

struct Ctx<'a> {
    call: &'a ToolCallRecord,
    evidence: String,
}

impl Ctx<'_> {
    #[allow(clippy::too_many_arguments)]
    fn signal(
        &self,
        signal_type: SignalType,
        resource_id: &str,
        resource_name: &str,
        resource_type: &str,
        severity: &str,
        category: FindingCategory,
        summary: String,
    ) -> Signal {
        Signal {
            signal_type,
            resource_id: resource_id.to_string(),
            resource_name: resource_name.to_string(),
            resource_type: resource_type.to_string(),
            severity: severity.to_string(),
            category,
            summary,
            evidence: self.evidence.clone(),
            tool_call_id: self.call.id.clone(),
        }
    }
}

fn smart_failures(ctx: &Ctx, disks: &[Value], out: &mut Vec<Signal>) {
    for disk in disks {
        let health = str_of(disk, "health").trim().to_uppercase();
        if health.is_empty() || health == "PASSED" || health == "OK" {
            continue;
        }
        let device = str_of(disk, "device");
        let host = first_non_empty(&[str_of(disk, "host"), str_of(disk, "node")]);
        let resource_id = if host.is_empty() { device } else { host };
        out.push(ctx.signal(
            SignalType::SmartFailure,
            resource_id,
            device,
            "node",
            "critical",
            FindingCategory::Reliability,
            format!("SMART health check: {} for {}", health, device),
        ));
    }
}

fn high_disk(ctx: &Ctx, pools: &[Value], t: &SignalThresholds, out: &mut Vec<Signal>) {
    for pool in pools {
        let usage = num_of(pool, "usage_percent").or_else(|| num_of(pool, "usage")).unwrap_or(0.0);
        if usage <= t.storage_warning {
            continue;
        }
        let severity = if usage > t.storage_critical { "critical" } else { "warning" };
        let name = str_of(pool, "name");
        let id = first_non_empty(&[str_of(pool, "id"), name]);
        out.push(ctx.signal(
            SignalType::HighDisk,
            id,
            name,
            "storage",
            severity,
            FindingCategory::Capacity,
            format!("Storage pool {} at {:.1}% usage", name, usage),
        ));
    }
}

fn metrics(ctx: &Ctx, summary: &Map<String, Value>, t: &SignalThresholds, out: &mut Vec<Signal>) {
    for (key, entry) in summary {
        let id = first_non_empty(&[str_of(entry, "resource_id"), key.as_str()]);
        let name = first_non_empty(&[str_of(entry, "resource_name"), id]);
        let rtype = str_of(entry, "resource_type");
        let avg_cpu = num_of(entry, "avg_cpu").unwrap_or(0.0);
        let avg_memory = num_of(entry, "avg_memory").unwrap_or(0.0);
        if avg_cpu > t.high_cpu {
            out.push(ctx.signal(
                SignalType::HighCpu,
                id,
                name,
                rtype,
                "warning",
                FindingCategory::Performance,
                format!("High CPU usage on {}: {:.1}%", name, avg_cpu),
            ));
        }
        if avg_memory > t.high_memory {
            out.push(ctx.signal(
                SignalType::HighMemory,
                id,
                name,
                rtype,
                "warning",
                FindingCategory::Performance,
                format!("High memory usage on {}: {:.1}%", name, avg_memory),
            ));
        }
    }
}

fn active_alerts(ctx: &Ctx, alerts: &[Value], out: &mut Vec<Signal>) {
    for alert in alerts {
        let level = first_non_empty(&[str_of(alert, "level"), str_of(alert, "severity")]).to_lowercase();
        if level != "critical" && level != "warning" {
            continue;
        }
        let alert_type = str_of(alert, "type").to_lowercase();
        let (signal_type, category, rtype) = classify_alert(&alert_type);
        let id = first_non_empty(&[str_of(alert, "resource_id"), str_of(alert, "resource_name")]);
        let name = first_non_empty(&[str_of(alert, "resource_name"), id]);
        out.push(ctx.signal(
            signal_type,
            id,
            name,
            rtype,
            &level,
            category,
            format!("Active {} alert: {}", level, str_of(alert, "message")),
        ));
    }
}

/// Alerts on a metric become that metric's signal so the finding lands in a
/// specific category
fn classify_alert(alert_type: &str) -> (SignalType, FindingCategory, &'static str) {
    if ["disk", "storage", "usage"].iter().any(|k| alert_type.contains(k)) {
        (SignalType::HighDisk, FindingCategory::Capacity, "storage")
    } else if alert_type.contains("cpu") {
        (SignalType::HighCpu, FindingCategory::Performance, "")
    } else if alert_type.contains("memory") {
        (SignalType::HighMemory, FindingCategory::Performance, "")
    } else if alert_type.contains("backup") {
        (SignalType::BackupFailed, FindingCategory::Backup, "backup")
    } else {
        (SignalType::ActiveAlert, FindingCategory::Reliability, "")
    }
}

fn backups(
    ctx: &Ctx,
    data: &Map<String, Value>,
    t: &SignalThresholds,
    now: DateTime<Utc>,
    out: &mut Vec<Signal>,
) {
    let stale_after = ChronoDuration::from_std(t.backup_stale).unwrap_or_else(|_| ChronoDuration::hours(48));
    let tasks = data.get("recent_tasks").and_then(Value::as_array).cloned().unwrap_or_default();

    let mut known_vmids = HashSet::new();
    // resource -> (time, failed, status)
    let mut latest: BTreeMap<String, (DateTime<Utc>, bool, String)> = BTreeMap::new();
    for task in &tasks {
        let vmid = vmid_of(task);
        if !vmid.is_empty() {
            known_vmids.insert(vmid.clone());
        }
        let status = str_of(task, "status").trim().to_string();
        let error = str_of(task, "error").trim();
        let lower = status.to_lowercase();
        if lower.is_empty() && error.is_empty() {
            continue;
        }
        let mut failed = !(lower == "ok" || lower.contains("success")) || !error.is_empty();
        if lower.contains("error") || lower.contains("fail") {
            failed = true;
        }
        if lower.contains("running") || lower.contains("active") {
            failed = false;
        }
        let when = task.get("start_time").and_then(parse_time).unwrap_or(now);
        if now - when > stale_after {
            continue;
        }
        let resource = first_non_empty(&[vmid.as_str(), str_of(task, "node"), "backup"]).to_string();
        let summary = if status.is_empty() { error.to_string() } else { status };
        match latest.get(&resource) {
            Some((prev, _, _)) if *prev >= when => {}
            _ => {
                latest.insert(resource, (when, failed, summary));
            }
        }
    }
    for (resource, (_, failed, status)) in &latest {
        if *failed {
            out.push(ctx.signal(
                SignalType::BackupFailed,
                resource,
                resource,
                "backup",
                "warning",
                FindingCategory::Backup,
                format!("Backup task failed: {}", status),
            ));
        }
    }

    if known_vmids.is_empty() {
        return;
    }
    let mut newest: HashMap<String, DateTime<Utc>> = HashMap::new();
    for key in ["pbs", "pve"] {
        for backup in data.get(key).and_then(Value::as_array).into_iter().flatten() {
            let vmid = vmid_of(backup);
            if !known_vmids.contains(&vmid) {
                continue;
            }
            if let Some(when) = backup.get("backup_time").and_then(parse_time) {
                let slot = newest.entry(vmid).or_insert(when);
                if when > *slot {
                    *slot = when;
                }
            }
        }
    }
    let mut stale: Vec<_> = newest
        .into_iter()
        .filter(|(_, when)| now - *when > stale_after)
        .collect();
    stale.sort();
    for (vmid, _) in stale {
        out.push(ctx.signal(
            SignalType::BackupStale,
            &vmid,
            &vmid,
            "backup",
            "warning",
            FindingCategory::Backup,
            format!("No backup completed in 48+ hours for VM/CT {}", vmid),
        ));
    }
}

// ============================================================================
// PARSING HELPERS
// ============================================================================

fn should_skip(output: &str) -> bool {
    let lower = output.trim().to_lowercase();
    lower.is_empty() || lower.starts_with("no ") || lower.starts_with("state provider not available")
}

/// The whole output as JSON, or the outermost object embedded in it
fn parse_output(output: &str) -> Option<Value> {
    if let Ok(v) = serde_json::from_str(output.trim()) {
        return Some(v);
    }
    let start = output.find('{')?;
    let end = output.rfind('}')?;
    if end <= start {
        return None;
    }
    serde_json::from_str(&output[start..=end]).ok()
}

fn str_of<'a>(v: &'a Value, key: &str) -> &'a str {
    v.get(key).and_then(Value::as_str).unwrap_or_default()
}

fn num_of(v: &Value, key: &str) -> Option<f64> {
    v.get(key).and_then(Value::as_f64)
}

fn first_non_empty<'a>(candidates: &[&'a str]) -> &'a str {
    candidates.iter().copied().find(|s| !s.is_empty()).unwrap_or_default()
}

/// VMIDs arrive as numbers or strings; zero means none
fn vmid_of(v: &Value) -> String {
    let vmid = match v.get("vmid") {
        Some(Value::Number(n)) => n.to_string(),
        Some(Value::String(s)) => s.trim().to_string(),
        _ => String::new(),
    };
    if vmid == "0" {
        String::new()
    } else {
        vmid
    }
}

fn parse_time(v: &Value) -> Option<DateTime<Utc>> {
    match v {
        Value::String(s) => {
            let s = s.trim();
            DateTime::parse_from_rfc3339(s)
                .map(|t| t.with_timezone(&Utc))
                .ok()
                .or_else(|| {
                    NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
                        .ok()
                        .map(|t| t.and_utc())
                })
        }
        Value::Number(n) => n.as_i64().and_then(|secs| Utc.timestamp_opt(secs, 0).single()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn call(name: &str, output: Value) -> ToolCallRecord {
        ToolCallRecord {
            id: format!("{}-1", name),
            name: name.to_string(),
            output: output.to_string(),
            success: true,
            ..Default::default()
        }
    }

    fn types(signals: &[Signal]) -> Vec<(SignalType, &str, &str)> {
        signals
            .iter()
            .map(|s| (s.signal_type, s.resource_id.as_str(), s.severity.as_str()))
            .collect()
    }

    #[test]
    fn test_health_overview_signals() {
        let output = json!({
            "alerts": [
                {"id": "a1", "type": "disk", "level": "critical", "resource_id": "pool-a",
                 "resource_name": "pool-a", "message": "disk critical on pool pool-a"},
                {"id": "a2", "type": "offline", "level": "warning", "resource_id": "qemu/101",
                 "resource_name": "web", "message": "web is offline"},
                {"id": "a3", "type": "cpu", "level": "info", "resource_id": "node/pve1"}
            ],
            "pools": [
                {"id": "pool-a", "name": "pool-a", "usage": 96.2},
                {"id": "pool-b", "name": "pool-b", "usage": 75.0},
                {"id": "pool-c", "name": "pool-c", "usage": 80.5}
            ],
            "disks": [
                {"host": "pve1", "device": "/dev/sda", "health": "FAILED"},
                {"host": "pve1", "device": "/dev/sdb", "health": "PASSED"}
            ]
        });
        let signals = detect_signals(&[call("query", output)], &SignalThresholds::default(), Utc::now());
        assert_eq!(
            types(&signals),
            vec![
                (SignalType::SmartFailure, "pve1", "critical"),
                (SignalType::HighDisk, "pool-a", "critical"),
                (SignalType::HighDisk, "pool-c", "warning"),
                (SignalType::ActiveAlert, "qemu/101", "warning"),
            ]
        );
        assert_eq!(signals[1].category, FindingCategory::Capacity);
        assert_eq!(signals[1].tool_call_id, "query-1");
        assert!(signals[0].evidence.len() <= MAX_EVIDENCE_LEN + 3);
    }

    #[test]
    fn test_metrics_summary_signals() {
        let output = json!({"period": "24h", "summary": {
            "node/pve1": {"resource_id": "node/pve1", "resource_name": "pve1", "resource_type": "node",
                          "avg_cpu": 82.0, "avg_memory": 40.0},
            "qemu/100": {"resource_id": "qemu/100", "resource_name": "db", "resource_type": "vm",
                         "avg_cpu": 10.0, "avg_memory": 91.5}
        }});
        let signals = detect_signals(&[call("get_metrics", output)], &SignalThresholds::default(), Utc::now());
        assert_eq!(
            types(&signals),
            vec![
                (SignalType::HighCpu, "node/pve1", "warning"),
                (SignalType::HighMemory, "qemu/100", "warning"),
            ]
        );
        assert_eq!(signals[1].summary, "High memory usage on db: 91.5%");
    }

    #[test]
    fn test_backup_signals() {
        let now = Utc::now();
        let recent = (now - ChronoDuration::hours(2)).to_rfc3339();
        let old = (now - ChronoDuration::hours(72)).to_rfc3339();
        let output = json!({
            "recent_tasks": [
                {"vmid": 100, "node": "pve1", "status": "OK", "start_time": recent},
                {"vmid": 101, "node": "pve1", "status": "job errors", "start_time": recent},
                {"vmid": 102, "node": "pve1", "status": "running", "start_time": recent},
                {"vmid": 103, "node": "pve1", "status": "failed", "start_time": old}
            ],
            "pve": [{"vmid": 100, "backup_time": old}],
            "pbs": [{"vmid": "100", "backup_time": old}, {"vmid": "999", "backup_time": old}]
        });
        let signals = detect_signals(&[call("list_backups", output)], &SignalThresholds::default(), now);
        assert_eq!(
            types(&signals),
            vec![
                (SignalType::BackupFailed, "101", "warning"),
                (SignalType::BackupStale, "100", "warning"),
            ]
        );
    }

    #[test]
    fn test_skips_unavailable_and_parses_embedded() {
        let calls = vec![
            ToolCallRecord { output: "No storage pools found.".into(), ..Default::default() },
            ToolCallRecord { output: "State provider not available".into(), ..Default::default() },
            ToolCallRecord {
                name: "list_storage".into(),
                output: r#"Pools: {"pools":[{"id":"p1","name":"p1","usage_percent":99}]} (1 shown)"#.into(),
                ..Default::default()
            },
        ];
        let signals = detect_signals(&calls, &SignalThresholds::default(), Utc::now());
        assert_eq!(types(&signals), vec![(SignalType::HighDisk, "p1", "critical")]);
    }

    #[test]
    fn test_dedup_and_unmatched() {
        let pools = json!({"pools": [{"id": "pool-a", "name": "pool-a", "usage": 90}]});
        let signals = detect_signals(
            &[call("query", pools.clone()), call("list_storage", pools)],
            &SignalThresholds::default(),
            Utc::now(),
        );
        assert_eq!(signals.len(), 1);

        let other_category = Finding {
            resource_id: "pool-a".into(),
            category: FindingCategory::Performance,
            ..Default::default()
        };
        assert_eq!(unmatched(&signals, &[other_category]).len(), 1);
        let same = Finding {
            resource_id: "pool-a".into(),
            category: FindingCategory::Capacity,
            ..Default::default()
        };
        assert!(unmatched(&signals, &[same]).is_empty());
    }

    #[test]
    fn test_finding_defaults() {
        let s = unreachable_signal("qemu/101", "web", "vm", "pve1");
        let input = s.to_finding_input();
        assert_eq!(input.key, "guest-unreachable");
        assert_eq!(input.title, "Guest unreachable: web");
        assert_eq!(input.category, "reliability");
        assert_eq!(input.severity, "warning");
        assert!(input.recommendation.starts_with("Investigate why this guest"));
    }
}
