//! Seed context for the patrol prompt
//!
//! A plain-text picture of the fleet assembled before the model runs, so it
//! can start analyzing without spending turns on routine reads. Sections:
//!
//! 1. previous run
//! 2. inventory (nodes, guests, docker, storage, ceph, pbs, pmg)
//! 3. backup gaps
//! 4. disk health, alerts, connections, hosts and clusters
//! 5. intelligence (anomalies, forecasts, predictions, changes, correlations)
//! 6. thresholds, findings to re-check, user feedback, user notes
//!
//! When nothing is moving (no anomalies, predictions, changes, alerts or
//! near-term forecasts) inventory tables collapse to one-line summaries.
//! Rendering is pure; the engine gathers [`SeedInputs`] and acts on the
//! returned ids.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use pulse_core::snapshot::{Guest, StateSnapshot};
use pulse_store::{Finding, PatrolRunRecord};
use pulse_tools::{DiskHealth, MetricBaseline, Prediction};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::config::AnalysisScope;
use crate::providers::{CapacityForecast, Correlation, GuestIntel, ResourceChange};
use crate::signals::SignalThresholds;

/// Resource id of findings about patrol itself
pub const PATROL_SERVICE_RESOURCE: &str = "ai-service";

const ANOMALY_Z_SCORE: f64 = 2.0;
const FORECAST_HORIZON_DAYS: f64 = 30.0;
const BACKUP_WINDOW_HOURS: i64 = 48;

#[derive(Default)]
pub struct SeedInputs {
    pub now: DateTime<Utc>,
    pub state: Arc<StateSnapshot>,
    pub scope: AnalysisScope,
    pub previous_run: Option<PatrolRunRecord>,
    pub guest_intel: HashMap<String, GuestIntel>,
    pub disk_health: Vec<DiskHealth>,
    pub baselines: HashMap<String, HashMap<String, MetricBaseline>>,
    pub predictions: Vec<Prediction>,
    pub forecasts: Vec<CapacityForecast>,
    pub changes: Vec<ResourceChange>,
    pub correlations: Vec<Correlation>,
    pub thresholds: SignalThresholds,
    pub active_findings: Vec<Finding>,
    pub dismissed_context: String,
    pub knowledge_context: String,
}

#[derive(Debug, Default)]
pub struct Seed {
    pub text: String,
    /// Active findings shown to the model for re-checking
    pub seeded_ids: Vec<String>,
    /// Active findings whose resource is gone from the snapshot
    pub gone_ids: Vec<String>,
}

#[derive(Debug)]
struct Anomaly {
    name: String,
    metric: &'static str,
    z: f64,
    current: f64,
    mean: f64,
}

pub fn build_seed(inputs: &SeedInputs) -> Seed {
    let anomalies = anomalies(inputs);
    let forecasts: Vec<&CapacityForecast> = inputs
        .forecasts
        .iter()
        .filter(|f| f.days_to_full.map(|d| d <= FORECAST_HORIZON_DAYS).unwrap_or(false))
        .collect();
    let changes: Vec<&ResourceChange> = inputs
        .changes
        .iter()
        .filter(|c| c.at.map(|t| inputs.now - t <= ChronoDuration::hours(24)).unwrap_or(true))
        .collect();
    let quiet = anomalies.is_empty()
        && inputs.predictions.is_empty()
        && changes.is_empty()
        && inputs.state.active_alerts.is_empty()
        && forecasts.is_empty();

    let mut out = String::new();
    previous_run(&mut out, inputs);
    inventory(&mut out, inputs, quiet);
    backups(&mut out, inputs);
    health(&mut out, inputs);
    intelligence(&mut out, inputs, &anomalies, &forecasts, &changes);
    let (seeded_ids, gone_ids) = findings(&mut out, inputs);

    Seed {
        text: out,
        seeded_ids,
        gone_ids,
    }
}

// ============================================================================
// SECTIONS
// ============================================================================

fn previous_run(out: &mut String, inputs: &SeedInputs) {
    let Some(last) = &inputs.previous_run else {
        return;
    };
    let ran = last.started_at.map(|t| time_ago(inputs.now, t)).unwrap_or_else(|| "unknown".into());
    out.push_str("# Previous Patrol Run\n");
    out.push_str(&format!(
        "- Ran: {} (duration: {})\n",
        ran,
        format_duration(ChronoDuration::milliseconds(last.duration_ms as i64))
    ));
    out.push_str(&format!("- Status: {}\n", status_label(last)));
    out.push_str(&format!(
        "- Findings: {} new, {} existing, {} resolved, {} rejected\n",
        last.new_findings, last.existing_findings, last.resolved_findings, last.rejected_findings
    ));
    if !last.summary.is_empty() {
        out.push_str(&format!("- Summary: {}\n", last.summary));
    }
    let trigger = if last.trigger.is_empty() { "scheduled" } else { last.trigger.as_str() };
    out.push_str(&format!("- Trigger: {}\n\n", trigger));
}

fn status_label(run: &PatrolRunRecord) -> &'static str {
    use pulse_store::PatrolRunStatus::*;
    match run.status {
        Healthy => "healthy",
        IssuesFound => "issues_found",
        Critical => "critical",
        Error => "error",
    }
}

fn inventory(out: &mut String, inputs: &SeedInputs, quiet: bool) {
    let state = &inputs.state;
    let scope = &inputs.scope;

    if scope.nodes && !state.nodes.is_empty() {
        let all_online = state.nodes.iter().all(|n| n.status == "online");
        if quiet && all_online {
            let cpu = range(state.nodes.iter().map(|n| n.cpu * 100.0));
            let mem = range(state.nodes.iter().map(|n| usage_of(n.memory.used, n.memory.total, n.memory.usage)));
            out.push_str(&format!(
                "# Nodes: All {} healthy (CPU {:.0}-{:.0}%, Mem {:.0}-{:.0}%)\n\n",
                state.nodes.len(),
                cpu.0,
                cpu.1,
                mem.0,
                mem.1
            ));
        } else {
            out.push_str("# Node Metrics\n");
            out.push_str("| Node | Status | CPU | Mem | Disk | Load (1/5/15) | Uptime | Updates |\n");
            out.push_str("|------|--------|-----|-----|------|---------------|--------|---------|\n");
            for n in &state.nodes {
                let load = if n.load_average.is_empty() {
                    "-".to_string()
                } else {
                    n.load_average.iter().map(|l| format!("{:.2}", l)).collect::<Vec<_>>().join("/")
                };
                out.push_str(&format!(
                    "| {} | {} | {:.0}% | {:.0}% | {:.0}% | {} | {} | {} |\n",
                    n.name,
                    n.status,
                    n.cpu * 100.0,
                    usage_of(n.memory.used, n.memory.total, n.memory.usage),
                    usage_of(n.disk.used, n.disk.total, n.disk.usage),
                    load,
                    format_duration(ChronoDuration::seconds(n.uptime as i64)),
                    n.pending_updates
                ));
            }
            out.push('\n');
        }
    }

    if scope.guests {
        guests(out, inputs, quiet);
    }

    if scope.docker && !state.docker_hosts.is_empty() {
        let unhealthy: Vec<String> = state
            .docker_hosts
            .iter()
            .flat_map(|h| {
                h.containers
                    .iter()
                    .filter(|c| !c.health.is_empty() && c.health != "healthy")
                    .map(move |c| format!("- {}/{}: health={}", h.hostname, c.name, c.health))
            })
            .collect();
        let running = |h: &pulse_core::snapshot::DockerHost| h.containers.iter().filter(|c| c.state == "running").count();
        if quiet && unhealthy.is_empty() {
            let total_running: usize = state.docker_hosts.iter().map(running).sum();
            out.push_str(&format!(
                "# Docker: {} hosts, {} of {} containers running, no health issues.\n\n",
                state.docker_hosts.len(),
                total_running,
                state.docker_container_count()
            ));
        } else {
            out.push_str("# Docker\n");
            out.push_str("| Host | Containers | Running | Stopped |\n");
            out.push_str("|------|------------|---------|---------|\n");
            for h in &state.docker_hosts {
                let r = running(h);
                out.push_str(&format!(
                    "| {} | {} | {} | {} |\n",
                    h.hostname,
                    h.containers.len(),
                    r,
                    h.containers.len() - r
                ));
            }
            for line in unhealthy {
                out.push_str(&format!("{}\n", line));
            }
            out.push('\n');
        }
    }

    if scope.storage && !state.storage.is_empty() {
        let t = &inputs.thresholds;
        let any_hot = state.storage.iter().any(|s| s.usage > t.storage_warning);
        let any_zfs_errors = state
            .storage
            .iter()
            .any(|s| s.zfs_pool.as_ref().map(|z| z.has_errors()).unwrap_or(false));
        if quiet && !any_hot && !any_zfs_errors {
            let (lo, hi) = range(state.storage.iter().map(|s| s.usage));
            out.push_str(&format!(
                "# Storage: {} pools, all within normal range ({:.0}-{:.0}% used).\n\n",
                state.storage.len(),
                lo,
                hi
            ));
        } else {
            out.push_str("# Storage\n");
            out.push_str("| Pool | Type | Node | Usage | Used | Total | Status |\n");
            out.push_str("|------|------|------|-------|------|-------|--------|\n");
            for s in &state.storage {
                out.push_str(&format!(
                    "| {} | {} | {} | {:.0}% | {} | {} | {} |\n",
                    s.name,
                    s.storage_type,
                    s.node,
                    s.usage,
                    format_bytes(s.used),
                    format_bytes(s.total),
                    s.status
                ));
            }
            for s in &state.storage {
                if let Some(z) = s.zfs_pool.as_ref().filter(|z| z.has_errors()) {
                    out.push_str(&format!(
                        "- {} ZFS errors: read={} write={} checksum={} (state {})\n",
                        s.name, z.read_errors, z.write_errors, z.checksum_errors, z.state
                    ));
                }
            }
            out.push('\n');
        }

        if !state.ceph_clusters.is_empty() {
            out.push_str("# Ceph\n");
            for c in &state.ceph_clusters {
                out.push_str(&format!("- {}: {}, {:.0}% used\n", c.name, c.health, c.usage));
                if !c.health_message.is_empty() {
                    out.push_str(&format!("  Message: {}\n", c.health_message));
                }
            }
            out.push('\n');
        }
    }

    if scope.pbs && state.pbs_instances.iter().any(|p| !p.datastores.is_empty()) {
        out.push_str("# PBS Datastores\n");
        for p in &state.pbs_instances {
            for ds in &p.datastores {
                out.push_str(&format!(
                    "- {}/{}: {:.0}% used ({} / {})\n",
                    p.name,
                    ds.name,
                    ds.usage,
                    format_bytes(ds.used),
                    format_bytes(ds.total)
                ));
            }
        }
        out.push('\n');
    }

    if scope.pmg && !state.pmg_instances.is_empty() {
        let all_online = state.pmg_instances.iter().all(|p| p.status == "online");
        if quiet && all_online {
            out.push_str(&format!(
                "# PMG: {} gateways, all healthy and processing mail normally.\n\n",
                state.pmg_instances.len()
            ));
        } else {
            out.push_str("# Proxmox Mail Gateway (PMG)\n");
            out.push_str("| Instance | Status | Mail (24h) | Queue |\n");
            out.push_str("|----------|--------|------------|-------|\n");
            for p in &state.pmg_instances {
                out.push_str(&format!("| {} | {} | {} | {} |\n", p.name, p.status, p.mail_count_24h, p.queue_total));
            }
            out.push('\n');
        }
    }
}

fn guests(out: &mut String, inputs: &SeedInputs, quiet: bool) {
    let guests: Vec<&Guest> = inputs.state.guests().collect();
    if guests.is_empty() {
        return;
    }
    let running = guests.iter().filter(|g| g.status == "running").count();
    let stopped = guests.len() - running;
    let intel = |g: &Guest| inputs.guest_intel.get(&g.id);
    let unreachable: Vec<&str> = guests
        .iter()
        .filter(|g| g.status == "running" && intel(g).and_then(|i| i.reachable) == Some(false))
        .map(|g| g.name.as_str())
        .collect();

    if quiet {
        if !unreachable.is_empty() {
            out.push_str(&format!(
                "# Guests: {} running, {} stopped. {} UNREACHABLE: {}\n\n",
                running,
                stopped,
                unreachable.len(),
                unreachable.join(", ")
            ));
        } else if guests.iter().any(|g| intel(g).and_then(|i| i.reachable).is_some()) {
            out.push_str(&format!(
                "# Guests: {} running, {} stopped, no issues detected. All reachable.\n\n",
                running, stopped
            ));
        } else {
            out.push_str(&format!("# Guests: {} running, {} stopped, no issues detected.\n\n", running, stopped));
        }
        return;
    }

    out.push_str("# Guest Metrics\n");
    out.push_str("| Name | Type | Node | Service | CPU | Mem | Disk | Status | Reachable | Last Backup |\n");
    out.push_str("|------|------|------|---------|-----|-----|------|--------|-----------|-------------|\n");
    for g in guests {
        let info = intel(g);
        let service = info
            .map(|i| i.service_name.as_str())
            .filter(|s| !s.is_empty())
            .unwrap_or("-");
        let reachable = match info.and_then(|i| i.reachable) {
            Some(true) => "yes",
            Some(false) => "UNREACHABLE",
            None => "-",
        };
        let last_backup = g
            .last_backup
            .map(|t| time_ago(inputs.now, t))
            .unwrap_or_else(|| "never".into());
        out.push_str(&format!(
            "| {} | {} | {} | {} | {:.0}% | {:.0}% | {:.0}% | {} | {} | {} |\n",
            g.name,
            if g.is_lxc() { "LXC" } else { "VM" },
            g.node,
            service,
            g.cpu * 100.0,
            g.memory.usage,
            g.disk.usage,
            g.status,
            reachable,
            last_backup
        ));
    }
    out.push('\n');
}

fn backups(out: &mut String, inputs: &SeedInputs) {
    let state = &inputs.state;
    let guests: Vec<&Guest> = state.guests().collect();
    if guests.is_empty() {
        return;
    }
    let names: HashMap<String, &str> = guests.iter().map(|g| (g.vmid.to_string(), g.name.as_str())).collect();
    let name_of = |vmid: &str| names.get(vmid).map(|n| n.to_string()).unwrap_or_else(|| format!("vmid-{}", vmid));

    let mut latest: HashMap<String, DateTime<Utc>> = HashMap::new();
    let mut record = |name: String, when: Option<DateTime<Utc>>| {
        if let Some(when) = when {
            let slot = latest.entry(name).or_insert(when);
            if when > *slot {
                *slot = when;
            }
        }
    };
    for task in state.pve_backups.backup_tasks.iter().filter(|t| t.status == "OK") {
        record(name_of(&task.vmid.to_string()), task.end_time.or(task.start_time));
    }
    for b in &state.pve_backups.storage_backups {
        record(name_of(&b.vmid.to_string()), b.time);
    }
    for b in &state.pbs_backups {
        record(name_of(b.vmid.trim()), b.backup_time);
    }
    for g in &guests {
        record(g.name.clone(), g.last_backup);
    }

    let cutoff = inputs.now - ChronoDuration::hours(BACKUP_WINDOW_HOURS);
    let mut stale = Vec::new();
    let mut recent = 0;
    let unique: HashSet<&str> = guests.iter().map(|g| g.name.as_str()).collect();
    for name in &unique {
        match latest.get(*name) {
            None => stale.push(format!("{} (never)", name)),
            Some(t) if *t < cutoff => stale.push(format!("{} (last: {})", name, time_ago(inputs.now, *t))),
            Some(_) => recent += 1,
        }
    }
    stale.sort();

    out.push_str("# Backup Status\n");
    if !stale.is_empty() {
        out.push_str(&format!("Guests with no backup in >48h: {}\n", stale.join(", ")));
    }
    out.push_str(&format!("Guests with recent backups: {}/{}\n\n", recent, unique.len()));
}

fn health(out: &mut String, inputs: &SeedInputs) {
    let state = &inputs.state;

    if !inputs.disk_health.is_empty() {
        out.push_str("# Disk Health\n");
        let failing: Vec<&DiskHealth> = inputs.disk_health.iter().filter(|d| d.is_failing()).collect();
        if failing.is_empty() {
            out.push_str(&format!("All {} disks healthy (SMART PASSED).\n", inputs.disk_health.len()));
        } else {
            out.push_str("| Node | Device | Model | Health | Wearout | Temp |\n");
            out.push_str("|------|--------|-------|--------|---------|------|\n");
            for d in failing {
                out.push_str(&format!(
                    "| {} | {} | {} | {} | {} | {} |\n",
                    d.host,
                    d.device,
                    d.model,
                    d.health,
                    d.wearout.map(|w| format!("{:.0}%", w)).unwrap_or_else(|| "-".into()),
                    d.temperature.map(|t| format!("{:.0}C", t)).unwrap_or_else(|| "-".into())
                ));
            }
        }
        out.push('\n');
    }

    if !state.active_alerts.is_empty() {
        out.push_str("# Active Alerts\n");
        for a in &state.active_alerts {
            let since = a.start_time.map(|t| time_ago(inputs.now, t)).unwrap_or_else(|| "unknown".into());
            out.push_str(&format!("- [{}] {}, since {}\n", a.level, a.message, since));
        }
        out.push('\n');
    }

    if !state.recently_resolved.is_empty() {
        out.push_str("# Recently Resolved Alerts\n");
        for r in &state.recently_resolved {
            let ago = r.resolved_time.map(|t| time_ago(inputs.now, t)).unwrap_or_else(|| "recently".into());
            out.push_str(&format!("- {}, resolved {}\n", r.alert.message, ago));
        }
        out.push('\n');
    }

    if !state.connection_health.is_empty() {
        out.push_str("# Connections\n");
        let disconnected: Vec<&str> = state
            .connection_health
            .iter()
            .filter(|(_, up)| !**up)
            .map(|(name, _)| name.as_str())
            .collect();
        if disconnected.is_empty() {
            out.push_str(&format!("All {} instances connected.\n", state.connection_health.len()));
        } else {
            out.push_str(&format!("Disconnected: {}\n", disconnected.join(", ")));
            out.push_str(&format!(
                "Connected: {}/{}\n",
                state.connection_health.len() - disconnected.len(),
                state.connection_health.len()
            ));
        }
        out.push('\n');
    }

    if inputs.scope.kubernetes && !state.kubernetes_clusters.is_empty() {
        out.push_str("# Kubernetes Clusters\n");
        for k in &state.kubernetes_clusters {
            out.push_str(&format!(
                "- {} ({}; nodes {}/{} ready, {} pods, {} unhealthy)\n",
                k.name, k.status, k.ready_nodes, k.node_count, k.pod_count, k.unhealthy_pods
            ));
        }
        out.push('\n');
    }

    if inputs.scope.hosts && !state.hosts.is_empty() {
        out.push_str("# Hosts\n");
        for h in &state.hosts {
            out.push_str(&format!(
                "- {} (ID: {}, {}, CPU {:.0}%, Mem {:.0}%)\n",
                h.hostname,
                h.id,
                h.status,
                h.cpu_usage,
                usage_of(h.memory.used, h.memory.total, h.memory.usage)
            ));
        }
        out.push('\n');
    }
}

fn intelligence(
    out: &mut String,
    inputs: &SeedInputs,
    anomalies: &[Anomaly],
    forecasts: &[&CapacityForecast],
    changes: &[&ResourceChange],
) {
    if !inputs.baselines.is_empty() {
        out.push_str("# Anomalies\n");
        if anomalies.is_empty() {
            out.push_str("No anomalies detected. All resources within learned baseline ranges.\n");
        }
        for a in anomalies {
            let severity = if a.z >= 4.0 {
                "critical"
            } else if a.z >= 3.0 {
                "warning"
            } else {
                "watch"
            };
            out.push_str(&format!(
                "- [{}] {} {}: {:.1} std devs above baseline (current: {:.0}%, baseline: {:.0}%)\n",
                severity, a.name, a.metric, a.z, a.current, a.mean
            ));
        }
        out.push('\n');
    }

    if !forecasts.is_empty() {
        out.push_str("# Capacity Forecasts\n");
        for f in forecasts {
            let days = f.days_to_full.unwrap_or_default();
            out.push_str(&format!(
                "- {} {}: full in ~{:.0} days (current: {:.0}%, 30-day projection: {:.0}%)\n",
                display_name(&f.resource_name, &f.resource_id),
                f.metric,
                days,
                f.current,
                f.predicted
            ));
        }
        out.push('\n');
    }

    if !inputs.predictions.is_empty() {
        out.push_str("# Failure Predictions\n");
        out.push_str("Based on historical patterns of recurring events:\n");
        for p in &inputs.predictions {
            let when = p
                .predicted_time
                .map(|t| {
                    let days = (t - inputs.now).num_hours() as f64 / 24.0;
                    format!("in {:.0} days", days.max(0.0))
                })
                .unwrap_or_else(|| "soon".into());
            out.push_str(&format!(
                "- {}: {} predicted {} (confidence: {:.0}%)",
                display_name(&p.resource_name, &p.resource_id),
                p.issue_type,
                when,
                p.confidence * 100.0
            ));
            if !p.recommendation.is_empty() {
                out.push_str(&format!(". {}", p.recommendation));
            }
            out.push('\n');
        }
        out.push('\n');
    }

    if !changes.is_empty() {
        out.push_str("# Recent Infrastructure Changes (last 24h)\n");
        for c in changes {
            let ago = c.at.map(|t| time_ago(inputs.now, t)).unwrap_or_else(|| "recently".into());
            out.push_str(&format!(
                "- {}: {} ({})\n",
                display_name(&c.resource_name, &c.resource_id),
                c.description,
                ago
            ));
        }
        out.push('\n');
    }

    if !inputs.correlations.is_empty() {
        out.push_str("# Known Resource Correlations\n");
        for c in &inputs.correlations {
            out.push_str(&format!(
                "- {} -> {}: {} (confidence: {:.0}%)\n",
                c.source,
                c.target,
                c.description,
                c.confidence * 100.0
            ));
        }
        out.push('\n');
    }
}

fn findings(out: &mut String, inputs: &SeedInputs) -> (Vec<String>, Vec<String>) {
    let t = &inputs.thresholds;
    out.push_str("# Alert Thresholds\n");
    out.push_str(&format!("- CPU warning: {:.0}%\n", t.high_cpu));
    out.push_str(&format!("- Memory warning: {:.0}%\n", t.high_memory));
    out.push_str(&format!("- Storage warning: {:.0}%, critical: {:.0}%\n", t.storage_warning, t.storage_critical));
    out.push_str(&format!("- Backup stale after: {}h\n", t.backup_stale.as_secs() / 3600));
    out.push_str(
        "Note: The real-time alerting system monitors these thresholds continuously. Focus on trends, capacity planning, and issues alerts cannot detect.\n\n"
    );

    let has_resources = !(inputs.state.nodes.is_empty()
        && inputs.state.vms.is_empty()
        && inputs.state.containers.is_empty()
        && inputs.state.storage.is_empty());
    let mut seeded = Vec::new();
    let mut gone = Vec::new();
    let mut lines = String::new();
    for f in &inputs.active_findings {
        if has_resources && f.resource_id != PATROL_SERVICE_RESOURCE && !resource_exists(&inputs.state, f) {
            gone.push(f.id.clone());
            continue;
        }
        let detected = f
            .detected_at
            .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|| "unknown".into());
        lines.push_str(&format!(
            "- [{}] {} on {} (ID: {}, Severity: {}, Detected: {})\n",
            f.id, f.title, f.resource_name, f.resource_id, f.severity, detected
        ));
        if let Some(note) = f.user_note.as_deref().filter(|n| !n.is_empty()) {
            lines.push_str(&format!("  User note: {:?}\n", note));
        }
        seeded.push(f.id.clone());
    }
    if !seeded.is_empty() {
        out.push_str("# Active Findings to Re-check\n");
        out.push_str(
            "Verify whether these findings are still valid. Resolve any that are no longer issues.\n\n"
        );
        out.push_str(&lines);
        out.push('\n');
    }

    if !inputs.dismissed_context.trim().is_empty() {
        out.push_str("# User Feedback on Previous Findings\n");
        out.push_str("Do NOT re-raise findings the user has dismissed or snoozed.\n\n");
        out.push_str(inputs.dismissed_context.trim_end());
        out.push_str("\n\n");
    }

    if !inputs.knowledge_context.trim().is_empty() {
        out.push_str("# User Notes\n");
        out.push_str(inputs.knowledge_context.trim_end());
        out.push_str("\n\n");
    }

    (seeded, gone)
}

// ============================================================================
// HELPERS
// ============================================================================

fn anomalies(inputs: &SeedInputs) -> Vec<Anomaly> {
    if inputs.baselines.is_empty() {
        return Vec::new();
    }
    let state = &inputs.state;
    let mut current: Vec<(String, String, &'static str, f64)> = Vec::new();
    for n in &state.nodes {
        current.push((n.id.clone(), n.name.clone(), "cpu", n.cpu * 100.0));
        current.push((n.id.clone(), n.name.clone(), "memory", usage_of(n.memory.used, n.memory.total, n.memory.usage)));
    }
    for g in state.guests().filter(|g| g.status == "running") {
        current.push((g.id.clone(), g.name.clone(), "cpu", g.cpu * 100.0));
        current.push((g.id.clone(), g.name.clone(), "memory", g.memory.usage));
        current.push((g.id.clone(), g.name.clone(), "disk", g.disk.usage));
    }

    let mut found: Vec<Anomaly> = current
        .into_iter()
        .filter_map(|(id, name, metric, value)| {
            let baseline = inputs.baselines.get(&id)?.get(metric)?;
            let z = baseline.z_score(value);
            (z >= ANOMALY_Z_SCORE).then(|| Anomaly {
                name,
                metric,
                z,
                current: value,
                mean: baseline.mean,
            })
        })
        .collect();
    found.sort_by(|a, b| b.z.total_cmp(&a.z));
    found
}

fn resource_exists(state: &StateSnapshot, f: &Finding) -> bool {
    let known = |key: &str| {
        !key.is_empty()
            && (state.contains_resource(key)
                || state.guests().any(|g| g.name == key)
                || state.docker_hosts.iter().any(|h| h.hostname == key)
                || state.hosts.iter().any(|h| h.hostname == key)
                || state.pbs_instances.iter().any(|p| p.name == key)
                || state.pmg_instances.iter().any(|p| p.name == key)
                || state.kubernetes_clusters.iter().any(|k| k.name == key))
    };
    known(&f.resource_id) || known(&f.resource_name)
}

fn usage_of(used: u64, total: u64, fallback: f64) -> f64 {
    if total > 0 {
        used as f64 / total as f64 * 100.0
    } else {
        fallback
    }
}

fn range(values: impl Iterator<Item = f64>) -> (f64, f64) {
    values.fold(None, |acc: Option<(f64, f64)>, v| match acc {
        None => Some((v, v)),
        Some((lo, hi)) => Some((lo.min(v), hi.max(v))),
    })
    .unwrap_or((0.0, 0.0))
}

fn display_name<'a>(name: &'a str, id: &'a str) -> &'a str {
    if name.is_empty() {
        id
    } else {
        name
    }
}

/// "just now", "12m ago", "3h ago", "2d ago"
pub fn time_ago(now: DateTime<Utc>, t: DateTime<Utc>) -> String {
    let d = now - t;
    if d < ChronoDuration::minutes(1) {
        "just now".to_string()
    } else if d < ChronoDuration::hours(1) {
        format!("{}m ago", d.num_minutes())
    } else if d < ChronoDuration::hours(24) {
        format!("{}h ago", d.num_hours())
    } else {
        format!("{}d ago", d.num_days())
    }
}

fn format_duration(d: ChronoDuration) -> String {
    if d < ChronoDuration::minutes(1) {
        format!("{}s", d.num_seconds())
    } else if d < ChronoDuration::hours(1) {
        format!("{}m", d.num_minutes())
    } else if d < ChronoDuration::hours(24) {
        format!("{}h", d.num_hours())
    } else {
        format!("{}d", d.num_days())
    }
}

fn format_bytes(b: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;
    const TB: u64 = GB * 1024;
    match b {
        b if b >= TB => format!("{:.1} TB", b as f64 / TB as f64),
        b if b >= GB => format!("{:.1} GB", b as f64 / GB as f64),
        b if b >= MB => format!("{:.0} MB", b as f64 / MB as f64),
        b if b >= KB => format!("{:.0} KB", b as f64 / KB as f64),
        b => format!("{} B", b),
    }
}
