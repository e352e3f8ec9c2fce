//! Finding creator wired into the executor for one patrol run
//!
//! Normalizes what the model reports, rejects findings the current metrics
//! do not back up, and remembers which findings were reported or resolved so
//! the engine can reconcile afterwards.

use async_trait::async_trait;
use pulse_core::{Error, Result, StateSnapshot};
use pulse_store::{generate_finding_id, Finding, FindingCategory, FindingSeverity, FindingsStore};
use pulse_tools::{BaselineProvider, CreatedFinding, PatrolFindingCreator, PatrolFindingInfo, PatrolFindingInput};
use std::collections::HashSet;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

pub const FINDING_SOURCE: &str = "ai-analysis";

const REJECTED_BY_METRICS: &str =
    "finding rejected: metrics do not support this finding (below actionable thresholds)";
const REJECTED_UNKNOWN_RESOURCE: &str = "finding rejected: resource not found in current infrastructure";
const REJECTED_NO_RECOMMENDATION: &str = "finding rejected: informational findings need a recommendation";

/// Minimum percent usage for a metric finding to be actionable
const CPU_ACTIONABLE: f64 = 50.0;
const MEMORY_ACTIONABLE: f64 = 60.0;
const DISK_ACTIONABLE: f64 = 70.0;
const STORAGE_ACTIONABLE: f64 = 70.0;
/// A value this many deviations above its baseline is actionable regardless
const ANOMALY_Z_SCORE: f64 = 2.0;

#[derive(Debug, Clone)]
pub struct ReportedFinding {
    pub id: String,
    pub severity: FindingSeverity,
    pub is_new: bool,
}

#[derive(Debug, Default)]
struct RunTracker {
    reported: Vec<ReportedFinding>,
    resolved: HashSet<String>,
    rejected: usize,
}

pub struct RunFindingCreator {
    findings: Arc<FindingsStore>,
    state: Arc<StateSnapshot>,
    baselines: Option<Arc<dyn BaselineProvider>>,
    tracker: Mutex<RunTracker>,
}

impl RunFindingCreator {
    pub fn new(
        findings: Arc<FindingsStore>,
        state: Arc<StateSnapshot>,
        baselines: Option<Arc<dyn BaselineProvider>>,
    ) -> Self {
        Self {
            findings,
            state,
            baselines,
            tracker: Mutex::new(RunTracker::default()),
        }
    }

    pub async fn reported(&self) -> Vec<ReportedFinding> {
        self.tracker.lock().await.reported.clone()
    }

    pub async fn reported_ids(&self) -> HashSet<String> {
        self.tracker.lock().await.reported.iter().map(|r| r.id.clone()).collect()
    }

    pub async fn resolved_ids(&self) -> HashSet<String> {
        self.tracker.lock().await.resolved.clone()
    }

    pub async fn rejected_count(&self) -> usize {
        self.tracker.lock().await.rejected
    }

    /// Findings reported so far, as stored
    pub async fn reported_findings(&self) -> Vec<Finding> {
        let ids: Vec<String> = self.tracker.lock().await.reported.iter().map(|r| r.id.clone()).collect();
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(f) = self.findings.get(&id).await {
                out.push(f);
            }
        }
        out
    }

    async fn reject(&self, reason: &str, input: &PatrolFindingInput) -> Error {
        self.tracker.lock().await.rejected += 1;
        info!(resource = %input.resource_id, title = %input.title, reason, "Patrol finding rejected");
        Error::invalid_input(reason)
    }

    fn to_finding(&self, input: &PatrolFindingInput) -> Finding {
        let severity = normalize_severity(&input.severity);
        let category = normalize_category(&input.category);
        let mut key = normalize_finding_key(&input.key);
        if key.is_empty() {
            key = normalize_finding_key(&input.title);
        }
        if key.is_empty() {
            key = "llm-finding".to_string();
        }
        let resource_name = if input.resource_name.trim().is_empty() {
            self.state
                .resource_name(&input.resource_id)
                .unwrap_or_else(|| input.resource_id.clone())
        } else {
            input.resource_name.clone()
        };
        Finding {
            id: generate_finding_id(&input.resource_id, category.as_str(), &key),
            key,
            severity,
            category,
            resource_id: input.resource_id.clone(),
            resource_name,
            resource_type: input.resource_type.clone(),
            node: self.node_of(&input.resource_id),
            title: input.title.clone(),
            description: input.description.clone(),
            recommendation: input.recommendation.clone(),
            evidence: input.evidence.clone(),
            source: FINDING_SOURCE.to_string(),
            ..Default::default()
        }
    }

    fn node_of(&self, resource_id: &str) -> String {
        self.state
            .vms
            .iter()
            .chain(self.state.containers.iter())
            .find(|g| g.id == resource_id)
            .map(|g| g.node.clone())
            .or_else(|| self.state.storage.iter().find(|s| s.id == resource_id).map(|s| s.node.clone()))
            .unwrap_or_default()
    }

    fn has_resources(&self) -> bool {
        !(self.state.nodes.is_empty()
            && self.state.vms.is_empty()
            && self.state.containers.is_empty()
            && self.state.storage.is_empty())
    }

    fn resource_known(&self, id: &str, name: &str) -> bool {
        let matches = |candidate_id: &str, candidate_name: &str| {
            candidate_id == id || (!name.is_empty() && candidate_name == name) || candidate_name == id
        };
        self.state.nodes.iter().any(|n| matches(&n.id, &n.name))
            || self
                .state
                .vms
                .iter()
                .chain(self.state.containers.iter())
                .any(|g| matches(&g.id, &g.name))
            || self.state.storage.iter().any(|s| matches(&s.id, &s.name))
            || self.state.contains_resource(id)
    }

    /// Current usage of `metric` (`cpu`, `memory`, `disk`, `storage`) in percent
    fn metric_value(&self, id: &str, name: &str, metric: &str) -> Option<f64> {
        let same = |cid: &str, cname: &str| cid == id || (!name.is_empty() && cname == name);
        if let Some(n) = self.state.nodes.iter().find(|n| same(&n.id, &n.name)) {
            return match metric {
                "cpu" => Some(n.cpu * 100.0),
                "memory" => Some(percent(n.memory.used, n.memory.total).unwrap_or(n.memory.usage)),
                "disk" => Some(percent(n.disk.used, n.disk.total).unwrap_or(n.disk.usage)),
                _ => None,
            };
        }
        if let Some(g) = self
            .state
            .vms
            .iter()
            .chain(self.state.containers.iter())
            .find(|g| same(&g.id, &g.name))
        {
            return match metric {
                "cpu" => Some(g.cpu * 100.0),
                "memory" => Some(g.memory.usage),
                "disk" => Some(g.disk.usage),
                _ => None,
            };
        }
        if let Some(s) = self.state.storage.iter().find(|s| same(&s.id, &s.name)) {
            return match metric {
                "storage" | "disk" => Some(s.usage),
                _ => None,
            };
        }
        None
    }

    fn is_anomalous(&self, id: &str, metric: &str, value: f64) -> bool {
        self.baselines
            .as_ref()
            .and_then(|b| b.baseline(id, metric))
            .map(|b| b.z_score(value) >= ANOMALY_Z_SCORE)
            .unwrap_or(false)
    }

    /// Why a finding should not be stored, if it should not
    fn rejection(&self, input: &PatrolFindingInput, finding: &Finding) -> Option<&'static str> {
        if finding.severity == FindingSeverity::Info && input.recommendation.trim().is_empty() {
            return Some(REJECTED_NO_RECOMMENDATION);
        }
        if self.has_resources() && !self.resource_known(&input.resource_id, &input.resource_name) {
            return Some(REJECTED_UNKNOWN_RESOURCE);
        }
        if finding.severity == FindingSeverity::Critical
            || matches!(finding.category, FindingCategory::Backup | FindingCategory::Reliability)
        {
            return None;
        }

        let text = format!("{} {}", finding.key, input.title).to_lowercase();
        let checks: [(&str, &[&str], f64); 3] = [
            ("cpu", &["cpu"], CPU_ACTIONABLE),
            ("memory", &["memory", "mem"], MEMORY_ACTIONABLE),
            ("disk", &["disk", "storage"], DISK_ACTIONABLE),
        ];
        for (metric, words, threshold) in checks {
            if !words.iter().any(|w| text.contains(w)) {
                continue;
            }
            let (value, threshold) = match self.metric_value(&input.resource_id, &input.resource_name, metric) {
                Some(v) => (v, threshold),
                None => match self.metric_value(&input.resource_id, &input.resource_name, "storage") {
                    Some(v) if metric == "disk" => (v, STORAGE_ACTIONABLE),
                    _ => return None,
                },
            };
            if value >= threshold || self.is_anomalous(&input.resource_id, metric, value) {
                return None;
            }
            debug!(metric, value, threshold, "Metric below actionable threshold");
            return Some(REJECTED_BY_METRICS);
        }
        None
    }
}

#[async_trait]
impl PatrolFindingCreator for RunFindingCreator {
    async fn create_finding(&self, input: PatrolFindingInput) -> Result<CreatedFinding> {
        let finding = self.to_finding(&input);
        if let Some(reason) = self.rejection(&input, &finding) {
            return Err(self.reject(reason, &input).await);
        }

        let id = finding.id.clone();
        let severity = finding.severity;
        let is_new = self.findings.add(finding).await;
        debug!(finding_id = %id, is_new, "Patrol finding recorded");

        let mut tracker = self.tracker.lock().await;
        match tracker.reported.iter_mut().find(|r| r.id == id) {
            Some(existing) => existing.is_new |= is_new,
            None => tracker.reported.push(ReportedFinding { id: id.clone(), severity, is_new }),
        }
        Ok(CreatedFinding { id, is_new })
    }

    async fn resolve_finding(&self, finding_id: &str, reason: &str) -> Result<()> {
        if !self.findings.resolve(finding_id, true).await {
            return Err(Error::not_found(format!(
                "finding {} not found or already resolved",
                finding_id
            )));
        }
        info!(finding_id, reason, "Patrol resolved finding");
        self.tracker.lock().await.resolved.insert(finding_id.to_string());
        Ok(())
    }

    async fn active_findings(&self, resource_id: &str, min_severity: &str) -> Vec<PatrolFindingInfo> {
        let min = if min_severity.is_empty() {
            FindingSeverity::Info
        } else {
            normalize_severity(min_severity)
        };
        self.findings
            .get_active(min)
            .await
            .iter()
            .filter(|f| resource_id.is_empty() || f.resource_id == resource_id || f.resource_name == resource_id)
            .map(PatrolFindingInfo::from)
            .collect()
    }
}

pub fn normalize_severity(s: &str) -> FindingSeverity {
    FindingSeverity::from_str(s.trim()).unwrap_or(FindingSeverity::Info)
}

pub fn normalize_category(s: &str) -> FindingCategory {
    FindingCategory::from_str(s.trim()).unwrap_or(FindingCategory::General)
}

/// Lowercase, `_` and spaces to `-`, only `[a-z0-9-]` kept
pub fn normalize_finding_key(key: &str) -> String {
    key.trim()
        .to_lowercase()
        .chars()
        .filter_map(|c| match c {
            '_' | ' ' => Some('-'),
            c if c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' => Some(c),
            _ => None,
        })
        .collect::<String>()
        .trim_matches('-')
        .to_string()
}

fn percent(used: u64, total: u64) -> Option<f64> {
    (total > 0).then(|| used as f64 / total as f64 * 100.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pulse_core::snapshot::{Guest, Node, Storage, Usage};

    fn state() -> Arc<StateSnapshot> {
        Arc::new(StateSnapshot {
            nodes: vec![Node {
                id: "node/pve1".into(),
                name: "pve1".into(),
                cpu: 0.12,
                memory: Usage { total: 100, used: 90, usage: 90.0 },
                ..Default::default()
            }],
            vms: vec![Guest {
                id: "qemu/100".into(),
                vmid: 100,
                name: "db".into(),
                node: "pve1".into(),
                cpu: 0.85,
                ..Default::default()
            }],
            storage: vec![Storage {
                id: "pool-a".into(),
                name: "pool-a".into(),
                node: "pve1".into(),
                usage: 40.0,
                ..Default::default()
            }],
            ..Default::default()
        })
    }

    fn input(resource: &str, key: &str, severity: &str, category: &str) -> PatrolFindingInput {
        PatrolFindingInput {
            key: key.into(),
            severity: severity.into(),
            category: category.into(),
            resource_id: resource.into(),
            title: format!("{} on {}", key, resource),
            description: "details".into(),
            recommendation: "do something".into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_normalize_key() {
        assert_eq!(normalize_finding_key("  High_CPU usage! "), "high-cpu-usage");
        assert_eq!(normalize_finding_key("--x--"), "x");
        assert_eq!(normalize_finding_key("%%%"), "");
        assert_eq!(normalize_severity("CRITICAL"), FindingSeverity::Critical);
        assert_eq!(normalize_severity("urgent"), FindingSeverity::Info);
        assert_eq!(normalize_category("nonsense"), FindingCategory::General);
    }

    #[tokio::test]
    async fn test_create_tracks_and_dedups() {
        let store = Arc::new(FindingsStore::new());
        let creator = RunFindingCreator::new(store.clone(), state(), None);

        let first = creator
            .create_finding(input("qemu/100", "cpu_high", "warning", "performance"))
            .await
            .unwrap();
        assert!(first.is_new);
        assert_eq!(first.id, generate_finding_id("qemu/100", "performance", "cpu-high"));
        let again = creator
            .create_finding(input("qemu/100", "cpu_high", "warning", "performance"))
            .await
            .unwrap();
        assert!(!again.is_new);

        let reported = creator.reported().await;
        assert_eq!(reported.len(), 1);
        assert!(reported[0].is_new);

        let stored = store.get(&first.id).await.unwrap();
        assert_eq!(stored.source, FINDING_SOURCE);
        assert_eq!(stored.resource_name, "db");
        assert_eq!(stored.node, "pve1");
    }

    #[tokio::test]
    async fn test_key_falls_back_to_title() {
        let creator = RunFindingCreator::new(Arc::new(FindingsStore::new()), state(), None);
        let mut i = input("pool-a", "", "critical", "capacity");
        i.title = "Pool nearly full".into();
        let created = creator.create_finding(i).await.unwrap();
        assert_eq!(created.id, generate_finding_id("pool-a", "capacity", "pool-nearly-full"));
    }

    #[tokio::test]
    async fn test_rejections_are_counted() {
        let store = Arc::new(FindingsStore::new());
        let creator = RunFindingCreator::new(store.clone(), state(), None);

        // Storage at 40% does not back a disk warning
        let err = creator
            .create_finding(input("pool-a", "disk-high", "warning", "capacity"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("below actionable thresholds"));

        // Unknown resource
        assert!(creator
            .create_finding(input("qemu/999", "cpu-high", "warning", "performance"))
            .await
            .is_err());

        // Info without recommendation
        let mut info = input("qemu/100", "note", "info", "general");
        info.recommendation.clear();
        assert!(creator.create_finding(info).await.is_err());

        // Node memory at 90% is actionable; critical always passes
        assert!(creator
            .create_finding(input("node/pve1", "memory-high", "warning", "performance"))
            .await
            .is_ok());
        assert!(creator
            .create_finding(input("pool-a", "disk-high", "critical", "capacity"))
            .await
            .is_ok());

        assert_eq!(creator.rejected_count().await, 3);
        assert_eq!(store.get_summary().await.total, 2);
    }

    #[tokio::test]
    async fn test_resolve_and_filter() {
        let store = Arc::new(FindingsStore::new());
        let creator = RunFindingCreator::new(store.clone(), state(), None);
        let created = creator
            .create_finding(input("qemu/100", "cpu-high", "warning", "performance"))
            .await
            .unwrap();

        assert_eq!(creator.active_findings("db", "").await.len(), 1);
        assert!(creator.active_findings("qemu/100", "critical").await.is_empty());
        assert!(creator.active_findings("node/pve1", "").await.is_empty());

        creator.resolve_finding(&created.id, "fixed").await.unwrap();
        assert!(creator.resolved_ids().await.contains(&created.id));
        let err = creator.resolve_finding(&created.id, "again").await.unwrap_err();
        assert!(err.to_string().contains("not found or already resolved"));
    }
}
