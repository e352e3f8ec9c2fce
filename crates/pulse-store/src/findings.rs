//! Findings store
//!
//! Active, dismissed and resolved findings keyed by a content hash of
//! `(resource_id, category, key)`, so the same underlying condition always
//! lands on the same record. Optionally persisted to `<data_dir>/findings.json`
//! after every mutation.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use pulse_core::{Error, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, warn};

pub const FINDINGS_FILE: &str = "findings.json";

/// Dismissed findings older than this are left out of LLM context
const DISMISSED_CONTEXT_WINDOW_DAYS: i64 = 30;

/// Stable id: first 8 bytes of `sha256("<resource>:<category>:<key>")`, hex
pub fn generate_finding_id(resource_id: &str, category: &str, key: &str) -> String {
    let digest = Sha256::digest(format!("{}:{}:{}", resource_id, category, key).as_bytes());
    digest[..8].iter().map(|b| format!("{:02x}", b)).collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FindingSeverity {
    #[default]
    Info,
    Watch,
    Warning,
    Critical,
}

impl FindingSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            FindingSeverity::Info => "info",
            FindingSeverity::Watch => "watch",
            FindingSeverity::Warning => "warning",
            FindingSeverity::Critical => "critical",
        }
    }
}

impl fmt::Display for FindingSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FindingSeverity {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "info" => Ok(FindingSeverity::Info),
            "watch" => Ok(FindingSeverity::Watch),
            "warning" => Ok(FindingSeverity::Warning),
            "critical" => Ok(FindingSeverity::Critical),
            other => Err(Error::invalid_input(format!("unknown severity: {}", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FindingCategory {
    Performance,
    Capacity,
    Reliability,
    Backup,
    Security,
    #[default]
    General,
}

impl FindingCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            FindingCategory::Performance => "performance",
            FindingCategory::Capacity => "capacity",
            FindingCategory::Reliability => "reliability",
            FindingCategory::Backup => "backup",
            FindingCategory::Security => "security",
            FindingCategory::General => "general",
        }
    }
}

impl fmt::Display for FindingCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FindingCategory {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "performance" => Ok(FindingCategory::Performance),
            "capacity" => Ok(FindingCategory::Capacity),
            "reliability" => Ok(FindingCategory::Reliability),
            "backup" => Ok(FindingCategory::Backup),
            "security" => Ok(FindingCategory::Security),
            "general" => Ok(FindingCategory::General),
            other => Err(Error::invalid_input(format!("unknown category: {}", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DismissReason {
    NotAnIssue,
    ExpectedBehavior,
    WillFixLater,
}

impl DismissReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DismissReason::NotAnIssue => "not_an_issue",
            DismissReason::ExpectedBehavior => "expected_behavior",
            DismissReason::WillFixLater => "will_fix_later",
        }
    }
}

impl FromStr for DismissReason {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "not_an_issue" => Ok(DismissReason::NotAnIssue),
            "expected_behavior" => Ok(DismissReason::ExpectedBehavior),
            "will_fix_later" => Ok(DismissReason::WillFixLater),
            other => Err(Error::invalid_input(format!(
                "invalid reason '{}': must be one of not_an_issue, expected_behavior, will_fix_later",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FindingStatus {
    Active,
    Dismissed,
    Resolved,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Finding {
    pub id: String,
    pub key: String,
    pub severity: FindingSeverity,
    pub category: FindingCategory,
    pub resource_id: String,
    pub resource_name: String,
    pub resource_type: String,
    pub node: String,
    pub title: String,
    pub description: String,
    pub recommendation: String,
    pub evidence: String,
    pub source: String,
    pub detected_at: Option<DateTime<Utc>>,
    pub last_seen_at: Option<DateTime<Utc>>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub auto_resolved: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolve_reason: Option<String>,
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub snoozed_until: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alert_id: Option<String>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub dismissed_reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_note: Option<String>,
    pub times_raised: u32,
    pub suppressed: bool,
}

impl Finding {
    pub fn is_snoozed(&self) -> bool {
        self.snoozed_until.map(|u| Utc::now() < u).unwrap_or(false)
    }

    pub fn is_resolved(&self) -> bool {
        self.resolved_at.is_some()
    }

    pub fn is_dismissed(&self) -> bool {
        !self.dismissed_reason.is_empty()
    }

    pub fn is_active(&self) -> bool {
        !self.is_resolved() && !self.is_snoozed() && !self.suppressed && !self.is_dismissed()
    }

    pub fn status(&self) -> FindingStatus {
        if self.is_resolved() {
            FindingStatus::Resolved
        } else if self.is_active() {
            FindingStatus::Active
        } else {
            FindingStatus::Dismissed
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FindingsSummary {
    pub critical: usize,
    pub warning: usize,
    pub watch: usize,
    pub info: usize,
    pub total: usize,
}

impl FindingsSummary {
    pub fn has_issues(&self) -> bool {
        self.critical > 0 || self.warning > 0
    }
}

pub struct FindingsStore {
    findings: RwLock<HashMap<String, Finding>>,
    path: Option<PathBuf>,
}

impl Default for FindingsStore {
    fn default() -> Self {
        Self::new()
    }
}

impl FindingsStore {
    /// In-memory store
    pub fn new() -> Self {
        Self {
            findings: RwLock::new(HashMap::new()),
            path: None,
        }
    }

    /// Store persisted to `<data_dir>/findings.json`, loading what is there
    pub async fn open(data_dir: &Path) -> Result<Self> {
        tokio::fs::create_dir_all(data_dir).await?;
        let path = data_dir.join(FINDINGS_FILE);
        let findings = match tokio::fs::read(&path).await {
            Ok(data) => serde_json::from_slice(&data)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(e.into()),
        };
        debug!(count = findings.len(), path = %path.display(), "Loaded findings");
        Ok(Self {
            findings: RwLock::new(findings),
            path: Some(path),
        })
    }

    async fn persist(&self, findings: &HashMap<String, Finding>) {
        let Some(path) = &self.path else {
            return;
        };
        if let Err(e) = write_atomic(path, findings).await {
            warn!(error = %e, path = %path.display(), "Failed to persist findings");
        }
    }

    /// Record a finding. Returns true only when a new active record was
    /// created (or a resolved one re-opened).
    pub async fn add(&self, mut finding: Finding) -> bool {
        let mut findings = self.findings.write().await;
        let now = Utc::now();

        let is_new = if let Some(existing) = findings.get_mut(&finding.id) {
            if existing.suppressed {
                return false;
            }
            if existing.is_dismissed() && finding.severity <= existing.severity {
                existing.last_seen_at = Some(now);
                existing.times_raised += 1;
                false
            } else {
                if existing.is_dismissed() {
                    // Severity escalated past what the user dismissed
                    existing.dismissed_reason.clear();
                    existing.user_note = None;
                    existing.acknowledged_at = None;
                }
                let reopened = existing.is_resolved();
                if reopened {
                    existing.resolved_at = None;
                    existing.auto_resolved = false;
                    existing.resolve_reason = None;
                }
                existing.last_seen_at = Some(now);
                existing.title = finding.title;
                existing.description = finding.description;
                existing.recommendation = finding.recommendation;
                existing.evidence = finding.evidence;
                existing.severity = finding.severity;
                existing.times_raised += 1;
                reopened
            }
        } else {
            if is_suppressed(&findings, &finding.resource_id, finding.category) {
                return false;
            }
            finding.detected_at.get_or_insert(now);
            finding.last_seen_at = Some(now);
            finding.times_raised = finding.times_raised.max(1);
            findings.insert(finding.id.clone(), finding);
            true
        };

        self.persist(&findings).await;
        is_new
    }

    pub async fn get(&self, id: &str) -> Option<Finding> {
        self.findings.read().await.get(id).cloned()
    }

    /// Mark an active finding resolved
    pub async fn resolve(&self, id: &str, auto: bool) -> bool {
        self.resolve_inner(id, auto, None).await
    }

    pub async fn resolve_with_reason(&self, id: &str, reason: &str) -> bool {
        self.resolve_inner(id, true, Some(reason.to_string())).await
    }

    async fn resolve_inner(&self, id: &str, auto: bool, reason: Option<String>) -> bool {
        let mut findings = self.findings.write().await;
        match findings.get_mut(id) {
            Some(f) if f.is_active() => {
                f.resolved_at = Some(Utc::now());
                f.auto_resolved = auto;
                f.resolve_reason = reason;
            }
            _ => return false,
        }
        self.persist(&findings).await;
        true
    }

    /// Dismiss with a reason; `not_an_issue` also suppresses the
    /// resource+category pair
    pub async fn dismiss(&self, id: &str, reason: DismissReason, note: &str) -> bool {
        let mut findings = self.findings.write().await;
        let Some(f) = findings.get_mut(id) else {
            return false;
        };
        f.dismissed_reason = reason.as_str().to_string();
        if !note.is_empty() {
            f.user_note = Some(note.to_string());
        }
        f.acknowledged_at = Some(Utc::now());
        if reason == DismissReason::NotAnIssue {
            f.suppressed = true;
        }
        self.persist(&findings).await;
        true
    }

    /// Attach a note; an empty note detaches it
    pub async fn set_user_note(&self, id: &str, note: &str) -> bool {
        let mut findings = self.findings.write().await;
        let Some(f) = findings.get_mut(id) else {
            return false;
        };
        f.user_note = (!note.is_empty()).then(|| note.to_string());
        self.persist(&findings).await;
        true
    }

    pub async fn snooze(&self, id: &str, duration: Duration) -> bool {
        let mut findings = self.findings.write().await;
        match findings.get_mut(id) {
            Some(f) if !f.is_resolved() => {
                let span = ChronoDuration::from_std(duration).unwrap_or_else(|_| ChronoDuration::days(365));
                f.snoozed_until = Some(Utc::now() + span);
            }
            _ => return false,
        }
        self.persist(&findings).await;
        true
    }

    pub async fn suppress(&self, id: &str) -> bool {
        let mut findings = self.findings.write().await;
        let Some(f) = findings.get_mut(id) else {
            return false;
        };
        f.suppressed = true;
        f.dismissed_reason = "suppressed".to_string();
        f.acknowledged_at = Some(Utc::now());
        self.persist(&findings).await;
        true
    }

    /// Active findings at or above `min_severity`, most severe first
    pub async fn get_active(&self, min_severity: FindingSeverity) -> Vec<Finding> {
        let mut active: Vec<Finding> = self
            .findings
            .read()
            .await
            .values()
            .filter(|f| f.is_active() && f.severity >= min_severity)
            .cloned()
            .collect();
        active.sort_by(|a, b| {
            b.severity
                .cmp(&a.severity)
                .then_with(|| b.last_seen_at.cmp(&a.last_seen_at))
                .then_with(|| a.id.cmp(&b.id))
        });
        active
    }

    pub async fn get_by_resource(&self, resource_id: &str) -> Vec<Finding> {
        self.findings
            .read()
            .await
            .values()
            .filter(|f| f.resource_id == resource_id)
            .cloned()
            .collect()
    }

    /// Dismissed, snoozed and suppressed findings that are not resolved
    pub async fn get_dismissed(&self) -> Vec<Finding> {
        let mut out: Vec<Finding> = self
            .findings
            .read()
            .await
            .values()
            .filter(|f| !f.is_resolved() && (f.is_dismissed() || f.suppressed || f.is_snoozed()))
            .cloned()
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    pub async fn get_summary(&self) -> FindingsSummary {
        let findings = self.findings.read().await;
        let mut summary = FindingsSummary {
            total: findings.len(),
            ..Default::default()
        };
        for f in findings.values().filter(|f| f.is_active()) {
            match f.severity {
                FindingSeverity::Critical => summary.critical += 1,
                FindingSeverity::Warning => summary.warning += 1,
                FindingSeverity::Watch => summary.watch += 1,
                FindingSeverity::Info => summary.info += 1,
            }
        }
        summary
    }

    /// Drop resolved findings older than `max_age`; returns how many went
    pub async fn cleanup(&self, max_age: Duration) -> usize {
        let cutoff = Utc::now() - ChronoDuration::from_std(max_age).unwrap_or_else(|_| ChronoDuration::days(3650));
        let mut findings = self.findings.write().await;
        let before = findings.len();
        findings.retain(|_, f| f.resolved_at.map(|r| r >= cutoff).unwrap_or(true));
        let removed = before - findings.len();
        if removed > 0 {
            self.persist(&findings).await;
        }
        removed
    }

    /// User feedback on earlier findings, rendered so the model does not
    /// raise them again
    pub async fn get_dismissed_for_context(&self) -> String {
        let findings = self.findings.read().await;
        let horizon = Utc::now() - ChronoDuration::days(DISMISSED_CONTEXT_WINDOW_DAYS);

        let mut ordered: Vec<&Finding> = findings.values().collect();
        ordered.sort_by(|a, b| a.id.cmp(&b.id));

        let (mut suppressed, mut dismissed, mut snoozed) = (Vec::new(), Vec::new(), Vec::new());
        for f in ordered {
            if f.last_seen_at.map(|t| t < horizon).unwrap_or(false) {
                continue;
            }
            let note = f
                .user_note
                .as_deref()
                .map(|n| format!(" - User note: {}", n))
                .unwrap_or_default();
            if f.suppressed {
                suppressed.push(format!("- {} on {}: {}{}", f.title, f.resource_name, f.dismissed_reason, note));
            } else if f.is_dismissed() {
                dismissed.push(format!("- {} on {} ({}){}", f.title, f.resource_name, f.dismissed_reason, note));
            } else if let (true, Some(until)) = (f.is_snoozed(), f.snoozed_until) {
                snoozed.push(format!(
                    "- {} on {} (snoozed until {})",
                    f.title,
                    f.resource_name,
                    until.format("%b %-d")
                ));
            }
        }

        if suppressed.is_empty() && dismissed.is_empty() && snoozed.is_empty() {
            return String::new();
        }

        let mut out = String::from("\n## Previous Findings - User Feedback\n");
        out.push_str("The following findings have been addressed by the user. Do NOT re-raise these unless the situation has significantly worsened:\n\n");
        for (header, lines) in [
            ("### Permanently Suppressed (never re-raise):", &suppressed),
            ("### Dismissed by User:", &dismissed),
            ("### Temporarily Snoozed:", &snoozed),
        ] {
            if lines.is_empty() {
                continue;
            }
            out.push_str(header);
            out.push('\n');
            for line in lines.iter() {
                out.push_str(line);
                out.push('\n');
            }
            out.push('\n');
        }
        out
    }
}

fn is_suppressed(findings: &HashMap<String, Finding>, resource_id: &str, category: FindingCategory) -> bool {
    findings
        .values()
        .any(|f| f.suppressed && f.resource_id == resource_id && f.category == category)
}

async fn write_atomic(path: &Path, findings: &HashMap<String, Finding>) -> Result<()> {
    let data = serde_json::to_vec_pretty(findings)?;
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, &data).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}
