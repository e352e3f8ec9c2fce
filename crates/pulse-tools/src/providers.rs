//! Collaborator interfaces injected into the executor
//!
//! Every provider is optional. Tool handlers check for presence and answer
//! with a "not available" text when one is missing.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pulse_core::snapshot::{Alert, CephCluster, PbsBackup, PbsInstance, PveBackups, Storage};
use pulse_core::Result;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::time::Duration;

// ============================================================================
// COMMAND EXECUTION
// ============================================================================

/// Verdict of the command policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyDecision {
    Allow,
    Deny,
    RequireApproval,
}

/// Command security policy
pub trait CommandPolicy: Send + Sync {
    fn evaluate(&self, command: &str) -> PolicyDecision;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectedAgent {
    pub agent_id: String,
    pub hostname: String,
    #[serde(default)]
    pub version: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CommandRequest {
    pub request_id: String,
    pub command: String,
    /// `host`, `container` or `vm`
    pub target_type: String,
    pub target_id: String,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CommandResult {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    #[serde(default)]
    pub error: String,
}

/// Transport that runs commands on connected host agents
#[async_trait]
pub trait AgentTransport: Send + Sync {
    fn connected_agents(&self) -> Vec<ConnectedAgent>;

    async fn execute_command(&self, agent_id: &str, request: CommandRequest) -> Result<CommandResult>;
}

// ============================================================================
// PATROL CONTEXT
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricPoint {
    pub timestamp: Option<DateTime<Utc>>,
    pub cpu: f64,
    pub memory: f64,
    #[serde(default)]
    pub disk: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricsSummary {
    pub resource_id: String,
    pub resource_name: String,
    pub resource_type: String,
    pub avg_cpu: f64,
    pub max_cpu: f64,
    pub avg_memory: f64,
    pub max_memory: f64,
    #[serde(default)]
    pub avg_disk: f64,
    #[serde(default)]
    pub max_disk: f64,
    /// `stable`, `growing` or `declining`
    pub trend: String,
}

pub trait MetricsHistoryProvider: Send + Sync {
    fn resource_metrics(&self, resource_id: &str, period: Duration) -> Result<Vec<MetricPoint>>;
    fn all_metrics_summary(&self, period: Duration) -> Result<HashMap<String, MetricsSummary>>;
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct MetricBaseline {
    pub mean: f64,
    pub std_dev: f64,
    pub min: f64,
    pub max: f64,
}

impl MetricBaseline {
    /// Standard deviations `value` sits from the mean
    pub fn z_score(&self, value: f64) -> f64 {
        if self.std_dev <= f64::EPSILON {
            return 0.0;
        }
        (value - self.mean) / self.std_dev
    }
}

pub trait BaselineProvider: Send + Sync {
    fn baseline(&self, resource_id: &str, metric: &str) -> Option<MetricBaseline>;
    /// resource id -> metric -> baseline
    fn all_baselines(&self) -> HashMap<String, HashMap<String, MetricBaseline>>;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Pattern {
    pub resource_id: String,
    pub resource_name: String,
    pub pattern_type: String,
    pub description: String,
    pub confidence: f64,
    pub last_seen: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Prediction {
    pub resource_id: String,
    pub resource_name: String,
    pub issue_type: String,
    pub predicted_time: Option<DateTime<Utc>>,
    pub confidence: f64,
    pub recommendation: String,
}

pub trait PatternProvider: Send + Sync {
    fn patterns(&self) -> Vec<Pattern>;
    fn predictions(&self) -> Vec<Prediction>;
}

pub trait AlertProvider: Send + Sync {
    fn active_alerts(&self) -> Vec<Alert>;
}

/// Read side of the findings store
#[async_trait]
pub trait FindingsProvider: Send + Sync {
    async fn active_findings(&self) -> Vec<pulse_store::Finding>;
    async fn dismissed_findings(&self) -> Vec<pulse_store::Finding>;
}

/// Write side used by the user-facing resolve/dismiss tools
#[async_trait]
pub trait FindingsManager: Send + Sync {
    async fn resolve_finding(&self, finding_id: &str, note: &str) -> Result<()>;
    async fn dismiss_finding(&self, finding_id: &str, reason: &str, note: &str) -> Result<()>;
}

// ============================================================================
// INFRASTRUCTURE CONTEXT
// ============================================================================

pub trait BackupProvider: Send + Sync {
    fn backups(&self) -> PveBackups;
    fn pbs_backups(&self) -> Vec<PbsBackup>;
    fn pbs_instances(&self) -> Vec<PbsInstance>;
}

pub trait StorageProvider: Send + Sync {
    fn storage(&self) -> Vec<Storage>;
    fn ceph_clusters(&self) -> Vec<CephCluster>;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiskHealth {
    pub host: String,
    pub device: String,
    pub model: String,
    #[serde(default)]
    pub serial: String,
    /// SMART verdict, `PASSED` or `FAILED`
    pub health: String,
    #[serde(default)]
    pub temperature: Option<f64>,
    /// Percent of rated endurance used (SSD)
    #[serde(default)]
    pub wearout: Option<f64>,
}

impl DiskHealth {
    pub fn is_failing(&self) -> bool {
        let h = self.health.to_uppercase();
        !h.is_empty() && h != "PASSED" && h != "OK"
    }
}

pub trait DiskHealthProvider: Send + Sync {
    fn disk_health(&self) -> Vec<DiskHealth>;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContainerUpdate {
    pub host_id: String,
    pub host_name: String,
    pub container_id: String,
    pub container_name: String,
    pub image: String,
    #[serde(default)]
    pub current_digest: String,
    #[serde(default)]
    pub latest_digest: String,
    pub last_checked: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait UpdatesProvider: Send + Sync {
    fn pending_updates(&self, host_id: Option<&str>) -> Vec<ContainerUpdate>;
    /// Ask the host agent to refresh its update check; returns a command id
    async fn trigger_update_check(&self, host_id: &str) -> Result<String>;
    async fn update_container(&self, host_id: &str, container_id: &str) -> Result<String>;
}

#[async_trait]
pub trait MetadataUpdater: Send + Sync {
    async fn set_resource_url(&self, resource_type: &str, resource_id: &str, url: &str) -> Result<()>;
}

// ============================================================================
// AGENT PROFILES
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentScope {
    pub agent_id: String,
    pub profile_id: String,
    pub profile_name: String,
    pub profile_version: u32,
    pub settings: Map<String, Value>,
}

#[derive(Debug, Clone, Default)]
pub struct AppliedScope {
    pub profile_id: String,
    pub profile_name: String,
    pub created: bool,
}

#[async_trait]
pub trait AgentProfileManager: Send + Sync {
    async fn apply_agent_scope(
        &self,
        agent_id: &str,
        agent_label: &str,
        settings: Map<String, Value>,
    ) -> Result<AppliedScope>;

    /// Returns the assigned profile's name
    async fn assign_profile(&self, agent_id: &str, profile_id: &str) -> Result<String>;

    async fn agent_scope(&self, agent_id: &str) -> Result<Option<AgentScope>>;
}

// ============================================================================
// PATROL FINDINGS
// ============================================================================

/// Arguments of `patrol_report_finding`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PatrolFindingInput {
    pub key: String,
    pub severity: String,
    pub category: String,
    pub resource_id: String,
    pub resource_name: String,
    pub resource_type: String,
    pub title: String,
    pub description: String,
    pub recommendation: String,
    pub evidence: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PatrolFindingInfo {
    pub id: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub key: String,
    pub severity: String,
    pub category: String,
    pub resource_id: String,
    pub resource_name: String,
    pub resource_type: String,
    pub title: String,
    pub description: String,
    pub detected_at: String,
}

impl From<&pulse_store::Finding> for PatrolFindingInfo {
    fn from(f: &pulse_store::Finding) -> Self {
        Self {
            id: f.id.clone(),
            key: f.key.clone(),
            severity: f.severity.to_string(),
            category: f.category.to_string(),
            resource_id: f.resource_id.clone(),
            resource_name: f.resource_name.clone(),
            resource_type: f.resource_type.clone(),
            title: f.title.clone(),
            description: f.description.clone(),
            detected_at: f.detected_at.map(|t| t.to_rfc3339()).unwrap_or_default(),
        }
    }
}

/// Outcome of a reported finding
#[derive(Debug, Clone)]
pub struct CreatedFinding {
    pub id: String,
    pub is_new: bool,
}

/// Wired for the duration of a patrol run so the model can record findings
#[async_trait]
pub trait PatrolFindingCreator: Send + Sync {
    async fn create_finding(&self, input: PatrolFindingInput) -> Result<CreatedFinding>;
    async fn resolve_finding(&self, finding_id: &str, reason: &str) -> Result<()>;
    async fn active_findings(&self, resource_id: &str, min_severity: &str) -> Vec<PatrolFindingInfo>;
}
