//! Tool executor
//!
//! Owns the tool registry plus the bag of optional collaborators the tools
//! read from. Providers can be swapped at runtime; accessors copy the `Arc`s
//! out of the lock so no lock is held while a tool runs.

use pulse_core::{ControlLevel, Result, StateProvider, StateSnapshot};
use pulse_store::KnowledgeStore;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::debug;

use crate::approval::ApprovalStore;
use crate::providers::*;
use crate::registry::ToolRegistry;
use crate::tool::{ToolDefinition, ToolResult};
use crate::tools;

/// Optional collaborators. Cloning copies the handles, not the providers.
#[derive(Clone, Default)]
pub struct Providers {
    pub state: Option<Arc<dyn StateProvider>>,
    pub policy: Option<Arc<dyn CommandPolicy>>,
    pub agents: Option<Arc<dyn AgentTransport>>,
    pub metrics_history: Option<Arc<dyn MetricsHistoryProvider>>,
    pub baselines: Option<Arc<dyn BaselineProvider>>,
    pub patterns: Option<Arc<dyn PatternProvider>>,
    pub alerts: Option<Arc<dyn AlertProvider>>,
    pub findings: Option<Arc<dyn FindingsProvider>>,
    pub findings_manager: Option<Arc<dyn FindingsManager>>,
    pub backups: Option<Arc<dyn BackupProvider>>,
    pub storage: Option<Arc<dyn StorageProvider>>,
    pub disk_health: Option<Arc<dyn DiskHealthProvider>>,
    pub updates: Option<Arc<dyn UpdatesProvider>>,
    pub metadata: Option<Arc<dyn MetadataUpdater>>,
    pub agent_profiles: Option<Arc<dyn AgentProfileManager>>,
    pub knowledge: Option<Arc<KnowledgeStore>>,
    pub patrol_findings: Option<Arc<dyn PatrolFindingCreator>>,
}

/// Target of the current conversation, if it was opened on a resource
#[derive(Debug, Clone, Default)]
pub struct ExecutionContext {
    pub target_type: String,
    pub target_id: String,
    /// Auto-fix runs skip the approval step at `controlled`
    pub autonomous: bool,
}

#[derive(Debug, Clone, Default)]
struct ControlSettings {
    level: ControlLevel,
    protected_guests: Vec<String>,
}

pub struct ToolExecutor {
    providers: RwLock<Providers>,
    control: RwLock<ControlSettings>,
    context: RwLock<ExecutionContext>,
    approvals: Arc<ApprovalStore>,
    registry: ToolRegistry,
    pub(crate) http: reqwest::Client,
}

macro_rules! provider_setters {
    ($($setter:ident => $field:ident : $ty:ty),* $(,)?) => {
        $(
            pub async fn $setter(&self, provider: Option<$ty>) {
                self.providers.write().await.$field = provider;
            }
        )*
    };
}

impl ToolExecutor {
    pub fn new(providers: Providers) -> Self {
        let mut registry = ToolRegistry::new();
        tools::register_all(&mut registry);
        debug!(tools = registry.len(), "Tool registry built");

        Self {
            providers: RwLock::new(providers),
            control: RwLock::new(ControlSettings::default()),
            context: RwLock::new(ExecutionContext::default()),
            approvals: Arc::new(ApprovalStore::new()),
            registry,
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .unwrap_or_default(),
        }
    }

    provider_setters! {
        set_state_provider => state: Arc<dyn StateProvider>,
        set_policy => policy: Arc<dyn CommandPolicy>,
        set_agent_transport => agents: Arc<dyn AgentTransport>,
        set_metrics_history => metrics_history: Arc<dyn MetricsHistoryProvider>,
        set_baseline_provider => baselines: Arc<dyn BaselineProvider>,
        set_pattern_provider => patterns: Arc<dyn PatternProvider>,
        set_alert_provider => alerts: Arc<dyn AlertProvider>,
        set_findings_provider => findings: Arc<dyn FindingsProvider>,
        set_findings_manager => findings_manager: Arc<dyn FindingsManager>,
        set_backup_provider => backups: Arc<dyn BackupProvider>,
        set_storage_provider => storage: Arc<dyn StorageProvider>,
        set_disk_health_provider => disk_health: Arc<dyn DiskHealthProvider>,
        set_updates_provider => updates: Arc<dyn UpdatesProvider>,
        set_metadata_updater => metadata: Arc<dyn MetadataUpdater>,
        set_agent_profile_manager => agent_profiles: Arc<dyn AgentProfileManager>,
        set_knowledge_store => knowledge: Arc<KnowledgeStore>,
        set_patrol_finding_creator => patrol_findings: Arc<dyn PatrolFindingCreator>,
    }

    /// Snapshot of the wired providers
    pub async fn providers(&self) -> Providers {
        self.providers.read().await.clone()
    }

    pub async fn set_control_level(&self, level: ControlLevel) {
        self.control.write().await.level = level;
    }

    pub async fn control_level(&self) -> ControlLevel {
        self.control.read().await.level
    }

    pub async fn set_protected_guests(&self, guests: Vec<String>) {
        self.control.write().await.protected_guests = guests;
    }

    pub async fn protected_guests(&self) -> Vec<String> {
        self.control.read().await.protected_guests.clone()
    }

    pub async fn set_context(&self, context: ExecutionContext) {
        *self.context.write().await = context;
    }

    pub async fn context(&self) -> ExecutionContext {
        self.context.read().await.clone()
    }

    pub fn approvals(&self) -> Arc<ApprovalStore> {
        self.approvals.clone()
    }

    /// Level used when deciding how a mutating tool acts
    pub(crate) async fn effective_level(&self) -> ControlLevel {
        let level = self.control_level().await;
        if level == ControlLevel::Controlled && self.context.read().await.autonomous {
            return ControlLevel::Autonomous;
        }
        level
    }

    /// Current fleet snapshot, empty when no state provider is wired
    pub(crate) async fn snapshot(&self) -> Option<StateSnapshot> {
        let provider = self.providers.read().await.state.clone()?;
        Some(provider.snapshot())
    }

    pub async fn list_tools(&self) -> Vec<ToolDefinition> {
        self.registry.list(self.control_level().await)
    }

    /// Whether a tool with this name is registered, ignoring control level
    pub fn has_tool(&self, name: &str) -> bool {
        self.registry.get(name).is_some()
    }

    pub async fn execute_tool(&self, name: &str, args: Value) -> Result<ToolResult> {
        let level = self.control_level().await;
        self.registry.execute(self, level, name, args).await
    }
}
