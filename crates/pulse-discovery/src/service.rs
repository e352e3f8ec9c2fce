//! Discovery service
//!
//! Classifies every Docker container in the fleet with the LLM analyzer and
//! records what runs where as infrastructure notes on the host. Results are
//! cached per image so a steady fleet costs no model calls between cache
//! expiries.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pulse_core::config::DiscoverySettings;
use pulse_core::snapshot::{DockerContainer, DockerHost};
use pulse_core::{spawn_guarded, Cancellation, Lifecycle, Result, StateProvider};
use pulse_store::{KnowledgeStore, NoteCategory};
use pulse_tools::sanitize::substitute_container;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::analysis::{build_prompt, parse_response, DiscoveryResult};
use crate::sanitize::{sanitize_text, valid_port, ContainerInfo, MAX_APP_FIELD_LEN};

pub const RUNTIME_DOCKER: &str = "docker";
pub const UNKNOWN_HOST: &str = "unknown-host";
pub const UNKNOWN_CONTAINER: &str = "unknown-container";

/// Sends one classification prompt to a model and returns its raw answer
#[async_trait]
pub trait Analyzer: Send + Sync {
    async fn analyze(&self, prompt: &str) -> Result<String>;
}

#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    pub interval: Duration,
    pub cache_expiry: Duration,
    pub ai_analysis_timeout: Duration,
    pub max_cache_entries: usize,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self::from(&DiscoverySettings::default())
    }
}

impl From<&DiscoverySettings> for DiscoveryConfig {
    fn from(s: &DiscoverySettings) -> Self {
        let defaults = DiscoverySettings::default();
        let positive = |value: Duration, fallback: Duration, name: &str| {
            if value.is_zero() {
                warn!(setting = name, default = ?fallback, "Invalid discovery setting, using default");
                fallback
            } else {
                value
            }
        };
        Self {
            interval: positive(s.interval(), defaults.interval(), "interval"),
            cache_expiry: positive(s.cache_expiry(), defaults.cache_expiry(), "cache_expiry"),
            ai_analysis_timeout: positive(
                s.ai_analysis_timeout(),
                defaults.ai_analysis_timeout(),
                "ai_analysis_timeout",
            ),
            max_cache_entries: s.max_analysis_cache_entries.max(1),
        }
    }
}

/// A classified service instance
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiscoveredApp {
    /// `docker:<hostname>:<container>`
    pub id: String,
    #[serde(rename = "type")]
    pub app_type: String,
    pub name: String,
    pub category: String,
    pub runs_in: String,
    pub host_id: String,
    pub hostname: String,
    pub container_id: String,
    pub container_name: String,
    pub ports: Vec<u16>,
    pub cli_access: String,
    pub confidence: f64,
    pub detected_at: DateTime<Utc>,
    pub ai_reasoning: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct DiscoveryStatus {
    pub running: bool,
    pub last_run: Option<DateTime<Utc>>,
    pub discovery_count: usize,
    pub cache_size: usize,
    /// Seconds
    pub interval: u64,
    pub analyzer_set: bool,
}

struct CacheEntry {
    result: DiscoveryResult,
    cached_at: Instant,
}

#[derive(Default)]
struct Discoveries {
    apps: Vec<DiscoveredApp>,
    last_run: Option<DateTime<Utc>>,
}

struct Workers {
    cancel: Cancellation,
    handles: Vec<JoinHandle<()>>,
}

pub struct DiscoveryService {
    state: Arc<dyn StateProvider>,
    knowledge: Option<Arc<KnowledgeStore>>,
    analyzer: RwLock<Option<Arc<dyn Analyzer>>>,
    config: DiscoveryConfig,
    lifecycle: Lifecycle,
    workers: Mutex<Option<Workers>>,
    /// Serializes scans from the initial run, the ticker and force refresh
    runner: Mutex<()>,
    discoveries: RwLock<Discoveries>,
    cache: RwLock<HashMap<String, CacheEntry>>,
}

impl DiscoveryService {
    pub fn new(
        state: Arc<dyn StateProvider>,
        knowledge: Option<Arc<KnowledgeStore>>,
        config: DiscoveryConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            state,
            knowledge,
            analyzer: RwLock::new(None),
            config,
            lifecycle: Lifecycle::new(),
            workers: Mutex::new(None),
            runner: Mutex::new(()),
            discoveries: RwLock::new(Discoveries::default()),
            cache: RwLock::new(HashMap::new()),
        })
    }

    /// Scans are skipped until an analyzer is set
    pub async fn set_analyzer(&self, analyzer: Option<Arc<dyn Analyzer>>) {
        *self.analyzer.write().await = analyzer;
    }

    // ========================================================================
    // LIFECYCLE
    // ========================================================================

    /// Run one scan now and then every `interval`. Starting twice is a no-op.
    pub async fn start(self: &Arc<Self>) {
        let mut workers = self.workers.lock().await;
        if !self.lifecycle.begin_start() {
            debug!("Discovery service already running");
            return;
        }
        info!(interval = ?self.config.interval, "Starting infrastructure discovery service");

        let cancel = Cancellation::new();
        let initial = {
            let service = Arc::clone(self);
            let cancel = cancel.clone();
            spawn_guarded("discovery-initial", async move {
                service.run_with(&cancel).await;
            })
        };
        let periodic = {
            let service = Arc::clone(self);
            let cancel = cancel.clone();
            spawn_guarded("discovery-loop", async move {
                service.discovery_loop(cancel).await;
            })
        };
        *workers = Some(Workers {
            cancel,
            handles: vec![initial, periodic],
        });
        self.lifecycle.mark_running();
    }

    /// Cancel workers and wait for them. Stopping twice is a no-op.
    pub async fn stop(&self) {
        let Some(workers) = self.workers.lock().await.take() else {
            return;
        };
        self.lifecycle.begin_stop();
        workers.cancel.cancel();
        for handle in workers.handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "Discovery worker join failed");
            }
        }
        self.lifecycle.mark_stopped();
        info!("Infrastructure discovery service stopped");
    }

    pub fn is_running(&self) -> bool {
        self.lifecycle.is_running()
    }

    async fn discovery_loop(&self, cancel: Cancellation) {
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately and the initial worker covers it
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Discovery loop cancelled");
                    return;
                }
                _ = ticker.tick() => {
                    self.run_with(&cancel).await;
                }
            }
        }
    }

    /// Scan in the background under the service's cancellation
    pub async fn force_refresh(self: &Arc<Self>) {
        let cancel = self.current_cancel().await;
        if cancel.is_cancelled() {
            debug!("Discovery stopped, skipping force refresh");
            return;
        }
        let service = Arc::clone(self);
        spawn_guarded("discovery-refresh", async move {
            service.run_with(&cancel).await;
        });
    }

    async fn current_cancel(&self) -> Cancellation {
        match self.workers.lock().await.as_ref() {
            Some(w) => w.cancel.clone(),
            None => Cancellation::new(),
        }
    }

    // ========================================================================
    // SCAN
    // ========================================================================

    /// One full scan. Returns the apps found, or nothing when the scan was
    /// cancelled part way.
    pub async fn run_discovery(&self) -> Vec<DiscoveredApp> {
        let cancel = self.current_cancel().await;
        self.run_with(&cancel).await
    }

    async fn run_with(&self, cancel: &Cancellation) -> Vec<DiscoveredApp> {
        let _guard = self.runner.lock().await;
        if cancel.is_cancelled() {
            return Vec::new();
        }
        let Some(analyzer) = self.analyzer.read().await.clone() else {
            debug!("Discovery analyzer not set, skipping scan");
            return Vec::new();
        };

        let started = Instant::now();
        let snapshot = self.state.snapshot();
        let pairs: Vec<(&DockerContainer, &DockerHost)> = snapshot
            .docker_hosts
            .iter()
            .flat_map(|host| host.containers.iter().map(move |c| (c, host)))
            .collect();

        let mut apps = Vec::new();
        for (container, host) in &pairs {
            if cancel.is_cancelled() {
                debug!("Discovery cancelled mid-scan");
                return Vec::new();
            }
            if let Some(app) = self.analyze_container(analyzer.as_ref(), container, host, cancel).await {
                apps.push(app);
            }
        }
        if cancel.is_cancelled() {
            return Vec::new();
        }

        self.save_notes(&apps).await;
        {
            let mut discoveries = self.discoveries.write().await;
            discoveries.apps = apps.clone();
            discoveries.last_run = Some(Utc::now());
        }
        info!(
            containers = pairs.len(),
            apps = apps.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Infrastructure discovery completed"
        );
        apps
    }

    async fn analyze_container(
        &self,
        analyzer: &dyn Analyzer,
        container: &DockerContainer,
        host: &DockerHost,
        cancel: &Cancellation,
    ) -> Option<DiscoveredApp> {
        let result = match self.cached(&container.image).await {
            Some(result) => {
                debug!(container = %container.name, image = %container.image, "Using cached analysis");
                result
            }
            None => {
                let result = self.analyze(analyzer, container, cancel).await?;
                self.remember(&container.image, result.clone()).await;
                result
            }
        };

        if !result.is_actionable() {
            debug!(
                container = %container.name,
                service_type = %result.service_type,
                confidence = result.confidence,
                "Skipping unknown or low-confidence discovery"
            );
            return None;
        }
        Some(build_app(&result, container, host))
    }

    async fn analyze(
        &self,
        analyzer: &dyn Analyzer,
        container: &DockerContainer,
        cancel: &Cancellation,
    ) -> Option<DiscoveryResult> {
        let info = ContainerInfo::from_container(container);
        let prompt = match build_prompt(&info) {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, container = %container.name, "Failed to build discovery prompt");
                return None;
            }
        };

        let timeout = self.config.ai_analysis_timeout;
        let response = tokio::select! {
            _ = cancel.cancelled() => return None,
            r = tokio::time::timeout(timeout, analyzer.analyze(&prompt)) => r,
        };
        let response = match response {
            Ok(Ok(text)) => text,
            Ok(Err(e)) if e.is_timeout() => {
                warn!(container = %container.name, image = %container.image, ?timeout, "Discovery analysis timed out");
                return None;
            }
            Err(_) => {
                warn!(container = %container.name, image = %container.image, ?timeout, "Discovery analysis timed out");
                return None;
            }
            Ok(Err(e)) => {
                warn!(error = %e, container = %container.name, image = %container.image, "Discovery analysis failed");
                return None;
            }
        };

        let parsed = parse_response(&response);
        if parsed.is_none() {
            warn!(container = %container.name, image = %container.image, "Failed to parse discovery response");
        }
        parsed
    }

    async fn cached(&self, image: &str) -> Option<DiscoveryResult> {
        let cache = self.cache.read().await;
        cache
            .get(image)
            .filter(|e| e.cached_at.elapsed() < self.config.cache_expiry)
            .map(|e| e.result.clone())
    }

    async fn remember(&self, image: &str, result: DiscoveryResult) {
        let mut cache = self.cache.write().await;
        if !cache.contains_key(image) && cache.len() >= self.config.max_cache_entries {
            warn!(
                entries = cache.len(),
                limit = self.config.max_cache_entries,
                "Discovery analysis cache full, clearing"
            );
            cache.clear();
        }
        cache.insert(
            image.to_string(),
            CacheEntry {
                result,
                cached_at: Instant::now(),
            },
        );
    }

    async fn save_notes(&self, apps: &[DiscoveredApp]) {
        let Some(store) = &self.knowledge else {
            return;
        };
        for app in apps {
            let title = format!("{} ({})", app.name, app.runs_in);
            let access = if app.cli_access.is_empty() {
                "No CLI access available.".to_string()
            } else {
                format!("CLI access: {}", app.cli_access)
            };
            let content = format!(
                "Detected {} running in {} on {}. {}",
                app.name, app.runs_in, app.hostname, access
            );
            if let Err(e) = store
                .save_note(&app.host_id, &app.hostname, "host", NoteCategory::Infrastructure, &title, &content)
                .await
            {
                warn!(error = %e, app_id = %app.id, host = %app.hostname, "Failed to save discovery note");
            }
        }
    }

    // ========================================================================
    // ACCESSORS
    // ========================================================================

    pub async fn get_discoveries(&self) -> Vec<DiscoveredApp> {
        self.discoveries.read().await.apps.clone()
    }

    pub async fn last_run(&self) -> Option<DateTime<Utc>> {
        self.discoveries.read().await.last_run
    }

    /// Forget every cached classification
    pub async fn clear_cache(&self) {
        self.cache.write().await.clear();
    }

    pub async fn cache_size(&self) -> usize {
        self.cache.read().await.len()
    }

    pub async fn status(&self) -> DiscoveryStatus {
        let (discovery_count, last_run) = {
            let d = self.discoveries.read().await;
            (d.apps.len(), d.last_run)
        };
        DiscoveryStatus {
            running: self.is_running(),
            last_run,
            discovery_count,
            cache_size: self.cache_size().await,
            interval: self.config.interval.as_secs(),
            analyzer_set: self.analyzer.read().await.is_some(),
        }
    }
}

fn build_app(result: &DiscoveryResult, container: &DockerContainer, host: &DockerHost) -> DiscoveredApp {
    let field = |s: &str| sanitize_text(s, MAX_APP_FIELD_LEN);
    let or = |s: String, fallback: &str| if s.is_empty() { fallback.to_string() } else { s };

    let hostname = or(field(&host.hostname), UNKNOWN_HOST);
    let container_name = or(field(&container.name), UNKNOWN_CONTAINER);
    let host_id = [&host.agent_id, &host.id]
        .into_iter()
        .map(|s| field(s))
        .find(|s| !s.is_empty())
        .unwrap_or_else(|| hostname.clone());

    let cli_access = if result.cli_command.is_empty() {
        String::new()
    } else {
        substitute_container(&result.cli_command, &field(&container.name))
    };

    let ports = container
        .ports
        .iter()
        .filter_map(|p| valid_port(p.public_port).or_else(|| valid_port(p.private_port)))
        .collect();

    DiscoveredApp {
        id: format!("{}:{}:{}", RUNTIME_DOCKER, hostname, container_name),
        app_type: result.service_type.clone(),
        name: result.service_name.clone(),
        category: result.category.clone(),
        runs_in: RUNTIME_DOCKER.to_string(),
        host_id,
        hostname,
        container_id: field(&container.id),
        container_name,
        ports,
        cli_access,
        confidence: result.confidence,
        detected_at: Utc::now(),
        ai_reasoning: result.reasoning.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pulse_core::snapshot::ContainerPort;

    fn result(cli: &str) -> DiscoveryResult {
        DiscoveryResult {
            service_type: "postgres".into(),
            service_name: "PostgreSQL".into(),
            category: "database".into(),
            cli_command: cli.into(),
            confidence: 0.9,
            reasoning: String::new(),
        }
    }

    #[test]
    fn test_build_app_fallbacks() {
        let app = build_app(&result(""), &DockerContainer::default(), &DockerHost::default());
        assert_eq!(app.id, "docker:unknown-host:unknown-container");
        assert_eq!(app.host_id, "unknown-host");
        assert_eq!(app.cli_access, "");
    }

    #[test]
    fn test_build_app_quotes_name_and_picks_ports() {
        let container = DockerContainer {
            name: "my db".into(),
            ports: vec![
                ContainerPort { private_port: 5432, public_port: 15432, protocol: "tcp".into() },
                ContainerPort { private_port: 8080, public_port: 0, protocol: "tcp".into() },
            ],
            ..Default::default()
        };
        let host = DockerHost {
            agent_id: "agent-1".into(),
            hostname: "dock1".into(),
            ..Default::default()
        };
        let app = build_app(&result("docker exec {container} psql -U postgres"), &container, &host);
        assert_eq!(app.cli_access, "docker exec 'my db' psql -U postgres");
        assert_eq!(app.ports, vec![15432, 8080]);
        assert_eq!(app.host_id, "agent-1");
        assert_eq!(app.id, "docker:dock1:my db");
    }

    #[test]
    fn test_config_replaces_zero_durations() {
        let settings = DiscoverySettings {
            interval_secs: 0,
            ai_analysis_timeout_ms: 0,
            ..Default::default()
        };
        let cfg = DiscoveryConfig::from(&settings);
        assert_eq!(cfg.interval, Duration::from_secs(300));
        assert_eq!(cfg.ai_analysis_timeout, Duration::from_secs(45));
    }
}
