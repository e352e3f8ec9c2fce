//! Sidecar supervisor
//!
//! Runs the OpenCode runtime as a child process on a loopback port. Start
//! writes `opencode.json` (MCP server entry, model, provider mapping), passes
//! API keys through the environment and waits for the health endpoint. A
//! health loop restarts the child when it goes from healthy to unhealthy.

use async_trait::async_trait;
use pulse_core::config::SidecarSettings;
use pulse_core::{spawn_guarded, Cancellation, Lifecycle};
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::client::OpenCodeClient;
use crate::error::{LlmError, Result};
use crate::model::{opencode_provider, ModelRef};

pub const CONFIG_FILE: &str = "opencode.json";
pub const MCP_SERVER_NAME: &str = "pulse";

// ============================================================================
// CONFIGURATION
// ============================================================================

#[derive(Clone)]
pub struct SidecarConfig {
    pub binary: String,
    pub data_dir: PathBuf,
    pub mcp_url: String,
    /// 0 picks a free loopback port on every start
    pub port: u16,
    pub model: String,
    pub anthropic_api_key: String,
    pub openai_api_key: String,
    pub deepseek_api_key: String,
    pub gemini_api_key: String,
    pub startup_timeout: Duration,
    pub startup_poll: Duration,
    pub health_interval: Duration,
    pub health_timeout: Duration,
    pub stop_grace: Duration,
}

impl Default for SidecarConfig {
    fn default() -> Self {
        Self {
            binary: "opencode".to_string(),
            data_dir: PathBuf::from("/var/lib/pulse/opencode"),
            mcp_url: String::new(),
            port: 0,
            model: String::new(),
            anthropic_api_key: String::new(),
            openai_api_key: String::new(),
            deepseek_api_key: String::new(),
            gemini_api_key: String::new(),
            startup_timeout: Duration::from_secs(30),
            startup_poll: Duration::from_millis(500),
            health_interval: Duration::from_secs(30),
            health_timeout: Duration::from_secs(5),
            stop_grace: Duration::from_secs(5),
        }
    }
}

impl SidecarConfig {
    /// Build from settings; `default_data_dir` applies when none is configured
    pub fn from_settings(settings: &SidecarSettings, default_data_dir: &Path) -> Self {
        Self {
            binary: settings.binary.clone(),
            data_dir: settings
                .data_dir
                .clone()
                .unwrap_or_else(|| default_data_dir.to_path_buf()),
            mcp_url: settings.mcp_url.clone(),
            port: settings.port,
            model: settings.model.clone(),
            anthropic_api_key: settings.anthropic_api_key.clone(),
            openai_api_key: settings.openai_api_key.clone(),
            deepseek_api_key: settings.deepseek_api_key.clone(),
            gemini_api_key: settings.gemini_api_key.clone(),
            ..Default::default()
        }
    }

    /// `(provider, key, env vars)` for each configured key. Gemini keys are
    /// also exported under the names the Google SDK looks for.
    fn keyed_providers(&self) -> Vec<(&'static str, &str, &'static [&'static str])> {
        let all: [(&'static str, &str, &'static [&'static str]); 4] = [
            ("anthropic", self.anthropic_api_key.as_str(), &["ANTHROPIC_API_KEY"]),
            ("openai", self.openai_api_key.as_str(), &["OPENAI_API_KEY"]),
            ("deepseek", self.deepseek_api_key.as_str(), &["DEEPSEEK_API_KEY"]),
            (
                "gemini",
                self.gemini_api_key.as_str(),
                &["GEMINI_API_KEY", "GOOGLE_GENERATIVE_AI_API_KEY", "GOOGLE_API_KEY"],
            ),
        ];
        all.into_iter().filter(|(_, key, _)| !key.is_empty()).collect()
    }

    /// Contents of `opencode.json`
    pub fn runtime_config(&self) -> Value {
        let mut doc = json!({
            "$schema": "https://opencode.ai/config.json",
            "mcp": {
                MCP_SERVER_NAME: {
                    "type": "remote",
                    "url": self.mcp_url,
                    "enabled": true,
                }
            },
        });
        if let Some(model) = ModelRef::parse(&self.model) {
            doc["model"] = json!(model.to_string());
        }

        let mut providers = Map::new();
        for (provider, _, env) in self.keyed_providers() {
            providers.insert(
                opencode_provider(provider).to_string(),
                json!({"options": {"apiKey": format!("{{env:{}}}", env[0])}}),
            );
        }
        if !providers.is_empty() {
            doc["provider"] = Value::Object(providers);
        }
        doc
    }

    fn launch_spec(&self, port: u16, config_path: PathBuf) -> LaunchSpec {
        let mut env = vec![(
            "OPENCODE_CONFIG".to_string(),
            config_path.to_string_lossy().into_owned(),
        )];
        for (_, key, vars) in self.keyed_providers() {
            for var in vars {
                env.push((var.to_string(), key.to_string()));
            }
        }
        LaunchSpec {
            program: self.binary.clone(),
            args: vec![
                "serve".to_string(),
                "--port".to_string(),
                port.to_string(),
                "--hostname".to_string(),
                "127.0.0.1".to_string(),
            ],
            env,
            cwd: self.data_dir.clone(),
            port,
        }
    }
}

// ============================================================================
// PROCESS LAUNCHING
// ============================================================================

#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub cwd: PathBuf,
    pub port: u16,
}

/// A running child
#[async_trait]
pub trait ChildProcess: Send + Sync {
    fn pid(&self) -> Option<u32>;

    /// Ask the child to exit, killing it after `grace`
    async fn shutdown(&mut self, grace: Duration) -> Result<()>;
}

#[async_trait]
pub trait Launcher: Send + Sync {
    async fn launch(&self, spec: &LaunchSpec) -> Result<Box<dyn ChildProcess>>;
}

/// Spawns real OS processes
#[derive(Debug, Default)]
pub struct ProcessLauncher;

#[async_trait]
impl Launcher for ProcessLauncher {
    async fn launch(&self, spec: &LaunchSpec) -> Result<Box<dyn ChildProcess>> {
        let mut cmd = tokio::process::Command::new(&spec.program);
        cmd.args(&spec.args)
            .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .current_dir(&spec.cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| LlmError::sidecar(format!("failed to spawn {}: {}", spec.program, e)))?;

        if let Some(stdout) = child.stdout.take() {
            forward_output("stdout", stdout);
        }
        if let Some(stderr) = child.stderr.take() {
            forward_output("stderr", stderr);
        }
        info!(pid = ?child.id(), port = spec.port, "OpenCode sidecar spawned");
        Ok(Box::new(OsChild { child }))
    }
}

fn forward_output<R>(stream: &'static str, reader: R)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    spawn_guarded("sidecar-output", async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            debug!(target: "opencode", stream, "{}", line);
        }
    });
}

struct OsChild {
    child: tokio::process::Child,
}

#[async_trait]
impl ChildProcess for OsChild {
    fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    async fn shutdown(&mut self, grace: Duration) -> Result<()> {
        let Some(pid) = self.child.id() else {
            // Already reaped
            return Ok(());
        };
        // SAFETY: plain signal delivery to a pid we own
        let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
        if rc != 0 {
            warn!(pid, "SIGTERM to sidecar failed");
        }

        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(status) => {
                debug!(pid, status = ?status.ok(), "Sidecar exited");
                Ok(())
            }
            Err(_) => {
                warn!(pid, "Sidecar ignored SIGTERM, killing");
                self.child.kill().await?;
                Ok(())
            }
        }
    }
}

// ============================================================================
// SUPERVISOR
// ============================================================================

#[derive(Debug, Clone, Default, Serialize)]
pub struct SidecarStatus {
    pub running: bool,
    pub port: u16,
    pub url: String,
    pub model: String,
    pub healthy: bool,
    pub restarts: u32,
}

struct Running {
    port: u16,
    child: Box<dyn ChildProcess>,
    cancel: Cancellation,
    health: JoinHandle<()>,
}

pub struct Sidecar {
    config: RwLock<SidecarConfig>,
    launcher: Arc<dyn Launcher>,
    lifecycle: Lifecycle,
    running: Mutex<Option<Running>>,
    healthy: AtomicBool,
    restarts: AtomicU32,
}

impl Sidecar {
    pub fn new(config: SidecarConfig) -> Arc<Self> {
        Self::with_launcher(config, Arc::new(ProcessLauncher))
    }

    pub fn with_launcher(config: SidecarConfig, launcher: Arc<dyn Launcher>) -> Arc<Self> {
        Arc::new(Self {
            config: RwLock::new(config),
            launcher,
            lifecycle: Lifecycle::new(),
            running: Mutex::new(None),
            healthy: AtomicBool::new(false),
            restarts: AtomicU32::new(0),
        })
    }

    pub async fn config(&self) -> SidecarConfig {
        self.config.read().await.clone()
    }

    /// Launch the child and wait for it to become healthy. Starting a
    /// running sidecar is a no-op.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            debug!("Sidecar already running");
            return Ok(());
        }
        if !self.lifecycle.begin_start() {
            return Err(LlmError::sidecar(format!("sidecar is {}", self.lifecycle.state())));
        }

        let config = self.config().await;
        match self.launch(&config).await {
            Ok((port, child)) => {
                let cancel = Cancellation::new();
                let health = spawn_guarded(
                    "sidecar-health",
                    health_loop(Arc::downgrade(self), cancel.clone(), config.health_interval),
                );
                *running = Some(Running {
                    port,
                    child,
                    cancel,
                    health,
                });
                self.healthy.store(true, Ordering::SeqCst);
                self.lifecycle.mark_running();
                info!(port, model = %config.model, "OpenCode sidecar started");
                Ok(())
            }
            Err(e) => {
                self.lifecycle.mark_failed();
                error!(error = %e, "OpenCode sidecar failed to start");
                Err(e)
            }
        }
    }

    /// Write the runtime config, spawn and wait for health
    async fn launch(&self, config: &SidecarConfig) -> Result<(u16, Box<dyn ChildProcess>)> {
        let port = match config.port {
            0 => free_port().await?,
            p => p,
        };
        let config_path = write_runtime_config(config).await?;
        let spec = config.launch_spec(port, config_path);

        let mut child = self.launcher.launch(&spec).await?;
        if let Err(e) = wait_healthy(port, config).await {
            if let Err(stop_err) = child.shutdown(config.stop_grace).await {
                warn!(error = %stop_err, "Failed to stop unhealthy sidecar");
            }
            return Err(e);
        }
        Ok((port, child))
    }

    /// Stop the health loop and the child. Stopping twice is a no-op.
    pub async fn stop(&self) {
        let Some(mut running) = self.running.lock().await.take() else {
            return;
        };
        self.lifecycle.begin_stop();
        running.cancel.cancel();
        if let Err(e) = running.health.await {
            error!(error = %e, "Sidecar health loop join failed");
        }
        let grace = self.config.read().await.stop_grace;
        if let Err(e) = running.child.shutdown(grace).await {
            warn!(error = %e, "Sidecar shutdown failed");
        }
        self.healthy.store(false, Ordering::SeqCst);
        self.lifecycle.mark_stopped();
        info!(port = running.port, "OpenCode sidecar stopped");
    }

    /// Apply new settings (model, keys, MCP url) and cycle the child
    pub async fn restart(self: &Arc<Self>, config: SidecarConfig) -> Result<()> {
        *self.config.write().await = config;
        self.stop().await;
        self.start().await
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    pub async fn port(&self) -> Option<u16> {
        self.running.lock().await.as_ref().map(|r| r.port)
    }

    pub async fn url(&self) -> Option<String> {
        self.port().await.map(|p| format!("http://127.0.0.1:{}", p))
    }

    /// Client for the running runtime
    pub async fn client(&self) -> Result<OpenCodeClient> {
        let url = self
            .url()
            .await
            .ok_or_else(|| LlmError::sidecar("sidecar is not running"))?;
        OpenCodeClient::new(url)
    }

    pub async fn status(&self) -> SidecarStatus {
        let port = self.port().await;
        SidecarStatus {
            running: port.is_some(),
            port: port.unwrap_or(0),
            url: port.map(|p| format!("http://127.0.0.1:{}", p)).unwrap_or_default(),
            model: self.config.read().await.model.clone(),
            healthy: self.healthy.load(Ordering::SeqCst),
            restarts: self.restarts.load(Ordering::SeqCst),
        }
    }

    /// Replace the child after a failed health check, keeping the port
    async fn restart_child(&self) {
        let mut guard = self.running.lock().await;
        let Some(running) = guard.as_mut() else {
            return;
        };
        let mut config = self.config().await;
        config.port = running.port;

        if let Err(e) = running.child.shutdown(config.stop_grace).await {
            warn!(error = %e, "Failed to stop unhealthy sidecar");
        }
        match self.launch(&config).await {
            Ok((_, child)) => {
                running.child = child;
                self.healthy.store(true, Ordering::SeqCst);
                self.restarts.fetch_add(1, Ordering::SeqCst);
                info!(port = running.port, "OpenCode sidecar restarted");
            }
            Err(e) => error!(error = %e, "OpenCode sidecar restart failed"),
        }
    }
}

async fn health_loop(sidecar: Weak<Sidecar>, cancel: Cancellation, interval: Duration) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(interval) => {}
        }
        let Some(sidecar) = sidecar.upgrade() else {
            return;
        };
        let Some(port) = sidecar.port().await else {
            return;
        };
        let config = sidecar.config().await;

        let ok = check_health(port, config.health_timeout).await;
        let was_healthy = sidecar.healthy.swap(ok, Ordering::SeqCst);
        if was_healthy && !ok && !cancel.is_cancelled() {
            warn!(port, "OpenCode sidecar became unhealthy, restarting");
            sidecar.restart_child().await;
        }
    }
}

async fn check_health(port: u16, timeout: Duration) -> bool {
    let Ok(client) = OpenCodeClient::new(format!("http://127.0.0.1:{}", port)) else {
        return false;
    };
    matches!(tokio::time::timeout(timeout, client.health()).await, Ok(Ok(())))
}

async fn wait_healthy(port: u16, config: &SidecarConfig) -> Result<()> {
    let deadline = tokio::time::Instant::now() + config.startup_timeout;
    loop {
        if check_health(port, config.health_timeout).await {
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(LlmError::Timeout(format!(
                "sidecar did not become healthy within {:?}",
                config.startup_timeout
            )));
        }
        tokio::time::sleep(config.startup_poll).await;
    }
}

async fn free_port() -> Result<u16> {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    Ok(listener.local_addr()?.port())
}

async fn write_runtime_config(config: &SidecarConfig) -> Result<PathBuf> {
    tokio::fs::create_dir_all(&config.data_dir).await?;
    let path = config.data_dir.join(CONFIG_FILE);
    let body = serde_json::to_vec_pretty(&config.runtime_config())?;
    tokio::fs::write(&path, body).await?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> SidecarConfig {
        SidecarConfig {
            mcp_url: "http://127.0.0.1:9000/".into(),
            model: "gemini:gemini-2.5-flash".into(),
            gemini_api_key: "g-key".into(),
            anthropic_api_key: "a-key".into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_runtime_config_document() {
        let doc = config().runtime_config();
        assert_eq!(doc["mcp"]["pulse"]["type"], "remote");
        assert_eq!(doc["mcp"]["pulse"]["url"], "http://127.0.0.1:9000/");
        assert_eq!(doc["model"], "google/gemini-2.5-flash");
        assert_eq!(doc["provider"]["google"]["options"]["apiKey"], "{env:GEMINI_API_KEY}");
        assert!(doc["provider"].get("anthropic").is_some());
        assert!(doc["provider"].get("openai").is_none());
        // Keys never land in the file
        assert!(!doc.to_string().contains("g-key"));
    }

    #[test]
    fn test_launch_spec_env() {
        let spec = config().launch_spec(4100, PathBuf::from("/tmp/x/opencode.json"));
        assert_eq!(spec.args, vec!["serve", "--port", "4100", "--hostname", "127.0.0.1"]);
        let env: std::collections::HashMap<_, _> = spec.env.into_iter().collect();
        assert_eq!(env["OPENCODE_CONFIG"], "/tmp/x/opencode.json");
        assert_eq!(env["GEMINI_API_KEY"], "g-key");
        assert_eq!(env["GOOGLE_GENERATIVE_AI_API_KEY"], "g-key");
        assert_eq!(env["ANTHROPIC_API_KEY"], "a-key");
        assert!(!env.contains_key("OPENAI_API_KEY"));
    }

    #[test]
    fn test_from_settings_defaults_data_dir() {
        let settings = SidecarSettings::default();
        let cfg = SidecarConfig::from_settings(&settings, Path::new("/data/opencode"));
        assert_eq!(cfg.data_dir, PathBuf::from("/data/opencode"));
        assert_eq!(cfg.binary, "opencode");
        assert_eq!(cfg.startup_timeout, Duration::from_secs(30));
    }
}
