//! Pulse AI service
//!
//! Wires the agent together:
//! - MCP HTTP server exposing the tool executor to the LLM runtime
//! - OpenCode sidecar, pointed at that MCP server
//! - Discovery service classifying Docker workloads
//! - Patrol scheduler

use anyhow::{Context, Result};
use clap::Parser;
use pulse_core::{Settings, StateProvider};
use pulse_discovery::{DiscoveryConfig, DiscoveryService};
use pulse_llm::{Sidecar, SidecarConfig};
use pulse_mcp::{HttpTransport, McpServer};
use pulse_patrol::{CostTracker, OpenCodeRunner, PatrolConfig, PatrolEngine, PatrolScheduler, TokenBudget};
use pulse_store::{FindingsStore, KnowledgeStore, PatrolHistoryStore};
use pulse_tools::{Providers, SnapshotProviders, ToolExecutor};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

mod analyzer;
mod state;

use analyzer::SidecarAnalyzer;
use state::SnapshotFile;

#[derive(Parser, Debug)]
#[command(name = "pulse-ai-service")]
#[command(about = "Pulse AI agent: MCP tools, LLM runtime, discovery and patrol")]
struct Args {
    /// Settings file (TOML); missing is fine
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Fleet snapshot written by the collectors
    #[arg(long, default_value = "/var/lib/pulse/state.json")]
    state: PathBuf,

    /// Token limit shared by all LLM use cases; unlimited when omitted
    #[arg(long)]
    token_budget: Option<u64>,

    /// Log as JSON lines
    #[arg(long)]
    log_json: bool,
}

fn init_tracing(json: bool) -> Result<()> {
    let filter = EnvFilter::from_default_env()
        .add_directive("pulse_ai_service=info".parse()?)
        .add_directive("pulse_patrol=info".parse()?)
        .add_directive("pulse_discovery=info".parse()?)
        .add_directive("pulse_llm=info".parse()?)
        .add_directive("pulse_mcp=info".parse()?);
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.log_json)?;

    let settings = Settings::load(args.config.as_deref()).context("failed to load settings")?;
    let data_dir = settings.data_dir().to_path_buf();
    info!(data_dir = %data_dir.display(), control_level = %settings.ai.control_level.as_str(), "Starting Pulse AI service");

    // --- 1. State and stores ---

    let state: Arc<dyn StateProvider> = Arc::new(SnapshotFile::new(&args.state));
    let knowledge = Arc::new(KnowledgeStore::new(&data_dir).context("failed to open knowledge store")?);
    let findings = Arc::new(
        FindingsStore::open(&data_dir)
            .await
            .context("failed to open findings store")?,
    );
    let history = Arc::new(
        PatrolHistoryStore::open(&data_dir)
            .await
            .context("failed to open patrol history")?,
    );

    // --- 2. Tools ---

    let snapshot_views = Arc::new(SnapshotProviders::new(state.clone()));
    let executor = Arc::new(ToolExecutor::new(Providers {
        state: Some(state.clone()),
        alerts: Some(snapshot_views.clone()),
        backups: Some(snapshot_views.clone()),
        storage: Some(snapshot_views),
        findings: Some(findings.clone()),
        findings_manager: Some(findings.clone()),
        knowledge: Some(knowledge.clone()),
        ..Default::default()
    }));
    executor.set_control_level(settings.ai.control_level).await;
    executor.set_protected_guests(settings.ai.protected_guests.clone()).await;

    // --- 3. MCP server ---

    let transport = HttpTransport::new(Arc::new(McpServer::new(executor.clone())), settings.mcp.bind.clone());
    transport.start().await.context("failed to start MCP server")?;

    // --- 4. LLM runtime ---

    let mut sidecar_config = SidecarConfig::from_settings(
        &settings.sidecar,
        &settings
            .ai
            .opencode_data_dir
            .clone()
            .unwrap_or_else(|| data_dir.join("opencode")),
    );
    if sidecar_config.mcp_url.is_empty() {
        sidecar_config.mcp_url = transport.url().await.unwrap_or_default();
    }
    if let Some(port) = settings.ai.opencode_port {
        sidecar_config.port = port;
    }
    let sidecar = Sidecar::new(sidecar_config);
    if let Err(e) = sidecar.start().await {
        // Patrol records the failure as a finding on every run until the
        // runtime comes up.
        error!(error = %e, "LLM runtime failed to start");
    }

    // --- 5. Discovery ---

    let discovery = DiscoveryService::new(
        state.clone(),
        Some(knowledge.clone()),
        DiscoveryConfig::from(&settings.discovery),
    );
    if settings.discovery.enabled {
        discovery
            .set_analyzer(Some(Arc::new(SidecarAnalyzer::new(
                sidecar.clone(),
                settings.ai.chat_model.clone(),
            ))))
            .await;
        discovery.start().await;
    }

    // --- 6. Patrol ---

    let budget: Arc<dyn CostTracker> = Arc::new(TokenBudget::new(args.token_budget));
    let engine = PatrolEngine::new(
        PatrolConfig::from_settings(&settings.patrol, &settings.ai),
        state,
        executor,
        Arc::new(OpenCodeRunner::new(sidecar.clone())),
        findings,
        history,
    )
    .with_knowledge(knowledge)
    .with_cost_tracker(budget);
    let patrol = PatrolScheduler::new(Arc::new(engine));
    if settings.patrol.enabled {
        patrol.start().await;
    } else {
        info!("Patrol disabled");
    }

    // --- 7. Run until interrupted ---

    tokio::signal::ctrl_c().await.context("failed to listen for shutdown signal")?;
    info!("Shutting down");

    patrol.stop().await;
    discovery.stop().await;
    sidecar.stop().await;
    transport.stop().await;

    Ok(())
}
