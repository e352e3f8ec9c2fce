//! Query tools: capabilities, inventory, resource detail, URL fetch and the
//! consolidated health query patrol leans on

use futures::FutureExt;
use pulse_core::snapshot::{DockerContainer, Guest};
use pulse_core::{ControlLevel, Result, StateSnapshot};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use tracing::debug;

use super::STATE_UNAVAILABLE;
use crate::executor::ToolExecutor;
use crate::registry::ToolRegistry;
use crate::tool::{int_arg, paginate, str_arg, FnTool, ToolResult};

/// Largest response body returned by the URL fetch tool
pub const URL_FETCH_LIMIT: usize = 50 * 1024;

const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

pub(super) fn register(registry: &mut ToolRegistry) {
    registry.register(FnTool::new(
        "pulse_get_capabilities",
        "Get server capabilities: control level, which data providers are wired, protected guests and connected agents.",
        json!({"type": "object", "properties": {}}),
        |e, _| e.get_capabilities().boxed(),
    ));

    registry.register(FnTool::new(
        "pulse_get_url_content",
        "Fetch content from a URL. Use to check if web services are responding or read API endpoints.",
        json!({
            "type": "object",
            "properties": {
                "url": {"type": "string", "description": "The URL to fetch"}
            },
            "required": ["url"]
        }),
        |e, args| e.get_url_content(args).boxed(),
    ));

    registry.register(FnTool::new(
        "pulse_list_infrastructure",
        "List all monitored infrastructure including VMs, containers, Docker hosts, and Proxmox nodes.",
        json!({
            "type": "object",
            "properties": {
                "type": {
                    "type": "string",
                    "description": "Filter by type: 'nodes', 'vms', 'containers', 'docker'. Omit for all.",
                    "enum": ["nodes", "vms", "containers", "docker"]
                },
                "status": {
                    "type": "string",
                    "description": "Filter by status: 'running', 'stopped', 'all'. Default: all.",
                    "enum": ["running", "stopped", "all"]
                },
                "limit": {"type": "integer", "description": "Maximum number of results per category (default: 100)"},
                "offset": {"type": "integer", "description": "Number of results to skip per category"}
            }
        }),
        |e, args| e.list_infrastructure(args).boxed(),
    ));

    registry.register(FnTool::new(
        "pulse_get_resource",
        "Get detailed information about a specific VM, LXC container, or Docker container.",
        json!({
            "type": "object",
            "properties": {
                "resource_type": {
                    "type": "string",
                    "description": "Type of resource",
                    "enum": ["vm", "container", "docker"]
                },
                "resource_id": {"type": "string", "description": "VMID, name, or container id"}
            },
            "required": ["resource_type", "resource_id"]
        }),
        |e, args| e.get_resource(args).boxed(),
    ));

    registry.register(FnTool::new(
        "pulse_set_resource_url",
        "Set the web URL for a resource in Pulse after discovering a web service.",
        json!({
            "type": "object",
            "properties": {
                "resource_type": {
                    "type": "string",
                    "description": "Type of resource: 'guest', 'docker', or 'host'",
                    "enum": ["guest", "docker", "host"]
                },
                "resource_id": {"type": "string", "description": "The resource ID from context"},
                "url": {"type": "string", "description": "The URL to set (empty to remove)"}
            },
            "required": ["resource_type", "resource_id"]
        }),
        |e, args| e.set_resource_url(args).boxed(),
    ));

    registry.register(FnTool::new(
        "pulse_query",
        "Query fleet state. action 'health' returns alerts, per-resource utilization, storage pools and disk health in one call; action 'search' finds resources by name.",
        json!({
            "type": "object",
            "properties": {
                "action": {"type": "string", "enum": ["health", "search"], "description": "What to query (default: health)"},
                "query": {"type": "string", "description": "Search term for action 'search'"}
            }
        }),
        |e, args| e.query(args).boxed(),
    ));
}

// ============================================================================
// RESPONSE TYPES
// ============================================================================

#[derive(Serialize, Default)]
struct Features {
    metrics_history: bool,
    baselines: bool,
    patterns: bool,
    alerts: bool,
    findings: bool,
    backups: bool,
    storage: bool,
    disk_health: bool,
    agent_profiles: bool,
    knowledge: bool,
    control: bool,
}

#[derive(Serialize)]
struct NodeSummary {
    id: String,
    name: String,
    status: String,
}

#[derive(Serialize)]
struct GuestSummary {
    vmid: u32,
    name: String,
    status: String,
    node: String,
    cpu_percent: f64,
    memory_percent: f64,
}

impl From<&Guest> for GuestSummary {
    fn from(g: &Guest) -> Self {
        Self {
            vmid: g.vmid,
            name: g.name.clone(),
            status: g.status.clone(),
            node: g.node.clone(),
            cpu_percent: round1(g.cpu * 100.0),
            memory_percent: round1(g.memory.usage),
        }
    }
}

#[derive(Serialize)]
struct DockerContainerSummary {
    id: String,
    name: String,
    state: String,
    image: String,
    health: String,
}

#[derive(Serialize)]
struct DockerHostSummary {
    id: String,
    hostname: String,
    display_name: String,
    container_count: usize,
    containers: Vec<DockerContainerSummary>,
}

fn round1(v: f64) -> f64 {
    (v * 10.0).round() / 10.0
}

fn status_matches(filter: &str, status: &str) -> bool {
    filter.is_empty() || filter == "all" || filter == status
}

// ============================================================================
// HANDLERS
// ============================================================================

impl ToolExecutor {
    async fn get_capabilities(&self) -> Result<ToolResult> {
        let providers = self.providers().await;
        let level = self.control_level().await;
        let connected_agents = providers
            .agents
            .as_ref()
            .map(|a| a.connected_agents().len())
            .unwrap_or(0);

        let features = Features {
            metrics_history: providers.metrics_history.is_some(),
            baselines: providers.baselines.is_some(),
            patterns: providers.patterns.is_some(),
            alerts: providers.alerts.is_some(),
            findings: providers.findings.is_some(),
            backups: providers.backups.is_some(),
            storage: providers.storage.is_some(),
            disk_health: providers.disk_health.is_some(),
            agent_profiles: providers.agent_profiles.is_some(),
            knowledge: providers.knowledge.is_some(),
            control: level != ControlLevel::ReadOnly,
        };

        ToolResult::json(&json!({
            "control_level": level,
            "features": features,
            "protected_guests": self.protected_guests().await,
            "connected_agents": connected_agents,
            "version": env!("CARGO_PKG_VERSION"),
        }))
    }

    async fn get_url_content(&self, args: Value) -> Result<ToolResult> {
        let url = str_arg(&args, "url");
        if url.is_empty() {
            return Ok(ToolResult::error("url is required"));
        }
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Ok(ToolResult::error("only http and https URLs are supported"));
        }

        let mut resp = match self.http.get(url).send().await {
            Ok(r) => r,
            Err(e) => return ToolResult::json(&json!({"url": url, "error": e.to_string()})),
        };

        let status = resp.status().as_u16();
        let headers: BTreeMap<String, String> = resp
            .headers()
            .iter()
            .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.to_string(), v.to_string())))
            .collect();

        let mut body = Vec::new();
        let mut truncated = false;
        loop {
            match resp.chunk().await {
                Ok(Some(chunk)) => {
                    let room = URL_FETCH_LIMIT - body.len();
                    if chunk.len() > room {
                        body.extend_from_slice(&chunk[..room]);
                        truncated = true;
                        break;
                    }
                    body.extend_from_slice(&chunk);
                }
                Ok(None) => break,
                Err(e) => {
                    return ToolResult::json(&json!({
                        "url": url,
                        "error": format!("error reading response: {}", e),
                    }))
                }
            }
        }
        debug!(url = %url, status, bytes = body.len(), "Fetched URL");

        ToolResult::json(&json!({
            "url": url,
            "status_code": status,
            "headers": headers,
            "body": String::from_utf8_lossy(&body),
            "truncated": truncated,
        }))
    }

    async fn list_infrastructure(&self, args: Value) -> Result<ToolResult> {
        let Some(state) = self.snapshot().await else {
            return Ok(ToolResult::text(STATE_UNAVAILABLE));
        };
        let kind = str_arg(&args, "type");
        let status = str_arg(&args, "status");
        let limit = int_arg(&args, "limit", 100);
        let offset = int_arg(&args, "offset", 0);
        let wants = |k: &str| kind.is_empty() || kind == k;

        let mut nodes = Vec::new();
        if wants("nodes") {
            nodes = paginate(
                state
                    .nodes
                    .iter()
                    .filter(|n| status_matches(status, &n.status))
                    .map(|n| NodeSummary {
                        id: n.id.clone(),
                        name: n.name.clone(),
                        status: n.status.clone(),
                    })
                    .collect(),
                offset,
                limit,
            );
        }

        let guests = |list: &[Guest]| -> Vec<GuestSummary> {
            paginate(
                list.iter()
                    .filter(|g| !g.template && status_matches(status, &g.status))
                    .map(GuestSummary::from)
                    .collect(),
                offset,
                limit,
            )
        };
        let vms = if wants("vms") { guests(&state.vms) } else { Vec::new() };
        let containers = if wants("containers") {
            guests(&state.containers)
        } else {
            Vec::new()
        };

        let mut docker_hosts = Vec::new();
        if wants("docker") {
            docker_hosts = paginate(
                state
                    .docker_hosts
                    .iter()
                    .map(|h| DockerHostSummary {
                        id: h.id.clone(),
                        hostname: h.hostname.clone(),
                        display_name: h.display_name.clone(),
                        container_count: h.containers.len(),
                        containers: h
                            .containers
                            .iter()
                            .filter(|c| status_matches(status, &c.state))
                            .map(|c| DockerContainerSummary {
                                id: c.id.clone(),
                                name: c.name.clone(),
                                state: c.state.clone(),
                                image: c.image.clone(),
                                health: c.health.clone(),
                            })
                            .collect(),
                    })
                    .collect(),
                offset,
                limit,
            );
        }

        ToolResult::json(&json!({
            "nodes": nodes,
            "vms": vms,
            "containers": containers,
            "docker_hosts": docker_hosts,
            "total": {
                "nodes": state.nodes.len(),
                "vms": state.vms.len(),
                "containers": state.containers.len(),
                "docker_hosts": state.docker_hosts.len(),
            }
        }))
    }

    async fn get_resource(&self, args: Value) -> Result<ToolResult> {
        let resource_type = str_arg(&args, "resource_type");
        let resource_id = str_arg(&args, "resource_id");
        if resource_type.is_empty() {
            return Ok(ToolResult::error("resource_type is required"));
        }
        if resource_id.is_empty() {
            return Ok(ToolResult::error("resource_id is required"));
        }
        let Some(state) = self.snapshot().await else {
            return Ok(ToolResult::text(STATE_UNAVAILABLE));
        };

        let not_found = || {
            ToolResult::json(&json!({
                "error": "not_found",
                "resource_id": resource_id,
                "type": resource_type,
            }))
        };
        let matches = |g: &&Guest| {
            g.vmid.to_string() == resource_id || g.name == resource_id || g.id == resource_id
        };

        match resource_type {
            "vm" => match state.vms.iter().find(matches) {
                Some(g) => ToolResult::json(&guest_detail("vm", g)),
                None => not_found(),
            },
            "container" => match state.containers.iter().find(matches) {
                Some(g) => ToolResult::json(&guest_detail("container", g)),
                None => not_found(),
            },
            "docker" => match state.find_docker_container(resource_id) {
                Some((host, c)) => ToolResult::json(&docker_detail(&host.hostname, c)),
                None => not_found(),
            },
            other => Ok(ToolResult::error(format!(
                "invalid resource_type: {}. Use 'vm', 'container', or 'docker'",
                other
            ))),
        }
    }

    async fn set_resource_url(&self, args: Value) -> Result<ToolResult> {
        let resource_type = str_arg(&args, "resource_type");
        let resource_id = str_arg(&args, "resource_id");
        let url = str_arg(&args, "url");
        if resource_type.is_empty() {
            return Ok(ToolResult::error("resource_type is required"));
        }
        if resource_id.is_empty() {
            return Ok(ToolResult::error("resource_id is required"));
        }
        let Some(updater) = self.providers().await.metadata else {
            return Ok(ToolResult::text("Metadata updater not available."));
        };

        if let Err(e) = updater.set_resource_url(resource_type, resource_id, url).await {
            return Ok(ToolResult::error(e.to_string()));
        }

        ToolResult::json(&json!({
            "success": true,
            "resource_type": resource_type,
            "resource_id": resource_id,
            "url": url,
            "action": if url.is_empty() { "cleared" } else { "set" },
        }))
    }

    async fn query(&self, args: Value) -> Result<ToolResult> {
        let Some(state) = self.snapshot().await else {
            return Ok(ToolResult::text(STATE_UNAVAILABLE));
        };
        match str_arg(&args, "action") {
            "" | "health" => {
                let disks = self
                    .providers()
                    .await
                    .disk_health
                    .map(|p| p.disk_health())
                    .unwrap_or_default();
                ToolResult::json(&health_report(&state, &disks))
            }
            "search" => {
                let needle = str_arg(&args, "query").to_lowercase();
                if needle.is_empty() {
                    return Ok(ToolResult::error("query is required for action 'search'"));
                }
                let hits: Vec<Value> = resource_rows(&state)
                    .into_iter()
                    .filter(|r| {
                        r["name"].as_str().unwrap_or("").to_lowercase().contains(&needle)
                            || r["id"].as_str().unwrap_or("").to_lowercase().contains(&needle)
                    })
                    .collect();
                ToolResult::json(&json!({ "query": needle, "matches": hits }))
            }
            other => Ok(ToolResult::error(format!(
                "unknown action '{}': use 'health' or 'search'",
                other
            ))),
        }
    }
}

fn guest_detail(kind: &str, g: &Guest) -> Value {
    json!({
        "type": kind,
        "id": g.id,
        "vmid": g.vmid,
        "name": g.name,
        "status": g.status,
        "node": g.node,
        "cpu": {"percent": round1(g.cpu * 100.0)},
        "memory": {
            "percent": round1(g.memory.usage),
            "used_gb": round1(g.memory.used as f64 / GIB),
            "total_gb": round1(g.memory.total as f64 / GIB),
        },
        "disk": {"percent": round1(g.disk.usage)},
        "tags": g.tags,
        "last_backup": g.last_backup,
    })
}

fn docker_detail(host: &str, c: &DockerContainer) -> Value {
    json!({
        "type": "docker",
        "id": c.id,
        "name": c.name,
        "status": c.state,
        "host": host,
        "image": c.image,
        "health": c.health,
        "cpu": {"percent": round1(c.cpu_percent)},
        "memory": {"percent": round1(c.memory_percent)},
        "update_available": c.update_available,
        "labels": c.labels,
        "ports": c.ports.iter().map(|p| json!({
            "private": p.private_port,
            "public": p.public_port,
            "protocol": p.protocol,
        })).collect::<Vec<_>>(),
        "networks": c.networks.iter().map(|n| json!({
            "name": n.name,
            "addresses": [n.ipv4],
        })).collect::<Vec<_>>(),
        "mounts": c.mounts.iter().map(|m| json!({
            "source": m.source,
            "destination": m.destination,
        })).collect::<Vec<_>>(),
    })
}

/// Flat per-resource utilization rows, percentages 0-100
fn resource_rows(state: &StateSnapshot) -> Vec<Value> {
    let mut rows = Vec::new();
    for n in &state.nodes {
        rows.push(json!({
            "id": n.id, "name": n.name, "type": "node", "node": n.name, "status": n.status,
            "cpu": round1(n.cpu * 100.0), "memory": round1(n.memory.usage), "disk": round1(n.disk.usage),
        }));
    }
    for g in state.guests() {
        rows.push(json!({
            "id": g.id, "name": g.name, "type": if g.is_lxc() { "container" } else { "vm" },
            "node": g.node, "status": g.status,
            "cpu": round1(g.cpu * 100.0), "memory": round1(g.memory.usage), "disk": round1(g.disk.usage),
        }));
    }
    for h in &state.docker_hosts {
        for c in &h.containers {
            rows.push(json!({
                "id": c.id, "name": c.name, "type": "docker", "node": h.hostname, "status": c.state,
                "cpu": round1(c.cpu_percent), "memory": round1(c.memory_percent),
            }));
        }
    }
    for h in &state.hosts {
        let disk = h.disks.iter().map(|d| d.usage.usage).fold(0.0, f64::max);
        rows.push(json!({
            "id": h.id, "name": h.hostname, "type": "host", "node": h.hostname, "status": h.status,
            "cpu": round1(h.cpu_usage), "memory": round1(h.memory.usage), "disk": round1(disk),
        }));
    }
    rows
}

/// One-call health overview. Keys `alerts`, `resources`, `pools` and `disks`
/// are read back by patrol signal detection.
pub(crate) fn health_report(state: &StateSnapshot, disks: &[crate::providers::DiskHealth]) -> Value {
    let alerts: Vec<Value> = state
        .active_alerts
        .iter()
        .map(|a| {
            json!({
                "id": a.id,
                "type": a.alert_type,
                "level": a.level,
                "resource_id": a.resource_id,
                "resource_name": a.resource_name,
                "node": a.node,
                "message": a.message,
                "value": a.value,
                "threshold": a.threshold,
            })
        })
        .collect();

    let pools: Vec<Value> = state
        .storage
        .iter()
        .map(|s| {
            let mut pool = json!({
                "id": s.id,
                "name": s.name,
                "node": s.node,
                "type": s.storage_type,
                "status": s.status,
                "usage": round1(s.usage),
            });
            if let Some(z) = &s.zfs_pool {
                pool["zfs_state"] = json!(z.state);
                pool["zfs_errors"] = json!(z.read_errors + z.write_errors + z.checksum_errors);
            }
            pool
        })
        .collect();

    json!({
        "alerts": alerts,
        "resources": resource_rows(state),
        "pools": pools,
        "disks": disks,
        "connections": state.connection_health,
    })
}
