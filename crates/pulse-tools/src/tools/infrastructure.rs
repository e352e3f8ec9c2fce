//! Infrastructure context tools: backups, storage, disk health and Docker
//! image updates

use futures::FutureExt;
use pulse_core::{ControlLevel, Result};
use serde_json::{json, Map, Value};

use super::control::{CommandPlan, Gate};
use crate::executor::ToolExecutor;
use crate::registry::ToolRegistry;
use crate::tool::{int_arg, paginate, str_arg, FnTool, ToolResult};

const GIB: f64 = 1024.0 * 1024.0 * 1024.0;
const RECENT_TASKS: usize = 20;

pub(super) fn register(registry: &mut ToolRegistry) {
    registry.register(FnTool::new(
        "pulse_list_backups",
        "List backups (PVE storage and PBS), PBS datastore usage and recent backup tasks.",
        json!({
            "type": "object",
            "properties": {
                "resource_id": {"type": "string", "description": "Optional: filter by VMID"},
                "limit": {"type": "integer", "description": "Max results (default 100)"},
                "offset": {"type": "integer", "description": "Skip N results for pagination"}
            }
        }),
        |e, args| e.list_backups(args).boxed(),
    ));

    registry.register(FnTool::new(
        "pulse_list_storage",
        "List storage pools with usage, ZFS pool health and Ceph cluster status.",
        json!({
            "type": "object",
            "properties": {
                "storage_id": {"type": "string", "description": "Optional: specific storage ID or name"},
                "limit": {"type": "integer", "description": "Max results (default 100)"},
                "offset": {"type": "integer", "description": "Skip N results for pagination"}
            }
        }),
        |e, args| e.list_storage(args).boxed(),
    ));

    registry.register(FnTool::new(
        "pulse_get_disk_health",
        "Get SMART disk health reported by host agents.",
        json!({"type": "object", "properties": {}}),
        |e, _| e.get_disk_health().boxed(),
    ));

    registry.register(FnTool::new(
        "pulse_list_docker_updates",
        "List Docker containers with a newer image available.",
        json!({
            "type": "object",
            "properties": {
                "host": {"type": "string", "description": "Optional: Docker host name or id"}
            }
        }),
        |e, args| e.list_docker_updates(args).boxed(),
    ));

    registry.register(
        FnTool::new(
            "pulse_check_docker_updates",
            "Ask a Docker host agent to check its containers for image updates now.",
            json!({
                "type": "object",
                "properties": {
                    "host": {"type": "string", "description": "Docker host name or id"}
                },
                "required": ["host"]
            }),
            |e, args| e.check_docker_updates(args).boxed(),
        )
        .mutating(),
    );

    registry.register(
        FnTool::new(
            "pulse_update_docker_container",
            "Pull the latest image for a Docker container and recreate it.",
            json!({
                "type": "object",
                "properties": {
                    "container": {"type": "string", "description": "Container name or id"},
                    "host": {"type": "string", "description": "Docker host name or id"}
                },
                "required": ["container", "host"]
            }),
            |e, args| e.update_docker_container(args).boxed(),
        )
        .mutating(),
    );
}

fn gib(bytes: u64) -> f64 {
    (bytes as f64 / GIB * 100.0).round() / 100.0
}

impl ToolExecutor {
    async fn list_backups(&self, args: Value) -> Result<ToolResult> {
        let Some(provider) = self.providers().await.backups else {
            return Ok(ToolResult::text("Backup information not available."));
        };
        let resource_id = str_arg(&args, "resource_id");
        let limit = int_arg(&args, "limit", 100);
        let offset = int_arg(&args, "offset", 0);

        let pve = provider.backups();
        let pbs: Vec<Value> = paginate(
            provider
                .pbs_backups()
                .into_iter()
                .filter(|b| resource_id.is_empty() || b.vmid == resource_id)
                .map(|b| {
                    json!({
                        "vmid": b.vmid,
                        "backup_time": b.backup_time,
                        "instance": b.instance,
                        "datastore": b.datastore,
                        "size_gb": gib(b.size),
                    })
                })
                .collect(),
            offset,
            limit,
        );
        let pve_backups: Vec<Value> = paginate(
            pve.storage_backups
                .iter()
                .filter(|b| resource_id.is_empty() || b.vmid.to_string() == resource_id)
                .map(|b| {
                    json!({
                        "vmid": b.vmid,
                        "backup_time": b.time,
                        "storage": b.storage,
                        "size_gb": gib(b.size),
                    })
                })
                .collect(),
            offset,
            limit,
        );
        let servers: Vec<Value> = provider
            .pbs_instances()
            .iter()
            .map(|p| {
                json!({
                    "name": p.name,
                    "host": p.host,
                    "status": p.status,
                    "datastores": p.datastores.iter().map(|d| json!({
                        "name": d.name,
                        "usage_percent": d.usage,
                        "free_gb": gib(d.total.saturating_sub(d.used)),
                    })).collect::<Vec<_>>(),
                })
            })
            .collect();
        let tasks: Vec<Value> = pve
            .backup_tasks
            .iter()
            .take(RECENT_TASKS)
            .map(|t| {
                json!({
                    "vmid": t.vmid,
                    "node": t.node,
                    "status": t.status,
                    "start_time": t.start_time,
                    "error": t.error,
                })
            })
            .collect();

        ToolResult::json(&json!({
            "pbs": pbs,
            "pve": pve_backups,
            "pbs_servers": servers,
            "recent_tasks": tasks,
        }))
    }

    async fn list_storage(&self, args: Value) -> Result<ToolResult> {
        let Some(provider) = self.providers().await.storage else {
            return Ok(ToolResult::text("Storage information not available."));
        };
        let storage_id = str_arg(&args, "storage_id");
        let limit = int_arg(&args, "limit", 100);
        let offset = int_arg(&args, "offset", 0);

        let pools: Vec<Value> = paginate(
            provider
                .storage()
                .into_iter()
                .filter(|s| storage_id.is_empty() || s.id == storage_id || s.name == storage_id)
                .map(|s| {
                    let mut pool = json!({
                        "id": s.id,
                        "name": s.name,
                        "node": s.node,
                        "type": s.storage_type,
                        "status": s.status,
                        "usage_percent": s.usage,
                        "used_gb": gib(s.used),
                        "total_gb": gib(s.total),
                        "free_gb": gib(s.total.saturating_sub(s.used)),
                        "shared": s.shared,
                    });
                    if let Some(z) = &s.zfs_pool {
                        pool["zfs"] = json!({
                            "name": z.name,
                            "state": z.state,
                            "read_errors": z.read_errors,
                            "write_errors": z.write_errors,
                            "checksum_errors": z.checksum_errors,
                        });
                    }
                    pool
                })
                .collect(),
            offset,
            limit,
        );

        ToolResult::json(&json!({
            "pools": pools,
            "ceph_clusters": provider.ceph_clusters(),
        }))
    }

    async fn get_disk_health(&self) -> Result<ToolResult> {
        let Some(provider) = self.providers().await.disk_health else {
            return Ok(ToolResult::text("Disk health information not available."));
        };
        let disks = provider.disk_health();
        let failing = disks.iter().filter(|d| d.is_failing()).count();
        ToolResult::json(&json!({"disks": disks, "failing": failing}))
    }

    /// Docker host id and display name for a host argument
    async fn resolve_docker_host(&self, host: &str) -> (String, String) {
        if let Some(state) = self.snapshot().await {
            if let Some(h) = state.find_docker_host(host) {
                let name = if h.display_name.is_empty() {
                    h.hostname.clone()
                } else {
                    h.display_name.clone()
                };
                return (h.id.clone(), name);
            }
        }
        (host.to_string(), host.to_string())
    }

    async fn list_docker_updates(&self, args: Value) -> Result<ToolResult> {
        let Some(provider) = self.providers().await.updates else {
            return Ok(ToolResult::text(
                "Docker update information not available. Ensure updates provider is configured.",
            ));
        };
        let host = str_arg(&args, "host");
        let host_id = if host.is_empty() {
            None
        } else {
            Some(self.resolve_docker_host(host).await.0)
        };
        let updates = provider.pending_updates(host_id.as_deref());
        ToolResult::json(&json!({
            "updates": updates,
            "total": updates.len(),
            "host_id": host_id,
        }))
    }

    async fn check_docker_updates(&self, args: Value) -> Result<ToolResult> {
        let Some(provider) = self.providers().await.updates else {
            return Ok(ToolResult::text(
                "Docker update checking not available. Ensure updates provider is configured.",
            ));
        };
        let host = str_arg(&args, "host");
        if host.is_empty() {
            return Ok(ToolResult::error("host is required"));
        }
        let (host_id, host_name) = self.resolve_docker_host(host).await;

        if self.effective_level().await <= ControlLevel::Suggest {
            return Ok(ToolResult::text(format!(
                "To check for Docker updates on host '{}', use the UI or API:\n\nPOST /api/agents/docker/hosts/{}/check-updates",
                host_name, host_id
            )));
        }

        match provider.trigger_update_check(&host_id).await {
            Ok(command_id) => ToolResult::json(&json!({
                "success": true,
                "host_id": host_id,
                "host_name": host_name,
                "command_id": command_id,
                "message": "Update check command queued. Results will be available after the next agent report cycle (~30 seconds).",
            })),
            Err(e) => Ok(ToolResult::text(format!("Failed to trigger update check: {}", e))),
        }
    }

    async fn update_docker_container(&self, args: Value) -> Result<ToolResult> {
        let Some(provider) = self.providers().await.updates else {
            return Ok(ToolResult::text(
                "Docker update functionality not available. Ensure updates provider is configured.",
            ));
        };
        let container = str_arg(&args, "container");
        let host = str_arg(&args, "host");
        if container.is_empty() {
            return Ok(ToolResult::error("container is required"));
        }
        if host.is_empty() {
            return Ok(ToolResult::error("host is required"));
        }

        let found = self.snapshot().await.and_then(|state| {
            let h = state.find_docker_host(host)?.clone();
            let c = h
                .containers
                .iter()
                .find(|c| c.name == container || c.id == container || c.id.starts_with(container))?
                .clone();
            Some((h, c))
        });
        let Some((docker_host, target)) = found else {
            return Ok(ToolResult::text(format!(
                "Could not find container '{}' on host '{}'",
                container, host
            )));
        };
        let name = target.name.trim_start_matches('/').to_string();

        let mut extra = Map::new();
        extra.insert("container_name".into(), json!(name));
        extra.insert("docker_host".into(), json!(docker_host.hostname));
        extra.insert("action".into(), json!("update"));
        let plan = CommandPlan {
            tool: "pulse_update_docker_container",
            command: format!("docker update {} (pull latest + recreate)", name),
            target_type: "docker".to_string(),
            target_id: target.id.clone(),
            target_name: name.clone(),
            target_host: docker_host.hostname.clone(),
            run_on_host: true,
            suggestion: format!(
                "To update container '{}' on host '{}', use the UI or run:\n\nPOST /api/agents/docker/containers/update\n{{\n  \"hostId\": \"{}\",\n  \"containerId\": \"{}\",\n  \"containerName\": \"{}\"\n}}",
                name, docker_host.hostname, docker_host.id, target.id, name
            ),
            extra,
        };
        if let Gate::Respond(result) = self.gate_command(&plan).await? {
            return Ok(result);
        }

        match provider.update_container(&docker_host.id, &target.id).await {
            Ok(command_id) => ToolResult::json(&json!({
                "success": true,
                "host_id": docker_host.id,
                "container_id": target.id,
                "container_name": name,
                "command_id": command_id,
                "message": format!(
                    "Update command queued for container '{}'. The agent will pull the latest image and recreate the container.",
                    name
                ),
            })),
            Err(e) => Ok(ToolResult::text(format!("Failed to queue update command: {}", e))),
        }
    }
}
