//! Fleet state snapshot
//!
//! Produced by the external collectors and consumed read-only here. A
//! snapshot is an owned value: taking one copies the collectors' view out of
//! their lock, so every reader sees a coherent point in time.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Source of fresh snapshots
pub trait StateProvider: Send + Sync {
    fn snapshot(&self) -> StateSnapshot;
}

/// A fixed snapshot is its own provider (tests and one-shot tools)
impl StateProvider for StateSnapshot {
    fn snapshot(&self) -> StateSnapshot {
        self.clone()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StateSnapshot {
    pub nodes: Vec<Node>,
    pub vms: Vec<Guest>,
    pub containers: Vec<Guest>,
    pub docker_hosts: Vec<DockerHost>,
    pub hosts: Vec<Host>,
    pub storage: Vec<Storage>,
    pub ceph_clusters: Vec<CephCluster>,
    pub pbs_instances: Vec<PbsInstance>,
    pub pmg_instances: Vec<PmgInstance>,
    pub kubernetes_clusters: Vec<KubernetesCluster>,
    pub active_alerts: Vec<Alert>,
    pub recently_resolved: Vec<ResolvedAlert>,
    /// Instance name -> connected
    pub connection_health: BTreeMap<String, bool>,
    pub pve_backups: PveBackups,
    pub pbs_backups: Vec<PbsBackup>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Usage {
    pub total: u64,
    pub used: u64,
    /// Percent, 0-100
    pub usage: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Node {
    pub id: String,
    pub name: String,
    pub instance: String,
    pub status: String,
    /// Fraction of all cores, 0-1
    pub cpu: f64,
    pub memory: Usage,
    pub disk: Usage,
    pub uptime: u64,
    pub load_average: Vec<f64>,
    pub pending_updates: u32,
}

/// VM or LXC container
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Guest {
    pub id: String,
    pub vmid: u32,
    pub name: String,
    pub node: String,
    pub instance: String,
    /// `qemu` or `lxc`
    #[serde(rename = "type")]
    pub guest_type: String,
    pub status: String,
    /// Fraction of allotted cores, 0-1
    pub cpu: f64,
    pub memory: Usage,
    pub disk: Usage,
    pub uptime: u64,
    pub template: bool,
    pub last_backup: Option<DateTime<Utc>>,
    pub tags: Vec<String>,
}

impl Guest {
    pub fn is_lxc(&self) -> bool {
        self.guest_type == "lxc"
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DockerHost {
    pub id: String,
    pub agent_id: String,
    pub hostname: String,
    pub display_name: String,
    pub status: String,
    pub containers: Vec<DockerContainer>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DockerContainer {
    pub id: String,
    pub name: String,
    pub image: String,
    pub state: String,
    pub status: String,
    pub health: String,
    pub labels: BTreeMap<String, String>,
    pub ports: Vec<ContainerPort>,
    pub networks: Vec<ContainerNetwork>,
    pub mounts: Vec<ContainerMount>,
    /// Environment variable names only, values are never collected
    pub env_names: Vec<String>,
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub update_available: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerPort {
    pub private_port: i64,
    pub public_port: i64,
    pub protocol: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerNetwork {
    pub name: String,
    pub ipv4: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerMount {
    pub source: String,
    pub destination: String,
}

/// Host running the standalone agent (no hypervisor)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Host {
    pub id: String,
    pub hostname: String,
    pub platform: String,
    pub os_name: String,
    pub status: String,
    pub cpu_usage: f64,
    pub memory: Usage,
    pub disks: Vec<HostDisk>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HostDisk {
    pub mountpoint: String,
    pub usage: Usage,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Storage {
    pub id: String,
    pub name: String,
    pub node: String,
    pub instance: String,
    #[serde(rename = "type")]
    pub storage_type: String,
    pub status: String,
    pub total: u64,
    pub used: u64,
    /// Percent, 0-100
    pub usage: f64,
    pub shared: bool,
    pub zfs_pool: Option<ZfsPool>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ZfsPool {
    pub name: String,
    pub state: String,
    pub read_errors: u64,
    pub write_errors: u64,
    pub checksum_errors: u64,
}

impl ZfsPool {
    pub fn has_errors(&self) -> bool {
        self.read_errors + self.write_errors + self.checksum_errors > 0
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CephCluster {
    pub id: String,
    pub name: String,
    pub health: String,
    pub health_message: String,
    pub usage: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PbsInstance {
    pub id: String,
    pub name: String,
    pub host: String,
    pub status: String,
    pub datastores: Vec<PbsDatastore>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PbsDatastore {
    pub name: String,
    pub total: u64,
    pub used: u64,
    pub usage: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PmgInstance {
    pub id: String,
    pub name: String,
    pub status: String,
    pub queue_total: u64,
    pub mail_count_24h: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct KubernetesCluster {
    pub id: String,
    pub name: String,
    pub status: String,
    pub node_count: u32,
    pub ready_nodes: u32,
    pub pod_count: u32,
    pub unhealthy_pods: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Alert {
    pub id: String,
    #[serde(rename = "type")]
    pub alert_type: String,
    /// `warning` or `critical`
    pub level: String,
    pub resource_id: String,
    pub resource_name: String,
    pub node: String,
    pub message: String,
    pub value: f64,
    pub threshold: f64,
    pub start_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolvedAlert {
    #[serde(flatten)]
    pub alert: Alert,
    pub resolved_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PveBackups {
    pub backup_tasks: Vec<BackupTask>,
    pub storage_backups: Vec<StorageBackup>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupTask {
    pub id: String,
    pub node: String,
    pub vmid: u32,
    /// `OK` on success, error text otherwise
    pub status: String,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub error: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageBackup {
    pub vmid: u32,
    pub storage: String,
    pub time: Option<DateTime<Utc>>,
    pub size: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PbsBackup {
    pub instance: String,
    pub datastore: String,
    pub vmid: String,
    pub backup_time: Option<DateTime<Utc>>,
    pub size: u64,
}

impl StateSnapshot {
    /// Non-template VMs and containers
    pub fn guests(&self) -> impl Iterator<Item = &Guest> {
        self.vms
            .iter()
            .chain(self.containers.iter())
            .filter(|g| !g.template)
    }

    pub fn find_guest(&self, id_or_name: &str) -> Option<&Guest> {
        self.vms.iter().chain(self.containers.iter()).find(|g| {
            g.id == id_or_name || g.name == id_or_name || g.vmid.to_string() == id_or_name
        })
    }

    pub fn find_docker_container(&self, id_or_name: &str) -> Option<(&DockerHost, &DockerContainer)> {
        self.docker_hosts.iter().find_map(|h| {
            h.containers
                .iter()
                .find(|c| c.id == id_or_name || c.name == id_or_name || c.id.starts_with(id_or_name))
                .map(|c| (h, c))
        })
    }

    pub fn find_docker_host(&self, id_or_name: &str) -> Option<&DockerHost> {
        self.docker_hosts.iter().find(|h| {
            h.id == id_or_name || h.hostname == id_or_name || h.display_name == id_or_name
        })
    }

    /// Whether any collector still reports a resource with this id
    pub fn contains_resource(&self, id: &str) -> bool {
        self.nodes.iter().any(|n| n.id == id || n.name == id)
            || self.vms.iter().chain(self.containers.iter()).any(|g| g.id == id)
            || self.docker_hosts.iter().any(|h| {
                h.id == id || h.containers.iter().any(|c| c.id == id || c.name == id)
            })
            || self.hosts.iter().any(|h| h.id == id)
            || self.storage.iter().any(|s| s.id == id || s.name == id)
            || self.pbs_instances.iter().any(|p| p.id == id)
            || self.pmg_instances.iter().any(|p| p.id == id)
            || self.kubernetes_clusters.iter().any(|k| k.id == id)
            || self.ceph_clusters.iter().any(|c| c.id == id)
    }

    /// Display name for a resource id, if it is known
    pub fn resource_name(&self, id: &str) -> Option<String> {
        if let Some(n) = self.nodes.iter().find(|n| n.id == id) {
            return Some(n.name.clone());
        }
        if let Some(g) = self.vms.iter().chain(self.containers.iter()).find(|g| g.id == id) {
            return Some(g.name.clone());
        }
        if let Some(s) = self.storage.iter().find(|s| s.id == id) {
            return Some(s.name.clone());
        }
        if let Some(h) = self.docker_hosts.iter().find(|h| h.id == id) {
            return Some(h.hostname.clone());
        }
        self.hosts.iter().find(|h| h.id == id).map(|h| h.hostname.clone())
    }

    pub fn docker_container_count(&self) -> usize {
        self.docker_hosts.iter().map(|h| h.containers.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> StateSnapshot {
        StateSnapshot {
            nodes: vec![Node {
                id: "pve-node1".into(),
                name: "node1".into(),
                status: "online".into(),
                ..Default::default()
            }],
            vms: vec![
                Guest {
                    id: "pve-node1-100".into(),
                    vmid: 100,
                    name: "web".into(),
                    guest_type: "qemu".into(),
                    ..Default::default()
                },
                Guest {
                    id: "pve-node1-9000".into(),
                    vmid: 9000,
                    name: "tmpl".into(),
                    template: true,
                    ..Default::default()
                },
            ],
            docker_hosts: vec![DockerHost {
                id: "dh1".into(),
                hostname: "docker01".into(),
                containers: vec![DockerContainer {
                    id: "abc123".into(),
                    name: "mydb".into(),
                    ..Default::default()
                }],
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    #[test]
    fn test_guests_skip_templates() {
        let s = sample();
        assert_eq!(s.guests().count(), 1);
        assert_eq!(s.find_guest("100").unwrap().name, "web");
    }

    #[test]
    fn test_contains_resource() {
        let s = sample();
        assert!(s.contains_resource("pve-node1"));
        assert!(s.contains_resource("mydb"));
        assert!(!s.contains_resource("ghost"));
        assert_eq!(s.resource_name("dh1").as_deref(), Some("docker01"));
    }

    #[test]
    fn test_snapshot_is_its_own_provider() {
        let s = sample();
        let copy = StateProvider::snapshot(&s);
        assert_eq!(copy.docker_container_count(), 1);
    }
}
