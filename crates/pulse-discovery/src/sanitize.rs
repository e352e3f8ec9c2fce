//! Bounding and cleaning of everything that crosses the model boundary
//!
//! Container metadata is attacker-influenced (labels, names, mounts) and the
//! model's answer is free text. Both sides go through the helpers here before
//! they reach a prompt, a note or a shell template.

use lazy_static::lazy_static;
use pulse_core::snapshot::DockerContainer;
use regex::Regex;
use serde::Serialize;
use std::collections::BTreeMap;

pub const MAX_PROMPT_FIELD_LEN: usize = 256;
pub const MAX_PROMPT_LABELS: usize = 64;
pub const MAX_PROMPT_MOUNTS: usize = 64;
pub const MAX_PROMPT_NETWORKS: usize = 32;
pub const MAX_PROMPT_PORTS: usize = 64;
pub const MAX_PROMPT_ENV_NAMES: usize = 64;

pub const MAX_IDENTIFIER_LEN: usize = 64;
pub const MAX_SERVICE_NAME_LEN: usize = 128;
pub const MAX_CLI_COMMAND_LEN: usize = 256;
pub const MAX_REASONING_LEN: usize = 1024;
pub const MAX_APP_FIELD_LEN: usize = 256;

const CLI_PREFIXES: [&str; 2] = ["docker exec ", "docker container exec "];
const CLI_FORBIDDEN: [&str; 5] = [";", "&&", "||", "`", "$("];

lazy_static! {
    static ref IDENTIFIER: Regex = Regex::new(r"^[a-z0-9][a-z0-9._-]{0,63}$").unwrap();
}

/// Collapse whitespace and control characters into single spaces, trim, and
/// cut to `max_chars` characters
pub fn sanitize_text(input: &str, max_chars: usize) -> String {
    if input.is_empty() || max_chars == 0 {
        return String::new();
    }
    let mut out = String::with_capacity(input.len());
    let mut pending_space = false;
    for c in input.chars() {
        if c.is_control() || c.is_whitespace() {
            pending_space = true;
            continue;
        }
        if pending_space && !out.is_empty() {
            out.push(' ');
        }
        out.push(c);
        pending_space = false;
    }
    truncate_chars(&out, max_chars)
}

pub fn truncate_chars(input: &str, max_chars: usize) -> String {
    match input.char_indices().nth(max_chars) {
        Some((idx, _)) => input[..idx].to_string(),
        None => input.to_string(),
    }
}

/// Lowercase identifier matching `[a-z0-9][a-z0-9._-]*`, or empty
pub fn normalize_identifier(input: &str, max_chars: usize) -> String {
    let id = sanitize_text(input, max_chars).to_lowercase();
    if IDENTIFIER.is_match(&id) {
        id
    } else {
        String::new()
    }
}

/// `tcp`, `udp`, `sctp` or empty
pub fn sanitize_protocol(input: &str) -> String {
    let protocol = sanitize_text(input, 16).to_lowercase();
    match protocol.as_str() {
        "tcp" | "udp" | "sctp" => protocol,
        _ => String::new(),
    }
}

/// A CLI template survives only if it is a plain `docker exec` into the
/// container placeholder with no shell chaining or substitution
pub fn sanitize_cli_command(input: &str) -> String {
    let command = sanitize_text(input, MAX_CLI_COMMAND_LEN);
    if command.is_empty() {
        return command;
    }
    let lower = command.to_lowercase();
    if !CLI_PREFIXES.iter().any(|p| lower.starts_with(p)) {
        return String::new();
    }
    if CLI_FORBIDDEN.iter().any(|bad| command.contains(bad)) {
        return String::new();
    }
    if !command.contains("{container}") {
        // `${container}` contains `{container}` too
        return String::new();
    }
    command
}

pub fn clamp_confidence(confidence: f64) -> f64 {
    if !confidence.is_finite() {
        return 0.0;
    }
    confidence.clamp(0.0, 1.0)
}

pub fn valid_port(port: i64) -> Option<u16> {
    u16::try_from(port).ok().filter(|p| *p > 0)
}

// ============================================================================
// PROMPT INPUT
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PortInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host_port: Option<u16>,
    pub container_port: u16,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub protocol: String,
}

/// What the model gets to see about a container
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ContainerInfo {
    pub name: String,
    pub image: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<PortInfo>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub env_var_names: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub mounts: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub networks: Vec<String>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub status: String,
}

impl ContainerInfo {
    pub fn from_container(c: &DockerContainer) -> Self {
        let field = |s: &str| sanitize_text(s, MAX_PROMPT_FIELD_LEN);

        let ports = c
            .ports
            .iter()
            .filter_map(|p| {
                Some(PortInfo {
                    container_port: valid_port(p.private_port)?,
                    host_port: valid_port(p.public_port),
                    protocol: sanitize_protocol(&p.protocol),
                })
            })
            .take(MAX_PROMPT_PORTS)
            .collect();

        let labels = c
            .labels
            .iter()
            .filter_map(|(k, v)| {
                let key = field(k);
                (!key.is_empty()).then(|| (key, field(v)))
            })
            .take(MAX_PROMPT_LABELS)
            .collect();

        let non_empty = |limit: usize, items: Vec<String>| -> Vec<String> {
            items.into_iter().filter(|s| !s.is_empty()).take(limit).collect()
        };

        Self {
            name: field(&c.name),
            image: field(&c.image),
            ports,
            labels,
            env_var_names: non_empty(
                MAX_PROMPT_ENV_NAMES,
                c.env_names.iter().map(|n| field(n)).collect(),
            ),
            mounts: non_empty(
                MAX_PROMPT_MOUNTS,
                c.mounts.iter().map(|m| field(&m.destination)).collect(),
            ),
            networks: non_empty(
                MAX_PROMPT_NETWORKS,
                c.networks.iter().map(|n| field(&n.name)).collect(),
            ),
            status: field(&c.status),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pulse_core::snapshot::{ContainerMount, ContainerNetwork, ContainerPort};

    #[test]
    fn test_sanitize_text_collapses_and_truncates() {
        assert_eq!(sanitize_text("  a\n\tb \u{7}c  ", 100), "a b c");
        assert_eq!(sanitize_text("ééééé", 3), "ééé");
        assert_eq!(sanitize_text("abc", 0), "");
    }

    #[test]
    fn test_identifier_rules() {
        assert_eq!(normalize_identifier("PostgreSQL", 64), "postgresql");
        assert_eq!(normalize_identifier("message_queue", 64), "message_queue");
        assert_eq!(normalize_identifier("two words", 64), "");
        assert_eq!(normalize_identifier("-leading", 64), "");
    }

    #[test]
    fn test_cli_command_rules() {
        let ok = "docker exec {container} psql -U postgres";
        assert_eq!(sanitize_cli_command(ok), ok);
        assert_eq!(
            sanitize_cli_command("docker container exec ${container} redis-cli"),
            "docker container exec ${container} redis-cli"
        );
        for bad in [
            "kubectl exec {container} sh",
            "docker exec {container} sh; rm -rf /",
            "docker exec {container} a && b",
            "docker exec {container} a || b",
            "docker exec {container} `id`",
            "docker exec {container} $(id)",
            "docker exec mydb psql",
        ] {
            assert_eq!(sanitize_cli_command(bad), "", "{}", bad);
        }
    }

    #[test]
    fn test_confidence_clamped() {
        assert_eq!(clamp_confidence(1.7), 1.0);
        assert_eq!(clamp_confidence(-0.2), 0.0);
        assert_eq!(clamp_confidence(f64::NAN), 0.0);
        assert_eq!(clamp_confidence(0.42), 0.42);
    }

    #[test]
    fn test_container_info_caps() {
        let c = DockerContainer {
            name: "db\n1".into(),
            image: "postgres:14".into(),
            ports: vec![
                ContainerPort { private_port: 5432, public_port: 15432, protocol: "TCP".into() },
                ContainerPort { private_port: 0, public_port: 80, protocol: "tcp".into() },
                ContainerPort { private_port: 53, public_port: 70000, protocol: "icmp".into() },
            ],
            labels: (0..100).map(|i| (format!("k{:03}", i), "v".to_string())).collect(),
            mounts: (0..100)
                .map(|i| ContainerMount { source: "/src".into(), destination: format!("/m{}", i) })
                .collect(),
            networks: (0..40)
                .map(|i| ContainerNetwork { name: format!("net{}", i), ipv4: String::new() })
                .collect(),
            ..Default::default()
        };
        let info = ContainerInfo::from_container(&c);
        assert_eq!(info.name, "db 1");
        assert_eq!(info.ports.len(), 2);
        assert_eq!(info.ports[0], PortInfo { host_port: Some(15432), container_port: 5432, protocol: "tcp".into() });
        assert_eq!(info.ports[1].host_port, None);
        assert_eq!(info.ports[1].protocol, "");
        assert_eq!(info.labels.len(), MAX_PROMPT_LABELS);
        assert_eq!(info.mounts.len(), MAX_PROMPT_MOUNTS);
        assert_eq!(info.networks.len(), MAX_PROMPT_NETWORKS);

        let json = serde_json::to_value(&info).unwrap();
        assert!(json.get("env_var_names").is_none());
        assert!(json["ports"][1].get("host_port").is_none());
    }
}
