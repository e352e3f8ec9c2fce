//! Container classification prompt and response parsing

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::sanitize::{
    clamp_confidence, normalize_identifier, sanitize_cli_command, sanitize_text, ContainerInfo,
    MAX_IDENTIFIER_LEN, MAX_REASONING_LEN, MAX_SERVICE_NAME_LEN,
};

/// Larger answers are not parsed at all
pub const MAX_RESPONSE_BYTES: usize = 64 * 1024;

/// Below this the result is not turned into an app
pub const MIN_CONFIDENCE: f64 = 0.5;

pub const UNKNOWN_SERVICE: &str = "unknown";

/// The model's classification of one image, after normalization
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryResult {
    pub service_type: String,
    pub service_name: String,
    pub category: String,
    pub cli_command: String,
    pub confidence: f64,
    pub reasoning: String,
}

impl DiscoveryResult {
    pub fn is_actionable(&self) -> bool {
        self.service_type != UNKNOWN_SERVICE && self.confidence >= MIN_CONFIDENCE
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawResult {
    service_type: String,
    service_name: String,
    category: String,
    cli_command: String,
    confidence: f64,
    reasoning: String,
}

impl From<RawResult> for DiscoveryResult {
    fn from(raw: RawResult) -> Self {
        let or_default = |s: String, default: &str| {
            if s.is_empty() {
                default.to_string()
            } else {
                s
            }
        };
        Self {
            service_type: or_default(
                normalize_identifier(&raw.service_type, MAX_IDENTIFIER_LEN),
                UNKNOWN_SERVICE,
            ),
            service_name: or_default(
                sanitize_text(&raw.service_name, MAX_SERVICE_NAME_LEN),
                "Unknown",
            ),
            category: or_default(
                normalize_identifier(&raw.category, MAX_IDENTIFIER_LEN),
                UNKNOWN_SERVICE,
            ),
            cli_command: sanitize_cli_command(&raw.cli_command),
            confidence: clamp_confidence(raw.confidence),
            reasoning: sanitize_text(&raw.reasoning, MAX_REASONING_LEN),
        }
    }
}

pub fn build_prompt(info: &ContainerInfo) -> serde_json::Result<String> {
    let info_json = serde_json::to_string_pretty(info)?;
    Ok(format!(
        r#"Analyze this Docker container and identify what service or application it's running.

Container Information:
{info_json}

Based on the image name, ports, labels, environment variable names, mounts, and other signals, determine:
1. What service/application is this? (e.g., postgres, redis, nginx, proxmox-backup-server, grafana)
2. What category does it belong to? (database, cache, web, backup, monitoring, message_queue, storage)
3. How should CLI commands be executed for this service?

Respond in this exact JSON format:
{{
  "service_type": "the_service_type",
  "service_name": "Human Readable Name",
  "category": "category",
  "cli_command": "docker exec {{container}} <cli-tool>",
  "confidence": 0.95,
  "reasoning": "Brief explanation of why you identified it this way"
}}

Guidelines:
- service_type is lowercase with no spaces (e.g., "postgres", "redis", "pbs", "nginx")
- Use {{container}} as the placeholder for the container name in cli_command
- If the service has a CLI tool, include it (e.g., "docker exec {{container}} psql -U postgres")
- If no CLI applies, use an empty string for cli_command
- Confidence is between 0 and 1 (1 = certain, 0.5 = guess)
- If you cannot identify the service, use service_type "unknown" with low confidence

Respond with ONLY the JSON, no other text."#
    ))
}

/// Pull a result out of a free-form answer. Prose before the object, fenced
/// blocks and trailing text are tolerated.
pub fn parse_response(response: &str) -> Option<DiscoveryResult> {
    let response = response.trim();
    if response.is_empty() {
        return None;
    }
    if response.len() > MAX_RESPONSE_BYTES {
        debug!(len = response.len(), "Discovery response exceeds size limit");
        return None;
    }

    let unfenced;
    let mut body = response;
    if body.starts_with("```") {
        unfenced = strip_fences(body);
        body = &unfenced;
    }

    let start = body.find('{')?;
    let end = body.rfind('}')?;
    if end <= start {
        return None;
    }

    match serde_json::from_str::<RawResult>(&body[start..=end]) {
        Ok(raw) => Some(raw.into()),
        Err(e) => {
            debug!(
                error = %e,
                response = %sanitize_text(body, 512),
                "Discovery response is not valid JSON"
            );
            None
        }
    }
}

/// Keep only the lines inside fenced blocks
fn strip_fences(text: &str) -> String {
    let mut inside = false;
    let mut kept = Vec::new();
    for line in text.lines() {
        if line.trim_start().starts_with("```") {
            inside = !inside;
            continue;
        }
        if inside {
            kept.push(line);
        }
    }
    kept.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    const POSTGRES: &str = r#"{"service_type":"postgres","service_name":"PostgreSQL","category":"database","cli_command":"docker exec {container} psql -U postgres","confidence":0.95,"reasoning":"image"}"#;

    #[test]
    fn test_plain_json() {
        let r = parse_response(POSTGRES).unwrap();
        assert_eq!(r.service_type, "postgres");
        assert_eq!(r.cli_command, "docker exec {container} psql -U postgres");
        assert!(r.is_actionable());
    }

    #[test]
    fn test_prose_fences_and_trailing_text() {
        let fenced = format!("```json\n{}\n```\nHope this helps!", POSTGRES);
        assert_eq!(parse_response(&fenced).unwrap().service_name, "PostgreSQL");

        let prose = format!("Sure! Here is the analysis: {} Let me know.", POSTGRES);
        assert_eq!(parse_response(&prose).unwrap().category, "database");
    }

    #[test]
    fn test_normalization() {
        let r = parse_response(
            r#"{"service_type":"Redis","category":"Cache Layer","cli_command":"redis-cli","confidence":3}"#,
        )
        .unwrap();
        assert_eq!(r.service_type, "redis");
        assert_eq!(r.category, "unknown");
        assert_eq!(r.service_name, "Unknown");
        assert_eq!(r.cli_command, "");
        assert_eq!(r.confidence, 1.0);
    }

    #[test]
    fn test_rejects_garbage_and_oversize() {
        assert!(parse_response("").is_none());
        assert!(parse_response("no json here").is_none());
        assert!(parse_response("} backwards {").is_none());
        let huge = format!("{{\"reasoning\":\"{}\"}}", "x".repeat(MAX_RESPONSE_BYTES));
        assert!(parse_response(&huge).is_none());
    }

    #[test]
    fn test_low_confidence_not_actionable() {
        let r = parse_response(r#"{"service_type":"unknown","confidence":0.3}"#).unwrap();
        assert!(!r.is_actionable());
        let r = parse_response(r#"{"service_type":"nginx","confidence":0.49}"#).unwrap();
        assert!(!r.is_actionable());
    }

    #[test]
    fn test_prompt_embeds_container() {
        let info = ContainerInfo {
            name: "mydb".into(),
            image: "postgres:14".into(),
            ..Default::default()
        };
        let prompt = build_prompt(&info).unwrap();
        assert!(prompt.contains("\"image\": \"postgres:14\""));
        assert!(prompt.contains("docker exec {container} <cli-tool>"));
    }
}
