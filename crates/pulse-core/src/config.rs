//! Settings
//!
//! Settings are layered with the `config` crate: an optional TOML file first,
//! then `PULSE_AI__<SECTION>__<KEY>` environment variables on top. Every field
//! has a default so an empty environment still produces a usable value.
//!
//! ```toml
//! [ai]
//! control_level = "controlled"
//! protected_guests = ["100", "db-primary"]
//!
//! [discovery]
//! interval_secs = 300
//! ```

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::control::ControlLevel;

/// Default configuration file location
pub const DEFAULT_CONFIG_FILE: &str = "/etc/pulse/ai.toml";

/// Environment prefix for overrides (`PULSE_AI__AI__CONTROL_LEVEL=autonomous`)
pub const ENV_PREFIX: &str = "PULSE_AI";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub ai: AiSettings,
    pub sidecar: SidecarSettings,
    pub discovery: DiscoverySettings,
    pub patrol: PatrolSettings,
    pub mcp: McpSettings,
}

impl Settings {
    /// Load settings from `path` (missing file is fine) plus environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = path
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));

        let s = Config::builder()
            .add_source(File::from(path).required(false))
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("ai.protected_guests")
                    .try_parsing(true),
            )
            .build()?;
        s.try_deserialize()
    }

    /// Data directory used by the knowledge and findings stores
    pub fn data_dir(&self) -> &Path {
        &self.ai.data_dir
    }
}

/// AI service settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AiSettings {
    pub control_level: ControlLevel,
    /// VMIDs or names the AI may never control
    pub protected_guests: Vec<String>,
    pub patrol_auto_fix: bool,
    pub patrol_model: String,
    pub chat_model: String,
    pub data_dir: PathBuf,
    pub opencode_data_dir: Option<PathBuf>,
    pub opencode_port: Option<u16>,
}

impl Default for AiSettings {
    fn default() -> Self {
        Self {
            control_level: ControlLevel::ReadOnly,
            protected_guests: Vec::new(),
            patrol_auto_fix: false,
            patrol_model: String::new(),
            chat_model: "anthropic:claude-sonnet-4-20250514".to_string(),
            data_dir: PathBuf::from("/var/lib/pulse"),
            opencode_data_dir: None,
            opencode_port: None,
        }
    }
}

impl AiSettings {
    /// Patrol falls back to the chat model when no dedicated model is set
    pub fn effective_patrol_model(&self) -> &str {
        if self.patrol_model.trim().is_empty() {
            &self.chat_model
        } else {
            &self.patrol_model
        }
    }
}

/// Sidecar (LLM runtime) settings
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SidecarSettings {
    pub binary: String,
    pub data_dir: Option<PathBuf>,
    pub mcp_url: String,
    /// 0 picks a free loopback port at start
    pub port: u16,
    pub model: String,
    pub anthropic_api_key: String,
    pub openai_api_key: String,
    pub deepseek_api_key: String,
    pub gemini_api_key: String,
}

impl Default for SidecarSettings {
    fn default() -> Self {
        Self {
            binary: "opencode".to_string(),
            data_dir: None,
            mcp_url: String::new(),
            port: 0,
            model: String::new(),
            anthropic_api_key: String::new(),
            openai_api_key: String::new(),
            deepseek_api_key: String::new(),
            gemini_api_key: String::new(),
        }
    }
}

fn redact(key: &str) -> &'static str {
    if key.is_empty() {
        ""
    } else {
        "***"
    }
}

impl fmt::Debug for SidecarSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SidecarSettings")
            .field("binary", &self.binary)
            .field("data_dir", &self.data_dir)
            .field("mcp_url", &self.mcp_url)
            .field("port", &self.port)
            .field("model", &self.model)
            .field("anthropic_api_key", &redact(&self.anthropic_api_key))
            .field("openai_api_key", &redact(&self.openai_api_key))
            .field("deepseek_api_key", &redact(&self.deepseek_api_key))
            .field("gemini_api_key", &redact(&self.gemini_api_key))
            .finish()
    }
}

/// Discovery settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoverySettings {
    pub enabled: bool,
    pub interval_secs: u64,
    pub cache_expiry_secs: u64,
    pub ai_analysis_timeout_ms: u64,
    pub max_analysis_cache_entries: usize,
}

impl Default for DiscoverySettings {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 5 * 60,
            cache_expiry_secs: 60 * 60,
            ai_analysis_timeout_ms: 45_000,
            max_analysis_cache_entries: 1024,
        }
    }
}

impl DiscoverySettings {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn cache_expiry(&self) -> Duration {
        Duration::from_secs(self.cache_expiry_secs)
    }

    pub fn ai_analysis_timeout(&self) -> Duration {
        Duration::from_millis(self.ai_analysis_timeout_ms)
    }
}

/// Patrol settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PatrolSettings {
    pub enabled: bool,
    pub interval_secs: u64,
    pub analyze_nodes: bool,
    pub analyze_guests: bool,
    pub analyze_docker: bool,
    pub analyze_storage: bool,
    pub analyze_pbs: bool,
    pub analyze_hosts: bool,
    pub analyze_kubernetes: bool,
    pub analyze_pmg: bool,
    /// Scheduled runs use the smaller quick-check turn budget
    pub quick_scope: bool,
}

impl Default for PatrolSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 6 * 60 * 60,
            analyze_nodes: true,
            analyze_guests: true,
            analyze_docker: true,
            analyze_storage: true,
            analyze_pbs: true,
            analyze_hosts: true,
            analyze_kubernetes: true,
            analyze_pmg: true,
            quick_scope: false,
        }
    }
}

impl PatrolSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

/// MCP server settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct McpSettings {
    /// Loopback only; 0 picks a free port
    pub bind: String,
}

impl Default for McpSettings {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:0".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let s = Settings::default();
        assert_eq!(s.ai.control_level, ControlLevel::ReadOnly);
        assert_eq!(s.discovery.ai_analysis_timeout(), Duration::from_secs(45));
        assert_eq!(s.discovery.cache_expiry(), Duration::from_secs(3600));
        assert_eq!(s.discovery.max_analysis_cache_entries, 1024);
        assert!(s.patrol.analyze_nodes);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ai.toml");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(
            f,
            "[ai]\ncontrol_level = \"controlled\"\nprotected_guests = [\"100\"]\n\n[discovery]\ninterval_secs = 60"
        )
        .unwrap();

        let s = Settings::load(Some(&path)).unwrap();
        assert_eq!(s.ai.control_level, ControlLevel::Controlled);
        assert_eq!(s.ai.protected_guests, vec!["100".to_string()]);
        assert_eq!(s.discovery.interval(), Duration::from_secs(60));
        // Untouched sections keep defaults
        assert_eq!(s.discovery.cache_expiry_secs, 3600);
    }

    #[test]
    fn test_missing_file_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let s = Settings::load(Some(&dir.path().join("absent.toml"))).unwrap();
        assert_eq!(s.mcp.bind, "127.0.0.1:0");
    }

    #[test]
    fn test_patrol_model_fallback() {
        let mut ai = AiSettings::default();
        assert_eq!(ai.effective_patrol_model(), ai.chat_model);
        ai.patrol_model = "openai:gpt-4o".into();
        assert_eq!(ai.effective_patrol_model(), "openai:gpt-4o");
    }

    #[test]
    fn test_api_keys_redacted() {
        let mut s = SidecarSettings::default();
        s.anthropic_api_key = "sk-secret".into();
        let dbg = format!("{:?}", s);
        assert!(!dbg.contains("sk-secret"));
        assert!(dbg.contains("***"));
    }
}
