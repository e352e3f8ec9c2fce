//! Model references
//!
//! Pulse settings name models as `provider:model` (or `provider/model`); the
//! runtime wants `{providerID, modelID}` using its own provider names.

use serde_json::{json, Value};
use std::fmt;

/// Providers whose prefix is accepted before a `:` separator
const KNOWN_PROVIDERS: &[&str] = &[
    "anthropic",
    "openai",
    "google",
    "gemini",
    "deepseek",
    "ollama",
    "openrouter",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelRef {
    pub provider: String,
    pub model: String,
}

impl ModelRef {
    /// Parse a configured model string. Bare names fall back to provider
    /// inference; `None` means the runtime default should be used.
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim();
        if s.is_empty() {
            return None;
        }

        if let Some((provider, model)) = s.split_once('/') {
            if !provider.is_empty() && !model.is_empty() {
                return Some(Self::new(provider, model));
            }
        }
        if let Some((provider, model)) = s.split_once(':') {
            if KNOWN_PROVIDERS.contains(&provider.to_lowercase().as_str()) && !model.is_empty() {
                return Some(Self::new(provider, model));
            }
        }

        infer_provider(s).map(|provider| Self::new(provider, s))
    }

    fn new(provider: &str, model: &str) -> Self {
        Self {
            provider: opencode_provider(&provider.to_lowercase()).to_string(),
            model: model.to_string(),
        }
    }

    /// Body fragment for prompt requests
    pub fn to_json(&self) -> Value {
        json!({"providerID": self.provider, "modelID": self.model})
    }
}

impl fmt::Display for ModelRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.provider, self.model)
    }
}

/// Map a Pulse provider name to the runtime's name for it
pub fn opencode_provider(provider: &str) -> &str {
    match provider {
        "gemini" => "google",
        other => other,
    }
}

/// Guess the provider from a bare model name
pub fn infer_provider(model: &str) -> Option<&'static str> {
    let m = model.to_lowercase();
    let starts = |prefixes: &[&str]| prefixes.iter().any(|p| m.starts_with(p));

    if starts(&["claude"]) {
        Some("anthropic")
    } else if starts(&["gpt", "o1", "o3"]) {
        Some("openai")
    } else if starts(&["gemini"]) {
        Some("google")
    } else if starts(&["deepseek"]) {
        Some("deepseek")
    } else if starts(&["llama", "mistral", "codellama", "phi", "qwen"]) {
        Some("ollama")
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_forms() {
        let m = ModelRef::parse("anthropic:claude-sonnet-4-20250514").unwrap();
        assert_eq!(m.to_string(), "anthropic/claude-sonnet-4-20250514");

        let m = ModelRef::parse("gemini:gemini-2.5-pro").unwrap();
        assert_eq!(m.provider, "google");

        let m = ModelRef::parse("openrouter/anthropic/claude-3.5").unwrap();
        assert_eq!(m.provider, "openrouter");
        assert_eq!(m.model, "anthropic/claude-3.5");

        // Tag separator inside an ollama model name is not a provider prefix
        let m = ModelRef::parse("llama3:8b").unwrap();
        assert_eq!(m.provider, "ollama");
        assert_eq!(m.model, "llama3:8b");
    }

    #[test]
    fn test_inference() {
        assert_eq!(infer_provider("gpt-4o"), Some("openai"));
        assert_eq!(infer_provider("o3-mini"), Some("openai"));
        assert_eq!(infer_provider("Claude-3"), Some("anthropic"));
        assert_eq!(infer_provider("qwen2.5"), Some("ollama"));
        assert_eq!(infer_provider("mystery"), None);
        assert!(ModelRef::parse("mystery").is_none());
        assert!(ModelRef::parse("  ").is_none());
    }

    #[test]
    fn test_json_shape() {
        let m = ModelRef::parse("deepseek-chat").unwrap();
        assert_eq!(m.to_json(), json!({"providerID": "deepseek", "modelID": "deepseek-chat"}));
    }
}
