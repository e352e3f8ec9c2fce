//! Control level
//!
//! Runtime permission tier for tools that change infrastructure. Levels are
//! totally ordered: `read_only < suggest < controlled < autonomous`.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Prefix of the approval sentinel embedded in tool output. The stream
/// bridge is the only reader that parses it.
pub const APPROVAL_PREFIX: &str = "APPROVAL_REQUIRED: ";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ControlLevel {
    /// Mutating tools are hidden and rejected
    #[default]
    ReadOnly,
    /// Mutating tools describe what the user should run
    Suggest,
    /// Mutating tools record an approval and return the approval sentinel
    Controlled,
    /// Mutating tools execute
    Autonomous,
}

impl ControlLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            ControlLevel::ReadOnly => "read_only",
            ControlLevel::Suggest => "suggest",
            ControlLevel::Controlled => "controlled",
            ControlLevel::Autonomous => "autonomous",
        }
    }

    /// Whether mutating tools are visible at all
    pub fn allows_control(&self) -> bool {
        *self > ControlLevel::ReadOnly
    }
}

impl fmt::Display for ControlLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ControlLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "" | "read_only" | "readonly" | "read-only" => Ok(ControlLevel::ReadOnly),
            "suggest" => Ok(ControlLevel::Suggest),
            "controlled" => Ok(ControlLevel::Controlled),
            "autonomous" => Ok(ControlLevel::Autonomous),
            other => Err(format!("unknown control level: {}", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_total_order() {
        assert!(ControlLevel::ReadOnly < ControlLevel::Suggest);
        assert!(ControlLevel::Suggest < ControlLevel::Controlled);
        assert!(ControlLevel::Controlled < ControlLevel::Autonomous);
    }

    #[test]
    fn test_parse_and_display() {
        for level in [
            ControlLevel::ReadOnly,
            ControlLevel::Suggest,
            ControlLevel::Controlled,
            ControlLevel::Autonomous,
        ] {
            assert_eq!(level.to_string().parse::<ControlLevel>().unwrap(), level);
        }
        assert_eq!("".parse::<ControlLevel>().unwrap(), ControlLevel::ReadOnly);
        assert!("yolo".parse::<ControlLevel>().is_err());
    }

    #[test]
    fn test_serde_snake_case() {
        let json = serde_json::to_string(&ControlLevel::ReadOnly).unwrap();
        assert_eq!(json, "\"read_only\"");
        assert!(!ControlLevel::ReadOnly.allows_control());
        assert!(ControlLevel::Suggest.allows_control());
    }
}
