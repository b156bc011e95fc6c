//! Static risk classification of tools by name.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{PoisonError, RwLock};

/// Risk tier of a tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    #[default]
    Medium,
    High,
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RiskLevel::Low => write!(f, "low"),
            RiskLevel::Medium => write!(f, "medium"),
            RiskLevel::High => write!(f, "high"),
        }
    }
}

const LOW_RISK_TOOLS: &[&str] = &[
    "read", "read_file", "glob", "grep", "ls", "list_dir", "list_files", "search", "web_search",
    "todo_read",
];

const MEDIUM_RISK_TOOLS: &[&str] = &[
    "write", "write_file", "edit", "edit_file", "multi_edit", "notebook_edit", "http_request",
    "web_fetch", "webfetch", "fetch", "todo_write",
];

/// Tools that run arbitrary shell commands. Always high risk by default.
pub(crate) const SHELL_TOOLS: &[&str] = &[
    "bash", "shell", "sh", "exec", "execute_command", "run_command", "run_shell_command",
];

const HIGH_RISK_TOOLS: &[&str] = &["delete_file", "kill_shell", "task", "spawn_agent"];

/// Built-in risk of a tool, `None` when the tool is not in the table.
pub fn builtin_risk(tool_name: &str) -> Option<RiskLevel> {
    let name = tool_name.to_ascii_lowercase();
    let name = name.as_str();
    if LOW_RISK_TOOLS.contains(&name) {
        Some(RiskLevel::Low)
    } else if MEDIUM_RISK_TOOLS.contains(&name) {
        Some(RiskLevel::Medium)
    } else if SHELL_TOOLS.contains(&name) || HIGH_RISK_TOOLS.contains(&name) {
        Some(RiskLevel::High)
    } else {
        None
    }
}

/// Maps tool names to risk tiers: per-instance overrides first, then the
/// built-in table, then `Medium`.
#[derive(Debug, Default)]
pub struct RiskClassifier {
    overrides: RwLock<HashMap<String, RiskLevel>>,
}

impl RiskClassifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Classifier seeded with overrides (e.g. from config).
    pub fn with_overrides(overrides: &HashMap<String, RiskLevel>) -> Self {
        let classifier = Self::new();
        for (tool, level) in overrides {
            classifier.set_risk(tool, *level);
        }
        classifier
    }

    pub fn risk(&self, tool_name: &str) -> RiskLevel {
        let key = tool_name.to_ascii_lowercase();
        let overridden = self
            .overrides
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key)
            .copied();
        overridden
            .or_else(|| builtin_risk(&key))
            .unwrap_or(RiskLevel::Medium)
    }

    pub fn set_risk(&self, tool_name: &str, level: RiskLevel) {
        self.overrides
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(tool_name.to_ascii_lowercase(), level);
    }

    /// Drop an override; returns whether one existed.
    pub fn clear_risk(&self, tool_name: &str) -> bool {
        self.overrides
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&tool_name.to_ascii_lowercase())
            .is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_builtin_table() {
        let classifier = RiskClassifier::new();
        assert_eq!(classifier.risk("read"), RiskLevel::Low);
        assert_eq!(classifier.risk("Grep"), RiskLevel::Low);
        assert_eq!(classifier.risk("write_file"), RiskLevel::Medium);
        assert_eq!(classifier.risk("Bash"), RiskLevel::High);
    }

    #[test]
    fn test_every_shell_tool_is_high() {
        let classifier = RiskClassifier::new();
        for tool in SHELL_TOOLS {
            assert_eq!(classifier.risk(tool), RiskLevel::High, "{tool}");
            assert_eq!(classifier.risk(&tool.to_uppercase()), RiskLevel::High, "{tool}");
        }
    }

    #[test]
    fn test_unknown_tool_is_medium() {
        assert_eq!(RiskClassifier::new().risk("mcp__custom__thing"), RiskLevel::Medium);
    }

    #[test]
    fn test_override_wins_and_clears() {
        let classifier = RiskClassifier::new();
        classifier.set_risk("bash", RiskLevel::Low);
        assert_eq!(classifier.risk("bash"), RiskLevel::Low);
        assert!(classifier.clear_risk("BASH"));
        assert_eq!(classifier.risk("bash"), RiskLevel::High);
        assert!(!classifier.clear_risk("bash"));
    }

    #[test]
    fn test_concurrent_reads_and_writes() {
        let classifier = Arc::new(RiskClassifier::new());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let classifier = Arc::clone(&classifier);
                std::thread::spawn(move || {
                    for _ in 0..200 {
                        classifier.set_risk(&format!("tool_{i}"), RiskLevel::High);
                        assert_eq!(classifier.risk(&format!("tool_{i}")), RiskLevel::High);
                        assert_eq!(classifier.risk("read"), RiskLevel::Low);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
    }

    #[test]
    fn test_serde_lowercase() {
        assert_eq!(serde_json::to_string(&RiskLevel::High).unwrap(), "\"high\"");
        let parsed: RiskLevel = serde_json::from_str("\"low\"").unwrap();
        assert_eq!(parsed, RiskLevel::Low);
    }
}
