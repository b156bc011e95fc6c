use crate::error::WardError;
use crate::permission::{InspectorMode, PermissionInspector};
use crate::plan::ExecutionOptions;
use crate::risk::{RiskClassifier, RiskLevel};
use crate::rules::RuleStore;
use crate::sandbox_policy::EnhancedInspector;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Serialized settings from ~/.ward/config.json
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub mode: InspectorMode,
    /// Persisted rule file; `~/.ward/rules.json` when unset.
    pub rules_path: Option<PathBuf>,
    pub risk_overrides: HashMap<String, RiskLevel>,
    pub sandbox: ward_sandbox::SandboxConfig,
    /// Defaults for new plans.
    pub execution: ExecutionOptions,
}

impl Config {
    pub fn resolved_rules_path(&self) -> PathBuf {
        self.rules_path
            .clone()
            .unwrap_or_else(|| ward_dir().join("rules.json"))
    }

    /// Base inspector with the configured mode, rule file and risk overrides.
    pub fn build_inspector(&self) -> PermissionInspector {
        PermissionInspector::with_parts(
            self.mode,
            RuleStore::open(self.resolved_rules_path()),
            RiskClassifier::with_overrides(&self.risk_overrides),
        )
    }

    /// Sandbox policy composer layered over [`Config::build_inspector`].
    pub fn build_enhanced_inspector(&self) -> EnhancedInspector {
        EnhancedInspector::new(Arc::new(self.build_inspector()), self.sandbox.clone())
    }
}

fn ward_dir() -> PathBuf {
    let mut path = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
    path.push(".ward");
    path
}

/// Helper struct for storing the location to read/write global settings
pub struct ConfigStore {
    path: PathBuf,
}

impl Default for ConfigStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigStore {
    pub fn new() -> Self {
        Self {
            path: ward_dir().join("config.json"),
        }
    }

    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the user's saved config, or fallback to Default
    pub fn load(&self) -> Config {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(_) => return Config::default(),
        };
        match serde_json::from_str(&content) {
            Ok(config) => config,
            Err(err) => {
                tracing::warn!(path = %self.path.display(), error = %err, "invalid config; using defaults");
                Config::default()
            }
        }
    }

    /// Save the user's config back to disk
    pub fn save(&self, config: &Config) -> Result<(), WardError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(config)?;
        fs::write(&self.path, content)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ward_sandbox::PermissionMode;

    #[test]
    fn test_config_backward_compatible_defaults() {
        let legacy = r#"{ "mode": "always_ask" }"#;

        let parsed: Config = serde_json::from_str(legacy).unwrap();
        assert_eq!(parsed.mode, InspectorMode::AlwaysAsk);
        assert!(parsed.risk_overrides.is_empty());
        assert_eq!(parsed.sandbox.permission_mode, PermissionMode::Default);
        assert!(!parsed.sandbox.settings.allow_unsandboxed_commands);
        assert!(parsed.execution.require_approval);
        assert_eq!(parsed.execution.max_parallel_steps, 3);
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::at(dir.path().join("nested").join("config.json"));

        let mut config = Config::default();
        config.mode = InspectorMode::AutoApprove;
        config.risk_overrides.insert("deploy".to_string(), RiskLevel::High);
        config.sandbox.settings.excluded_commands = vec!["git".to_string()];
        store.save(&config).unwrap();

        assert_eq!(store.load(), config);
    }

    #[test]
    fn test_invalid_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, "{ not json").unwrap();
        assert_eq!(ConfigStore::at(path).load(), Config::default());
    }

    #[test]
    fn test_build_inspector_uses_overrides_and_rules_path() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config {
            rules_path: Some(dir.path().join("rules.json")),
            ..Config::default()
        };
        config.risk_overrides.insert("deploy".to_string(), RiskLevel::Low);

        let inspector = config.build_inspector();
        assert_eq!(inspector.classifier().risk("deploy"), RiskLevel::Low);
        assert_eq!(inspector.rules().path(), Some(dir.path().join("rules.json").as_path()));
    }
}
