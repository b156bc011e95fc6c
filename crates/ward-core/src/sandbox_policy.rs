//! Sandbox policy composer.
//!
//! Layers sandbox settings, the permission-mode override, an external
//! callback and session rules on top of the base [`PermissionInspector`].
//! Layers run in a fixed order and the first one with a verdict wins:
//!
//! 1. permission mode (`bypass`, `plan`, `accept_edits`)
//! 2. sandbox-bypass requests when unsandboxed commands are not allowed
//! 3. the `CanUseTool` callback
//! 4. excluded commands (Bash-like tools)
//! 5. auto-allow while sandboxed (Bash-like tools)
//! 6. session rules
//! 7. the base inspector
//!
//! A permitted sandbox-bypass request skips layers 4 and 5 and reaches the
//! base inspector as a high-risk call.

use crate::event::{emit, EngineEvent, EventHandler};
use crate::permission::{
    decided_by, PermissionError, PermissionInspector, PermissionRequest, PermissionResponse,
    PermissionUpdate, RuleScope,
};
use crate::risk::{RiskLevel, SHELL_TOOLS};
use crate::rules::{first_match, match_pattern, Rule, RuleDecision};
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use ward_sandbox::{PermissionMode, SandboxConfig, Violation, ViolationSink};

/// Argument a call sets to ask for running outside the sandbox.
pub const DISABLE_SANDBOX_ARG: &str = "dangerouslyDisableSandbox";

const EDIT_TOOLS: &[&str] = &[
    "write", "write_file", "edit", "edit_file", "multi_edit", "notebook_edit", "create_file",
];

pub fn is_bash_like(tool_name: &str) -> bool {
    SHELL_TOOLS.contains(&tool_name.to_ascii_lowercase().as_str())
}

pub fn is_edit_tool(tool_name: &str) -> bool {
    EDIT_TOOLS.contains(&tool_name.to_ascii_lowercase().as_str())
}

/// Sandbox state handed to the callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanUseToolOptions {
    pub sandbox_enabled: bool,
    pub bypass_sandbox_requested: bool,
    pub call_id: String,
    pub risk_level: RiskLevel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallbackBehavior {
    Allow,
    Deny,
}

/// Verdict returned by a [`CanUseTool`] callback.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PermissionResult {
    pub behavior: CallbackBehavior,
    #[serde(default)]
    pub message: String,
    /// Arguments the tool must run with instead of the proposed ones.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_input: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub updated_permissions: Vec<PermissionUpdate>,
}

impl PermissionResult {
    pub fn allow() -> Self {
        Self {
            behavior: CallbackBehavior::Allow,
            message: String::new(),
            updated_input: None,
            updated_permissions: Vec::new(),
        }
    }

    pub fn allow_with_input(input: Map<String, Value>) -> Self {
        Self {
            updated_input: Some(input),
            ..Self::allow()
        }
    }

    pub fn deny(message: impl Into<String>) -> Self {
        Self {
            behavior: CallbackBehavior::Deny,
            message: message.into(),
            ..Self::allow()
        }
    }

    pub fn with_update(mut self, update: PermissionUpdate) -> Self {
        self.updated_permissions.push(update);
        self
    }
}

/// External permission callback. Called concurrently for in-flight calls.
///
/// Returning `Ok(None)` declines to decide and lets later layers run. An
/// error stops evaluation and the call is not executed.
#[async_trait]
pub trait CanUseTool: Send + Sync {
    async fn can_use_tool(
        &self,
        tool_name: &str,
        input: Map<String, Value>,
        options: &CanUseToolOptions,
    ) -> Result<Option<PermissionResult>, PermissionError>;
}

/// The layered inspector. See the module docs for the layer order.
pub struct EnhancedInspector {
    base: Arc<PermissionInspector>,
    sandbox: RwLock<SandboxConfig>,
    callback: RwLock<Option<Arc<dyn CanUseTool>>>,
    session_rules: RwLock<Vec<Rule>>,
    violations: Mutex<Vec<Violation>>,
    event_handler: RwLock<Option<EventHandler>>,
}

impl EnhancedInspector {
    pub fn new(base: Arc<PermissionInspector>, sandbox: SandboxConfig) -> Self {
        Self {
            base,
            sandbox: RwLock::new(sandbox),
            callback: RwLock::new(None),
            session_rules: RwLock::new(Vec::new()),
            violations: Mutex::new(Vec::new()),
            event_handler: RwLock::new(None),
        }
    }

    pub fn with_callback(self, callback: Arc<dyn CanUseTool>) -> Self {
        self.set_callback(Some(callback));
        self
    }

    pub fn base(&self) -> &Arc<PermissionInspector> {
        &self.base
    }

    pub fn set_callback(&self, callback: Option<Arc<dyn CanUseTool>>) {
        *self.callback.write().unwrap_or_else(PoisonError::into_inner) = callback;
    }

    pub fn set_event_handler(&self, handler: Option<EventHandler>) {
        *self.event_handler.write().unwrap_or_else(PoisonError::into_inner) = handler;
    }

    pub fn sandbox_config(&self) -> SandboxConfig {
        self.sandbox.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn set_sandbox_config(&self, config: SandboxConfig) {
        *self.sandbox.write().unwrap_or_else(PoisonError::into_inner) = config;
    }

    pub fn set_permission_mode(&self, mode: PermissionMode) {
        self.sandbox
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .permission_mode = mode;
    }

    /// Evaluate one call through every layer.
    pub async fn check(
        &self,
        request: &PermissionRequest,
    ) -> Result<PermissionResponse, PermissionError> {
        let response = self.evaluate(request).await?;
        tracing::debug!(
            tool = %request.tool_name,
            call_id = %request.call_id,
            decision = ?response.decision,
            decided_by = %response.decided_by,
            "sandbox policy check"
        );
        Ok(response)
    }

    async fn evaluate(
        &self,
        request: &PermissionRequest,
    ) -> Result<PermissionResponse, PermissionError> {
        let config = self.sandbox_config();
        let settings = &config.settings;
        let risk = self.base.risk_of(request);

        match config.permission_mode {
            PermissionMode::Bypass => {
                return Ok(
                    PermissionResponse::allow(decided_by::BYPASS_MODE, "bypass permission mode")
                        .with_risk(risk),
                );
            }
            PermissionMode::Plan => {
                return Ok(PermissionResponse::deny(
                    decided_by::PLAN_MODE,
                    format!("plan mode: '{}' is previewed, not executed", request.tool_name),
                )
                .with_risk(risk));
            }
            PermissionMode::AcceptEdits if is_edit_tool(&request.tool_name) => {
                return Ok(PermissionResponse::allow(
                    decided_by::ACCEPT_EDITS,
                    "file edits are accepted in this mode",
                )
                .with_risk(risk));
            }
            PermissionMode::AcceptEdits | PermissionMode::Default => {}
        }

        let bypass_requested = request.flag(DISABLE_SANDBOX_ARG);
        if bypass_requested && !settings.allow_unsandboxed_commands {
            return Ok(PermissionResponse::deny(
                decided_by::SANDBOX_POLICY,
                "running outside the sandbox is not allowed by sandbox settings",
            )
            .with_risk(risk));
        }

        if let Some(callback) = self.callback() {
            let options = CanUseToolOptions {
                sandbox_enabled: settings.enabled,
                bypass_sandbox_requested: bypass_requested,
                call_id: request.call_id.clone(),
                risk_level: risk,
            };
            let verdict = callback
                .can_use_tool(&request.tool_name, request.arguments.clone(), &options)
                .await?;
            if let Some(result) = verdict {
                return Ok(self.apply_callback_result(result, risk));
            }
        }

        if !bypass_requested && is_bash_like(&request.tool_name) {
            let command = request.str_arg("command").unwrap_or_default();
            if settings.is_excluded_command(command) {
                return Ok(PermissionResponse::allow(
                    decided_by::EXCLUDED_COMMAND,
                    format!("'{}' is an excluded command", ward_sandbox::command_token(command)),
                )
                .with_risk(risk));
            }
            if settings.enabled && settings.auto_allow_bash_if_sandboxed {
                return Ok(PermissionResponse::allow(
                    decided_by::AUTO_ALLOW_BASH,
                    "shell command runs inside the sandbox",
                )
                .with_risk(risk));
            }
        }

        if let Some(rule) = self.find_session_rule(request) {
            let response = if rule.decision.allows() {
                PermissionResponse::allow(
                    decided_by::SESSION_RULE,
                    format!("allowed by session rule '{}'", rule.pattern),
                )
            } else {
                PermissionResponse::deny(decided_by::SESSION_RULE, rule.reason())
            };
            return Ok(response.with_risk(risk).with_rule(rule));
        }

        if bypass_requested {
            let elevated = request.clone().with_risk_level(RiskLevel::High);
            return Ok(self.base.check(&elevated));
        }
        Ok(self.base.check(request))
    }

    fn callback(&self) -> Option<Arc<dyn CanUseTool>> {
        self.callback
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn apply_callback_result(&self, result: PermissionResult, risk: RiskLevel) -> PermissionResponse {
        self.apply_updates(&result.updated_permissions);

        let mut response = match result.behavior {
            CallbackBehavior::Allow => PermissionResponse::allow(decided_by::CALLBACK, result.message),
            CallbackBehavior::Deny => {
                let message = if result.message.is_empty() {
                    "denied by permission callback".to_string()
                } else {
                    result.message
                };
                PermissionResponse::deny(decided_by::CALLBACK, message)
            }
        };
        response.updated_input = result.updated_input;
        response.updated_permissions = result.updated_permissions;
        response.with_risk(risk)
    }

    /// Apply rule mutations requested by a policy layer.
    pub fn apply_updates(&self, updates: &[PermissionUpdate]) {
        for update in updates {
            match update {
                PermissionUpdate::AddRule { scope: RuleScope::Session, rule } => {
                    self.add_session_rule(rule.clone());
                }
                PermissionUpdate::AddRule { scope: RuleScope::Persistent, rule } => {
                    self.base.add_rule(rule.clone());
                    self.emit(EngineEvent::RuleAdded {
                        scope: RuleScope::Persistent,
                        rule: rule.clone(),
                    });
                }
                PermissionUpdate::RemoveRule { scope: RuleScope::Session, pattern } => {
                    self.remove_session_rule(pattern);
                }
                PermissionUpdate::RemoveRule { scope: RuleScope::Persistent, pattern } => {
                    if self.base.remove_rule(pattern) {
                        self.emit(EngineEvent::RuleRemoved {
                            scope: RuleScope::Persistent,
                            pattern: pattern.clone(),
                        });
                    }
                }
            }
        }
    }

    /// Record a human decision in the requested scope. Session scope keeps
    /// the decision for this inspector only; persistent scope goes through
    /// the base inspector and only keeps `*_always` decisions.
    pub fn record_decision(
        &self,
        request: &PermissionRequest,
        decision: RuleDecision,
        note: &str,
        scope: RuleScope,
    ) -> Option<Rule> {
        match scope {
            RuleScope::Session => {
                let rule = Rule::new(request.tool_name.clone(), decision).with_note(note);
                self.add_session_rule(rule.clone());
                Some(rule)
            }
            RuleScope::Persistent => {
                let rule = self.base.record_decision(request, decision, note)?;
                self.emit(EngineEvent::RuleAdded {
                    scope: RuleScope::Persistent,
                    rule: rule.clone(),
                });
                Some(rule)
            }
        }
    }

    pub fn add_session_rule(&self, mut rule: Rule) {
        rule.created_at.get_or_insert_with(Utc::now);
        self.session_rules
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(rule.clone());
        self.emit(EngineEvent::RuleAdded {
            scope: RuleScope::Session,
            rule,
        });
    }

    pub fn remove_session_rule(&self, pattern: &str) -> bool {
        let removed = {
            let mut rules = self
                .session_rules
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            match rules.iter().position(|rule| rule.pattern == pattern) {
                Some(idx) => {
                    rules.remove(idx);
                    true
                }
                None => false,
            }
        };
        if removed {
            self.emit(EngineEvent::RuleRemoved {
                scope: RuleScope::Session,
                pattern: pattern.to_string(),
            });
        }
        removed
    }

    pub fn session_rules(&self) -> Vec<Rule> {
        self.session_rules
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn clear_session_rules(&self) {
        self.session_rules
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    fn find_session_rule(&self, request: &PermissionRequest) -> Option<Rule> {
        let rules = self
            .session_rules
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        first_match(&rules, &request.tool_name, &request.arguments).cloned()
    }

    /// Append to the violation log unless the path matches an
    /// `ignore_violations` pattern.
    pub fn record_violation(&self, violation: Violation) {
        let ignored = self
            .sandbox
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .settings
            .ignore_violations
            .iter()
            .any(|pattern| match_pattern(pattern, &violation.path));
        if ignored {
            tracing::debug!(path = %violation.path, "ignoring sandbox violation");
            return;
        }

        tracing::warn!(
            kind = ?violation.kind,
            path = %violation.path,
            operation = %violation.operation,
            blocked = violation.blocked,
            "sandbox violation"
        );
        self.violations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(violation.clone());
        self.emit(EngineEvent::ViolationRecorded { violation });
    }

    /// Copy of the violation log.
    pub fn violations(&self) -> Vec<Violation> {
        self.violations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn emit(&self, event: EngineEvent) {
        let handler = self
            .event_handler
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        emit(handler.as_ref(), event);
    }
}

impl ViolationSink for EnhancedInspector {
    fn record_violation(&self, violation: Violation) {
        EnhancedInspector::record_violation(self, violation);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::PermissionEvent;
    use crate::permission::{Decision, InspectorMode};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use ward_sandbox::{SandboxSettings, ViolationKind};

    fn inspector(mode: InspectorMode, sandbox: SandboxConfig) -> EnhancedInspector {
        EnhancedInspector::new(Arc::new(PermissionInspector::new(mode)), sandbox)
    }

    fn sandbox(mode: PermissionMode, settings: SandboxSettings) -> SandboxConfig {
        SandboxConfig {
            permission_mode: mode,
            settings,
        }
    }

    fn bash(command: &str) -> PermissionRequest {
        PermissionRequest::new("bash", json!({"command": command}))
    }

    struct StaticCallback {
        result: Option<PermissionResult>,
        calls: AtomicUsize,
    }

    impl StaticCallback {
        fn new(result: Option<PermissionResult>) -> Arc<Self> {
            Arc::new(Self {
                result,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl CanUseTool for StaticCallback {
        async fn can_use_tool(
            &self,
            _tool_name: &str,
            _input: Map<String, Value>,
            _options: &CanUseToolOptions,
        ) -> Result<Option<PermissionResult>, PermissionError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.result.clone())
        }
    }

    struct FailingCallback;

    #[async_trait]
    impl CanUseTool for FailingCallback {
        async fn can_use_tool(
            &self,
            _tool_name: &str,
            _input: Map<String, Value>,
            _options: &CanUseToolOptions,
        ) -> Result<Option<PermissionResult>, PermissionError> {
            Err(PermissionError::Callback("reviewer offline".to_string()))
        }
    }

    #[tokio::test]
    async fn test_bypass_overrides_deny_rule() {
        let enhanced = inspector(
            InspectorMode::AlwaysAsk,
            sandbox(PermissionMode::Bypass, SandboxSettings::default()),
        );
        enhanced.base().add_rule(Rule::new("bash", RuleDecision::DenyAlways));
        enhanced.add_session_rule(Rule::new("bash", RuleDecision::Deny));
        enhanced.set_callback(Some(StaticCallback::new(Some(PermissionResult::deny("no")))));

        let response = enhanced.check(&bash("rm -rf build")).await.unwrap();
        assert!(response.is_allowed());
        assert_eq!(response.decided_by, "bypass_mode");
    }

    #[tokio::test]
    async fn test_plan_mode_blocks_low_risk() {
        let enhanced = inspector(
            InspectorMode::AutoApprove,
            sandbox(PermissionMode::Plan, SandboxSettings::default()),
        );
        let response = enhanced
            .check(&PermissionRequest::new("read", json!({"path": "README.md"})))
            .await
            .unwrap();
        assert!(response.is_denied());
        assert_eq!(response.decided_by, "plan_mode");
    }

    #[tokio::test]
    async fn test_accept_edits_allows_edit_tools_only() {
        let enhanced = inspector(
            InspectorMode::SmartApprove,
            sandbox(PermissionMode::AcceptEdits, SandboxSettings::default()),
        );
        let edit = enhanced
            .check(&PermissionRequest::new("edit_file", json!({"path": "/etc/hosts"})))
            .await
            .unwrap();
        assert_eq!(edit.decided_by, "accept_edits");

        let shell = enhanced.check(&bash("make")).await.unwrap();
        assert_eq!(shell.decided_by, "high_risk");
    }

    #[tokio::test]
    async fn test_disable_sandbox_denied_in_every_mode() {
        for mode in [
            InspectorMode::AutoApprove,
            InspectorMode::SmartApprove,
            InspectorMode::AlwaysAsk,
        ] {
            let settings = SandboxSettings {
                enabled: true,
                auto_allow_bash_if_sandboxed: true,
                excluded_commands: vec!["git".to_string()],
                allow_unsandboxed_commands: false,
                ..SandboxSettings::default()
            };
            let enhanced = inspector(mode, sandbox(PermissionMode::Default, settings));
            enhanced.set_callback(Some(StaticCallback::new(Some(PermissionResult::allow()))));

            let request = PermissionRequest::new(
                "bash",
                json!({"command": "git push", "dangerouslyDisableSandbox": true}),
            );
            let response = enhanced.check(&request).await.unwrap();
            assert!(response.is_denied(), "mode {mode:?}");
            assert_eq!(response.decided_by, "sandbox_policy");
        }
    }

    #[tokio::test]
    async fn test_allowed_bypass_request_still_needs_approval() {
        let settings = SandboxSettings {
            enabled: true,
            auto_allow_bash_if_sandboxed: true,
            excluded_commands: vec!["git".to_string()],
            allow_unsandboxed_commands: true,
            ..SandboxSettings::default()
        };
        let enhanced = inspector(
            InspectorMode::SmartApprove,
            sandbox(PermissionMode::Default, settings),
        );
        let request = PermissionRequest::new(
            "bash",
            json!({"command": "git fetch", "dangerouslyDisableSandbox": true}),
        )
        .with_risk_level(RiskLevel::Low);

        let response = enhanced.check(&request).await.unwrap();
        assert_eq!(response.decision, Decision::Ask);
        assert_eq!(response.decided_by, "high_risk");
    }

    #[tokio::test]
    async fn test_callback_allow_with_updated_input() {
        let mut rewritten = Map::new();
        rewritten.insert("command".to_string(), json!("ls -la"));
        let callback = StaticCallback::new(Some(PermissionResult::allow_with_input(rewritten.clone())));
        let enhanced = inspector(InspectorMode::SmartApprove, SandboxConfig::default())
            .with_callback(callback.clone());

        let response = enhanced.check(&bash("ls")).await.unwrap();
        assert!(response.is_allowed());
        assert_eq!(response.decided_by, "callback");
        assert_eq!(response.updated_input, Some(rewritten));
        assert_eq!(callback.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_callback_deny_has_message() {
        let enhanced = inspector(InspectorMode::AutoApprove, SandboxConfig::default())
            .with_callback(StaticCallback::new(Some(PermissionResult::deny(""))));
        let response = enhanced.check(&bash("ls")).await.unwrap();
        assert!(response.is_denied());
        assert_eq!(response.message, "denied by permission callback");
    }

    #[tokio::test]
    async fn test_callback_none_falls_through() {
        let enhanced = inspector(InspectorMode::SmartApprove, SandboxConfig::default())
            .with_callback(StaticCallback::new(None));
        let response = enhanced
            .check(&PermissionRequest::new("grep", json!({"pattern": "x"})))
            .await
            .unwrap();
        assert_eq!(response.decided_by, "low_risk");
    }

    #[tokio::test]
    async fn test_callback_error_propagates() {
        let enhanced = inspector(InspectorMode::AutoApprove, SandboxConfig::default())
            .with_callback(Arc::new(FailingCallback));
        let err = enhanced.check(&bash("ls")).await.unwrap_err();
        assert!(matches!(err, PermissionError::Callback(_)));
    }

    #[tokio::test]
    async fn test_callback_updates_applied() {
        let result = PermissionResult::allow()
            .with_update(PermissionUpdate::AddRule {
                scope: RuleScope::Session,
                rule: Rule::new("write_*", RuleDecision::Allow),
            })
            .with_update(PermissionUpdate::AddRule {
                scope: RuleScope::Persistent,
                rule: Rule::new("glob", RuleDecision::AllowAlways),
            });
        let enhanced = inspector(InspectorMode::SmartApprove, SandboxConfig::default())
            .with_callback(StaticCallback::new(Some(result)));

        enhanced.check(&bash("ls")).await.unwrap();
        assert_eq!(enhanced.session_rules().len(), 1);
        assert_eq!(enhanced.base().rules().len(), 1);
    }

    #[tokio::test]
    async fn test_excluded_command_and_auto_allow() {
        let settings = SandboxSettings {
            enabled: false,
            auto_allow_bash_if_sandboxed: true,
            excluded_commands: vec!["git".to_string(), "docker".to_string()],
            ..SandboxSettings::default()
        };
        let enhanced = inspector(
            InspectorMode::SmartApprove,
            sandbox(PermissionMode::Default, settings.clone()),
        );

        let git = enhanced.check(&bash("git status")).await.unwrap();
        assert_eq!(git.decided_by, "excluded_command");

        let make = enhanced.check(&bash("make")).await.unwrap();
        assert_eq!(make.decided_by, "high_risk");

        enhanced.set_sandbox_config(sandbox(
            PermissionMode::Default,
            SandboxSettings {
                enabled: true,
                ..settings
            },
        ));
        let make = enhanced.check(&bash("make")).await.unwrap();
        assert_eq!(make.decided_by, "auto_allow_bash");
    }

    #[tokio::test]
    async fn test_chained_command_is_not_excluded() {
        let settings = SandboxSettings {
            excluded_commands: vec!["git".to_string()],
            ..SandboxSettings::default()
        };
        let enhanced = inspector(
            InspectorMode::SmartApprove,
            sandbox(PermissionMode::Default, settings),
        );

        for command in ["git status; rm -rf ~", "git log && rm -rf ~", "git $(rm -rf ~)"] {
            let response = enhanced.check(&bash(command)).await.unwrap();
            assert_eq!(response.decision, Decision::Ask, "{command}");
            assert_eq!(response.decided_by, "high_risk", "{command}");
        }
    }

    #[tokio::test]
    async fn test_shell_aliases_are_bash_like() {
        let settings = SandboxSettings {
            excluded_commands: vec!["git".to_string()],
            ..SandboxSettings::default()
        };
        let enhanced = inspector(
            InspectorMode::SmartApprove,
            sandbox(PermissionMode::Default, settings),
        );
        for tool in SHELL_TOOLS {
            assert!(is_bash_like(tool));
            let request = PermissionRequest::new(*tool, json!({"command": "make", "dir": "."}));
            let response = enhanced.check(&request).await.unwrap();
            assert_eq!(response.risk_level, Some(RiskLevel::High), "{tool}");
            assert!(!response.is_allowed(), "{tool}");
        }
    }

    #[tokio::test]
    async fn test_session_rules_checked_before_base_and_cleared() {
        let enhanced = inspector(InspectorMode::SmartApprove, SandboxConfig::default());
        enhanced.base().add_rule(Rule::new("read", RuleDecision::Allow));

        let request = PermissionRequest::new("write_file", json!({"path": "/etc/hosts"}));
        enhanced.record_decision(&request, RuleDecision::Allow, "this session", RuleScope::Session);
        enhanced.add_session_rule(Rule::new("read", RuleDecision::Deny));

        assert_eq!(enhanced.check(&request).await.unwrap().decided_by, "session_rule");
        let read = enhanced.check(&PermissionRequest::new("read", json!({}))).await.unwrap();
        assert!(read.is_denied());

        enhanced.clear_session_rules();
        assert!(enhanced.check(&request).await.unwrap().needs_approval);
        assert_eq!(enhanced.base().rules().len(), 1);
    }

    #[tokio::test]
    async fn test_persistent_record_decision() {
        let enhanced = inspector(InspectorMode::SmartApprove, SandboxConfig::default());
        let request = bash("cargo build");
        assert!(enhanced
            .record_decision(&request, RuleDecision::Allow, "", RuleScope::Persistent)
            .is_none());
        assert!(enhanced
            .record_decision(&request, RuleDecision::AllowAlways, "", RuleScope::Persistent)
            .is_some());
        assert_eq!(enhanced.check(&request).await.unwrap().decided_by, "rule");
    }

    #[test]
    fn test_violation_log_snapshot_and_ignore() {
        let enhanced = inspector(
            InspectorMode::SmartApprove,
            sandbox(
                PermissionMode::Default,
                SandboxSettings {
                    ignore_violations: vec!["/proc/*".to_string()],
                    ..SandboxSettings::default()
                },
            ),
        );
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        enhanced.set_event_handler(Some(Arc::new(move |_event: &PermissionEvent| {
            counter.fetch_add(1, Ordering::SeqCst);
        })));

        enhanced.record_violation(Violation::new(ViolationKind::Filesystem, "/etc/x", "write"));
        enhanced.record_violation(Violation::new(ViolationKind::Filesystem, "/proc/1/mem", "access"));

        let mut snapshot = enhanced.violations();
        assert_eq!(snapshot.len(), 1);
        snapshot.clear();
        assert_eq!(enhanced.violations().len(), 1);
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }
}
