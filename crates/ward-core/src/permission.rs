//! Base permission inspector: inspector mode, then rules, then risk tier.

use crate::risk::{RiskClassifier, RiskLevel};
use crate::rules::{Rule, RuleDecision, RuleStore};
use crate::sandbox_policy::is_bash_like;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::{Component, Path, PathBuf};
use std::sync::{PoisonError, RwLock};

/// Audit tags naming the layer that produced a verdict.
pub mod decided_by {
    pub const AUTO_APPROVE: &str = "auto_approve";
    pub const ALWAYS_ASK: &str = "always_ask";
    pub const RULE: &str = "rule";
    pub const LOW_RISK: &str = "low_risk";
    pub const SAFE_OPERATION: &str = "safe_operation";
    pub const MEDIUM_RISK: &str = "medium_risk";
    pub const HIGH_RISK: &str = "high_risk";
    pub const BYPASS_MODE: &str = "bypass_mode";
    pub const PLAN_MODE: &str = "plan_mode";
    pub const ACCEPT_EDITS: &str = "accept_edits";
    pub const CALLBACK: &str = "callback";
    pub const EXCLUDED_COMMAND: &str = "excluded_command";
    pub const AUTO_ALLOW_BASH: &str = "auto_allow_bash";
    pub const SANDBOX_POLICY: &str = "sandbox_policy";
    pub const SESSION_RULE: &str = "session_rule";
}

/// How the base inspector treats calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum InspectorMode {
    /// Allow everything without evaluating rules or risk.
    AutoApprove,
    /// Rules first, then risk tier.
    #[default]
    SmartApprove,
    /// Every call needs approval.
    AlwaysAsk,
}

/// Verdict of a permission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Allow,
    Deny,
    /// Paused until a human (or automation) decides.
    Ask,
}

/// One tool call to evaluate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PermissionRequest {
    pub tool_name: String,
    #[serde(default)]
    pub arguments: Map<String, Value>,
    /// Overrides the classifier when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub risk_level: Option<RiskLevel>,
    #[serde(default)]
    pub call_id: String,
    #[serde(default)]
    pub context: Map<String, Value>,
}

impl PermissionRequest {
    /// Build a request. Non-object argument values are stored under `input`.
    pub fn new(tool_name: impl Into<String>, arguments: Value) -> Self {
        let arguments = match arguments {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                let mut map = Map::new();
                map.insert("input".to_string(), other);
                map
            }
        };
        Self {
            tool_name: tool_name.into(),
            arguments,
            risk_level: None,
            call_id: String::new(),
            context: Map::new(),
        }
    }

    pub fn with_call_id(mut self, call_id: impl Into<String>) -> Self {
        self.call_id = call_id.into();
        self
    }

    pub fn with_risk_level(mut self, level: RiskLevel) -> Self {
        self.risk_level = Some(level);
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: Value) -> Self {
        self.context.insert(key.into(), value);
        self
    }

    /// String argument, if present.
    pub fn str_arg(&self, key: &str) -> Option<&str> {
        self.arguments.get(key).and_then(Value::as_str)
    }

    /// Boolean argument, `false` when absent or not a boolean.
    pub fn flag(&self, key: &str) -> bool {
        self.arguments.get(key).and_then(Value::as_bool).unwrap_or(false)
    }
}

/// Where a rule mutation requested alongside a verdict is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleScope {
    /// The inspector's session overlay; gone on restart.
    Session,
    /// The persisted rule store.
    Persistent,
}

/// Rule mutation requested by a policy layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PermissionUpdate {
    AddRule { scope: RuleScope, rule: Rule },
    RemoveRule { scope: RuleScope, pattern: String },
}

/// Verdict with the audit trail needed by the caller and a human reviewer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PermissionResponse {
    pub decision: Decision,
    pub decided_by: String,
    /// Rewritten arguments to execute with instead of the original ones.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_input: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub updated_permissions: Vec<PermissionUpdate>,
    #[serde(default)]
    pub message: String,
    pub needs_approval: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub risk_level: Option<RiskLevel>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub matched_rule: Option<Rule>,
    /// Pending approval created for this verdict, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval_id: Option<String>,
}

impl PermissionResponse {
    fn with_decision(decision: Decision, decided_by: &str, message: impl Into<String>) -> Self {
        Self {
            decision,
            decided_by: decided_by.to_string(),
            updated_input: None,
            updated_permissions: Vec::new(),
            message: message.into(),
            needs_approval: decision == Decision::Ask,
            risk_level: None,
            matched_rule: None,
            approval_id: None,
        }
    }

    pub fn allow(decided_by: &str, message: impl Into<String>) -> Self {
        Self::with_decision(Decision::Allow, decided_by, message)
    }

    pub fn deny(decided_by: &str, message: impl Into<String>) -> Self {
        Self::with_decision(Decision::Deny, decided_by, message)
    }

    pub fn ask(decided_by: &str, message: impl Into<String>) -> Self {
        Self::with_decision(Decision::Ask, decided_by, message)
    }

    pub fn with_risk(mut self, level: RiskLevel) -> Self {
        self.risk_level = Some(level);
        self
    }

    pub fn with_rule(mut self, rule: Rule) -> Self {
        self.matched_rule = Some(rule);
        self
    }

    pub fn is_allowed(&self) -> bool {
        self.decision == Decision::Allow
    }

    pub fn is_denied(&self) -> bool {
        self.decision == Decision::Deny
    }

    /// Turn a deny or ask verdict into an error for callers that treat both
    /// as a hard stop.
    pub fn into_result(self, tool_name: &str) -> Result<Self, PermissionError> {
        match self.decision {
            Decision::Allow => Ok(self),
            Decision::Deny => Err(PermissionError::Denied {
                tool_name: tool_name.to_string(),
                decided_by: self.decided_by,
                reason: self.message,
            }),
            Decision::Ask => Err(PermissionError::ApprovalRequired {
                tool_name: tool_name.to_string(),
                decided_by: self.decided_by,
            }),
        }
    }
}

/// Errors from the permission engine. Deny and ask verdicts are values, not
/// errors, until converted with [`PermissionResponse::into_result`].
#[derive(Debug, thiserror::Error)]
pub enum PermissionError {
    #[error("'{tool_name}' denied by {decided_by}: {reason}")]
    Denied {
        tool_name: String,
        decided_by: String,
        reason: String,
    },

    #[error("'{tool_name}' requires approval ({decided_by})")]
    ApprovalRequired { tool_name: String, decided_by: String },

    /// The external permission callback failed; the call must not run.
    #[error("Permission callback failed: {0}")]
    Callback(String),

    #[error("No pending approval with id {0}")]
    ApprovalNotFound(String),
}

/// Evaluates calls against the inspector mode, the persisted rules and the
/// risk tier of the tool.
#[derive(Debug)]
pub struct PermissionInspector {
    mode: RwLock<InspectorMode>,
    rules: RuleStore,
    classifier: RiskClassifier,
}

impl Default for PermissionInspector {
    fn default() -> Self {
        Self::new(InspectorMode::SmartApprove)
    }
}

impl PermissionInspector {
    /// Inspector with in-memory rules and the built-in risk table.
    pub fn new(mode: InspectorMode) -> Self {
        Self::with_parts(mode, RuleStore::new(), RiskClassifier::new())
    }

    /// Inspector whose rules persist to (and are loaded from) `path`.
    pub fn with_rules_file(mode: InspectorMode, path: impl Into<PathBuf>) -> Self {
        Self::with_parts(mode, RuleStore::open(path), RiskClassifier::new())
    }

    pub fn with_parts(mode: InspectorMode, rules: RuleStore, classifier: RiskClassifier) -> Self {
        Self {
            mode: RwLock::new(mode),
            rules,
            classifier,
        }
    }

    pub fn mode(&self) -> InspectorMode {
        *self.mode.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_mode(&self, mode: InspectorMode) {
        *self.mode.write().unwrap_or_else(PoisonError::into_inner) = mode;
    }

    pub fn rules(&self) -> &RuleStore {
        &self.rules
    }

    pub fn classifier(&self) -> &RiskClassifier {
        &self.classifier
    }

    pub fn add_rule(&self, rule: Rule) {
        self.rules.add_rule(rule);
    }

    pub fn remove_rule(&self, pattern: &str) -> bool {
        self.rules.remove_rule(pattern)
    }

    pub fn find_matching_rule(&self, request: &PermissionRequest) -> Option<Rule> {
        self.rules
            .find_matching_rule(&request.tool_name, &request.arguments)
    }

    pub fn risk_of(&self, request: &PermissionRequest) -> RiskLevel {
        request
            .risk_level
            .unwrap_or_else(|| self.classifier.risk(&request.tool_name))
    }

    /// Evaluate one call.
    pub fn check(&self, request: &PermissionRequest) -> PermissionResponse {
        let response = match self.mode() {
            InspectorMode::AutoApprove => {
                PermissionResponse::allow(decided_by::AUTO_APPROVE, "auto-approve mode")
            }
            InspectorMode::AlwaysAsk => PermissionResponse::ask(
                decided_by::ALWAYS_ASK,
                format!("'{}' requires approval (always-ask mode)", request.tool_name),
            )
            .with_risk(self.risk_of(request)),
            InspectorMode::SmartApprove => self.smart_check(request),
        };

        tracing::debug!(
            tool = %request.tool_name,
            call_id = %request.call_id,
            decision = ?response.decision,
            decided_by = %response.decided_by,
            "permission check"
        );
        response
    }

    fn smart_check(&self, request: &PermissionRequest) -> PermissionResponse {
        if let Some(rule) = self.find_matching_rule(request) {
            let risk = rule.risk_level.unwrap_or_else(|| self.risk_of(request));
            let response = if rule.decision.allows() {
                PermissionResponse::allow(
                    decided_by::RULE,
                    format!("allowed by rule '{}'", rule.pattern),
                )
            } else {
                PermissionResponse::deny(decided_by::RULE, rule.reason())
            };
            return response.with_risk(risk).with_rule(rule);
        }

        let risk = self.risk_of(request);
        let response = match risk {
            RiskLevel::Low => PermissionResponse::allow(decided_by::LOW_RISK, "low-risk tool"),
            RiskLevel::Medium if is_safe_operation(request) => PermissionResponse::allow(
                decided_by::SAFE_OPERATION,
                "medium-risk tool on a safe target",
            ),
            RiskLevel::Medium => PermissionResponse::ask(
                decided_by::MEDIUM_RISK,
                format!("'{}' is medium risk and needs approval", request.tool_name),
            ),
            RiskLevel::High => PermissionResponse::ask(
                decided_by::HIGH_RISK,
                format!("'{}' is high risk and needs approval", request.tool_name),
            ),
        };
        response.with_risk(risk)
    }

    /// Record a human decision. `allow_always` and `deny_always` become a
    /// persisted rule on the tool name; one-off decisions leave no trace.
    pub fn record_decision(
        &self,
        request: &PermissionRequest,
        decision: RuleDecision,
        note: &str,
    ) -> Option<Rule> {
        if !decision.is_permanent() {
            tracing::debug!(tool = %request.tool_name, ?decision, "one-off decision recorded");
            return None;
        }

        let note = if note.is_empty() {
            format!("recorded {decision:?} decision")
        } else {
            note.to_string()
        };
        let rule = Rule::new(request.tool_name.clone(), decision).with_note(note);
        self.rules.add_rule(rule.clone());
        tracing::info!(tool = %request.tool_name, ?decision, "recorded permanent decision");
        Some(rule)
    }
}

const PATH_KEYS: &[&str] = &["path", "file_path", "filepath", "file", "dir", "directory"];

/// Whether a medium-risk call targets something harmless: relative paths that
/// stay below the working directory, paths under the temp directory, or HTTP
/// GET requests. At least one recognised argument must be present and every
/// recognised argument must be safe. Shell tools are never safe operations.
pub fn is_safe_operation(request: &PermissionRequest) -> bool {
    if is_bash_like(&request.tool_name) {
        return false;
    }
    let mut recognised = false;

    for key in PATH_KEYS {
        if let Some(value) = request.arguments.get(*key) {
            recognised = true;
            match value.as_str() {
                Some(path) if is_safe_path(Path::new(path)) => {}
                _ => return false,
            }
        }
    }

    let method = request.arguments.get("method");
    if method.is_some() || request.arguments.contains_key("url") {
        recognised = true;
        let is_get = match method {
            None => true,
            Some(value) => value
                .as_str()
                .is_some_and(|m| m.eq_ignore_ascii_case("GET")),
        };
        if !is_get {
            return false;
        }
    }

    recognised
}

fn is_safe_path(path: &Path) -> bool {
    if path.as_os_str().is_empty() {
        return false;
    }
    if path.is_absolute() {
        return !path.components().any(|c| c == Component::ParentDir)
            && temp_roots().iter().any(|root| path.starts_with(root));
    }
    stays_below(path)
}

/// No `..` climbs above the starting point.
fn stays_below(path: &Path) -> bool {
    let mut depth: usize = 0;
    for component in path.components() {
        match component {
            Component::ParentDir => {
                if depth == 0 {
                    return false;
                }
                depth -= 1;
            }
            Component::Normal(_) => depth += 1,
            Component::CurDir | Component::RootDir | Component::Prefix(_) => {}
        }
    }
    true
}

fn temp_roots() -> Vec<PathBuf> {
    let temp = std::env::temp_dir();
    let mut roots = vec![temp.clone()];
    if let Ok(canonical) = temp.canonicalize() {
        roots.push(canonical);
    }
    if cfg!(unix) {
        roots.push(PathBuf::from("/tmp"));
    }
    roots
}
