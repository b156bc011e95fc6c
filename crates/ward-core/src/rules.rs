//! Permission rules and the ordered, optionally persisted rule store.
//!
//! Rules are evaluated strictly in insertion order and the first match wins.
//! Callers add broad rules first and narrower ones later; the store never
//! reorders them.

use crate::error::{best_effort, WardError};
use crate::risk::RiskLevel;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError, RwLock};

/// Outcome a rule assigns to a matching call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleDecision {
    Allow,
    Deny,
    AllowAlways,
    DenyAlways,
}

impl RuleDecision {
    pub fn allows(self) -> bool {
        matches!(self, RuleDecision::Allow | RuleDecision::AllowAlways)
    }

    /// `*_always` decisions become durable rules when recorded.
    pub fn is_permanent(self) -> bool {
        matches!(self, RuleDecision::AllowAlways | RuleDecision::DenyAlways)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConditionOperator {
    Eq,
    Ne,
    Contains,
    Prefix,
    Suffix,
}

/// Predicate over one call argument. Arguments compare as text: strings as
/// they are, every other JSON value as its JSON encoding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Condition {
    pub field: String,
    pub operator: ConditionOperator,
    pub value: String,
}

impl Condition {
    pub fn new(field: impl Into<String>, operator: ConditionOperator, value: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            operator,
            value: value.into(),
        }
    }

    /// A missing argument fails the condition whatever the operator.
    pub fn evaluate(&self, arguments: &Map<String, Value>) -> bool {
        let Some(actual) = arguments.get(&self.field).map(argument_text) else {
            return false;
        };
        let expected = self.value.as_str();
        match self.operator {
            ConditionOperator::Eq => actual == expected,
            ConditionOperator::Ne => actual != expected,
            ConditionOperator::Contains => actual.contains(expected),
            ConditionOperator::Prefix => actual.starts_with(expected),
            ConditionOperator::Suffix => actual.ends_with(expected),
        }
    }
}

fn argument_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// A permission rule. Field names are the on-disk format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub pattern: String,
    pub decision: RuleDecision,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub risk_level: Option<RiskLevel>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub note: String,
}

impl Rule {
    pub fn new(pattern: impl Into<String>, decision: RuleDecision) -> Self {
        Self {
            pattern: pattern.into(),
            decision,
            risk_level: None,
            conditions: Vec::new(),
            expires_at: None,
            created_at: None,
            note: String::new(),
        }
    }

    pub fn with_condition(mut self, condition: Condition) -> Self {
        self.conditions.push(condition);
        self
    }

    pub fn with_risk_level(mut self, level: RiskLevel) -> Self {
        self.risk_level = Some(level);
        self
    }

    pub fn expires_at(mut self, at: DateTime<Utc>) -> Self {
        self.expires_at = Some(at);
        self
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = note.into();
        self
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    /// Pattern and every condition match. Expiry is checked by the caller.
    pub fn matches(&self, tool_name: &str, arguments: &Map<String, Value>) -> bool {
        match_pattern(&self.pattern, tool_name)
            && self.conditions.iter().all(|c| c.evaluate(arguments))
    }

    /// Human-readable reason used when this rule blocks a call.
    pub fn reason(&self) -> String {
        if self.note.is_empty() {
            format!("denied by rule '{}'", self.pattern)
        } else {
            self.note.clone()
        }
    }
}

/// Wildcard match on tool names: `*` matches everything, `prefix*`,
/// `*suffix` and `*infix*` match accordingly, anything else is exact.
pub fn match_pattern(pattern: &str, name: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    match (pattern.strip_prefix('*'), pattern.strip_suffix('*')) {
        (Some(_), Some(_)) if pattern.len() >= 2 => name.contains(&pattern[1..pattern.len() - 1]),
        (None, Some(prefix)) => name.starts_with(prefix),
        (Some(suffix), None) => name.ends_with(suffix),
        _ => pattern == name,
    }
}

/// First non-expired rule in `rules` matching the call.
pub fn first_match<'a>(
    rules: &'a [Rule],
    tool_name: &str,
    arguments: &Map<String, Value>,
) -> Option<&'a Rule> {
    let now = Utc::now();
    rules
        .iter()
        .filter(|rule| !rule.is_expired_at(now))
        .find(|rule| rule.matches(tool_name, arguments))
}

/// Ordered rule list, shared by concurrent evaluations, optionally backed by
/// a JSON file that is rewritten on every mutation.
#[derive(Debug, Default)]
pub struct RuleStore {
    rules: RwLock<Vec<Rule>>,
    path: Option<PathBuf>,
    write_lock: Mutex<()>,
}

impl RuleStore {
    /// In-memory store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store persisted at `path`. Existing rules are loaded best-effort; a
    /// missing or unreadable file starts the store empty.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let store = Self {
            path: Some(path.into()),
            ..Self::default()
        };
        best_effort("load permission rules", store.load_rules());
        store
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Append a rule, stamping `created_at` when unset, then persist.
    pub fn add_rule(&self, mut rule: Rule) {
        rule.created_at.get_or_insert_with(Utc::now);
        tracing::debug!(pattern = %rule.pattern, decision = ?rule.decision, "adding permission rule");
        self.rules
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(rule);
        self.persist();
    }

    /// Remove the first rule whose pattern equals `pattern` exactly.
    pub fn remove_rule(&self, pattern: &str) -> bool {
        let removed = {
            let mut rules = self.rules.write().unwrap_or_else(PoisonError::into_inner);
            match rules.iter().position(|rule| rule.pattern == pattern) {
                Some(idx) => {
                    rules.remove(idx);
                    true
                }
                None => false,
            }
        };
        if removed {
            self.persist();
        }
        removed
    }

    pub fn find_matching_rule(&self, tool_name: &str, arguments: &Map<String, Value>) -> Option<Rule> {
        let rules = self.rules.read().unwrap_or_else(PoisonError::into_inner);
        first_match(&rules, tool_name, arguments).cloned()
    }

    /// Snapshot of all rules, expired ones included.
    pub fn rules(&self) -> Vec<Rule> {
        self.rules.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn len(&self) -> usize {
        self.rules.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.rules.write().unwrap_or_else(PoisonError::into_inner).clear();
        self.persist();
    }

    /// Drop expired rules from memory; returns how many were dropped.
    pub fn prune_expired(&self) -> usize {
        let now = Utc::now();
        let pruned = {
            let mut rules = self.rules.write().unwrap_or_else(PoisonError::into_inner);
            let before = rules.len();
            rules.retain(|rule| !rule.is_expired_at(now));
            before - rules.len()
        };
        if pruned > 0 {
            self.persist();
        }
        pruned
    }

    /// Write the full rule list to the backing file. No-op for in-memory stores.
    pub fn save_rules(&self) -> Result<(), WardError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let content = serde_json::to_string_pretty(&self.rules())?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, content)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Replace the in-memory rules with the non-expired rules on disk.
    /// Returns the number of rules loaded; a missing file loads nothing.
    pub fn load_rules(&self) -> Result<usize, WardError> {
        let Some(path) = &self.path else {
            return Ok(0);
        };
        if !path.exists() {
            return Ok(0);
        }

        let content = std::fs::read_to_string(path)?;
        let mut loaded: Vec<Rule> = serde_json::from_str(&content)?;
        let now = Utc::now();
        loaded.retain(|rule| !rule.is_expired_at(now));
        let count = loaded.len();

        *self.rules.write().unwrap_or_else(PoisonError::into_inner) = loaded;
        tracing::debug!(path = %path.display(), count, "loaded permission rules");
        Ok(count)
    }

    fn persist(&self) {
        best_effort("persist permission rules", self.save_rules());
    }
}
