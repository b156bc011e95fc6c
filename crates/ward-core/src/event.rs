//! Events emitted by the permission engine.
//!
//! Events produced in-process are always [`EngineEvent`]s. Payloads that come
//! from other processes may carry types this build does not know; those are
//! kept as a raw key-value bag instead of being dropped.

use crate::permission::RuleScope;
use crate::risk::RiskLevel;
use crate::rules::{Rule, RuleDecision};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use ward_sandbox::Violation;

/// Callback receiving engine events. Must not block.
pub type EventHandler = Arc<dyn Fn(&PermissionEvent) + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    ApprovalRequested {
        approval_id: String,
        tool_name: String,
        arguments: Map<String, Value>,
        decided_by: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        risk_level: Option<RiskLevel>,
        #[serde(default)]
        call_id: String,
    },
    ApprovalResolved {
        approval_id: String,
        tool_name: String,
        decision: RuleDecision,
    },
    ViolationRecorded {
        violation: Violation,
    },
    RuleAdded {
        scope: RuleScope,
        rule: Rule,
    },
    RuleRemoved {
        scope: RuleScope,
        pattern: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PermissionEvent {
    Engine(EngineEvent),
    /// Event of a type this build does not understand.
    Raw(Map<String, Value>),
}

impl PermissionEvent {
    /// Decode a payload, falling back to [`PermissionEvent::Raw`] for unknown
    /// or malformed events. Non-object payloads are wrapped under `payload`.
    pub fn from_value(value: Value) -> Self {
        match serde_json::from_value::<EngineEvent>(value.clone()) {
            Ok(event) => PermissionEvent::Engine(event),
            Err(_) => match value {
                Value::Object(map) => PermissionEvent::Raw(map),
                other => {
                    let mut map = Map::new();
                    map.insert("payload".to_string(), other);
                    PermissionEvent::Raw(map)
                }
            },
        }
    }

    /// The `type` tag, `"unknown"` for raw events without one.
    pub fn event_type(&self) -> &str {
        match self {
            PermissionEvent::Engine(event) => match event {
                EngineEvent::ApprovalRequested { .. } => "approval_requested",
                EngineEvent::ApprovalResolved { .. } => "approval_resolved",
                EngineEvent::ViolationRecorded { .. } => "violation_recorded",
                EngineEvent::RuleAdded { .. } => "rule_added",
                EngineEvent::RuleRemoved { .. } => "rule_removed",
            },
            PermissionEvent::Raw(map) => map.get("type").and_then(Value::as_str).unwrap_or("unknown"),
        }
    }
}

impl From<EngineEvent> for PermissionEvent {
    fn from(event: EngineEvent) -> Self {
        PermissionEvent::Engine(event)
    }
}

/// Deliver `event` to `handler`, if any.
pub(crate) fn emit(handler: Option<&EventHandler>, event: EngineEvent) {
    if let Some(handler) = handler {
        handler(&PermissionEvent::Engine(event));
    }
}
