//! ward-core: permission decisions, sandbox policy, approvals and the
//! execution plan engine.

pub mod approval;
pub mod config;
mod error;
pub mod event;
pub mod permission;
pub mod plan;
pub mod risk;
pub mod rules;
pub mod sandbox_policy;

pub use approval::{ApprovalOutcome, ApprovalRegistry, PendingApproval};
pub use config::{Config, ConfigStore};
pub use error::WardError;
pub use event::{EngineEvent, EventHandler, PermissionEvent};
pub use permission::{
    decided_by, Decision, InspectorMode, PermissionError, PermissionInspector, PermissionRequest,
    PermissionResponse, PermissionUpdate, RuleScope,
};
pub use plan::{
    ExecutionOptions, ExecutionPlan, ExecutionPlanManager, PlanError, PlanExecutor, PlanFilter,
    PlanObserver, PlanStatus, PlanStep, StepStatus, StepSummary,
};
pub use risk::{RiskClassifier, RiskLevel};
pub use rules::{Condition, ConditionOperator, Rule, RuleDecision, RuleStore};
pub use sandbox_policy::{
    CallbackBehavior, CanUseTool, CanUseToolOptions, EnhancedInspector, PermissionResult,
};
