//! Execution plans: ordered tool-call steps with approval, dependencies and
//! retry policy.
//!
//! An [`ExecutionPlan`] is only mutated through its own methods. The
//! [`PlanExecutor`] runs it and the [`ExecutionPlanManager`] owns plans for a
//! process.

mod executor;
mod manager;

pub use executor::{PlanExecutor, PlanObserver};
pub use manager::{ExecutionPlanManager, PlanFilter, SharedPlan};

use crate::permission::PermissionError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use ward_tools::ToolResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    #[default]
    Draft,
    PendingApproval,
    Approved,
    Executing,
    Completed,
    Failed,
    Partial,
    Cancelled,
}

impl PlanStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            PlanStatus::Completed | PlanStatus::Failed | PlanStatus::Partial | PlanStatus::Cancelled
        )
    }
}

impl fmt::Display for PlanStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PlanStatus::Draft => "draft",
            PlanStatus::PendingApproval => "pending_approval",
            PlanStatus::Approved => "approved",
            PlanStatus::Executing => "executing",
            PlanStatus::Completed => "completed",
            PlanStatus::Failed => "failed",
            PlanStatus::Partial => "partial",
            PlanStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

/// Per-plan execution policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionOptions {
    pub require_approval: bool,
    pub auto_approve: bool,
    pub stop_on_error: bool,
    pub parallel: bool,
    pub max_parallel_steps: usize,
    /// 0 disables the per-attempt timeout.
    pub step_timeout_ms: u64,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
}

impl Default for ExecutionOptions {
    fn default() -> Self {
        Self {
            require_approval: true,
            auto_approve: false,
            stop_on_error: true,
            parallel: false,
            max_parallel_steps: 3,
            step_timeout_ms: 0,
            max_retries: 0,
            retry_delay_ms: 1000,
        }
    }
}

/// One tool call in a plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct PlanStep {
    /// Generated when empty at `add_step` time.
    pub id: String,
    pub index: usize,
    pub tool_name: String,
    pub description: String,
    pub input: Value,
    pub status: StepStatus,
    pub result: Option<ToolResult>,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: u64,
    /// IDs of steps that must complete first.
    pub depends_on: Vec<String>,
    pub retry_count: u32,
    /// Falls back to the plan's options when unset.
    pub max_retries: Option<u32>,
    pub retry_delay_ms: Option<u64>,
    /// One-shot pre-approval, consumed by the next permission gate.
    pub approved: bool,
    /// `decided_by` tag of an outstanding approval requirement.
    pub approval: Option<String>,
    pub approval_id: Option<String>,
}

impl PlanStep {
    pub fn new(tool_name: impl Into<String>, description: impl Into<String>, input: Value) -> Self {
        Self {
            tool_name: tool_name.into(),
            description: description.into(),
            input,
            ..Self::default()
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn depends_on(mut self, step_id: impl Into<String>) -> Self {
        self.depends_on.push(step_id.into());
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn with_retry_delay_ms(mut self, delay_ms: u64) -> Self {
        self.retry_delay_ms = Some(delay_ms);
        self
    }

    pub fn is_finished(&self) -> bool {
        matches!(
            self.status,
            StepStatus::Completed | StepStatus::Failed | StepStatus::Skipped
        )
    }

    pub fn awaiting_approval(&self) -> bool {
        self.status == StepStatus::Pending && self.approval.is_some()
    }

    pub(crate) fn mark_running(&mut self) {
        self.status = StepStatus::Running;
        self.started_at = Some(Utc::now());
        self.completed_at = None;
        self.error = None;
        self.approval = None;
        self.approval_id = None;
    }

    pub(crate) fn mark_completed(&mut self, result: ToolResult) {
        self.status = StepStatus::Completed;
        self.result = Some(result);
        self.error = None;
        self.finish();
    }

    pub(crate) fn mark_failed(&mut self, error: impl Into<String>) {
        self.status = StepStatus::Failed;
        self.error = Some(error.into());
        self.finish();
    }

    pub(crate) fn mark_skipped(&mut self, reason: impl Into<String>) {
        self.status = StepStatus::Skipped;
        self.error = Some(reason.into());
        self.approval = None;
        self.completed_at = Some(Utc::now());
    }

    pub(crate) fn mark_awaiting(&mut self, decided_by: String, approval_id: Option<String>) {
        self.status = StepStatus::Pending;
        self.approval = Some(decided_by);
        self.approval_id = approval_id;
    }

    fn finish(&mut self) {
        let now = Utc::now();
        self.completed_at = Some(now);
        if let Some(started) = self.started_at {
            self.duration_ms = (now - started).num_milliseconds().max(0) as u64;
        }
    }

    fn reset(&mut self) {
        self.status = StepStatus::Pending;
        self.result = None;
        self.error = None;
        self.started_at = None;
        self.completed_at = None;
        self.duration_ms = 0;
        self.retry_count = 0;
    }
}

/// Step counts by status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct StepSummary {
    pub total: usize,
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub awaiting_approval: usize,
}

#[derive(Debug, thiserror::Error)]
pub enum PlanError {
    #[error("Plan not found: {0}")]
    NotFound(String),

    #[error("Plan {id} cannot execute in status {status}")]
    NotExecutable { id: String, status: PlanStatus },

    #[error("Cannot {action} plan in status {status}")]
    InvalidTransition {
        action: &'static str,
        status: PlanStatus,
    },

    #[error("Step not found: {0}")]
    StepNotFound(String),

    #[error("Step '{step_id}' failed: {message}")]
    StepFailed { step_id: String, message: String },

    #[error("Plan cancelled: {0}")]
    Cancelled(String),

    #[error(transparent)]
    Permission(#[from] PermissionError),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionPlan {
    id: String,
    description: String,
    steps: Vec<PlanStep>,
    status: PlanStatus,
    user_approved: bool,
    approved_by: Option<String>,
    approved_at: Option<DateTime<Utc>>,
    rejection_note: Option<String>,
    current_step: Option<usize>,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    updated_at: DateTime<Utc>,
    total_duration_ms: u64,
    options: ExecutionOptions,
    agent_id: Option<String>,
    org_id: Option<String>,
    tenant_id: Option<String>,
    metadata: Map<String, Value>,
}

impl ExecutionPlan {
    pub fn new(description: impl Into<String>, options: ExecutionOptions) -> Self {
        let now = Utc::now();
        Self {
            id: ulid::Ulid::new().to_string(),
            description: description.into(),
            steps: Vec::new(),
            status: PlanStatus::Draft,
            user_approved: false,
            approved_by: None,
            approved_at: None,
            rejection_note: None,
            current_step: None,
            created_at: now,
            started_at: None,
            completed_at: None,
            updated_at: now,
            total_duration_ms: 0,
            options,
            agent_id: None,
            org_id: None,
            tenant_id: None,
            metadata: Map::new(),
        }
    }

    pub fn with_agent(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = Some(agent_id.into());
        self
    }

    pub fn with_tenant(mut self, org_id: impl Into<String>, tenant_id: impl Into<String>) -> Self {
        self.org_id = Some(org_id.into());
        self.tenant_id = Some(tenant_id.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn steps(&self) -> &[PlanStep] {
        &self.steps
    }

    pub fn status(&self) -> PlanStatus {
        self.status
    }

    pub fn options(&self) -> &ExecutionOptions {
        &self.options
    }

    pub fn user_approved(&self) -> bool {
        self.user_approved
    }

    pub fn approved_by(&self) -> Option<&str> {
        self.approved_by.as_deref()
    }

    pub fn approved_at(&self) -> Option<DateTime<Utc>> {
        self.approved_at
    }

    pub fn rejection_note(&self) -> Option<&str> {
        self.rejection_note.as_deref()
    }

    /// Index of the most recently started step.
    pub fn current_step(&self) -> Option<usize> {
        self.current_step
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        self.completed_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    pub fn total_duration_ms(&self) -> u64 {
        self.total_duration_ms
    }

    pub fn agent_id(&self) -> Option<&str> {
        self.agent_id.as_deref()
    }

    pub fn org_id(&self) -> Option<&str> {
        self.org_id.as_deref()
    }

    pub fn tenant_id(&self) -> Option<&str> {
        self.tenant_id.as_deref()
    }

    pub fn metadata(&self) -> &Map<String, Value> {
        &self.metadata
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Append a step and return its ID. Indexes start at zero.
    pub fn add_step(&mut self, mut step: PlanStep) -> String {
        if step.id.is_empty() {
            step.id = ulid::Ulid::new().to_string();
        }
        step.index = self.steps.len();
        let id = step.id.clone();
        self.steps.push(step);
        self.touch();
        id
    }

    pub fn get_step(&self, index: usize) -> Option<&PlanStep> {
        self.steps.get(index)
    }

    pub fn step_by_id(&self, step_id: &str) -> Option<&PlanStep> {
        self.steps.iter().find(|step| step.id == step_id)
    }

    /// Explicitly approved by a user, or auto-approved by options.
    pub fn is_approved(&self) -> bool {
        self.user_approved || self.options.auto_approve
    }

    pub fn can_execute(&self) -> bool {
        self.status != PlanStatus::Executing
            && !self.status.is_terminal()
            && (!self.options.require_approval || self.is_approved())
    }

    pub fn submit_for_approval(&mut self) -> Result<(), PlanError> {
        if self.status != PlanStatus::Draft {
            return Err(self.invalid("submit"));
        }
        self.status = PlanStatus::PendingApproval;
        self.touch();
        Ok(())
    }

    pub fn approve(&mut self, approved_by: impl Into<String>) -> Result<(), PlanError> {
        if self.status == PlanStatus::Executing || self.status.is_terminal() {
            return Err(self.invalid("approve"));
        }
        self.user_approved = true;
        self.approved_by = Some(approved_by.into());
        self.approved_at = Some(Utc::now());
        self.status = PlanStatus::Approved;
        self.touch();
        Ok(())
    }

    pub fn reject(&mut self, note: impl Into<String>) -> Result<(), PlanError> {
        if self.status == PlanStatus::Executing || self.status.is_terminal() {
            return Err(self.invalid("reject"));
        }
        let note = note.into();
        self.rejection_note = Some(note.clone());
        self.user_approved = false;
        self.skip_unfinished(&format!("plan rejected: {note}"));
        self.status = PlanStatus::Cancelled;
        self.touch();
        Ok(())
    }

    /// Cancel the plan. Pending and running steps become skipped with
    /// `reason`.
    pub fn cancel(&mut self, reason: &str) -> Result<(), PlanError> {
        if self.status.is_terminal() {
            return Err(self.invalid("cancel"));
        }
        self.skip_unfinished(reason);
        self.status = PlanStatus::Cancelled;
        let now = Utc::now();
        self.completed_at = Some(now);
        self.update_duration(now);
        self.touch();
        Ok(())
    }

    /// Pre-approve one step that is waiting on (or will need) approval.
    /// `approval_id` is kept until the step runs so the executor can drop
    /// the outstanding registry entry.
    pub fn approve_step(&mut self, step_id: &str) -> Result<(), PlanError> {
        let step = self.step_mut_by_id(step_id)?;
        step.approved = true;
        step.approval = None;
        self.touch();
        Ok(())
    }

    /// Fail a step whose approval was refused.
    pub fn reject_step(&mut self, step_id: &str, reason: &str) -> Result<(), PlanError> {
        let step = self.step_mut_by_id(step_id)?;
        step.approved = false;
        step.approval = None;
        step.approval_id = None;
        step.mark_failed(format!("approval refused: {reason}"));
        self.touch();
        Ok(())
    }

    pub fn summary(&self) -> StepSummary {
        let mut summary = StepSummary {
            total: self.steps.len(),
            ..StepSummary::default()
        };
        for step in &self.steps {
            match step.status {
                StepStatus::Pending => summary.pending += 1,
                StepStatus::Running => summary.running += 1,
                StepStatus::Completed => summary.completed += 1,
                StepStatus::Failed => summary.failed += 1,
                StepStatus::Skipped => summary.skipped += 1,
            }
            if step.awaiting_approval() {
                summary.awaiting_approval += 1;
            }
        }
        summary
    }

    /// Fraction of steps that reached a final status, in `0.0..=1.0`.
    pub fn progress(&self) -> f64 {
        if self.steps.is_empty() {
            return 0.0;
        }
        let finished = self.steps.iter().filter(|step| step.is_finished()).count();
        finished as f64 / self.steps.len() as f64
    }

    fn invalid(&self, action: &'static str) -> PlanError {
        PlanError::InvalidTransition {
            action,
            status: self.status,
        }
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    fn update_duration(&mut self, now: DateTime<Utc>) {
        if let Some(started) = self.started_at {
            self.total_duration_ms = (now - started).num_milliseconds().max(0) as u64;
        }
    }

    fn step_mut_by_id(&mut self, step_id: &str) -> Result<&mut PlanStep, PlanError> {
        self.steps
            .iter_mut()
            .find(|step| step.id == step_id)
            .ok_or_else(|| PlanError::StepNotFound(step_id.to_string()))
    }

    fn skip_unfinished(&mut self, reason: &str) {
        for step in &mut self.steps {
            if matches!(step.status, StepStatus::Pending | StepStatus::Running) {
                step.mark_skipped(reason);
            }
        }
    }

    pub(crate) fn steps_mut(&mut self) -> &mut Vec<PlanStep> {
        &mut self.steps
    }

    pub(crate) fn set_current_step(&mut self, index: usize) {
        self.current_step = Some(index);
    }

    pub(crate) fn begin_execution(&mut self) {
        let now = Utc::now();
        self.status = PlanStatus::Executing;
        self.started_at = Some(now);
        self.completed_at = None;
        self.updated_at = now;
    }

    /// Derive the final status from step statuses.
    pub(crate) fn finish_execution(&mut self, cancelled: bool) -> PlanStatus {
        let now = Utc::now();
        self.status = if cancelled {
            self.skip_unfinished("plan cancelled");
            PlanStatus::Cancelled
        } else if self.steps.iter().any(PlanStep::awaiting_approval) {
            PlanStatus::PendingApproval
        } else {
            let summary = self.summary();
            let bad = summary.failed + summary.skipped + summary.pending + summary.running;
            if bad == 0 {
                PlanStatus::Completed
            } else if summary.completed > 0 {
                PlanStatus::Partial
            } else {
                PlanStatus::Failed
            }
        };
        if self.status != PlanStatus::PendingApproval {
            self.completed_at = Some(now);
        }
        self.update_duration(now);
        self.updated_at = now;
        self.status
    }

    /// Reset failed and skipped steps from the first unfinished one so the
    /// plan can run again.
    /// Cancelled and rejected plans are final and cannot be resumed.
    pub(crate) fn prepare_resume(&mut self) -> Result<(), PlanError> {
        if matches!(self.status, PlanStatus::Executing | PlanStatus::Cancelled) {
            return Err(self.invalid("resume"));
        }
        let Some(first) = self
            .steps
            .iter()
            .position(|step| step.status != StepStatus::Completed)
        else {
            return Err(self.invalid("resume"));
        };
        for step in &mut self.steps[first..] {
            if matches!(step.status, StepStatus::Failed | StepStatus::Skipped) {
                step.reset();
            }
        }
        self.status = if self.options.require_approval {
            PlanStatus::Approved
        } else {
            PlanStatus::Draft
        };
        self.completed_at = None;
        self.touch();
        Ok(())
    }
}
