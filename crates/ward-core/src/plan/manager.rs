//! Owns the plans of one process and coordinates execution, approval and
//! cancellation across callers.

use super::{ExecutionOptions, ExecutionPlan, PlanError, PlanExecutor, PlanStatus, PlanStep};
use crate::permission::PermissionError;
use crate::rules::RuleDecision;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;

pub type SharedPlan = Arc<AsyncMutex<ExecutionPlan>>;

/// Selects plans in [`ExecutionPlanManager::list`]. Unset fields match all.
#[derive(Debug, Clone, Default)]
pub struct PlanFilter {
    pub agent_id: Option<String>,
    pub tenant_id: Option<String>,
    pub status: Option<PlanStatus>,
}

impl PlanFilter {
    fn matches(&self, plan: &ExecutionPlan) -> bool {
        self.agent_id
            .as_deref()
            .map_or(true, |agent| plan.agent_id() == Some(agent))
            && self
                .tenant_id
                .as_deref()
                .map_or(true, |tenant| plan.tenant_id() == Some(tenant))
            && self.status.map_or(true, |status| plan.status() == status)
    }
}

/// Removes the running entry when an execution ends, even if the future is
/// dropped.
struct RunningGuard<'a> {
    running: &'a Mutex<HashMap<String, CancellationToken>>,
    id: String,
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.id);
    }
}

pub struct ExecutionPlanManager {
    executor: Arc<PlanExecutor>,
    defaults: ExecutionOptions,
    plans: RwLock<HashMap<String, SharedPlan>>,
    running: Mutex<HashMap<String, CancellationToken>>,
}

impl ExecutionPlanManager {
    pub fn new(executor: PlanExecutor, defaults: ExecutionOptions) -> Self {
        Self {
            executor: Arc::new(executor),
            defaults,
            plans: RwLock::new(HashMap::new()),
            running: Mutex::new(HashMap::new()),
        }
    }

    pub fn executor(&self) -> &Arc<PlanExecutor> {
        &self.executor
    }

    /// Create a plan with the default options and return its ID.
    pub fn create_plan(&self, description: impl Into<String>, steps: Vec<PlanStep>) -> String {
        let mut plan = ExecutionPlan::new(description, self.defaults.clone());
        for step in steps {
            plan.add_step(step);
        }
        self.insert(plan)
    }

    /// Take ownership of an already built plan.
    pub fn insert(&self, plan: ExecutionPlan) -> String {
        let id = plan.id().to_string();
        tracing::info!(plan_id = %id, steps = plan.len(), "plan created");
        self.plans
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.clone(), Arc::new(AsyncMutex::new(plan)));
        id
    }

    pub fn get(&self, id: &str) -> Result<SharedPlan, PlanError> {
        self.plans
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
            .ok_or_else(|| PlanError::NotFound(id.to_string()))
    }

    /// Copy of a plan. Waits while the plan is executing.
    pub async fn snapshot(&self, id: &str) -> Result<ExecutionPlan, PlanError> {
        let plan = self.get(id)?;
        let guard = plan.lock().await;
        Ok(guard.clone())
    }

    /// Plans matching `filter`, oldest first.
    pub async fn list(&self, filter: &PlanFilter) -> Vec<ExecutionPlan> {
        let plans: Vec<SharedPlan> = self
            .plans
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();

        let mut matched = Vec::new();
        for plan in plans {
            let guard = plan.lock().await;
            if filter.matches(&guard) {
                matched.push(guard.clone());
            }
        }
        matched.sort_by_key(|plan| plan.created_at());
        matched
    }

    pub fn len(&self) -> usize {
        self.plans.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub async fn submit(&self, id: &str) -> Result<(), PlanError> {
        let plan = self.get(id)?;
        let mut guard = plan.lock().await;
        guard.submit_for_approval()
    }

    pub async fn approve(&self, id: &str, approved_by: &str) -> Result<(), PlanError> {
        let plan = self.get(id)?;
        plan.lock().await.approve(approved_by)?;
        tracing::info!(plan_id = %id, approved_by, "plan approved");
        Ok(())
    }

    pub async fn reject(&self, id: &str, note: &str) -> Result<(), PlanError> {
        let plan = self.get(id)?;
        let mut guard = plan.lock().await;
        guard.reject(note)?;
        self.discard_approvals(&mut guard).await;
        tracing::info!(plan_id = %id, note, "plan rejected");
        Ok(())
    }

    /// Pre-approve a step. Its outstanding approval, if any, is dropped.
    pub async fn approve_step(&self, id: &str, step_id: &str) -> Result<(), PlanError> {
        let plan = self.get(id)?;
        let mut guard = plan.lock().await;
        guard.approve_step(step_id)?;
        self.discard_approvals(&mut guard).await;
        Ok(())
    }

    /// Fail a step whose approval was refused out of band.
    pub async fn reject_step(&self, id: &str, step_id: &str, reason: &str) -> Result<(), PlanError> {
        let plan = self.get(id)?;
        let mut guard = plan.lock().await;
        let outstanding = guard
            .step_by_id(step_id)
            .and_then(|step| step.approval_id.clone());
        guard.reject_step(step_id, reason)?;
        if let (Some(approvals), Some(approval_id)) = (self.executor.approvals(), outstanding) {
            approvals.discard(&approval_id).await;
        }
        Ok(())
    }

    /// Drop registry entries for steps that no longer wait on a reviewer.
    async fn discard_approvals(&self, plan: &mut ExecutionPlan) {
        let Some(approvals) = self.executor.approvals() else {
            return;
        };
        for step in plan.steps_mut() {
            if step.awaiting_approval() {
                continue;
            }
            if let Some(approval_id) = step.approval_id.take() {
                approvals.discard(&approval_id).await;
            }
        }
    }

    /// Resolve a pending approval raised by one of the plan's steps. Allowing
    /// decisions pre-approve the step; denying ones fail it. `*_always`
    /// decisions are also recorded as rules.
    pub async fn resolve_approval(
        &self,
        id: &str,
        approval_id: &str,
        decision: RuleDecision,
        note: &str,
    ) -> Result<(), PlanError> {
        let approvals = self
            .executor
            .approvals()
            .ok_or_else(|| PermissionError::ApprovalNotFound(approval_id.to_string()))?;
        let plan = self.get(id)?;
        let pending = approvals
            .get(approval_id)
            .await
            .ok_or_else(|| PermissionError::ApprovalNotFound(approval_id.to_string()))?;

        // Nothing is consumed or recorded unless the approval belongs here.
        let step_id = pending.request.call_id;
        let mut guard = plan.lock().await;
        let raised_here = pending.request.context.get("plan_id").and_then(Value::as_str) == Some(id)
            && guard.step_by_id(&step_id).is_some();
        if !raised_here {
            return Err(PlanError::StepNotFound(step_id));
        }
        approvals.resolve(approval_id, decision, note).await?;

        if decision.allows() {
            guard.approve_step(&step_id)
        } else {
            let reason = if note.is_empty() { "denied by reviewer" } else { note };
            guard.reject_step(&step_id, reason)
        }
    }

    pub async fn execute(&self, id: &str) -> Result<PlanStatus, PlanError> {
        let plan = self.get(id)?;
        let (token, _running) = self.start_run(id)?;
        let mut guard = plan.lock().await;
        self.executor.execute(&mut guard, &token).await
    }

    pub async fn resume(&self, id: &str) -> Result<PlanStatus, PlanError> {
        let plan = self.get(id)?;
        let (token, _running) = self.start_run(id)?;
        let mut guard = plan.lock().await;
        self.executor.resume(&mut guard, &token).await
    }

    /// Cancel a plan. A running plan is stopped through its cancellation
    /// token; an idle one is cancelled directly.
    pub async fn cancel(&self, id: &str, reason: &str) -> Result<(), PlanError> {
        let plan = self.get(id)?;
        let token = self
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned();
        if let Some(token) = token {
            tracing::info!(plan_id = %id, reason, "cancelling running plan");
            token.cancel();
            return Ok(());
        }
        let mut guard = plan.lock().await;
        guard.cancel(reason)?;
        self.discard_approvals(&mut guard).await;
        Ok(())
    }

    /// Forget a plan, stopping it first if it is running.
    pub fn remove(&self, id: &str) -> bool {
        if let Some(token) = self
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
        {
            token.cancel();
        }
        self.plans
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id)
            .is_some()
    }

    pub fn is_running(&self, id: &str) -> bool {
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(id)
    }

    fn start_run(&self, id: &str) -> Result<(CancellationToken, RunningGuard<'_>), PlanError> {
        let mut running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        if running.contains_key(id) {
            return Err(PlanError::NotExecutable {
                id: id.to_string(),
                status: PlanStatus::Executing,
            });
        }
        let token = CancellationToken::new();
        running.insert(id.to_string(), token.clone());
        Ok((
            token,
            RunningGuard {
                running: &self.running,
                id: id.to_string(),
            },
        ))
    }
}
