//! Plan execution: sequential or bounded-parallel, with a permission gate,
//! retries, timeouts and cancellation.

use super::{ExecutionOptions, ExecutionPlan, PlanError, PlanStatus, PlanStep, StepStatus};
use crate::approval::ApprovalRegistry;
use crate::permission::{Decision, PermissionRequest};
use crate::sandbox_policy::EnhancedInspector;
use futures::stream::{FuturesUnordered, StreamExt};
use serde_json::Value;
use std::collections::HashSet;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use ward_sandbox::ViolationSink;
use ward_tools::{Tool, ToolContext, ToolRegistry, ToolResult};

/// How often the parallel scheduler re-checks for newly ready steps.
const READY_POLL: Duration = Duration::from_millis(100);

/// Progress callbacks. Called synchronously from the executor; panics are
/// caught and logged.
pub trait PlanObserver: Send + Sync {
    fn on_step_start(&self, _plan_id: &str, _step: &PlanStep) {}
    fn on_step_complete(&self, _plan_id: &str, _step: &PlanStep) {}
    fn on_step_failed(&self, _plan_id: &str, _step: &PlanStep, _error: &str) {}
    fn on_plan_complete(&self, _plan: &ExecutionPlan) {}
}

enum Gate {
    Proceed(Value),
    Denied(String),
    Awaiting {
        decided_by: String,
        approval_id: Option<String>,
    },
}

enum StepFailure {
    Failed(String),
    Cancelled,
}

enum StepOutcome {
    Completed,
    Failed(String),
    Awaiting,
    Cancelled,
}

enum DependencyState {
    Ready,
    Waiting,
    Blocked(String),
}

struct ParallelState {
    steps: Vec<PlanStep>,
    current: Option<usize>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Runs plans against a tool registry.
pub struct PlanExecutor {
    tools: ToolRegistry,
    inspector: Option<Arc<EnhancedInspector>>,
    approvals: Option<ApprovalRegistry>,
    observers: Vec<Arc<dyn PlanObserver>>,
    context: ToolContext,
}

impl PlanExecutor {
    pub fn new(tools: ToolRegistry) -> Self {
        Self {
            tools,
            inspector: None,
            approvals: None,
            observers: Vec::new(),
            context: ToolContext::default(),
        }
    }

    /// Gate every step through `inspector`. Tools also get its current
    /// sandbox settings on every call and report violations to it.
    pub fn with_inspector(mut self, inspector: Arc<EnhancedInspector>) -> Self {
        let sink: Arc<dyn ViolationSink> = inspector.clone();
        self.context.violation_sink = Some(sink);
        self.inspector = Some(inspector);
        self
    }

    /// Register `ask` verdicts as pending approvals.
    pub fn with_approvals(mut self, approvals: ApprovalRegistry) -> Self {
        self.approvals = Some(approvals);
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn PlanObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    /// Base context for tool calls; `call_id` is set per step.
    pub fn with_context(mut self, context: ToolContext) -> Self {
        let sink = self.context.violation_sink.take();
        self.context = context;
        if self.context.violation_sink.is_none() {
            self.context.violation_sink = sink;
        }
        self
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    pub fn inspector(&self) -> Option<&Arc<EnhancedInspector>> {
        self.inspector.as_ref()
    }

    pub fn approvals(&self) -> Option<&ApprovalRegistry> {
        self.approvals.as_ref()
    }

    /// Run every pending step of `plan`.
    ///
    /// Returns the final plan status. Returns an error when the plan cannot
    /// execute, when the run was cancelled, or with the first step failure.
    pub async fn execute(
        &self,
        plan: &mut ExecutionPlan,
        cancel: &CancellationToken,
    ) -> Result<PlanStatus, PlanError> {
        if !plan.can_execute() {
            return Err(PlanError::NotExecutable {
                id: plan.id().to_string(),
                status: plan.status(),
            });
        }

        plan.begin_execution();
        tracing::info!(
            plan_id = %plan.id(),
            steps = plan.len(),
            parallel = plan.options().parallel,
            "executing plan"
        );

        let first_error = if plan.options().parallel {
            self.run_parallel(plan, cancel).await
        } else {
            self.run_sequential(plan, cancel).await
        };

        let status = plan.finish_execution(cancel.is_cancelled());
        tracing::info!(
            plan_id = %plan.id(),
            %status,
            duration_ms = plan.total_duration_ms(),
            "plan finished"
        );
        let finished: &ExecutionPlan = plan;
        self.notify(|observer| observer.on_plan_complete(finished));

        match (status, first_error) {
            (PlanStatus::Cancelled, _) => Err(PlanError::Cancelled("execution cancelled".to_string())),
            (_, Some(err)) => Err(err),
            (status, None) => Ok(status),
        }
    }

    /// Reset failed and skipped steps and run the plan again. Completed
    /// steps are not re-run.
    pub async fn resume(
        &self,
        plan: &mut ExecutionPlan,
        cancel: &CancellationToken,
    ) -> Result<PlanStatus, PlanError> {
        plan.prepare_resume()?;
        tracing::info!(plan_id = %plan.id(), "resuming plan");
        self.execute(plan, cancel).await
    }

    async fn run_sequential(
        &self,
        plan: &mut ExecutionPlan,
        cancel: &CancellationToken,
    ) -> Option<PlanError> {
        let options = plan.options().clone();
        let plan_id = plan.id().to_string();
        let mut first_error = None;
        let mut halted: Option<String> = None;

        for idx in 0..plan.len() {
            if cancel.is_cancelled() {
                break;
            }
            if plan.steps()[idx].status != StepStatus::Pending {
                continue;
            }
            if let Some(reason) = &halted {
                plan.steps_mut()[idx].mark_skipped(reason.clone());
                continue;
            }
            match dependency_state(plan.steps(), &plan.steps()[idx]) {
                DependencyState::Ready => {}
                DependencyState::Waiting => {
                    let reason = "dependency has not completed".to_string();
                    tracing::warn!(plan_id = %plan_id, step = idx, "{reason}");
                    plan.steps_mut()[idx].mark_skipped(reason);
                    continue;
                }
                DependencyState::Blocked(reason) => {
                    tracing::warn!(plan_id = %plan_id, step = idx, "{reason}");
                    plan.steps_mut()[idx].mark_skipped(reason);
                    continue;
                }
            }

            let step = plan.steps()[idx].clone();
            let (step, outcome) = self
                .run_step(&plan_id, step, &options, cancel, |started| {
                    plan.set_current_step(started.index)
                })
                .await;
            let step_id = step.id.clone();
            plan.steps_mut()[idx] = step;

            match outcome {
                StepOutcome::Completed => {}
                StepOutcome::Failed(message) => {
                    if first_error.is_none() {
                        first_error = Some(PlanError::StepFailed {
                            step_id: step_id.clone(),
                            message,
                        });
                    }
                    if options.stop_on_error {
                        halted = Some(format!("skipped: step '{step_id}' failed"));
                    }
                }
                // Later steps wait for the approval.
                StepOutcome::Awaiting | StepOutcome::Cancelled => break,
            }
        }

        first_error
    }

    async fn run_parallel(
        &self,
        plan: &mut ExecutionPlan,
        cancel: &CancellationToken,
    ) -> Option<PlanError> {
        let options = plan.options().clone();
        let plan_id = plan.id().to_string();
        let shared = Mutex::new(ParallelState {
            steps: std::mem::take(plan.steps_mut()),
            current: plan.current_step(),
        });
        let semaphore = Semaphore::new(options.max_parallel_steps.max(1));
        let mut dispatched = HashSet::new();
        let mut in_flight = FuturesUnordered::new();
        let mut first_error = None;
        let mut halted = false;

        loop {
            if !halted && !cancel.is_cancelled() {
                for idx in ready_steps(&shared, &dispatched) {
                    dispatched.insert(idx);
                    in_flight.push(self.run_parallel_step(
                        &plan_id, &shared, idx, &semaphore, &options, cancel,
                    ));
                }
            }
            if in_flight.is_empty() {
                break;
            }

            tokio::select! {
                Some((idx, outcome)) = in_flight.next() => {
                    if let StepOutcome::Failed(message) = outcome {
                        if first_error.is_none() {
                            let step_id = lock(&shared).steps[idx].id.clone();
                            first_error = Some(PlanError::StepFailed { step_id, message });
                        }
                        if options.stop_on_error && !halted {
                            tracing::warn!(plan_id = %plan_id, "step failed; no further steps will start");
                            halted = true;
                        }
                    }
                }
                _ = tokio::time::sleep(READY_POLL) => {}
                _ = cancel.cancelled(), if !cancel.is_cancelled() => {}
            }
        }
        drop(in_flight);

        let mut state = shared.into_inner().unwrap_or_else(PoisonError::into_inner);
        if halted {
            skip_pending(&mut state.steps, "skipped: an earlier step failed");
        } else if !cancel.is_cancelled() && !state.steps.iter().any(PlanStep::awaiting_approval) {
            // Nothing left can make these ready (e.g. a dependency cycle).
            skip_pending(&mut state.steps, "dependencies never completed");
        }
        *plan.steps_mut() = state.steps;
        if let Some(current) = state.current {
            plan.set_current_step(current);
        }
        first_error
    }

    async fn run_parallel_step(
        &self,
        plan_id: &str,
        shared: &Mutex<ParallelState>,
        idx: usize,
        semaphore: &Semaphore,
        options: &ExecutionOptions,
        cancel: &CancellationToken,
    ) -> (usize, StepOutcome) {
        let _permit = tokio::select! {
            permit = semaphore.acquire() => match permit {
                Ok(permit) => permit,
                Err(_) => return (idx, StepOutcome::Cancelled),
            },
            _ = cancel.cancelled() => return (idx, StepOutcome::Cancelled),
        };

        let step = lock(shared).steps[idx].clone();
        let (step, outcome) = self
            .run_step(plan_id, step, options, cancel, |started| {
                let mut state = lock(shared);
                state.steps[idx] = started.clone();
                state.current = Some(idx);
            })
            .await;
        lock(shared).steps[idx] = step;
        (idx, outcome)
    }

    /// Gate, execute and retry one step. `on_start` sees the step once it is
    /// marked running.
    async fn run_step<F>(
        &self,
        plan_id: &str,
        mut step: PlanStep,
        options: &ExecutionOptions,
        cancel: &CancellationToken,
        on_start: F,
    ) -> (PlanStep, StepOutcome)
    where
        F: FnOnce(&PlanStep) + Send,
    {
        let Some(tool) = self.tools.get(&step.tool_name) else {
            let message = format!("unknown tool '{}'", step.tool_name);
            return self.fail(plan_id, step, message);
        };

        let input = match self.gate(plan_id, &step).await {
            Gate::Proceed(input) => {
                step.approved = false;
                self.discard_approval(&mut step).await;
                input
            }
            Gate::Denied(reason) => {
                self.discard_approval(&mut step).await;
                return self.fail(plan_id, step, reason);
            }
            Gate::Awaiting {
                decided_by,
                approval_id,
            } => {
                tracing::info!(
                    plan_id,
                    step_id = %step.id,
                    decided_by = %decided_by,
                    "step awaiting approval"
                );
                step.mark_awaiting(decided_by, approval_id);
                return (step, StepOutcome::Awaiting);
            }
        };

        step.mark_running();
        on_start(&step);
        self.notify(|observer| observer.on_step_start(plan_id, &step));
        tracing::debug!(plan_id, step_id = %step.id, tool = %step.tool_name, "step started");

        let max_retries = step.max_retries.unwrap_or(options.max_retries);
        let delay = Duration::from_millis(step.retry_delay_ms.unwrap_or(options.retry_delay_ms));
        let (result, retries) = self
            .run_tool(&step.id, tool, input, max_retries, delay, options.step_timeout_ms, cancel)
            .await;
        step.retry_count = retries;

        match result {
            Ok(result) => {
                step.mark_completed(result);
                self.notify(|observer| observer.on_step_complete(plan_id, &step));
                tracing::debug!(plan_id, step_id = %step.id, duration_ms = step.duration_ms, "step completed");
                (step, StepOutcome::Completed)
            }
            Err(StepFailure::Cancelled) => {
                step.mark_skipped("plan cancelled");
                (step, StepOutcome::Cancelled)
            }
            Err(StepFailure::Failed(message)) => self.fail(plan_id, step, message),
        }
    }

    /// Drop the step's outstanding approval once the gate no longer waits
    /// on it.
    async fn discard_approval(&self, step: &mut PlanStep) {
        let Some(id) = step.approval_id.take() else {
            return;
        };
        if let Some(approvals) = &self.approvals {
            approvals.discard(&id).await;
        }
    }

    fn fail(&self, plan_id: &str, mut step: PlanStep, message: String) -> (PlanStep, StepOutcome) {
        tracing::warn!(plan_id, step_id = %step.id, error = %message, "step failed");
        step.mark_failed(message.clone());
        self.notify(|observer| observer.on_step_failed(plan_id, &step, &message));
        (step, StepOutcome::Failed(message))
    }

    async fn gate(&self, plan_id: &str, step: &PlanStep) -> Gate {
        let Some(inspector) = &self.inspector else {
            return Gate::Proceed(step.input.clone());
        };
        if step.approved {
            return Gate::Proceed(step.input.clone());
        }

        let request = PermissionRequest::new(step.tool_name.clone(), step.input.clone())
            .with_call_id(step.id.clone())
            .with_context("plan_id", Value::String(plan_id.to_string()));
        let mut response = match inspector.check(&request).await {
            Ok(response) => response,
            Err(err) => return Gate::Denied(err.to_string()),
        };

        match response.decision {
            Decision::Allow => Gate::Proceed(
                response
                    .updated_input
                    .take()
                    .map(Value::Object)
                    .unwrap_or_else(|| step.input.clone()),
            ),
            Decision::Deny => Gate::Denied(format!(
                "permission denied by {}: {}",
                response.decided_by, response.message
            )),
            Decision::Ask => {
                if let Some(approvals) = &self.approvals {
                    match step.approval_id.as_deref() {
                        Some(id) if approvals.get(id).await.is_some() => {
                            response.approval_id = Some(id.to_string());
                        }
                        _ => {
                            let _receiver = approvals.request(&request, &mut response).await;
                        }
                    }
                }
                Gate::Awaiting {
                    decided_by: response.decided_by,
                    approval_id: response.approval_id,
                }
            }
        }
    }

    /// Up to `max_retries + 1` attempts. Returns the result and the number
    /// of retries used.
    #[allow(clippy::too_many_arguments)]
    async fn run_tool(
        &self,
        step_id: &str,
        tool: Arc<dyn Tool>,
        input: Value,
        max_retries: u32,
        delay: Duration,
        timeout_ms: u64,
        cancel: &CancellationToken,
    ) -> (Result<ToolResult, StepFailure>, u32) {
        let mut ctx = self.context.clone();
        ctx.call_id = step_id.to_string();
        if let Some(inspector) = &self.inspector {
            ctx.sandbox = inspector.sandbox_config().settings;
        }
        let mut last_error = String::new();

        for attempt in 0..=max_retries {
            if attempt > 0 {
                tokio::select! {
                    _ = cancel.cancelled() => return (Err(StepFailure::Cancelled), attempt - 1),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            match attempt_once(tool.as_ref(), input.clone(), &ctx, timeout_ms, cancel).await {
                Ok(result) => return (Ok(result), attempt),
                Err(StepFailure::Cancelled) => return (Err(StepFailure::Cancelled), attempt),
                Err(StepFailure::Failed(message)) => {
                    tracing::warn!(step_id, attempt, error = %message, "step attempt failed");
                    last_error = message;
                }
            }
        }
        (Err(StepFailure::Failed(last_error)), max_retries)
    }

    fn notify(&self, call: impl Fn(&dyn PlanObserver)) {
        for observer in &self.observers {
            if catch_unwind(AssertUnwindSafe(|| call(observer.as_ref()))).is_err() {
                tracing::warn!("plan observer panicked; ignoring");
            }
        }
    }
}

async fn attempt_once(
    tool: &dyn Tool,
    input: Value,
    ctx: &ToolContext,
    timeout_ms: u64,
    cancel: &CancellationToken,
) -> Result<ToolResult, StepFailure> {
    let call = async {
        let result = if timeout_ms > 0 {
            match tokio::time::timeout(Duration::from_millis(timeout_ms), tool.execute(input, ctx)).await {
                Ok(result) => result,
                Err(_) => {
                    return Err(StepFailure::Failed(format!("timed out after {timeout_ms} ms")));
                }
            }
        } else {
            tool.execute(input, ctx).await
        };
        match result {
            Ok(result) if result.is_error => Err(StepFailure::Failed(result.output)),
            Ok(result) => Ok(result),
            Err(err) => Err(StepFailure::Failed(err.to_string())),
        }
    };

    tokio::select! {
        _ = cancel.cancelled() => Err(StepFailure::Cancelled),
        result = call => result,
    }
}

fn dependency_state(steps: &[PlanStep], step: &PlanStep) -> DependencyState {
    let mut waiting = false;
    for dep in &step.depends_on {
        match steps.iter().find(|candidate| &candidate.id == dep) {
            None => return DependencyState::Blocked(format!("dependency '{dep}' does not exist")),
            Some(found) => match found.status {
                StepStatus::Completed => {}
                StepStatus::Failed | StepStatus::Skipped => {
                    return DependencyState::Blocked(format!("dependency '{dep}' did not complete"));
                }
                StepStatus::Pending | StepStatus::Running => waiting = true,
            },
        }
    }
    if waiting {
        DependencyState::Waiting
    } else {
        DependencyState::Ready
    }
}

/// Pending, undispatched steps whose dependencies are complete. Steps with
/// an unresolvable dependency are skipped along the way.
fn ready_steps(shared: &Mutex<ParallelState>, dispatched: &HashSet<usize>) -> Vec<usize> {
    let mut state = lock(shared);
    let mut ready = Vec::new();
    loop {
        let mut changed = false;
        for idx in 0..state.steps.len() {
            if state.steps[idx].status != StepStatus::Pending
                || dispatched.contains(&idx)
                || ready.contains(&idx)
            {
                continue;
            }
            match dependency_state(&state.steps, &state.steps[idx]) {
                DependencyState::Ready => ready.push(idx),
                DependencyState::Waiting => {}
                DependencyState::Blocked(reason) => {
                    tracing::warn!(step = idx, "{reason}");
                    state.steps[idx].mark_skipped(reason);
                    changed = true;
                }
            }
        }
        if !changed {
            return ready;
        }
    }
}

fn skip_pending(steps: &mut [PlanStep], reason: &str) {
    for step in steps {
        if step.status == StepStatus::Pending {
            step.mark_skipped(reason);
        }
    }
}
