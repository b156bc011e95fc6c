use anyhow::Context;
use serde::Deserialize;
use std::io::{BufRead, IsTerminal, Write};
use std::path::Path;
use std::sync::Arc;
use ward_core::{
    ApprovalRegistry, Config, ExecutionOptions, ExecutionPlan, ExecutionPlanManager,
    PendingApproval, PlanError, PlanExecutor, PlanObserver, PlanStatus, PlanStep, RuleDecision,
    StepStatus,
};

pub struct PlanOptions {
    pub approve: bool,
    pub parallel: bool,
    pub json: bool,
}

/// On-disk plan format.
#[derive(Debug, Deserialize)]
struct PlanFile {
    description: String,
    #[serde(default)]
    agent_id: Option<String>,
    /// Falls back to the config's execution defaults.
    #[serde(default)]
    options: Option<ExecutionOptions>,
    steps: Vec<PlanStep>,
}

/// Progress lines on stderr.
struct ConsoleObserver;

impl PlanObserver for ConsoleObserver {
    fn on_step_start(&self, _plan_id: &str, step: &PlanStep) {
        eprintln!("[{}] {} ...", step.index + 1, step_label(step));
    }

    fn on_step_complete(&self, _plan_id: &str, step: &PlanStep) {
        eprintln!("[{}] done ({} ms)", step.index + 1, step.duration_ms);
    }

    fn on_step_failed(&self, _plan_id: &str, step: &PlanStep, error: &str) {
        eprintln!("[{}] failed: {error}", step.index + 1);
    }
}

pub async fn run(config: &Config, path: &Path, options: PlanOptions) -> anyhow::Result<PlanStatus> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read plan file {}", path.display()))?;
    let plan = parse_plan(&content, &config.execution, options.parallel)?;

    let inspector = Arc::new(config.build_enhanced_inspector());
    let approvals = ApprovalRegistry::new(Arc::clone(&inspector));
    let mut executor = PlanExecutor::new(super::load_tool_registry())
        .with_inspector(inspector)
        .with_approvals(approvals);
    if !options.json {
        executor = executor.with_observer(Arc::new(ConsoleObserver));
    }
    let manager = ExecutionPlanManager::new(executor, config.execution.clone());
    let id = manager.insert(plan);
    tracing::debug!(plan_id = %id, path = %path.display(), "loaded plan file");

    if !manager.snapshot(&id).await?.can_execute() {
        if !options.approve {
            let plan = manager.snapshot(&id).await?;
            print_preview(&plan);
            println!("Plan requires approval; re-run with --yes to execute it.");
            return Ok(plan.status());
        }
        manager.approve(&id, "cli").await?;
    }

    let mut result = manager.execute(&id).await;
    loop {
        let status = manager.snapshot(&id).await?.status();
        if status != PlanStatus::PendingApproval || !std::io::stdin().is_terminal() {
            break;
        }
        if !review_pending(&manager, &id).await? {
            manager.cancel(&id, "approval refused").await?;
            break;
        }
        result = manager.resume(&id).await;
    }

    let plan = manager.snapshot(&id).await?;
    if options.json {
        println!("{}", serde_json::to_string_pretty(&plan)?);
    } else {
        print_report(&plan);
    }

    match result {
        Ok(_) | Err(PlanError::StepFailed { .. }) | Err(PlanError::Cancelled(_)) => Ok(plan.status()),
        Err(err) => Err(err.into()),
    }
}

/// Exit code for a finished plan: 0 completed, 2 waiting on approval,
/// 1 otherwise.
pub fn exit_code(status: PlanStatus) -> i32 {
    match status {
        PlanStatus::Completed => 0,
        PlanStatus::PendingApproval | PlanStatus::Draft | PlanStatus::Approved => 2,
        _ => 1,
    }
}

fn parse_plan(
    content: &str,
    defaults: &ExecutionOptions,
    parallel: bool,
) -> anyhow::Result<ExecutionPlan> {
    let file: PlanFile = serde_json::from_str(content).context("Invalid plan file")?;
    if file.steps.is_empty() {
        anyhow::bail!("Plan has no steps");
    }

    let mut options = file.options.unwrap_or_else(|| defaults.clone());
    if parallel {
        options.parallel = true;
    }
    let mut plan = ExecutionPlan::new(file.description, options);
    if let Some(agent_id) = file.agent_id {
        plan = plan.with_agent(agent_id);
    }
    for step in file.steps {
        plan.add_step(step);
    }
    Ok(plan)
}

/// Prompt for every pending approval. Returns false once one is refused.
async fn review_pending(manager: &ExecutionPlanManager, plan_id: &str) -> anyhow::Result<bool> {
    let Some(approvals) = manager.executor().approvals() else {
        return Ok(false);
    };
    for pending in approvals.pending_list().await {
        let decision = prompt_decision(&pending)?;
        manager
            .resolve_approval(plan_id, &pending.id, decision, "")
            .await?;
        if !decision.allows() {
            return Ok(false);
        }
    }
    Ok(true)
}

fn prompt_decision(pending: &PendingApproval) -> anyhow::Result<RuleDecision> {
    let arguments = serde_json::to_string(&pending.request.arguments)?;
    eprintln!(
        "\n{} wants to run with {arguments}\n  {} ({})",
        pending.request.tool_name, pending.message, pending.decided_by
    );
    eprint!("Allow? [y]es / [n]o / [a]lways / ne[v]er: ");
    std::io::stderr().flush()?;

    let mut answer = String::new();
    std::io::stdin().lock().read_line(&mut answer)?;
    Ok(parse_answer(&answer))
}

fn parse_answer(answer: &str) -> RuleDecision {
    match answer.trim().to_ascii_lowercase().as_str() {
        "y" | "yes" => RuleDecision::Allow,
        "a" | "always" => RuleDecision::AllowAlways,
        "v" | "never" => RuleDecision::DenyAlways,
        _ => RuleDecision::Deny,
    }
}

fn step_label(step: &PlanStep) -> String {
    if step.description.is_empty() {
        step.tool_name.clone()
    } else {
        format!("{}: {}", step.tool_name, step.description)
    }
}

fn status_tag(step: &PlanStep) -> &'static str {
    if step.awaiting_approval() {
        return "awaiting";
    }
    match step.status {
        StepStatus::Pending => "pending",
        StepStatus::Running => "running",
        StepStatus::Completed => "ok",
        StepStatus::Failed => "failed",
        StepStatus::Skipped => "skipped",
    }
}

fn print_preview(plan: &ExecutionPlan) {
    println!("Plan: {} ({} steps)", plan.description(), plan.len());
    for step in plan.steps() {
        let mut line = format!("  {}. {}", step.index + 1, step_label(step));
        if !step.depends_on.is_empty() {
            line.push_str(&format!(" (after {})", step.depends_on.join(", ")));
        }
        println!("{line}");
    }
}

fn print_report(plan: &ExecutionPlan) {
    println!(
        "Plan {} {} in {} ms",
        plan.id(),
        plan.status(),
        plan.total_duration_ms()
    );
    for step in plan.steps() {
        println!(
            "  [{:>8}] {}. {}",
            status_tag(step),
            step.index + 1,
            step_label(step)
        );
        if let Some(error) = &step.error {
            println!("             {error}");
        }
    }
    let summary = plan.summary();
    println!(
        "{} completed, {} failed, {} skipped, {} awaiting approval ({:.0}%)",
        summary.completed,
        summary.failed,
        summary.skipped,
        summary.awaiting_approval,
        plan.progress() * 100.0
    );
}
