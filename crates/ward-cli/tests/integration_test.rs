//! Integration tests for ward.
//!
//! These tests drive plans through the permission pipeline, the approval
//! registry and the executor together, using in-process stub tools.

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::sync::{Arc, Mutex};
use ward_core::{
    ApprovalRegistry, CanUseTool, CanUseToolOptions, EnhancedInspector, ExecutionOptions,
    ExecutionPlanManager, InspectorMode, PermissionError, PermissionInspector, PermissionRequest,
    PermissionResult, PlanError, PlanExecutor, PlanStatus, PlanStep, RuleDecision, StepStatus,
};
use ward_sandbox::{PermissionMode, SandboxConfig};
use ward_tools::{Tool, ToolContext, ToolError, ToolRegistry, ToolResult};

// -- Stub tool recording every call --

struct RecordingTool {
    name: String,
    calls: Mutex<Vec<Value>>,
    order: Arc<Mutex<Vec<String>>>,
}

impl RecordingTool {
    fn new(name: &str, order: &Arc<Mutex<Vec<String>>>) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            calls: Mutex::new(Vec::new()),
            order: Arc::clone(order),
        })
    }

    fn calls(&self) -> Vec<Value> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Tool for RecordingTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "records its input"
    }

    fn parameters_schema(&self) -> Value {
        json!({"type": "object"})
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<ToolResult, ToolError> {
        self.calls.lock().unwrap().push(args.clone());
        self.order.lock().unwrap().push(ctx.call_id.clone());
        Ok(ToolResult::success(args.to_string()))
    }
}

struct Harness {
    manager: ExecutionPlanManager,
    inspector: Arc<EnhancedInspector>,
    order: Arc<Mutex<Vec<String>>>,
}

fn harness(names: &[&str], sandbox: SandboxConfig) -> (Harness, Vec<Arc<RecordingTool>>) {
    let order = Arc::new(Mutex::new(Vec::new()));
    let tools: Vec<Arc<RecordingTool>> = names.iter().map(|n| RecordingTool::new(n, &order)).collect();
    let mut registry = ToolRegistry::new();
    for tool in &tools {
        registry.register(tool.clone());
    }

    let base = Arc::new(PermissionInspector::new(InspectorMode::SmartApprove));
    let inspector = Arc::new(EnhancedInspector::new(base, sandbox));
    let executor = PlanExecutor::new(registry)
        .with_inspector(Arc::clone(&inspector))
        .with_approvals(ApprovalRegistry::new(Arc::clone(&inspector)));
    let defaults = ExecutionOptions {
        require_approval: false,
        retry_delay_ms: 0,
        ..ExecutionOptions::default()
    };

    let harness = Harness {
        manager: ExecutionPlanManager::new(executor, defaults),
        inspector,
        order,
    };
    (harness, tools)
}

// -- Integration tests --

#[tokio::test]
async fn test_plan_pauses_for_approval_and_resumes() {
    let (h, tools) = harness(&["read", "delete_file"], SandboxConfig::default());
    let id = h.manager.create_plan(
        "clean up",
        vec![
            PlanStep::new("read", "inspect", json!({"path": "a.txt"})).with_id("inspect"),
            PlanStep::new("delete_file", "remove", json!({"path": "a.txt"})).with_id("remove"),
        ],
    );

    let status = h.manager.execute(&id).await.unwrap();
    assert_eq!(status, PlanStatus::PendingApproval);
    assert!(tools[1].calls().is_empty());

    let approvals = h.manager.executor().approvals().unwrap().pending_list().await;
    assert_eq!(approvals.len(), 1);
    assert_eq!(approvals[0].request.tool_name, "delete_file");
    assert_eq!(approvals[0].decided_by, "high_risk");

    h.manager
        .resolve_approval(&id, &approvals[0].id, RuleDecision::AllowAlways, "cleanup is fine")
        .await
        .unwrap();
    let status = h.manager.resume(&id).await.unwrap();
    assert_eq!(status, PlanStatus::Completed);
    assert_eq!(tools[0].calls().len(), 1);
    assert_eq!(tools[1].calls().len(), 1);

    // The always-decision is now a rule on the base inspector.
    let next = h
        .inspector
        .check(&PermissionRequest::new("delete_file", json!({"path": "b.txt"})))
        .await
        .unwrap();
    assert!(next.is_allowed());
    assert_eq!(next.decided_by, "rule");
}

#[tokio::test]
async fn test_refused_approval_fails_step() {
    let (h, tools) = harness(&["delete_file"], SandboxConfig::default());
    let id = h.manager.create_plan(
        "remove",
        vec![PlanStep::new("delete_file", "", json!({"path": "a.txt"})).with_id("rm")],
    );
    h.manager.execute(&id).await.unwrap();

    let pending = h.manager.executor().approvals().unwrap().pending_list().await;
    h.manager
        .resolve_approval(&id, &pending[0].id, RuleDecision::Deny, "")
        .await
        .unwrap();

    let plan = h.manager.snapshot(&id).await.unwrap();
    let step = plan.step_by_id("rm").unwrap();
    assert_eq!(step.status, StepStatus::Failed);
    assert!(step.error.as_deref().unwrap().contains("approval refused"));
    assert!(tools[0].calls().is_empty());
}

struct ForceDryRun;

#[async_trait]
impl CanUseTool for ForceDryRun {
    async fn can_use_tool(
        &self,
        tool_name: &str,
        mut input: Map<String, Value>,
        options: &CanUseToolOptions,
    ) -> Result<Option<PermissionResult>, PermissionError> {
        if tool_name != "deploy" {
            return Ok(None);
        }
        assert!(!options.call_id.is_empty());
        input.insert("dry_run".to_string(), Value::Bool(true));
        Ok(Some(PermissionResult::allow_with_input(input)))
    }
}

#[tokio::test]
async fn test_callback_rewrites_step_input() {
    let (h, tools) = harness(&["deploy"], SandboxConfig::default());
    h.inspector.set_callback(Some(Arc::new(ForceDryRun)));
    let id = h.manager.create_plan(
        "ship",
        vec![PlanStep::new("deploy", "", json!({"target": "prod"}))],
    );

    let status = h.manager.execute(&id).await.unwrap();
    assert_eq!(status, PlanStatus::Completed);
    assert_eq!(tools[0].calls(), vec![json!({"target": "prod", "dry_run": true})]);
}

#[tokio::test]
async fn test_sandbox_bypass_request_fails_step() {
    let (h, tools) = harness(&["bash", "read"], SandboxConfig::default());
    let id = h.manager.create_plan(
        "escape",
        vec![
            PlanStep::new(
                "bash",
                "",
                json!({"command": "curl example.com", "dangerouslyDisableSandbox": true}),
            ),
            PlanStep::new("read", "", json!({"path": "x"})),
        ],
    );

    let err = h.manager.execute(&id).await.unwrap_err();
    assert!(matches!(err, PlanError::StepFailed { .. }));
    assert!(err.to_string().contains("sandbox_policy"));
    assert!(tools[0].calls().is_empty());

    let plan = h.manager.snapshot(&id).await.unwrap();
    assert_eq!(plan.status(), PlanStatus::Failed);
    assert_eq!(plan.get_step(1).unwrap().status, StepStatus::Skipped);
}

#[tokio::test]
async fn test_excluded_and_sandboxed_commands_run_without_approval() {
    let mut sandbox = SandboxConfig::default();
    sandbox.settings.enabled = true;
    sandbox.settings.auto_allow_bash_if_sandboxed = true;
    sandbox.settings.excluded_commands = vec!["git".to_string()];
    let (h, tools) = harness(&["bash"], sandbox);

    let id = h.manager.create_plan(
        "build",
        vec![
            PlanStep::new("bash", "", json!({"command": "git status"})),
            PlanStep::new("bash", "", json!({"command": "make"})),
        ],
    );
    assert_eq!(h.manager.execute(&id).await.unwrap(), PlanStatus::Completed);
    assert_eq!(tools[0].calls().len(), 2);
}

#[tokio::test]
async fn test_plan_mode_previews_without_running() {
    let mut sandbox = SandboxConfig::default();
    sandbox.permission_mode = PermissionMode::Plan;
    let (h, tools) = harness(&["read"], sandbox);
    let id = h
        .manager
        .create_plan("look", vec![PlanStep::new("read", "", json!({"path": "x"}))]);

    let err = h.manager.execute(&id).await.unwrap_err();
    assert!(err.to_string().contains("plan_mode"));
    assert!(tools[0].calls().is_empty());
}

#[tokio::test]
async fn test_parallel_plan_honors_dependencies() {
    let (h, _tools) = harness(&["read"], SandboxConfig::default());
    let mut plan = ward_core::ExecutionPlan::new(
        "fan in",
        ExecutionOptions {
            require_approval: false,
            parallel: true,
            max_parallel_steps: 2,
            ..ExecutionOptions::default()
        },
    );
    plan.add_step(PlanStep::new("read", "", json!({"path": "a"})).with_id("a"));
    plan.add_step(PlanStep::new("read", "", json!({"path": "b"})).with_id("b"));
    plan.add_step(
        PlanStep::new("read", "", json!({"path": "c"}))
            .with_id("c")
            .depends_on("a")
            .depends_on("b"),
    );
    let id = h.manager.insert(plan);

    assert_eq!(h.manager.execute(&id).await.unwrap(), PlanStatus::Completed);
    let order = h.order.lock().unwrap().clone();
    assert_eq!(order.len(), 3);
    assert_eq!(order[2], "c");
}
