//! Tool trait definition and common types.

use crate::error::ToolError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use ward_sandbox::{SandboxSettings, ViolationSink};

/// Context provided to tools during execution.
#[derive(Clone)]
pub struct ToolContext {
    /// Current working directory.
    pub working_dir: PathBuf,
    /// Agent session the call belongs to.
    pub session_id: String,
    /// Identifier of the tool call (plan step ID or model call ID).
    pub call_id: String,
    /// Execution timeout.
    pub timeout: Duration,
    /// Sandbox settings in effect for this call.
    pub sandbox: SandboxSettings,
    /// Where sandbox violations observed during the call are reported.
    pub violation_sink: Option<Arc<dyn ViolationSink>>,
}

impl Default for ToolContext {
    fn default() -> Self {
        Self {
            working_dir: std::env::current_dir().unwrap_or_default(),
            session_id: String::new(),
            call_id: String::new(),
            timeout: Duration::from_secs(120),
            sandbox: SandboxSettings::default(),
            violation_sink: None,
        }
    }
}

impl fmt::Debug for ToolContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolContext")
            .field("working_dir", &self.working_dir)
            .field("session_id", &self.session_id)
            .field("call_id", &self.call_id)
            .field("timeout", &self.timeout)
            .field("sandbox", &self.sandbox)
            .field("violation_sink", &self.violation_sink.is_some())
            .finish()
    }
}

/// Result of a tool execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    /// Output text.
    pub output: String,
    /// Optional metadata (exit code, sandbox state, ...).
    pub metadata: serde_json::Value,
    /// Whether the result represents an error.
    pub is_error: bool,
}

impl ToolResult {
    pub fn success(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            metadata: serde_json::Value::Null,
            is_error: false,
        }
    }

    pub fn success_with_metadata(output: impl Into<String>, metadata: serde_json::Value) -> Self {
        Self {
            output: output.into(),
            metadata,
            is_error: false,
        }
    }

    pub fn error(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            metadata: serde_json::Value::Null,
            is_error: true,
        }
    }
}

/// A capability the agent can invoke against the environment.
///
/// The permission engine never looks inside a tool; it only decides whether
/// `execute` may be called and with which arguments.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Machine-readable tool name (e.g., "bash").
    fn name(&self) -> &str;

    /// Description of what the tool does.
    fn description(&self) -> &str;

    /// JSON Schema describing the tool's parameters.
    fn parameters_schema(&self) -> serde_json::Value;

    /// Execute the tool with the given arguments.
    async fn execute(
        &self,
        args: serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<ToolResult, ToolError>;
}

// Compile-time check: Tool must be object-safe
const _: () = {
    fn _assert_object_safe(_: &dyn Tool) {}
};
