//! Bash tool: shell command execution under the sandbox settings of the call.

use crate::error::ToolError;
use crate::traits::{Tool, ToolContext, ToolResult};
use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use ward_sandbox::{run_shell_command, SandboxError};

const MAX_OUTPUT_BYTES: usize = 50 * 1024; // 50KB

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct BashParams {
    /// Shell command to execute.
    pub command: String,
    /// Optional timeout in seconds. Default: the context timeout.
    #[serde(default)]
    pub timeout: Option<u64>,
    /// Run outside the sandbox. Only honored when policy allowed the call.
    #[serde(default, rename = "dangerouslyDisableSandbox")]
    pub dangerously_disable_sandbox: bool,
}

pub struct BashTool;

#[async_trait]
impl Tool for BashTool {
    fn name(&self) -> &str {
        "bash"
    }

    fn description(&self) -> &str {
        "Execute a shell command and return stdout/stderr."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::to_value(schemars::schema_for!(BashParams)).unwrap_or_else(|_| {
            serde_json::json!({"type": "object", "required": ["command"]})
        })
    }

    async fn execute(
        &self,
        args: serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<ToolResult, ToolError> {
        let params: BashParams = serde_json::from_value(args)
            .map_err(|e| ToolError::InvalidParameters(e.to_string()))?;

        let timeout_secs = params.timeout.unwrap_or(ctx.timeout.as_secs());
        let timeout = std::time::Duration::from_secs(timeout_secs);

        let output = run_shell_command(
            &params.command,
            &ctx.working_dir,
            timeout,
            &ctx.sandbox,
            params.dangerously_disable_sandbox,
        )
        .await
        .map_err(|e| match e {
            SandboxError::Timeout(_) => {
                ToolError::Timeout(format!("Command timed out after {timeout_secs}s"))
            }
            SandboxError::BackendUnavailable(msg) => ToolError::PermissionDenied(msg),
            other => ToolError::ExecutionError(other.to_string()),
        })?;

        let violation_count = output.violations.len();
        if let Some(sink) = &ctx.violation_sink {
            for violation in output.violations {
                sink.record_violation(violation);
            }
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        let mut text = String::new();
        if !stdout.is_empty() {
            text.push_str(&stdout);
        }
        if !stderr.is_empty() {
            if !text.is_empty() {
                text.push('\n');
            }
            text.push_str("STDERR:\n");
            text.push_str(&stderr);
        }

        if text.len() > MAX_OUTPUT_BYTES {
            let mut cut = MAX_OUTPUT_BYTES;
            while !text.is_char_boundary(cut) {
                cut -= 1;
            }
            text.truncate(cut);
            text.push_str("\n\n... (truncated at 50KB)");
        }
        if text.is_empty() {
            text = "(no output)".to_string();
        }

        let is_error = !output.success;
        if is_error {
            text = format!("Exit code: {}\n{text}", output.exit_code);
        }

        Ok(ToolResult {
            output: text,
            metadata: serde_json::json!({
                "exit_code": output.exit_code,
                "sandboxed": output.sandboxed,
                "violations": violation_count,
            }),
            is_error,
        })
    }
}
