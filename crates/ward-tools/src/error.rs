//! Error types for the ward-tools crate.

/// Errors a tool can return from `execute`.
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    /// Arguments did not match the tool's parameter schema.
    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    /// The tool ran and failed.
    #[error("Execution error: {0}")]
    ExecutionError(String),

    /// The environment refused the operation.
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    /// The surrounding execution was cancelled.
    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
