//! Error types for the ward-core crate.

use std::fmt;

/// Configuration and persistence errors.
#[derive(Debug, thiserror::Error)]
pub enum WardError {
    /// I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Generic error with message
    #[error("{0}")]
    Other(String),
}

/// Run-time policy for persistence side effects: a failure is logged and
/// dropped, and the in-memory state stays authoritative for this process.
pub(crate) fn best_effort<T, E: fmt::Display>(operation: &str, result: Result<T, E>) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(err) => {
            tracing::warn!(operation, error = %err, "best-effort operation failed; continuing");
            None
        }
    }
}
