//! Sandbox violation records and stderr-based detection.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Resource class a violation touched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ViolationKind {
    Filesystem,
    Network,
    Process,
}

/// One sandbox violation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Violation {
    #[serde(rename = "type")]
    pub kind: ViolationKind,
    /// Path or host involved, empty when unknown.
    pub path: String,
    /// Operation that was attempted (write, access, connect, signal).
    pub operation: String,
    /// Whether the sandbox blocked the operation.
    pub blocked: bool,
    pub timestamp: DateTime<Utc>,
    /// Raw diagnostic line.
    pub details: String,
}

impl Violation {
    pub fn new(kind: ViolationKind, path: impl Into<String>, operation: impl Into<String>) -> Self {
        Self {
            kind,
            path: path.into(),
            operation: operation.into(),
            blocked: true,
            timestamp: Utc::now(),
            details: String::new(),
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = details.into();
        self
    }
}

/// Receiver for violations observed while a tool runs.
pub trait ViolationSink: Send + Sync {
    fn record_violation(&self, violation: Violation);
}

const NETWORK_MARKERS: &[&str] = &[
    "Network is unreachable",
    "Could not resolve host",
    "Temporary failure in name resolution",
    "Name or service not known",
];

/// Scan the stderr of a sandboxed command for signs of blocked operations.
pub fn detect_violations(stderr: &str) -> Vec<Violation> {
    stderr.lines().filter_map(classify_line).collect()
}

fn classify_line(line: &str) -> Option<Violation> {
    let line = line.trim();
    let (kind, operation) = if line.contains("Read-only file system") {
        (ViolationKind::Filesystem, "write")
    } else if NETWORK_MARKERS.iter().any(|marker| line.contains(marker)) {
        (ViolationKind::Network, "connect")
    } else if line.contains("Operation not permitted") {
        if line.contains("kill") || line.contains("ptrace") {
            (ViolationKind::Process, "signal")
        } else {
            (ViolationKind::Filesystem, "access")
        }
    } else {
        return None;
    };

    Some(Violation::new(kind, extract_subject(line), operation).with_details(line))
}

/// Pull the quoted path (`'...'` or `‘...’`) or the first `/`-rooted segment.
fn extract_subject(line: &str) -> String {
    for (open, close) in [('\'', '\''), ('‘', '’'), ('"', '"')] {
        if let Some(start) = line.find(open) {
            let rest = &line[start + open.len_utf8()..];
            if let Some(end) = rest.find(close) {
                return rest[..end].to_string();
            }
        }
    }

    line.split(": ")
        .map(str::trim)
        .find(|segment| segment.starts_with('/'))
        .map(str::to_string)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detects_read_only_write() {
        let found = detect_violations("touch: cannot touch '/etc/ward': Read-only file system\n");
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].kind, ViolationKind::Filesystem);
        assert_eq!(found[0].path, "/etc/ward");
        assert_eq!(found[0].operation, "write");
        assert!(found[0].blocked);
    }

    #[test]
    fn test_detects_unquoted_path() {
        let found = detect_violations("bash: /usr/lib/x: Read-only file system");
        assert_eq!(found[0].path, "/usr/lib/x");
    }

    #[test]
    fn test_detects_network() {
        let found = detect_violations("curl: (6) Could not resolve host: example.com");
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].kind, ViolationKind::Network);
        assert_eq!(found[0].operation, "connect");
    }

    #[test]
    fn test_ignores_ordinary_output() {
        assert!(detect_violations("warning: unused variable\nerror: build failed").is_empty());
    }

    #[test]
    fn test_serializes_kind_as_type() {
        let violation = Violation::new(ViolationKind::Process, "", "signal");
        let json = serde_json::to_value(&violation).unwrap();
        assert_eq!(json["type"], "process");
    }
}
