//! ward-sandbox: sandbox settings, violation records, and the OS sandbox runner.

mod runner;
mod settings;
mod violation;

pub use runner::{run_shell_command, SandboxError, SandboxRunResult};
pub use settings::{command_token, has_shell_control, NetworkSettings, PermissionMode, SandboxConfig, SandboxSettings};
pub use violation::{detect_violations, Violation, ViolationKind, ViolationSink};
