//! Shell command execution under the OS sandbox.

use crate::settings::SandboxSettings;
use crate::violation::{detect_violations, Violation};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::process::Command;

/// Output of a shell command run.
#[derive(Debug, Clone)]
pub struct SandboxRunResult {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    /// Exit code, -1 when the process was terminated by a signal.
    pub exit_code: i32,
    pub success: bool,
    /// Whether the command actually ran inside the sandbox.
    pub sandboxed: bool,
    /// Violations detected in stderr; always empty for unsandboxed runs.
    pub violations: Vec<Violation>,
}

/// Errors returned by the sandbox runner.
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("Command timed out after {0}s")]
    Timeout(u64),
    #[error("{0}")]
    BackendUnavailable(String),
    #[error("Failed to execute command: {0}")]
    Execution(String),
}

/// Run `command` in `cwd`. The sandbox is used when `settings.enabled` and
/// the caller did not ask to run unsandboxed. Whether an unsandboxed run is
/// permitted at all is a policy question answered before this point.
pub async fn run_shell_command(
    command: &str,
    cwd: &Path,
    timeout: Duration,
    settings: &SandboxSettings,
    unsandboxed: bool,
) -> Result<SandboxRunResult, SandboxError> {
    if !settings.enabled || unsandboxed {
        tracing::debug!(command, "running command without sandbox");
        return run_with_timeout(direct_command(command, cwd), timeout, false).await;
    }

    let workspace = cwd
        .canonicalize()
        .map_err(|e| SandboxError::Execution(format!("Cannot resolve workspace: {e}")))?;
    let writable = writable_roots(&workspace);

    let (cmd, backend) = if cfg!(target_os = "macos") {
        (seatbelt_command(command, &workspace, &writable, settings), "sandbox-exec")
    } else if cfg!(target_os = "linux") {
        (bwrap_command(command, &workspace, &writable, settings), "bubblewrap")
    } else {
        return Err(SandboxError::BackendUnavailable(
            "Sandbox backend unavailable on this OS. Disable the sandbox to proceed.".to_string(),
        ));
    };

    tracing::debug!(command, backend, "running command in sandbox");
    run_with_timeout(cmd, timeout, true)
        .await
        .map_err(|e| match e {
            SandboxError::Execution(msg) if msg.contains("No such file or directory") => {
                SandboxError::BackendUnavailable(format!(
                    "Sandbox backend ({backend}) unavailable. Disable the sandbox to proceed."
                ))
            }
            other => other,
        })
}

fn direct_command(command: &str, cwd: &Path) -> Command {
    let (shell, flag) = shell_and_flag();
    let mut cmd = Command::new(shell);
    cmd.arg(flag).arg(command).current_dir(cwd);
    cmd
}

fn writable_roots(workspace: &Path) -> Vec<PathBuf> {
    let mut roots = vec![workspace.to_path_buf()];
    if let Ok(temp) = std::env::temp_dir().canonicalize() {
        if !roots.contains(&temp) {
            roots.push(temp);
        }
    }
    roots
}

fn bwrap_command(
    command: &str,
    workspace: &Path,
    writable: &[PathBuf],
    settings: &SandboxSettings,
) -> Command {
    let (shell, flag) = shell_and_flag();
    let mut cmd = Command::new("bwrap");
    cmd.arg("--die-with-parent")
        .arg("--new-session")
        .arg("--ro-bind")
        .arg("/")
        .arg("/")
        .arg("--proc")
        .arg("/proc")
        .arg("--dev-bind")
        .arg("/dev")
        .arg("/dev");

    for root in writable {
        cmd.arg("--bind").arg(root).arg(root);
    }

    // A fresh network namespace still has loopback, so local binding keeps
    // working when outbound traffic is cut.
    if !settings.network.allow_outbound {
        cmd.arg("--unshare-net");
    }

    cmd.arg("--chdir")
        .arg(workspace)
        .arg(shell)
        .arg(flag)
        .arg(command);
    cmd
}

fn seatbelt_command(
    command: &str,
    workspace: &Path,
    writable: &[PathBuf],
    settings: &SandboxSettings,
) -> Command {
    let (shell, flag) = shell_and_flag();
    let mut cmd = Command::new("sandbox-exec");
    cmd.arg("-p")
        .arg(seatbelt_profile(writable, settings))
        .arg(shell)
        .arg(flag)
        .arg(command)
        .current_dir(workspace);
    cmd
}

fn seatbelt_profile(writable: &[PathBuf], settings: &SandboxSettings) -> String {
    let mut profile = String::from(
        "(version 1)\n\
         (deny default)\n\
         (import \"system.sb\")\n\
         (allow process-exec)\n\
         (allow process-fork)\n\
         (allow signal (target self))\n\
         (allow file-read*)\n",
    );

    for root in writable {
        profile.push_str(&format!(
            "(allow file-write* (subpath \"{}\"))\n",
            escape_seatbelt_path(root)
        ));
    }

    if settings.network.allow_outbound {
        profile.push_str("(allow network-outbound)\n");
    }
    if settings.network.allow_local_binding {
        profile.push_str("(allow network-bind (local ip))\n(allow network-inbound (local ip))\n");
    }

    profile
}

fn escape_seatbelt_path(path: &Path) -> String {
    path.display().to_string().replace('\\', "\\\\").replace('"', "\\\"")
}

async fn run_with_timeout(
    mut command: Command,
    timeout: Duration,
    sandboxed: bool,
) -> Result<SandboxRunResult, SandboxError> {
    command.kill_on_drop(true);
    let output = tokio::time::timeout(timeout, command.output())
        .await
        .map_err(|_| SandboxError::Timeout(timeout.as_secs()))?
        .map_err(|e| SandboxError::Execution(e.to_string()))?;

    let violations = if sandboxed {
        detect_violations(&String::from_utf8_lossy(&output.stderr))
    } else {
        Vec::new()
    };

    Ok(SandboxRunResult {
        stdout: output.stdout,
        stderr: output.stderr,
        exit_code: output.status.code().unwrap_or(-1),
        success: output.status.success(),
        sandboxed,
        violations,
    })
}

fn shell_and_flag() -> (&'static str, &'static str) {
    if cfg!(target_os = "windows") {
        ("cmd", "/C")
    } else {
        ("/bin/sh", "-c")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::NetworkSettings;
    use tempfile::TempDir;

    #[test]
    fn test_seatbelt_profile_network_rules() {
        let closed = SandboxSettings::default();
        let profile = seatbelt_profile(&[PathBuf::from("/work")], &closed);
        assert!(profile.contains("(subpath \"/work\")"));
        assert!(!profile.contains("network-outbound"));

        let open = SandboxSettings {
            network: NetworkSettings {
                allow_outbound: true,
                allow_local_binding: true,
            },
            ..SandboxSettings::default()
        };
        let profile = seatbelt_profile(&[], &open);
        assert!(profile.contains("(allow network-outbound)"));
        assert!(profile.contains("network-bind"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_disabled_sandbox_runs_directly() {
        let dir = TempDir::new().unwrap();
        let result = run_shell_command(
            "echo ward",
            dir.path(),
            Duration::from_secs(10),
            &SandboxSettings::default(),
            false,
        )
        .await
        .unwrap();

        assert!(result.success);
        assert!(!result.sandboxed);
        assert_eq!(String::from_utf8_lossy(&result.stdout).trim(), "ward");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_timeout() {
        let dir = TempDir::new().unwrap();
        let err = run_shell_command(
            "sleep 5",
            dir.path(),
            Duration::from_millis(100),
            &SandboxSettings::default(),
            true,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, SandboxError::Timeout(_)));
    }
}
