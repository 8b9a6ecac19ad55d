//! Subprocess sandbox for code-executing tools.
//!
//! Each call gets a fresh working directory under the work root, a
//! scrubbed environment, and a wall-clock budget. Cancellation and
//! timeout send SIGTERM, then SIGKILL after a grace period.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{ToolError, ToolResult};

/// Grace between SIGTERM and SIGKILL.
const KILL_GRACE: Duration = Duration::from_secs(2);

/// One sandboxed invocation.
#[derive(Debug, Clone)]
pub struct SandboxRequest {
    /// Program to run.
    pub program: String,
    /// Arguments.
    pub args: Vec<String>,
    /// Wall-clock budget.
    pub wall_clock: Duration,
    /// Environment variables passed through (everything else is scrubbed).
    pub env_passthrough: Vec<(String, String)>,
}

/// Captured sandbox output.
#[derive(Debug, Clone)]
pub struct SandboxOutput {
    /// Captured stdout.
    pub stdout: String,
    /// Captured stderr.
    pub stderr: String,
    /// Exit code, `-1` when terminated by signal.
    pub exit_code: i32,
    /// The per-call working directory (kept for artifact collection).
    pub work_dir: PathBuf,
}

/// Run a request in a fresh directory under `work_root`.
///
/// # Errors
///
/// - [`ToolError::Timeout`] when the wall clock expires.
/// - [`ToolError::Cancelled`] when `cancel` fires first.
/// - [`ToolError::Io`] when the process cannot be spawned.
pub async fn run_sandboxed(
    work_root: &Path,
    request: &SandboxRequest,
    cancel: &CancellationToken,
) -> ToolResult<SandboxOutput> {
    let work_dir = work_root.join(format!("call-{}", Uuid::new_v4()));
    tokio::fs::create_dir_all(&work_dir).await?;

    let mut command = Command::new(&request.program);
    command
        .args(&request.args)
        .current_dir(&work_dir)
        .env_clear()
        .env("HOME", &work_dir)
        .env("PATH", std::env::var("PATH").unwrap_or_default())
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    for (key, value) in &request.env_passthrough {
        command.env(key, value);
    }

    let mut child = command.spawn()?;
    debug!(program = %request.program, dir = %work_dir.display(), "Sandbox spawned");

    let waited = tokio::select! {
        result = child.wait_with_captured() => result,
        () = cancel.cancelled() => {
            terminate(&mut child).await;
            return Err(ToolError::Cancelled);
        },
        () = tokio::time::sleep(request.wall_clock) => {
            terminate(&mut child).await;
            return Err(ToolError::Timeout(request.wall_clock));
        },
    };

    let (stdout, stderr, exit_code) = waited?;
    Ok(SandboxOutput {
        stdout,
        stderr,
        exit_code,
        work_dir,
    })
}

/// SIGTERM, grace, SIGKILL.
async fn terminate(child: &mut Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        #[allow(clippy::cast_possible_wrap)]
        let pid = nix::unistd::Pid::from_raw(pid as i32);
        if let Err(e) = nix::sys::signal::kill(pid, nix::sys::signal::Signal::SIGTERM) {
            warn!(error = %e, "SIGTERM failed");
        }
        let graceful = tokio::time::timeout(KILL_GRACE, child.wait()).await;
        if graceful.is_err() {
            let _ = child.kill().await;
        }
        return;
    }
    let _ = child.kill().await;
}

/// Capture helper: wait for exit while collecting both pipes.
trait CapturedWait {
    async fn wait_with_captured(&mut self) -> ToolResult<(String, String, i32)>;
}

impl CapturedWait for Child {
    async fn wait_with_captured(&mut self) -> ToolResult<(String, String, i32)> {
        use tokio::io::AsyncReadExt;

        let mut stdout = String::new();
        let mut stderr = String::new();
        if let Some(mut pipe) = self.stdout.take() {
            let _ = pipe.read_to_string(&mut stdout).await;
        }
        if let Some(mut pipe) = self.stderr.take() {
            let _ = pipe.read_to_string(&mut stderr).await;
        }
        let status = self.wait().await?;
        Ok((stdout, stderr, status.code().unwrap_or(-1)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(program: &str, args: &[&str], secs: u64) -> SandboxRequest {
        SandboxRequest {
            program: program.to_string(),
            args: args.iter().map(ToString::to_string).collect(),
            wall_clock: Duration::from_secs(secs),
            env_passthrough: Vec::new(),
        }
    }

    #[tokio::test]
    async fn captures_output_in_fresh_dir() {
        let root = tempfile::tempdir().unwrap();
        let out = run_sandboxed(
            root.path(),
            &request("sh", &["-c", "echo hello; pwd"], 10),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert!(out.stdout.starts_with("hello"));
        assert_eq!(out.exit_code, 0);
        assert!(out.stdout.contains("call-"));
    }

    #[tokio::test]
    async fn wall_clock_kills_the_process() {
        let root = tempfile::tempdir().unwrap();
        let err = run_sandboxed(
            root.path(),
            &SandboxRequest {
                wall_clock: Duration::from_millis(200),
                ..request("sh", &["-c", "sleep 30"], 1)
            },
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ToolError::Timeout(_)));
    }

    #[tokio::test]
    async fn cancellation_aborts() {
        let root = tempfile::tempdir().unwrap();
        let cancel = CancellationToken::new();
        let early = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            early.cancel();
        });
        let err = run_sandboxed(
            root.path(),
            &request("sh", &["-c", "sleep 30"], 60),
            &cancel,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ToolError::Cancelled));
    }

    #[tokio::test]
    async fn environment_is_scrubbed() {
        // SAFETY-free check: the sandbox must not leak arbitrary env vars.
        let root = tempfile::tempdir().unwrap();
        let out = run_sandboxed(
            root.path(),
            &request("sh", &["-c", "echo \"${ITAK_SANDBOX_PROBE:-absent}\""], 10),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(out.stdout.trim(), "absent");
    }
}
