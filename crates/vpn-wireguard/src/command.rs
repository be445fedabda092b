use crate::error::{Result, WireGuardError};
use std::process::{Output, Stdio};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

fn spawn_error(program: &str, e: std::io::Error) -> WireGuardError {
    match e.kind() {
        std::io::ErrorKind::NotFound => WireGuardError::ToolUnavailable(program.to_string()),
        std::io::ErrorKind::PermissionDenied => {
            WireGuardError::PermissionDenied(format!("cannot execute {}", program))
        }
        _ => WireGuardError::Io(e),
    }
}

/// Run a tool and capture its output; a non-zero exit is left to the caller
pub(crate) async fn run(program: &str, args: &[&str]) -> Result<Output> {
    debug!(program, ?args, "running command");
    Command::new(program)
        .args(args)
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| spawn_error(program, e))
}

/// Like [`run`], feeding `input` on stdin (secrets never go on the command line)
pub(crate) async fn run_with_stdin(program: &str, args: &[&str], input: &str) -> Result<Output> {
    debug!(program, ?args, "running command with stdin");
    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| spawn_error(program, e))?;

    if let Some(mut stdin) = child.stdin.take() {
        stdin.write_all(input.as_bytes()).await?;
        stdin.write_all(b"\n").await?;
    }
    Ok(child.wait_with_output().await?)
}

pub(crate) fn stderr_of(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).trim().to_string()
}

/// Map a failed invocation to the error the caller should see
pub(crate) fn failure(output: &Output, wrap: fn(String) -> WireGuardError) -> WireGuardError {
    let stderr = stderr_of(output);
    let lower = stderr.to_lowercase();
    if lower.contains("operation not permitted")
        || lower.contains("permission denied")
        || lower.contains("must be run as root")
    {
        return WireGuardError::PermissionDenied(stderr);
    }
    wrap(stderr)
}
