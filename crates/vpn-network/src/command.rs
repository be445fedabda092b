//! Thin wrapper over `tokio::process::Command` for the OS tools this crate drives.

use crate::error::{NetworkError, Result};
use std::process::Output;
use tokio::process::Command;
use tracing::debug;

/// Run `program args..` and capture its output.
///
/// A missing binary is reported as [`NetworkError::ToolUnavailable`]; a
/// non-zero exit status is returned in the `Output` for the caller to judge.
pub(crate) async fn run(program: &str, args: &[&str]) -> Result<Output> {
    debug!(program, ?args, "running command");
    Command::new(program)
        .args(args)
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => NetworkError::ToolUnavailable(program.to_string()),
            std::io::ErrorKind::PermissionDenied => {
                NetworkError::PermissionDenied(format!("cannot execute {}", program))
            }
            _ => NetworkError::IoError(e),
        })
}

pub(crate) fn stderr_of(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).trim().to_string()
}
