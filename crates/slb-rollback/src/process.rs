//! External tools (`git`, `kubectl`) run with a deadline and a cancel token.

use std::ffi::OsStr;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use slb_core::{Result, SlbError};

/// Output of a finished tool. Stdout is kept as raw bytes: diffs of files
/// that are not UTF-8 must reach disk unchanged.
#[derive(Debug)]
pub struct ToolOutput {
    pub success: bool,
    pub stdout: Vec<u8>,
    pub stderr: String,
}

impl ToolOutput {
    /// Stdout as text with surrounding whitespace trimmed.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).trim().to_string()
    }
}

/// Run `program` in `dir`. The child is killed when the timeout fires or
/// `cancel` is triggered. A program that cannot be started at all (not
/// installed) is a `Rollback` error, the same as one that times out.
pub async fn run_tool(
    program: &str,
    dir: &Path,
    args: &[&str],
    envs: &[(&str, &OsStr)],
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<ToolOutput> {
    let mut cmd = Command::new(program);
    cmd.args(args)
        .current_dir(dir)
        .envs(envs.iter().copied())
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    debug!(program, ?dir, ?args, "running tool");

    let output = tokio::select! {
        _ = cancel.cancelled() => return Err(SlbError::Cancelled),
        result = tokio::time::timeout(timeout, cmd.output()) => match result {
            Ok(output) => output.map_err(|e| {
                SlbError::Rollback(format!("failed to run {program} {}: {e}", args.join(" ")))
            })?,
            Err(_) => {
                return Err(SlbError::Rollback(format!(
                    "{program} {} timed out after {}s",
                    args.join(" "),
                    timeout.as_secs()
                )));
            }
        },
    };

    Ok(ToolOutput {
        success: output.status.success(),
        stdout: output.stdout,
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}
