//! Piped child processes as [`ProcessIo`].

use std::process::Stdio;

use tokio::process::Command;
use tracing::debug;

use crate::error::UnishellError;
use crate::io::{BoxWriter, ProcessIo, Termination};
use crate::Result;

/// Spawn `command` with all three streams piped.
///
/// `display` names the command in errors and logs.
pub(crate) fn spawn_piped(mut command: Command, display: &str) -> Result<ProcessIo> {
    command
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let spawn_error = |reason: String| UnishellError::Spawn {
        cmd: display.to_string(),
        reason,
    };

    let mut child = command.spawn().map_err(|e| spawn_error(e.to_string()))?;
    let pid = child.id();

    let stdin = child.stdin.take();
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| spawn_error("stdout was not captured".into()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| spawn_error("stderr was not captured".into()))?;

    let cmd = display;
    debug!(cmd = %cmd, ?pid, "process spawned");

    Ok(ProcessIo {
        stdin: stdin.map(|s| Box::new(s) as BoxWriter),
        stdout: Box::new(stdout),
        stderr: Box::new(stderr),
        exit: Box::pin(async move {
            let status = child.wait().await?;
            debug!(?pid, %status, "process exited");
            Ok(Termination::from(status))
        }),
    })
}
