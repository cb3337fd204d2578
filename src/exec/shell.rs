//! Shell command execution in an isolated process group.
//!
//! Commands run as `sh -c <command>` in their own process group so a timeout
//! (or a dropped future) kills every process the command started, not just the
//! shell.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;

use crate::error::ExecError;

/// Result of a shell command execution.
#[derive(Debug, Clone)]
pub struct ExecResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub timed_out: bool,
}

impl ExecResult {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0) && !self.timed_out
    }
}

/// Run `command` in `cwd`, writing `input` to its stdin and closing it.
///
/// On timeout the whole process group gets SIGKILL and the result carries
/// `timed_out = true` with no exit code.
pub async fn execute_with_input(
    command: &str,
    cwd: &Path,
    input: Option<&[u8]>,
    timeout: Duration,
) -> Result<ExecResult, ExecError> {
    // process_group(0) requires the CommandExt trait on Unix.
    #[allow(unused_imports)]
    use std::os::unix::process::CommandExt;

    let mut child = Command::new("sh")
        .arg("-c")
        .arg(command)
        .current_dir(cwd)
        .process_group(0)
        .stdin(if input.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| ExecError::SpawnFailed(e.to_string()))?;

    let mut guard = ProcessGroupGuard::new(child.id());

    let mut stdout = child
        .stdout
        .take()
        .ok_or_else(|| ExecError::ProcessFailed("failed to capture stdout".into()))?;
    let mut stderr = child
        .stderr
        .take()
        .ok_or_else(|| ExecError::ProcessFailed("failed to capture stderr".into()))?;
    let stdin = child.stdin.take();

    let run = async {
        let feed = async {
            if let (Some(mut pipe), Some(bytes)) = (stdin, input) {
                // Commands that never read stdin close the pipe early.
                if let Err(e) = pipe.write_all(bytes).await {
                    tracing::debug!(error = %e, "stdin closed before input was written");
                }
            }
        };
        let mut out = Vec::new();
        let mut err = Vec::new();
        let ((), out_read, err_read) = tokio::join!(
            feed,
            stdout.read_to_end(&mut out),
            stderr.read_to_end(&mut err)
        );
        out_read.map_err(|e| ExecError::ProcessFailed(format!("reading stdout: {e}")))?;
        err_read.map_err(|e| ExecError::ProcessFailed(format!("reading stderr: {e}")))?;
        let status = child
            .wait()
            .await
            .map_err(|e| ExecError::ProcessFailed(format!("waiting for process: {e}")))?;
        Ok::<_, ExecError>((out, err, status.code()))
    };

    match tokio::time::timeout(timeout, run).await {
        Ok(Ok((out, err, exit_code))) => {
            guard.disarm();
            Ok(ExecResult {
                stdout: String::from_utf8_lossy(&out).into_owned(),
                stderr: String::from_utf8_lossy(&err).into_owned(),
                exit_code,
                timed_out: false,
            })
        }
        Ok(Err(e)) => Err(e),
        Err(_) => {
            tracing::warn!(command, secs = timeout.as_secs(), "Command timed out, killing process group");
            drop(guard);
            // Reap the shell so it does not linger as a zombie.
            let _ = child.wait().await;
            Ok(ExecResult {
                stdout: String::new(),
                stderr: String::new(),
                exit_code: None,
                timed_out: true,
            })
        }
    }
}

/// Sends SIGKILL to a process group when dropped, unless disarmed.
struct ProcessGroupGuard {
    pgid: Option<u32>,
}

impl ProcessGroupGuard {
    fn new(pid: Option<u32>) -> Self {
        Self { pgid: pid }
    }

    fn disarm(&mut self) {
        self.pgid = None;
    }
}

impl Drop for ProcessGroupGuard {
    fn drop(&mut self) {
        if let Some(pid) = self.pgid.take() {
            let pgid = nix::unistd::Pid::from_raw(pid as i32);
            let _ = nix::sys::signal::killpg(pgid, nix::sys::signal::Signal::SIGKILL);
        }
    }
}
