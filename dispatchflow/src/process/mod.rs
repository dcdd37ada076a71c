//! External command execution.
//!
//! Actions that need a host-side tool (power control, network inspection,
//! flashing utilities) go through [`run_command`], which captures the output,
//! logs every line and enforces the caller's deadline.

use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::errors::{Failure, Result};
use crate::timeout::Deadline;

/// Exit status of a finished command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    /// Exited with status zero.
    Success,
    /// Exited with a non-zero status.
    Error(i32),
    /// Terminated by a signal.
    Signal,
}

impl ExitStatus {
    /// Returns true for a zero exit status.
    #[must_use]
    pub const fn success(&self) -> bool {
        matches!(self, Self::Success)
    }

    /// Returns the numeric exit code, if the process exited normally.
    #[must_use]
    pub const fn code(&self) -> Option<i32> {
        match self {
            Self::Success => Some(0),
            Self::Error(code) => Some(*code),
            Self::Signal => None,
        }
    }

    fn from_std(status: std::process::ExitStatus) -> Self {
        match status.code() {
            Some(0) => Self::Success,
            Some(code) => Self::Error(code),
            None => Self::Signal,
        }
    }
}

/// Captured result of [`run_command`].
#[derive(Debug, Clone)]
pub struct CommandOutput {
    /// How the command ended.
    pub status: ExitStatus,
    /// Standard output.
    pub stdout: String,
    /// Standard error.
    pub stderr: String,
    /// Wall time spent.
    pub duration: Duration,
}

impl CommandOutput {
    /// Returns stdout followed by stderr.
    #[must_use]
    pub fn combined(&self) -> String {
        let mut out = self.stdout.clone();
        out.push_str(&self.stderr);
        out
    }
}

/// Splits a command line into program and arguments, shell style.
pub fn split_command(command_line: &str) -> Result<(String, Vec<String>)> {
    let mut parts = shell_words::split(command_line)
        .map_err(|err| Failure::job(format!("Invalid command line '{command_line}': {err}")))?;
    if parts.is_empty() {
        return Err(Failure::job("Empty command line"));
    }
    let program = parts.remove(0);
    Ok((program, parts))
}

async fn collect_lines<R>(reader: Option<R>, stream: &'static str) -> String
where
    R: tokio::io::AsyncRead + Unpin,
{
    let Some(reader) = reader else {
        return String::new();
    };
    let mut lines = BufReader::new(reader).lines();
    let mut out = String::new();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(stream, "output: {}", line);
        out.push_str(&line);
        out.push('\n');
    }
    out
}

/// Runs `program args...` until it exits or `deadline` passes.
///
/// A spawn failure is an infrastructure failure. Overrunning the deadline
/// kills the child and yields a timeout failure. A non-zero exit is not a
/// failure here; callers decide with [`CommandOutput::status`].
pub async fn run_command(program: &str, args: &[String], deadline: Deadline) -> Result<CommandOutput> {
    let command_text = if args.is_empty() {
        program.to_string()
    } else {
        format!("{program} {}", shell_words::join(args))
    };
    debug!("Executing external command: {}", command_text);

    let started = Instant::now();
    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|err| Failure::infrastructure(format!("Unable to run '{command_text}': {err}")))?;

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let outcome = tokio::time::timeout_at(deadline, async {
        let (out, err) = tokio::join!(collect_lines(stdout, "stdout"), collect_lines(stderr, "stderr"));
        let status = child.wait().await?;
        Ok::<_, std::io::Error>((out, err, status))
    })
    .await;

    match outcome {
        Ok(Ok((stdout, stderr, status))) => Ok(CommandOutput {
            status: ExitStatus::from_std(status),
            stdout,
            stderr,
            duration: started.elapsed(),
        }),
        Ok(Err(err)) => Err(Failure::infrastructure(format!("'{command_text}' failed: {err}"))),
        Err(_) => {
            warn!("'{}' did not finish before the deadline, killing it", command_text);
            if let Err(err) = child.kill().await {
                debug!("Kill failed: {}", err);
            }
            Err(Failure::timeout(format!(
                "'{command_text}' timed out after {} seconds",
                started.elapsed().as_secs()
            )))
        }
    }
}

/// Convenience wrapper around [`run_command`] taking one command line.
pub async fn run_command_line(command_line: &str, deadline: Deadline) -> Result<CommandOutput> {
    let (program, args) = split_command(command_line)?;
    run_command(&program, &args, deadline).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::FailureKind;
    use tokio_test::{assert_err, assert_ok};

    fn soon() -> Deadline {
        Instant::now() + Duration::from_secs(10)
    }

    #[test]
    fn test_split_command() {
        let (program, args) = split_command("ip -o addr 'show dev'").unwrap();
        assert_eq!(program, "ip");
        assert_eq!(args, vec!["-o", "addr", "show dev"]);
    }

    #[test]
    fn test_split_command_rejects_empty_and_unbalanced() {
        assert_eq!(split_command("   ").unwrap_err().kind(), FailureKind::JobConfig);
        assert_eq!(split_command("echo 'open").unwrap_err().kind(), FailureKind::JobConfig);
    }

    #[test]
    fn test_exit_status_code() {
        assert_eq!(ExitStatus::Success.code(), Some(0));
        assert_eq!(ExitStatus::Error(3).code(), Some(3));
        assert_eq!(ExitStatus::Signal.code(), None);
        assert!(!ExitStatus::Error(1).success());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_command_captures_output() {
        let output = run_command_line("sh -c 'echo out; echo err >&2'", soon()).await.unwrap();
        assert!(output.status.success());
        assert_eq!(output.stdout, "out\n");
        assert_eq!(output.stderr, "err\n");
        assert_eq!(output.combined(), "out\nerr\n");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_command_non_zero_exit() {
        let output = assert_ok!(run_command_line("sh -c 'exit 3'", soon()).await);
        assert_eq!(output.status, ExitStatus::Error(3));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_command_deadline_kills_child() {
        let deadline = Instant::now() + Duration::from_millis(200);
        let err = run_command_line("sleep 5", deadline).await.unwrap_err();
        assert_eq!(err.kind(), FailureKind::Timeout);
    }

    #[tokio::test]
    async fn test_run_command_missing_program() {
        let err = assert_err!(run_command("definitely-not-a-real-program-xyz", &[], soon()).await);
        assert_eq!(err.kind(), FailureKind::Infrastructure);
    }
}
