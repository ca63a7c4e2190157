//! External command execution.
//!
//! Every privileged helper, daemon restart, and OS introspection call in the
//! orchestrator goes through [`run`] or one of its variants. A non-zero exit
//! code is data, not an error: callers must distinguish "tool ran and
//! reported a problem" from "tool could not run at all". Only a missing
//! executable or an elapsed deadline surfaces as `Err`.

use std::io;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::error::RouterError;

/// Default deadline for external commands, matching the slowest expected
/// daemon restart.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Captured result of one external command run.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Diagnostic text for the caller: stderr if present, stdout otherwise.
    pub fn diagnostic(&self) -> String {
        if self.stderr.trim().is_empty() {
            self.stdout.trim().to_string()
        } else {
            self.stderr.trim().to_string()
        }
    }
}

/// Run a command with the default timeout, logging the full command line.
pub async fn run(program: &str, args: &[&str]) -> Result<CommandOutput, RouterError> {
    run_redacting(program, args, DEFAULT_TIMEOUT, &[]).await
}

/// Run a command with an explicit timeout.
pub async fn run_timeout(
    program: &str,
    args: &[&str],
    deadline: Duration,
) -> Result<CommandOutput, RouterError> {
    run_redacting(program, args, deadline, &[]).await
}

/// Run a command; the argument positions in `secrets` are replaced with
/// `*****` in log output (pre-shared keys, portal passwords).
pub async fn run_redacting(
    program: &str,
    args: &[&str],
    deadline: Duration,
    secrets: &[usize],
) -> Result<CommandOutput, RouterError> {
    let cmd_display = display_line(program, args, secrets);
    debug!(command = %cmd_display, "running command");

    let child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => RouterError::CommandNotFound(program.to_string()),
            _ => RouterError::Execution {
                command: cmd_display.clone(),
                detail: e.to_string(),
            },
        })?;

    // On deadline the wait future is dropped, which kills the child.
    let output = match timeout(deadline, child.wait_with_output()).await {
        Ok(result) => result.map_err(|e| RouterError::Execution {
            command: cmd_display.clone(),
            detail: e.to_string(),
        })?,
        Err(_) => {
            warn!(command = %cmd_display, "command timed out");
            return Err(RouterError::CommandTimeout {
                command: cmd_display,
                seconds: deadline.as_secs(),
            });
        }
    };

    let result = CommandOutput {
        exit_code: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    };

    if !result.success() {
        warn!(command = %cmd_display, exit_code = result.exit_code, stderr = %result.stderr.trim(),
            "command reported failure");
    }

    Ok(result)
}

fn display_line(program: &str, args: &[&str], secrets: &[usize]) -> String {
    let mut parts = vec![program.to_string()];
    for (i, arg) in args.iter().enumerate() {
        if secrets.contains(&i) {
            parts.push("*****".to_string());
        } else {
            parts.push((*arg).to_string());
        }
    }
    parts.join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn captures_stdout_and_exit_code() {
        let out = run("sh", &["-c", "echo hello"]).await.unwrap();
        assert_eq!(out.exit_code, 0);
        assert!(out.success());
        assert_eq!(out.stdout.trim(), "hello");
    }

    #[tokio::test]
    async fn nonzero_exit_is_data_not_error() {
        let out = run("sh", &["-c", "echo oops >&2; exit 3"]).await.unwrap();
        assert_eq!(out.exit_code, 3);
        assert!(!out.success());
        assert_eq!(out.diagnostic(), "oops");
    }

    #[tokio::test]
    async fn missing_executable_is_not_found() {
        let err = run("definitely-not-a-real-binary-xyz", &[]).await.unwrap_err();
        assert!(matches!(err, RouterError::CommandNotFound(_)));
    }

    #[tokio::test]
    async fn deadline_elapsing_kills_the_child() {
        let err = run_timeout("sleep", &["5"], Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, RouterError::CommandTimeout { .. }));
    }

    #[test]
    fn secret_arguments_are_redacted_in_logs() {
        let line = display_line("wpa_passphrase", &["MyNet", "hunter22"], &[1]);
        assert_eq!(line, "wpa_passphrase MyNet *****");
    }
}
