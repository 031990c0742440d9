//! One-shot command execution, separate from the session registry.
//!
//! Runs a command line under `/bin/sh -c`, captures both output streams to
//! completion, and reports them as a single result event tied to the
//! caller's request id. Nothing here touches PTYs or history.

use tracing::debug;
use wmux_core::WorkerEvent;

use crate::config::expand_tilde_str;

/// Run `command` to completion and package the outcome. Failures to start
/// the command at all are reported in the `error` field with exit code -1.
pub async fn run_exec(id: &str, command: &str, cwd: Option<&str>) -> WorkerEvent {
    debug!(exec_id = %id, command = %command, "exec start");

    let mut cmd = tokio::process::Command::new("/bin/sh");
    cmd.arg("-c").arg(command).env("TERM", "xterm");
    if let Some(dir) = cwd {
        cmd.current_dir(expand_tilde_str(dir));
    }

    match cmd.output().await {
        Ok(output) => {
            let returncode = output.status.code().unwrap_or(-1);
            debug!(exec_id = %id, returncode, "exec done");
            WorkerEvent::ExecResult {
                id: id.to_string(),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                returncode,
                error: None,
            }
        }
        Err(e) => {
            debug!(exec_id = %id, error = %e, "exec failed to start");
            WorkerEvent::ExecResult {
                id: id.to_string(),
                stdout: String::new(),
                stderr: String::new(),
                returncode: -1,
                error: Some(e.to_string()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn captures_stdout_and_exit_code() {
        let event = run_exec("e1", "echo exec_works", None).await;
        match event {
            WorkerEvent::ExecResult {
                id,
                stdout,
                stderr,
                returncode,
                error,
            } => {
                assert_eq!(id, "e1");
                assert_eq!(stdout, "exec_works\n");
                assert_eq!(stderr, "");
                assert_eq!(returncode, 0);
                assert!(error.is_none());
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn captures_stderr_and_nonzero_exit() {
        let event = run_exec("e2", "echo oops >&2; exit 3", None).await;
        match event {
            WorkerEvent::ExecResult {
                stdout,
                stderr,
                returncode,
                error,
                ..
            } => {
                assert_eq!(stdout, "");
                assert_eq!(stderr, "oops\n");
                assert_eq!(returncode, 3);
                assert!(error.is_none());
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn runs_in_requested_directory() {
        let event = run_exec("e3", "pwd", Some("/tmp")).await;
        match event {
            WorkerEvent::ExecResult { stdout, .. } => {
                assert!(stdout.trim_end().ends_with("/tmp"));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn bad_directory_reports_error() {
        let event = run_exec("e4", "true", Some("/no/such/dir")).await;
        match event {
            WorkerEvent::ExecResult {
                returncode, error, ..
            } => {
                assert_eq!(returncode, -1);
                assert!(error.is_some());
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
