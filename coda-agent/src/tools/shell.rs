use super::process::{self, ProcessError};
use super::{SafetyError, ToolFuture, ToolResult, ToolTrait, Workspace, parse_args};
use crate::clients::{ToolDefinition, ToolParameters, ToolProperty};
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

/// Captured result of a shell command that ran to completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellReport {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl ShellReport {
    /// Text form used as the `run_shell` tool output.
    pub fn render(&self) -> String {
        let mut out = String::new();
        if !self.stdout.is_empty() {
            out.push_str(&format!("STDOUT:\n{}\n", self.stdout.trim_end_matches('\n')));
        }
        if !self.stderr.is_empty() {
            out.push_str(&format!("STDERR:\n{}\n", self.stderr.trim_end_matches('\n')));
        }
        out.push_str(&format!("Exit code: {}", self.exit_code));
        out
    }
}

/// Reasons a shell command produced no [`ShellReport`].
#[derive(Debug, Error)]
pub enum ShellError {
    #[error("Command must not be empty")]
    EmptyCommand,
    #[error(transparent)]
    Safety(#[from] SafetyError),
    #[error("Working directory not found: {0}")]
    MissingWorkingDir(String),
    #[error("Command timed out after {0} seconds")]
    TimedOut(u64),
    #[error(transparent)]
    Process(ProcessError),
}

#[derive(Debug, Clone)]
pub struct RunShellTool {
    workspace: Workspace,
    default_timeout: u64,
}

impl RunShellTool {
    pub fn new(workspace: Workspace, default_timeout: u64) -> Self {
        Self {
            workspace,
            default_timeout,
        }
    }

    /// Runs `command` through the blocked-command check and the sandbox, then
    /// in its own process group. `timeout` falls back to the tool default.
    pub async fn run_command(
        &self,
        command: &str,
        working_dir: Option<&str>,
        timeout: Option<u64>,
    ) -> Result<ShellReport, ShellError> {
        if command.trim().is_empty() {
            return Err(ShellError::EmptyCommand);
        }
        if let Err(e) = self.workspace.policy().check_command(command) {
            warn!(command = %command, "Refused blocked command");
            return Err(e.into());
        }

        let cwd = match working_dir {
            Some(dir) => self.workspace.resolve(dir)?,
            None => self.workspace.root().to_path_buf(),
        };
        if !cwd.is_dir() {
            return Err(ShellError::MissingWorkingDir(cwd.display().to_string()));
        }

        let timeout = timeout.unwrap_or(self.default_timeout).max(1);
        let mut shell = process::shell_command(command);
        shell.current_dir(&cwd);

        info!(command = %command, cwd = %cwd.display(), timeout, "Running shell command");
        match process::run(shell, None, Duration::from_secs(timeout)).await {
            Ok(output) => Ok(ShellReport {
                exit_code: output.exit_code(),
                stdout: output.stdout,
                stderr: output.stderr,
            }),
            Err(ProcessError::TimedOut(_)) => Err(ShellError::TimedOut(timeout)),
            Err(e) => Err(ShellError::Process(e)),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RunShellArgs {
    command: String,
    working_dir: Option<String>,
    timeout: Option<u64>,
}

impl ToolTrait for RunShellTool {
    fn info(&self) -> ToolDefinition {
        ToolDefinition {
            name: "run_shell".to_string(),
            description: "Execute a shell command and return its stdout, stderr and exit code.".to_string(),
            parameters: ToolParameters::new()
                .property("command", ToolProperty::string("Shell command to execute"), true)
                .property(
                    "working_dir",
                    ToolProperty::string("Directory to run the command in (default: workspace root)"),
                    false,
                )
                .property(
                    "timeout",
                    ToolProperty::integer(format!("Timeout in seconds (default {})", self.default_timeout)),
                    false,
                ),
        }
    }

    fn execute<'a>(&'a self, arguments: &'a str) -> ToolFuture<'a> {
        Box::pin(async move {
            let args: RunShellArgs = parse_args(arguments)?;
            let result = self
                .run_command(&args.command, args.working_dir.as_deref(), args.timeout)
                .await;
            Ok(match result {
                Ok(report) if report.exit_code == 0 => ToolResult::success(report.render()),
                Ok(report) => ToolResult::failure(report.render()),
                Err(e) => ToolResult::failure(e.to_string()),
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;
    use tempfile::TempDir;

    fn tool(dir: &TempDir) -> RunShellTool {
        RunShellTool::new(Workspace::unrestricted(dir.path().to_path_buf()), 60)
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_runs_in_workspace() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("marker.txt"), "").unwrap();
        let result = tool(&dir).execute(r#"{"command": "ls"}"#).await.unwrap();
        assert!(result.is_success());
        assert_eq!(result.output(), Some("STDOUT:\nmarker.txt\nExit code: 0"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_nonzero_exit_is_failure() {
        let dir = TempDir::new().unwrap();
        let result = tool(&dir)
            .execute(r#"{"command": "echo oops >&2; exit 4"}"#)
            .await
            .unwrap();
        assert!(!result.is_success());
        assert_eq!(result.error(), Some("STDERR:\noops\nExit code: 4"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_timeout_kills_command() {
        let dir = TempDir::new().unwrap();
        let started = Instant::now();
        let result = tool(&dir)
            .execute(r#"{"command": "sleep 10", "timeout": 1}"#)
            .await
            .unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(result.error(), Some("Command timed out after 1 seconds"));
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_timeout_leaves_no_processes() {
        let dir = TempDir::new().unwrap();
        let result = tool(&dir)
            .execute(r#"{"command": "sleep 37 & echo $! > bg.pid; echo $$ > sh.pid; sleep 38", "timeout": 1}"#)
            .await
            .unwrap();
        assert_eq!(result.error(), Some("Command timed out after 1 seconds"));

        let read_pid = |name: &str| -> u32 {
            std::fs::read_to_string(dir.path().join(name)).unwrap().trim().parse().unwrap()
        };
        let pids = [read_pid("sh.pid"), read_pid("bg.pid")];
        assert!(crate::tools::process::wait_for_exit(&pids).await, "processes still running: {:?}", pids);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_command_keeps_streams_apart() {
        let dir = TempDir::new().unwrap();
        let report = tool(&dir)
            .run_command("printf 'line one\nSTDERR:\nline two\n'", None, None)
            .await
            .unwrap();
        assert_eq!(report.stdout, "line one\nSTDERR:\nline two\n");
        assert_eq!(report.stderr, "");
        assert_eq!(report.exit_code, 0);
    }

    #[tokio::test]
    async fn test_run_command_errors() {
        let dir = TempDir::new().unwrap();
        let config = crate::config::SafetyConfig::default();
        let workspace = Workspace::new(
            dir.path().to_path_buf(),
            crate::tools::SafetyPolicy::from_config(&config, dir.path()),
        );
        let tool = RunShellTool::new(workspace, 60);

        assert!(matches!(tool.run_command("  ", None, None).await, Err(ShellError::EmptyCommand)));
        assert!(matches!(
            tool.run_command("sudo ls", None, None).await,
            Err(ShellError::Safety(SafetyError::BlockedCommand(_)))
        ));
        assert!(matches!(
            tool.run_command("ls", Some("missing"), None).await,
            Err(ShellError::MissingWorkingDir(_))
        ));
    }

    #[tokio::test]
    async fn test_blocked_command_never_runs() {
        let dir = TempDir::new().unwrap();
        let config = crate::config::SafetyConfig::default();
        let workspace = Workspace::new(
            dir.path().to_path_buf(),
            crate::tools::SafetyPolicy::from_config(&config, dir.path()),
        );
        let tool = RunShellTool::new(workspace, 60);
        let result = tool
            .execute(r#"{"command": "sudo touch created.txt"}"#)
            .await
            .unwrap();
        assert!(result.error().unwrap().starts_with("Blocked command for safety"));
        assert!(!dir.path().join("created.txt").exists());
    }

    #[tokio::test]
    async fn test_missing_working_dir() {
        let dir = TempDir::new().unwrap();
        let result = tool(&dir)
            .execute(r#"{"command": "pwd", "working_dir": "nope"}"#)
            .await
            .unwrap();
        assert!(result.error().unwrap().starts_with("Working directory not found"));
    }
}
