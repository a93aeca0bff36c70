use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::debug;

/// How long to keep draining pipes after the child exits. Background
/// grandchildren can hold them open indefinitely.
const PIPE_DRAIN_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug)]
pub struct ProcessOutput {
    pub stdout: String,
    pub stderr: String,
    pub status: ExitStatus,
}

impl ProcessOutput {
    /// Exit code, or -1 when the process was killed by a signal.
    pub fn exit_code(&self) -> i32 {
        self.status.code().unwrap_or(-1)
    }
}

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("Failed to start process: {0}")]
    Spawn(std::io::Error),
    #[error("Process timed out after {} seconds", .0.as_secs())]
    TimedOut(Duration),
    #[error("Failed waiting for process: {0}")]
    Wait(std::io::Error),
}

/// `sh -c <command>` (or `cmd /C` on Windows).
pub fn shell_command(command: &str) -> Command {
    if cfg!(target_os = "windows") {
        let mut cmd = Command::new("cmd");
        cmd.arg("/C").arg(command);
        cmd
    } else {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(command);
        cmd
    }
}

/// Spawns `command`, feeds `input` to its stdin and collects both output
/// streams. On timeout the whole process group is killed and the child is
/// reaped before returning.
pub async fn run(
    mut command: Command,
    input: Option<Vec<u8>>,
    timeout: Duration,
) -> Result<ProcessOutput, ProcessError> {
    command
        .stdin(if input.is_some() { Stdio::piped() } else { Stdio::null() })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    command.process_group(0);

    let mut child = command.spawn().map_err(ProcessError::Spawn)?;

    if let (Some(bytes), Some(mut stdin)) = (input, child.stdin.take()) {
        tokio::spawn(async move {
            if let Err(e) = stdin.write_all(&bytes).await {
                debug!(error = %e, "Child closed stdin early");
            }
        });
    }

    let stdout = child.stdout.take().map(spawn_reader);
    let stderr = child.stderr.take().map(spawn_reader);

    match tokio::time::timeout(timeout, child.wait()).await {
        Ok(Ok(status)) => Ok(ProcessOutput {
            stdout: collect(stdout).await,
            stderr: collect(stderr).await,
            status,
        }),
        Ok(Err(e)) => {
            abort(stdout);
            abort(stderr);
            Err(ProcessError::Wait(e))
        }
        Err(_) => {
            debug!(timeout_secs = timeout.as_secs(), "Process timed out, killing");
            terminate(&mut child).await;
            abort(stdout);
            abort(stderr);
            Err(ProcessError::TimedOut(timeout))
        }
    }
}

fn spawn_reader<R>(mut reader: R) -> JoinHandle<Vec<u8>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = Vec::new();
        if let Err(e) = reader.read_to_end(&mut buf).await {
            debug!(error = %e, "Pipe read failed");
        }
        buf
    })
}

async fn collect(handle: Option<JoinHandle<Vec<u8>>>) -> String {
    let Some(handle) = handle else {
        return String::new();
    };
    let abort_handle = handle.abort_handle();
    match tokio::time::timeout(PIPE_DRAIN_GRACE, handle).await {
        Ok(Ok(bytes)) => String::from_utf8_lossy(&bytes).into_owned(),
        Ok(Err(e)) => {
            debug!(error = %e, "Pipe reader task failed");
            String::new()
        }
        Err(_) => {
            abort_handle.abort();
            String::new()
        }
    }
}

fn abort(handle: Option<JoinHandle<Vec<u8>>>) {
    if let Some(handle) = handle {
        handle.abort();
    }
}

async fn terminate(child: &mut Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        kill_group(pid);
    }
    if let Err(e) = child.kill().await {
        debug!(error = %e, "Kill after timeout failed");
    }
}

/// SIGKILL to the group led by `pid`, so grandchildren go down with the shell.
#[cfg(unix)]
fn kill_group(pid: u32) {
    let Ok(pgid) = libc::pid_t::try_from(pid) else {
        debug!(pid, "Process id out of range for killpg");
        return;
    };
    // SAFETY: killpg has no memory-safety preconditions.
    let rc = unsafe { libc::killpg(pgid, libc::SIGKILL) };
    if rc != 0 {
        debug!(pid, error = %std::io::Error::last_os_error(), "Process group kill failed");
    }
}

/// Whether `pid` is still a live (non-zombie) process.
#[cfg(all(test, target_os = "linux"))]
pub(crate) fn process_alive(pid: u32) -> bool {
    let Ok(stat) = std::fs::read_to_string(format!("/proc/{}/stat", pid)) else {
        return false;
    };
    // The state letter follows the parenthesised command name.
    stat.rsplit_once(')')
        .and_then(|(_, rest)| rest.trim_start().chars().next())
        .is_some_and(|state| state != 'Z' && state != 'X')
}

/// Polls until every pid in `pids` is gone, or two seconds pass.
#[cfg(all(test, target_os = "linux"))]
pub(crate) async fn wait_for_exit(pids: &[u32]) -> bool {
    for _ in 0..40 {
        if !pids.iter().any(|&pid| process_alive(pid)) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Instant;

    #[tokio::test]
    async fn test_captures_both_streams() {
        let output = run(
            shell_command("echo out; echo err >&2; exit 3"),
            None,
            Duration::from_secs(5),
        )
        .await
        .unwrap();
        assert_eq!(output.stdout, "out\n");
        assert_eq!(output.stderr, "err\n");
        assert_eq!(output.exit_code(), 3);
    }

    #[tokio::test]
    async fn test_feeds_stdin() {
        let output = run(shell_command("cat"), Some(b"hello".to_vec()), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(output.stdout, "hello");
    }

    #[tokio::test]
    async fn test_timeout_kills_child() {
        let started = Instant::now();
        let err = run(shell_command("sleep 10"), None, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, ProcessError::TimedOut(_)));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_timeout_kills_background_children() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut command = shell_command("sleep 37 & echo $! > bg.pid; echo $$ > sh.pid; sleep 38");
        command.current_dir(dir.path());

        let err = run(command, None, Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, ProcessError::TimedOut(_)));

        let read_pid = |name: &str| -> u32 {
            std::fs::read_to_string(dir.path().join(name)).unwrap().trim().parse().unwrap()
        };
        let pids = [read_pid("sh.pid"), read_pid("bg.pid")];
        assert!(wait_for_exit(&pids).await, "processes still running: {:?}", pids);
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let err = run(
            Command::new("/definitely/not/a/binary"),
            None,
            Duration::from_secs(1),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ProcessError::Spawn(_)));
    }
}
