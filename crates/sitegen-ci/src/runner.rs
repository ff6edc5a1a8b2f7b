//! Single command execution with a wall-clock ceiling.

use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};

use command_group::{AsyncCommandGroup, AsyncGroupChild};
use sitegen_core::{Result, SiteError};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tracing::{debug, warn};

use crate::stage::BuildCommand;

/// Time a timed-out process group gets between SIGTERM and SIGKILL.
const GRACE_PERIOD: Duration = Duration::from_secs(2);

/// Result of one command execution.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub name: String,

    /// Exit code (0 = success, -1 when killed by a signal).
    pub exit_code: i32,

    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
}

impl CommandOutput {
    pub fn passed(&self) -> bool {
        self.exit_code == 0
    }

    /// Standard error followed by standard output.
    pub fn combined(&self) -> String {
        match (self.stderr.is_empty(), self.stdout.is_empty()) {
            (true, _) => self.stdout.clone(),
            (false, true) => self.stderr.clone(),
            (false, false) => format!("{}\n{}", self.stderr.trim_end(), self.stdout),
        }
    }
}

/// Executes build commands inside a working directory.
pub struct CommandRunner;

impl CommandRunner {
    /// Run `config` in `cwd` and capture its output.
    ///
    /// Each command runs in its own process group. A non-zero exit is
    /// reported in the returned [`CommandOutput`], not as an error. Exceeding
    /// the ceiling terminates the whole group and fails with
    /// [`SiteError::Timeout`]. Processes the command left running in its
    /// group are killed once it exits.
    pub async fn execute(config: &BuildCommand, cwd: &Path) -> Result<CommandOutput> {
        let start = Instant::now();

        let Some((exe, args)) = config.command.split_first() else {
            return Err(SiteError::Validation(format!(
                "build command '{}' is empty",
                config.name
            )));
        };

        debug!(command = %config.name, cwd = %cwd.display(), "spawning");
        let mut command = Command::new(exe);
        command
            .args(args)
            .current_dir(cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let mut child = command
            .group_spawn()
            .map_err(|e| SiteError::ProcessFailure {
                command: config.name.clone(),
                exit_code: -1,
                output: format!("failed to spawn {exe}: {e}"),
            })?;

        // The group leader's pid is the group id; `id()` is gone once reaped.
        let pgid = child.inner().id();
        let stdout = tokio::spawn(read_pipe(child.inner().stdout.take()));
        let stderr = tokio::spawn(read_pipe(child.inner().stderr.take()));

        let status = if config.timeout_secs > 0 {
            let ceiling = Duration::from_secs(config.timeout_secs);
            match tokio::time::timeout(ceiling, child.wait()).await {
                Ok(status) => status?,
                Err(_) => {
                    warn!(
                        command = %config.name,
                        timeout_secs = config.timeout_secs,
                        "command timed out, terminating process group"
                    );
                    terminate_process_group(&mut child, pgid, GRACE_PERIOD).await;
                    return Err(SiteError::Timeout {
                        command: config.name.clone(),
                        timeout_secs: config.timeout_secs,
                    });
                }
            }
        } else {
            child.wait().await?
        };

        // Background jobs would otherwise outlive the command and hold the
        // output pipes open.
        kill_stragglers(pgid);

        Ok(CommandOutput {
            name: config.name.clone(),
            exit_code: status.code().unwrap_or(-1),
            stdout: stdout.await.unwrap_or_default(),
            stderr: stderr.await.unwrap_or_default(),
            duration_ms: start.elapsed().as_millis() as u64,
        })
    }
}

async fn read_pipe<R>(pipe: Option<R>) -> String
where
    R: AsyncRead + Unpin,
{
    let mut buf = Vec::new();
    if let Some(mut pipe) = pipe {
        if let Err(e) = pipe.read_to_end(&mut buf).await {
            warn!(error = %e, "error reading command output");
        }
    }
    String::from_utf8_lossy(&buf).into_owned()
}

#[cfg(unix)]
fn signal_group(pgid: u32, signal: nix::sys::signal::Signal) {
    use nix::errno::Errno;
    use nix::sys::signal::killpg;
    use nix::unistd::Pid;

    match killpg(Pid::from_raw(pgid as i32), signal) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => warn!(pgid, ?signal, error = %e, "failed to signal process group"),
    }
}

#[cfg(unix)]
fn kill_stragglers(pgid: Option<u32>) {
    if let Some(pgid) = pgid {
        signal_group(pgid, nix::sys::signal::Signal::SIGKILL);
    }
}

#[cfg(not(unix))]
fn kill_stragglers(_pgid: Option<u32>) {}

/// SIGTERM the group, give it `grace` to exit, then SIGKILL whatever is left
/// and reap the leader.
#[cfg(unix)]
async fn terminate_process_group(
    child: &mut AsyncGroupChild,
    pgid: Option<u32>,
    grace: Duration,
) {
    use nix::sys::signal::Signal;

    // No pid means the leader was already reaped.
    let Some(pgid) = pgid else {
        return;
    };

    signal_group(pgid, Signal::SIGTERM);
    let deadline = tokio::time::Instant::now() + grace;
    while tokio::time::Instant::now() < deadline {
        if matches!(child.inner().try_wait(), Ok(Some(_))) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    // The leader exiting says nothing about the rest of the group.
    signal_group(pgid, Signal::SIGKILL);
    let _ = child.wait().await;
}

#[cfg(not(unix))]
async fn terminate_process_group(
    child: &mut AsyncGroupChild,
    _pgid: Option<u32>,
    _grace: Duration,
) {
    let _ = child.kill().await;
    let _ = child.wait().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn output(stdout: &str, stderr: &str) -> CommandOutput {
        CommandOutput {
            name: "t".into(),
            exit_code: 1,
            stdout: stdout.into(),
            stderr: stderr.into(),
            duration_ms: 1,
        }
    }

    #[test]
    fn combined_puts_stderr_first() {
        assert_eq!(output("out\n", "err\n").combined(), "err\nout\n");
        assert_eq!(output("", "err").combined(), "err");
        assert_eq!(output("out", "").combined(), "out");
    }

    #[tokio::test]
    async fn executes_in_working_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("marker.txt"), "hello").unwrap();

        let cmd = BuildCommand::shell("cat", "cat marker.txt", 10);
        let result = CommandRunner::execute(&cmd, dir.path()).await.unwrap();
        assert!(result.passed());
        assert_eq!(result.stdout, "hello");
    }

    #[tokio::test]
    async fn non_zero_exit_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let cmd = BuildCommand::shell("fail", "echo 'Type error: nope' >&2; exit 3", 10);
        let result = CommandRunner::execute(&cmd, dir.path()).await.unwrap();
        assert!(!result.passed());
        assert_eq!(result.exit_code, 3);
        assert!(result.stderr.contains("Type error"));
    }

    #[tokio::test]
    async fn exceeding_ceiling_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let cmd = BuildCommand::shell("sleep", "sleep 5", 1);
        let err = CommandRunner::execute(&cmd, dir.path()).await.unwrap_err();
        assert!(matches!(err, SiteError::Timeout { timeout_secs: 1, .. }));
    }

    #[tokio::test]
    async fn timeout_terminates_background_children() {
        let dir = tempfile::tempdir().unwrap();
        let cmd = BuildCommand::shell("background", "(sleep 2; touch marker.txt) & wait", 1);

        let err = CommandRunner::execute(&cmd, dir.path()).await.unwrap_err();
        assert!(matches!(err, SiteError::Timeout { timeout_secs: 1, .. }));

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(!dir.path().join("marker.txt").exists());
    }

    #[tokio::test]
    async fn background_jobs_do_not_outlive_command() {
        let dir = tempfile::tempdir().unwrap();
        let cmd = BuildCommand::shell("detached", "(sleep 2; touch late.txt) & echo done", 30);

        let start = Instant::now();
        let result = CommandRunner::execute(&cmd, dir.path()).await.unwrap();
        assert!(result.passed());
        assert_eq!(result.stdout, "done\n");
        assert!(start.elapsed() < Duration::from_secs(2));

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(!dir.path().join("late.txt").exists());
    }

    #[tokio::test]
    async fn empty_command_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let cmd = BuildCommand::new("nothing", vec![], 10);
        let err = CommandRunner::execute(&cmd, dir.path()).await.unwrap_err();
        assert!(matches!(err, SiteError::Validation(_)));
    }

    #[tokio::test]
    async fn missing_executable_is_process_failure() {
        let dir = tempfile::tempdir().unwrap();
        let cmd = BuildCommand::from_line("definitely-not-a-real-binary-xyz", 10);
        let err = CommandRunner::execute(&cmd, dir.path()).await.unwrap_err();
        assert!(matches!(err, SiteError::ProcessFailure { exit_code: -1, .. }));
    }
}
