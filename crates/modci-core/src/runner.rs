//! Build command execution.
//!
//! The command text is written to a command file and run by the configured
//! shell inside the project's working copy. stdout and stderr are appended
//! to the task log. A hard timeout kills the whole process group.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use modci_state::{ProjectId, TaskId};
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("failed to prepare {path}: {source}")]
    Prepare {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to spawn '{shell}': {source}")]
    Spawn {
        shell: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed waiting for build process: {0}")]
    Wait(#[source] std::io::Error),
}

/// One build command to run.
#[derive(Debug, Clone)]
pub struct ProcessRequest {
    pub task_id: TaskId,
    pub project_id: ProjectId,
    pub command: String,
    /// Working copy the command runs in.
    pub working_dir: PathBuf,
    pub command_file: PathBuf,
    pub log_file: PathBuf,
    pub timeout: Duration,
}

/// How a build process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessOutcome {
    /// `None` when killed by a signal.
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub duration_ms: u64,
}

impl ProcessOutcome {
    pub fn success(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }
}

#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, request: &ProcessRequest) -> Result<ProcessOutcome, RunnerError>;
}

/// Runs command files with a shell (`sh` by default).
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    shell: String,
}

impl Default for ProcessRunner {
    fn default() -> Self {
        Self::new("sh")
    }
}

impl ProcessRunner {
    pub fn new(shell: impl Into<String>) -> Self {
        Self {
            shell: shell.into(),
        }
    }

    /// `command_file` must be absolute: the shell starts in `working_dir`.
    fn command(
        &self,
        request: &ProcessRequest,
        command_file: &Path,
    ) -> Result<Command, RunnerError> {
        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&request.log_file)
            .map_err(|source| prepare_error(&request.log_file, source))?;
        let log_err = log
            .try_clone()
            .map_err(|source| prepare_error(&request.log_file, source))?;

        let mut cmd = std::process::Command::new(&self.shell);
        cmd.arg(command_file)
            .current_dir(&request.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err));

        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }

        let mut cmd = Command::from(cmd);
        cmd.kill_on_drop(true);
        Ok(cmd)
    }
}

fn prepare_error(path: &Path, source: std::io::Error) -> RunnerError {
    RunnerError::Prepare {
        path: path.to_path_buf(),
        source,
    }
}

async fn ensure_parent(path: &Path) -> Result<(), RunnerError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|source| prepare_error(parent, source))?;
    }
    Ok(())
}

#[cfg(unix)]
fn kill_process_group(pid: u32) {
    // The child leads its own group (process_group(0)), so pgid == pid.
    let rc = unsafe { libc::killpg(pid as libc::pid_t, libc::SIGKILL) };
    if rc != 0 {
        warn!(pid, error = %std::io::Error::last_os_error(), "killpg failed");
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pid: u32) {}

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(&self, request: &ProcessRequest) -> Result<ProcessOutcome, RunnerError> {
        ensure_parent(&request.command_file).await?;
        ensure_parent(&request.log_file).await?;
        tokio::fs::write(&request.command_file, &request.command)
            .await
            .map_err(|source| prepare_error(&request.command_file, source))?;
        let command_file = tokio::fs::canonicalize(&request.command_file)
            .await
            .map_err(|source| prepare_error(&request.command_file, source))?;

        let start = Instant::now();
        let mut child = self
            .command(request, &command_file)?
            .spawn()
            .map_err(|source| RunnerError::Spawn {
                shell: self.shell.clone(),
                source,
            })?;
        debug!(
            project_id = %request.project_id,
            task_id = %request.task_id,
            pid = ?child.id(),
            "build process started"
        );

        let (exit_code, timed_out) = match tokio::time::timeout(request.timeout, child.wait()).await
        {
            Ok(status) => (status.map_err(RunnerError::Wait)?.code(), false),
            Err(_) => {
                warn!(
                    project_id = %request.project_id,
                    timeout_ms = request.timeout.as_millis() as u64,
                    "build command timed out, killing process group"
                );
                if let Some(pid) = child.id() {
                    kill_process_group(pid);
                }
                let _ = child.kill().await;
                (None, true)
            }
        };

        Ok(ProcessOutcome {
            exit_code,
            timed_out,
            duration_ms: start.elapsed().as_millis() as u64,
        })
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn request(dir: &Path, command: &str, timeout: Duration) -> ProcessRequest {
        ProcessRequest {
            task_id: TaskId(1),
            project_id: ProjectId(2),
            command: command.to_string(),
            working_dir: dir.to_path_buf(),
            command_file: dir.join("jobs/1/cmd-demo.sh"),
            log_file: dir.join("jobs/1/build.log"),
            timeout,
        }
    }

    #[test]
    fn test_outcome_success() {
        let ok = ProcessOutcome {
            exit_code: Some(0),
            timed_out: false,
            duration_ms: 5,
        };
        assert!(ok.success());

        let killed = ProcessOutcome {
            exit_code: None,
            timed_out: true,
            duration_ms: 5,
        };
        assert!(!killed.success());
    }

    #[tokio::test]
    async fn test_run_writes_output_to_log() {
        let dir = tempfile::tempdir().unwrap();
        let req = request(
            dir.path(),
            "echo building $(pwd)\necho oops >&2",
            Duration::from_secs(30),
        );

        let outcome = ProcessRunner::default().run(&req).await.unwrap();
        assert!(outcome.success());

        let log = std::fs::read_to_string(&req.log_file).unwrap();
        assert!(log.contains("building"));
        assert!(log.contains("oops"));
        assert_eq!(
            std::fs::read_to_string(&req.command_file).unwrap(),
            req.command
        );
    }

    #[tokio::test]
    async fn test_run_with_relative_paths() {
        let dir = tempfile::tempdir_in(".").unwrap();
        assert!(dir.path().is_relative());
        let working_dir = dir.path().join("sources/demo");
        std::fs::create_dir_all(&working_dir).unwrap();
        let req = ProcessRequest {
            working_dir,
            ..request(dir.path(), "echo hi from $(basename $(pwd))", Duration::from_secs(30))
        };

        let outcome = ProcessRunner::default().run(&req).await.unwrap();

        let log = std::fs::read_to_string(&req.log_file).unwrap();
        assert!(outcome.success(), "log: {log}");
        assert!(log.contains("hi from demo"));
    }

    #[tokio::test]
    async fn test_run_appends_to_existing_log() {
        let dir = tempfile::tempdir().unwrap();
        let req = request(dir.path(), "echo second", Duration::from_secs(30));
        std::fs::create_dir_all(req.log_file.parent().unwrap()).unwrap();
        std::fs::write(&req.log_file, "first\n").unwrap();

        ProcessRunner::default().run(&req).await.unwrap();

        let log = std::fs::read_to_string(&req.log_file).unwrap();
        assert!(log.starts_with("first\n"));
        assert!(log.contains("second"));
    }

    #[tokio::test]
    async fn test_run_reports_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let req = request(dir.path(), "exit 3", Duration::from_secs(30));

        let outcome = ProcessRunner::default().run(&req).await.unwrap();
        assert_eq!(outcome.exit_code, Some(3));
        assert!(!outcome.timed_out);
        assert!(!outcome.success());
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_timeout_kills_process_group() {
        let dir = tempfile::tempdir().unwrap();
        // The background sleeper would outlive a plain child kill.
        let req = request(
            dir.path(),
            "sleep 30 &\necho $! > sleeper.pid\nwait",
            Duration::from_millis(500),
        );

        let outcome = ProcessRunner::default().run(&req).await.unwrap();
        assert!(outcome.timed_out);
        assert!(outcome.exit_code.is_none());
        assert!(outcome.duration_ms < 10_000);

        tokio::time::sleep(Duration::from_millis(200)).await;
        let pid = std::fs::read_to_string(dir.path().join("sleeper.pid")).unwrap();
        let pid = pid.trim();
        assert!(
            !is_running(pid),
            "background process {pid} survived the timeout"
        );
    }

    /// Zombies count as dead; nobody may be left to reap them.
    fn is_running(pid: &str) -> bool {
        match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
            Ok(stat) => {
                let state = stat
                    .rsplit_once(')')
                    .and_then(|(_, rest)| rest.trim_start().chars().next());
                !matches!(state, Some('Z') | Some('X') | None)
            }
            Err(_) => false,
        }
    }

    #[tokio::test]
    async fn test_missing_shell_is_spawn_error() {
        let dir = tempfile::tempdir().unwrap();
        let req = request(dir.path(), "true", Duration::from_secs(5));
        let err = ProcessRunner::new("/no/such/shell")
            .run(&req)
            .await
            .unwrap_err();
        assert!(matches!(err, RunnerError::Spawn { .. }));
    }
}
