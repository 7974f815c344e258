//! In-memory collaborators for tests and dry runs.
//!
//! - [`RecordingSynchronizer`]: simulated remotes and working copies
//! - [`ScriptedRunner`]: records requests, scripted exit codes, tracks overlap
//! - [`RecordingHook`]: counts post-build invocations

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use modci_state::{ProjectId, TaskHistory, VcsKind};

use crate::error::{PipelineError, Result};
use crate::orchestrator::{PipelineReport, PostBuildHook};
use crate::runner::{CommandRunner, ProcessOutcome, ProcessRequest, RunnerError};
use crate::source::{SourceSynchronizer, SyncError};

/// One call made against a [`RecordingSynchronizer`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOp {
    Clone {
        url: String,
        path: PathBuf,
        branch: String,
    },
    CheckoutAndPull {
        path: PathBuf,
        branch: String,
    },
    Rollback {
        path: PathBuf,
        commit: String,
    },
}

#[derive(Debug, Clone)]
struct WorkingCopy {
    url: String,
    head: String,
}

#[derive(Debug, Default)]
struct SyncState {
    remote_heads: HashMap<(String, String), String>,
    copies: HashMap<PathBuf, WorkingCopy>,
    failing_urls: HashSet<String>,
    ops: Vec<SyncOp>,
}

/// Simulated VCS. Remotes are `(url, branch) -> head` entries set by the
/// test; working copies live in memory keyed by path.
#[derive(Debug, Default)]
pub struct RecordingSynchronizer {
    state: Mutex<SyncState>,
}

impl RecordingSynchronizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_branch_head(&self, url: &str, branch: &str, head: &str) {
        self.state
            .lock()
            .unwrap()
            .remote_heads
            .insert((url.to_string(), branch.to_string()), head.to_string());
    }

    /// Make every clone of `url` fail.
    pub fn fail_clone(&self, url: &str) {
        self.state.lock().unwrap().failing_urls.insert(url.to_string());
    }

    pub fn ops(&self) -> Vec<SyncOp> {
        self.state.lock().unwrap().ops.clone()
    }

    pub fn head_of(&self, path: &Path) -> Option<String> {
        self.state
            .lock()
            .unwrap()
            .copies
            .get(path)
            .map(|c| c.head.clone())
    }
}

fn sync_failure(operation: &str, path: &Path, stderr: impl Into<String>) -> SyncError {
    SyncError::Git {
        operation: operation.to_string(),
        path: path.to_path_buf(),
        stderr: stderr.into(),
    }
}

#[async_trait]
impl SourceSynchronizer for RecordingSynchronizer {
    async fn has_local_copy(&self, path: &Path) -> bool {
        self.state.lock().unwrap().copies.contains_key(path)
    }

    async fn clone_repo(
        &self,
        _vcs: VcsKind,
        url: &str,
        path: &Path,
        branch: &str,
    ) -> std::result::Result<(), SyncError> {
        let mut state = self.state.lock().unwrap();
        state.ops.push(SyncOp::Clone {
            url: url.to_string(),
            path: path.to_path_buf(),
            branch: branch.to_string(),
        });
        if state.failing_urls.contains(url) {
            return Err(sync_failure("clone", path, "injected clone failure"));
        }
        let head = state
            .remote_heads
            .get(&(url.to_string(), branch.to_string()))
            .cloned()
            .ok_or_else(|| sync_failure("clone", path, format!("no branch {branch}")))?;
        state.copies.insert(
            path.to_path_buf(),
            WorkingCopy {
                url: url.to_string(),
                head,
            },
        );
        Ok(())
    }

    async fn checkout_and_pull(
        &self,
        _vcs: VcsKind,
        path: &Path,
        branch: &str,
    ) -> std::result::Result<(), SyncError> {
        let mut state = self.state.lock().unwrap();
        state.ops.push(SyncOp::CheckoutAndPull {
            path: path.to_path_buf(),
            branch: branch.to_string(),
        });
        let url = state
            .copies
            .get(path)
            .map(|c| c.url.clone())
            .ok_or_else(|| sync_failure("checkout", path, "no working copy"))?;
        let head = state
            .remote_heads
            .get(&(url, branch.to_string()))
            .cloned()
            .ok_or_else(|| sync_failure("checkout", path, format!("no branch {branch}")))?;
        if let Some(copy) = state.copies.get_mut(path) {
            copy.head = head;
        }
        Ok(())
    }

    async fn rollback(
        &self,
        _vcs: VcsKind,
        path: &Path,
        commit: &str,
    ) -> std::result::Result<(), SyncError> {
        let mut state = self.state.lock().unwrap();
        state.ops.push(SyncOp::Rollback {
            path: path.to_path_buf(),
            commit: commit.to_string(),
        });
        let copy = state
            .copies
            .get_mut(path)
            .ok_or_else(|| sync_failure("reset", path, "no working copy"))?;
        copy.head = commit.to_string();
        Ok(())
    }

    async fn latest_commit(&self, path: &Path) -> std::result::Result<String, SyncError> {
        self.head_of(path)
            .ok_or_else(|| sync_failure("rev-parse", path, "no working copy"))
    }
}

/// Start or end of a scripted build, in the order observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunEvent {
    Started(ProjectId),
    Finished(ProjectId),
}

#[derive(Debug, Default)]
struct RunnerState {
    requests: Vec<ProcessRequest>,
    exit_codes: HashMap<ProjectId, i32>,
    timeouts: HashSet<ProjectId>,
    active: HashMap<ProjectId, usize>,
    max_active: HashMap<ProjectId, usize>,
    events: Vec<RunEvent>,
}

/// [`CommandRunner`] that never spawns anything.
#[derive(Debug, Default)]
pub struct ScriptedRunner {
    delay: Duration,
    state: Mutex<RunnerState>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Each build takes `delay`, so overlapping builds become observable.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn fail_project(&self, project_id: ProjectId, exit_code: i32) {
        self.state
            .lock()
            .unwrap()
            .exit_codes
            .insert(project_id, exit_code);
    }

    pub fn time_out_project(&self, project_id: ProjectId) {
        self.state.lock().unwrap().timeouts.insert(project_id);
    }

    pub fn requests(&self) -> Vec<ProcessRequest> {
        self.state.lock().unwrap().requests.clone()
    }

    pub fn events(&self) -> Vec<RunEvent> {
        self.state.lock().unwrap().events.clone()
    }

    /// Largest number of simultaneous builds seen for `project_id`.
    pub fn max_concurrent(&self, project_id: ProjectId) -> usize {
        self.state
            .lock()
            .unwrap()
            .max_active
            .get(&project_id)
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
    async fn run(
        &self,
        request: &ProcessRequest,
    ) -> std::result::Result<ProcessOutcome, RunnerError> {
        let project = request.project_id;
        {
            let mut state = self.state.lock().unwrap();
            state.requests.push(request.clone());
            state.events.push(RunEvent::Started(project));
            let active = state.active.entry(project).or_insert(0);
            *active += 1;
            let now = *active;
            let max = state.max_active.entry(project).or_insert(0);
            *max = (*max).max(now);
        }

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let mut state = self.state.lock().unwrap();
        if let Some(active) = state.active.get_mut(&project) {
            *active -= 1;
        }
        state.events.push(RunEvent::Finished(project));
        let timed_out = state.timeouts.contains(&project);
        let exit_code = if timed_out {
            None
        } else {
            Some(state.exit_codes.get(&project).copied().unwrap_or(0))
        };
        Ok(ProcessOutcome {
            exit_code,
            timed_out,
            duration_ms: self.delay.as_millis() as u64,
        })
    }
}

/// [`PostBuildHook`] that records each report it sees.
#[derive(Debug, Default)]
pub struct RecordingHook {
    reports: Mutex<Vec<PipelineReport>>,
    fail: bool,
}

impl RecordingHook {
    pub fn new() -> Self {
        Self::default()
    }

    /// A hook that records, then fails.
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn calls(&self) -> usize {
        self.reports.lock().unwrap().len()
    }

    pub fn reports(&self) -> Vec<PipelineReport> {
        self.reports.lock().unwrap().clone()
    }
}

#[async_trait]
impl PostBuildHook for RecordingHook {
    async fn post_built(&self, task: &TaskHistory, report: &PipelineReport) -> Result<()> {
        self.reports.lock().unwrap().push(report.clone());
        if self.fail {
            return Err(PipelineError::PostBuild(format!(
                "recording hook failed for task {}",
                task.id
            )));
        }
        Ok(())
    }
}
