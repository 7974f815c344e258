//! Error types for pipeline orchestration.

use modci_state::{BuildKind, ProjectId, StorageError, TaskId};
use thiserror::Error;

use crate::mutex::MutexError;
use crate::release::ReleaseError;
use crate::runner::RunnerError;
use crate::source::SyncError;

/// Errors produced by a pipeline run.
///
/// Every variant is fatal for the run. Nothing here is retried locally; the
/// caller marks the task failed.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Neither the probe nor the wait acquisition got the project lock.
    #[error("timed out after {waited_ms}ms waiting for build lock on project {project_id}")]
    LockTimeout { project_id: ProjectId, waited_ms: u64 },

    /// A dependency rollback has no recorded commit to return to.
    #[error("no recorded commit for dependency {dependency_id} in task {ref_id:?}")]
    MissingProvenance {
        dependency_id: ProjectId,
        ref_id: Option<TaskId>,
    },

    /// A primary rollback has no target commit on the task.
    #[error("rollback task {task_id} carries no target commit")]
    MissingRollbackTarget { task_id: TaskId },

    /// The build command exited non-zero or hit its hard timeout.
    #[error("build of project {project_id} failed (exit code {exit_code:?}, timed out: {timed_out})")]
    BuildExecution {
        project_id: ProjectId,
        exit_code: Option<i32>,
        timed_out: bool,
    },

    #[error("project {0} not found")]
    ProjectNotFound(ProjectId),

    #[error("no default build command for project {project_id} (kind {kind:?})")]
    NoDefaultCommand { project_id: ProjectId, kind: BuildKind },

    #[error("source sync failed: {0}")]
    SourceSync(#[from] SyncError),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("build lock error: {0}")]
    Lock(#[from] MutexError),

    #[error("process error: {0}")]
    Process(#[from] RunnerError),

    #[error("release error: {0}")]
    Release(#[from] ReleaseError),

    /// A post-build hook failed after every build succeeded.
    #[error("post-build hook failed: {0}")]
    PostBuild(String),

    /// The same trigger was admitted too recently.
    #[error("trigger {key} throttled")]
    Throttled { key: String },
}

/// Convenience result alias.
pub type Result<T> = std::result::Result<T, PipelineError>;
