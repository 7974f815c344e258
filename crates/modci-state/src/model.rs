//! Domain records shared by the orchestrator and its storage collaborators.
//!
//! - [`TaskHistory`]: one pipeline execution
//! - [`Dependency`]: "this project depends on `dependent_id` built from `branch`"
//! - [`TaskBuildCommand`]: per-task build command override for one project
//! - [`TaskSign`]: provenance record (exact commit a dependency was built at)
//! - [`Project`]: static project metadata

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identifier of a pipeline execution (task history row).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub i64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a project (primary or dependency).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProjectId(pub i64);

impl fmt::Display for ProjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One build-pipeline execution instance.
///
/// Created when a run is triggered. The orchestrator only reads it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskHistory {
    pub id: TaskId,
    /// Primary project built by this run.
    pub project_id: ProjectId,
    /// Branch of the primary project.
    pub branch_name: String,
    /// Override for the primary build command. Empty means default.
    #[serde(default)]
    pub build_command: String,
    /// Commit the primary project is rolled back to (rollback runs only).
    #[serde(default)]
    pub sha_git: Option<String>,
    /// The forward run a rollback run is undoing.
    #[serde(default)]
    pub ref_id: Option<TaskId>,
}

impl TaskHistory {
    /// Forward run of `project_id` on `branch_name`.
    pub fn forward(id: TaskId, project_id: ProjectId, branch_name: impl Into<String>) -> Self {
        Self {
            id,
            project_id,
            branch_name: branch_name.into(),
            build_command: String::new(),
            sha_git: None,
            ref_id: None,
        }
    }

    /// Rollback run undoing `ref_id`, restoring the primary to `sha_git`.
    pub fn rollback_of(
        id: TaskId,
        project_id: ProjectId,
        branch_name: impl Into<String>,
        ref_id: TaskId,
        sha_git: impl Into<String>,
    ) -> Self {
        Self {
            id,
            project_id,
            branch_name: branch_name.into(),
            build_command: String::new(),
            sha_git: Some(sha_git.into()),
            ref_id: Some(ref_id),
        }
    }

    /// Set the primary build command override.
    pub fn with_build_command(mut self, command: impl Into<String>) -> Self {
        self.build_command = command.into();
        self
    }

    /// The primary override, `None` when blank.
    pub fn primary_override(&self) -> Option<&str> {
        let trimmed = self.build_command.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(self.build_command.as_str())
        }
    }
}

/// Dependency edge: the primary depends on `dependent_id` built from `branch`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Dependency {
    pub dependent_id: ProjectId,
    pub branch: String,
}

impl Dependency {
    pub fn new(dependent_id: ProjectId, branch: impl Into<String>) -> Self {
        Self {
            dependent_id,
            branch: branch.into(),
        }
    }
}

/// Per-task build command override for one project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskBuildCommand {
    pub task_id: TaskId,
    pub project_id: ProjectId,
    pub command: String,
}

/// Provenance record: the exact commit `dependency_id` was built at for `task_id`.
///
/// Append-only. At most one per `(task_id, dependency_id)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSign {
    pub task_id: TaskId,
    pub dependency_id: ProjectId,
    pub sha_git: String,
    pub created_at: DateTime<Utc>,
}

impl TaskSign {
    pub fn new(task_id: TaskId, dependency_id: ProjectId, sha_git: impl Into<String>) -> Self {
        Self {
            task_id,
            dependency_id,
            sha_git: sha_git.into(),
            created_at: Utc::now(),
        }
    }
}

/// Hosting flavour of a project's repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VcsKind {
    Github,
    Gitlab,
    Gitee,
    Bitbucket,
    /// Any other plain git remote.
    Git,
}

impl VcsKind {
    pub fn name(&self) -> &'static str {
        match self {
            VcsKind::Github => "github",
            VcsKind::Gitlab => "gitlab",
            VcsKind::Gitee => "gitee",
            VcsKind::Bitbucket => "bitbucket",
            VcsKind::Git => "git",
        }
    }
}

/// Build system of a project. Selects the default build commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildKind {
    Maven,
    Gradle,
    Npm,
    Cargo,
    Go,
    Python,
    Docker,
    /// No default; every build needs an explicit command.
    Custom,
}

impl BuildKind {
    pub fn name(&self) -> &'static str {
        match self {
            BuildKind::Maven => "maven",
            BuildKind::Gradle => "gradle",
            BuildKind::Npm => "npm",
            BuildKind::Cargo => "cargo",
            BuildKind::Go => "go",
            BuildKind::Python => "python",
            BuildKind::Docker => "docker",
            BuildKind::Custom => "custom",
        }
    }

    /// Parse a kind from its snake_case name.
    pub fn from_name(name: &str) -> Option<Self> {
        [
            BuildKind::Maven,
            BuildKind::Gradle,
            BuildKind::Npm,
            BuildKind::Cargo,
            BuildKind::Go,
            BuildKind::Python,
            BuildKind::Docker,
            BuildKind::Custom,
        ]
        .into_iter()
        .find(|kind| kind.name() == name)
    }
}

/// Static project metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Project {
    pub id: ProjectId,
    /// Also names the local working directory.
    pub name: String,
    pub vcs: VcsKind,
    pub remote_url: String,
    pub build_kind: BuildKind,
}
