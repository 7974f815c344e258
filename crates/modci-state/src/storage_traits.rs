//! Storage trait definitions for modci
//!
//! These traits are the seams between the orchestrator and the systems that
//! own task, dependency and provenance records:
//! - `TaskSignStore`: append-only provenance (task, dependency) -> commit
//! - `BuildCommandOverrideStore`: per-task build command overrides
//! - `DependencyResolver`: dependency hierarchy of a project
//! - `ProjectStore`: static project metadata
//!
//! All traits are async and backend-agnostic. In-memory fakes are provided
//! via the `fakes` module.

use async_trait::async_trait;

use crate::error::StorageError;
use crate::model::{Dependency, Project, ProjectId, TaskBuildCommand, TaskId, TaskSign};

/// Result type for storage operations
pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Append-only provenance store.
///
/// Guarantees:
/// - At most one sign per `(task_id, dependency_id)`; a second `insert` for
///   the same pair fails with `StorageError::DuplicateTaskSign`.
/// - Signs are never updated or deleted.
#[async_trait]
pub trait TaskSignStore: Send + Sync {
    /// Find the sign recorded for `dependency_id` by task `task_id`.
    async fn find(
        &self,
        dependency_id: ProjectId,
        task_id: TaskId,
    ) -> StorageResult<Option<TaskSign>>;

    /// Persist a new sign.
    async fn insert(&self, sign: TaskSign) -> StorageResult<()>;

    /// All signs written by a task, ordered by dependency id.
    async fn list_by_task(&self, task_id: TaskId) -> StorageResult<Vec<TaskSign>>;
}

/// Per-task build command overrides.
#[async_trait]
pub trait BuildCommandOverrideStore: Send + Sync {
    async fn find_by_task(&self, task_id: TaskId) -> StorageResult<Vec<TaskBuildCommand>>;
}

/// Resolves the (transitive) dependency set of a project.
///
/// The result is treated as an unordered set: dependencies carry no build
/// order among themselves.
#[async_trait]
pub trait DependencyResolver: Send + Sync {
    async fn hierarchy_of(
        &self,
        project_id: ProjectId,
        reference: Option<&str>,
    ) -> StorageResult<Vec<Dependency>>;
}

/// Static project metadata lookup.
#[async_trait]
pub trait ProjectStore: Send + Sync {
    async fn get(&self, project_id: ProjectId) -> StorageResult<Option<Project>>;
}
