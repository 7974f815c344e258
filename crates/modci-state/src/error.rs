//! Error types for modci-state

use thiserror::Error;

use crate::model::{ProjectId, TaskId};

/// Errors raised while connecting to or preparing the SurrealDB backend
#[derive(Error, Debug)]
pub enum StateError {
    /// Database connection error
    #[error("Database connection failed: {0}")]
    Connection(String),

    /// Database query error
    #[error("Database query failed: {0}")]
    Query(String),

    /// Serialization error
    #[error("Serialization failed: {0}")]
    Serialization(String),

    /// Schema setup error
    #[error("Schema setup failed: {0}")]
    SchemaSetup(String),
}

impl From<surrealdb::Error> for StateError {
    fn from(err: surrealdb::Error) -> Self {
        StateError::Query(err.to_string())
    }
}

impl From<serde_json::Error> for StateError {
    fn from(err: serde_json::Error) -> Self {
        StateError::Serialization(err.to_string())
    }
}

/// Errors returned by the storage trait implementations
#[derive(Error, Debug)]
pub enum StorageError {
    /// A provenance record already exists for this (task, dependency) pair
    #[error("task sign already recorded for task {task_id}, dependency {dependency_id}")]
    DuplicateTaskSign {
        task_id: TaskId,
        dependency_id: ProjectId,
    },

    /// The dependency hierarchy loops back on itself
    #[error("dependency cycle detected involving projects: {projects:?}")]
    DependencyCycle { projects: Vec<ProjectId> },

    /// Backend failure (query, connection, decoding)
    #[error("storage backend error: {0}")]
    Backend(String),
}

impl From<StateError> for StorageError {
    fn from(err: StateError) -> Self {
        StorageError::Backend(err.to_string())
    }
}
