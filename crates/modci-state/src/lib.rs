//! modci-state: records and storage seams for the modci build orchestrator
//!
//! This crate owns the data the orchestrator reads and the provenance it
//! writes. Everything behind a trait here is owned by another system in a
//! full deployment; in-memory fakes cover tests and manifest-driven runs.
//!
//! ## Key Components
//!
//! - [`model`]: `TaskHistory`, `Dependency`, `TaskBuildCommand`, `TaskSign`, `Project`
//! - [`storage_traits`]: `TaskSignStore`, `BuildCommandOverrideStore`,
//!   `DependencyResolver`, `ProjectStore`
//! - [`SurrealTaskSignStore`]: durable, append-only provenance

mod error;
pub mod fakes;
pub mod handle;
pub mod migrations;
pub mod model;
mod schema;
pub mod storage_traits;
pub mod surreal_signs;

pub use error::{StateError, StorageError};
pub use handle::CloudConfig;
pub use model::{
    BuildKind, Dependency, Project, ProjectId, TaskBuildCommand, TaskHistory, TaskId, TaskSign,
    VcsKind,
};
pub use storage_traits::{
    BuildCommandOverrideStore, DependencyResolver, ProjectStore, StorageResult, TaskSignStore,
};
pub use surreal_signs::SurrealTaskSignStore;

/// Result type for connection and schema operations
pub type Result<T> = std::result::Result<T, StateError>;
