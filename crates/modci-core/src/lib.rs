//! modci-core: dependency-aware build orchestration
//!
//! Builds a project's internal dependencies, then the project itself,
//! guaranteeing that no two cluster nodes build the same project at once,
//! recording the exact commit every dependency was built at, and replaying
//! those commits on rollback.
//!
//! ## Key Components
//!
//! - [`PipelineOrchestrator`]: dependencies, then primary, then post-build hook
//! - [`DependencyBuildCoordinator`]: one project under its cluster-wide lock
//! - [`mutex`]: `BuildMutex` with in-process and Redis backends
//! - [`ProcessRunner`]: command files with a hard, process-group timeout
//! - [`GitCliSynchronizer`]: working copies via the `git` binary
//! - [`ReleaseHook`]: deterministic release descriptors for downstream
//! - [`TriggerThrottle`]: drops repeated triggers within a TTL

pub mod build_log;
pub mod command;
pub mod config;
pub mod coordinator;
mod error;
pub mod fakes;
pub mod mutex;
pub mod orchestrator;
pub mod release;
pub mod runner;
pub mod source;
pub mod telemetry;
pub mod throttle;

pub use build_log::BuildLog;
pub use command::{BuildCommandResolver, CommandSource, DefaultCommandTable, PlaceholderContext};
pub use config::{CiConfig, ConfigError, JobLayout, LockBackend};
pub use coordinator::{
    BuildOutcome, BuildRequest, Collaborators, DependencyBuildCoordinator, ModuleBuildReport,
};
pub use error::{PipelineError, Result};
pub use mutex::{BuildMutex, MemoryBuildMutex, MutexError, MutexKey, RedisBuildMutex};
pub use orchestrator::{NoopHook, PipelineOrchestrator, PipelineReport, PostBuildHook};
pub use release::{
    HttpReleaseNotifier, LogReleaseNotifier, MemoryReleaseNotifier, ReleaseDescriptor,
    ReleaseError, ReleaseHook, ReleaseInstance, ReleaseMeta, ReleaseNotifier,
};
pub use runner::{CommandRunner, ProcessOutcome, ProcessRequest, ProcessRunner, RunnerError};
pub use source::{GitCliSynchronizer, SourceSynchronizer, SyncError};
pub use telemetry::init_tracing;
pub use throttle::TriggerThrottle;
