//! Builds one project under its cluster-wide lock.
//!
//! Per edge the coordinator moves through
//! `LOCK_WAIT -> SOURCE_SYNC -> SIGNED (forward dependencies only) ->
//! BUILDING -> DONE`, or `FAILED` from any state. The lock is released on
//! every exit path once acquired.

use std::sync::Arc;
use std::time::Instant;

use modci_state::{
    Dependency, Project, ProjectId, ProjectStore, StorageError, TaskHistory, TaskSign,
    TaskSignStore,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::build_log::BuildLog;
use crate::command::{
    self, BuildCommandResolver, CommandSource, DefaultCommandTable, PlaceholderContext,
};
use crate::config::{BuildConfig, CiConfig, JobLayout};
use crate::error::{PipelineError, Result};
use crate::mutex::{BuildMutex, MutexKey};
use crate::runner::{CommandRunner, ProcessRequest};
use crate::source::SourceSynchronizer;

/// What to build for one edge of the pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildRequest {
    pub project_id: ProjectId,
    /// Set for dependency builds (equal to `project_id`), `None` for the primary.
    pub dependency_id: Option<ProjectId>,
    pub branch: String,
    pub is_rollback: bool,
    pub override_command: Option<String>,
}

impl BuildRequest {
    pub fn dependency(dep: &Dependency, is_rollback: bool, override_command: Option<String>) -> Self {
        Self {
            project_id: dep.dependent_id,
            dependency_id: Some(dep.dependent_id),
            branch: dep.branch.clone(),
            is_rollback,
            override_command,
        }
    }

    pub fn primary(task: &TaskHistory, is_rollback: bool) -> Self {
        Self {
            project_id: task.project_id,
            dependency_id: None,
            branch: task.branch_name.clone(),
            is_rollback,
            override_command: task.primary_override().map(str::to_string),
        }
    }

    pub fn is_dependency(&self) -> bool {
        self.dependency_id.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildOutcome {
    Built,
    /// Lock obtained only after waiting and `skip_after_wait` is set.
    SkippedAfterWait,
}

/// Result of one edge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleBuildReport {
    pub project_id: ProjectId,
    pub dependency_id: Option<ProjectId>,
    pub branch: String,
    /// Commit that was built. `None` when skipped.
    pub commit: Option<String>,
    pub command_source: Option<CommandSource>,
    pub outcome: BuildOutcome,
    pub lock_waited: bool,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Copy)]
enum BuildState {
    LockWait,
    SourceSync,
    Signed,
    Building,
    Done,
    Failed,
}

impl BuildState {
    fn as_str(self) -> &'static str {
        match self {
            BuildState::LockWait => "LOCK_WAIT",
            BuildState::SourceSync => "SOURCE_SYNC",
            BuildState::Signed => "SIGNED",
            BuildState::Building => "BUILDING",
            BuildState::Done => "DONE",
            BuildState::Failed => "FAILED",
        }
    }
}

/// Everything the coordinator talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub projects: Arc<dyn ProjectStore>,
    pub signs: Arc<dyn TaskSignStore>,
    pub mutex: Arc<dyn BuildMutex>,
    pub source: Arc<dyn SourceSynchronizer>,
    pub runner: Arc<dyn CommandRunner>,
}

pub struct DependencyBuildCoordinator {
    parts: Collaborators,
    layout: JobLayout,
    build: BuildConfig,
    key_prefix: String,
    defaults: DefaultCommandTable,
}

impl DependencyBuildCoordinator {
    pub fn new(config: &CiConfig, parts: Collaborators) -> Self {
        Self {
            parts,
            layout: config.layout(),
            build: config.build.clone(),
            key_prefix: config.lock.key_prefix.clone(),
            defaults: DefaultCommandTable::with_overrides(&config.default_commands),
        }
    }

    pub fn layout(&self) -> &JobLayout {
        &self.layout
    }

    pub fn mutex_key(&self, project_id: ProjectId) -> MutexKey {
        MutexKey::for_project(&self.key_prefix, project_id)
    }

    /// Build one project for `task` while holding its lock.
    pub async fn build_one(
        &self,
        task: &TaskHistory,
        request: &BuildRequest,
    ) -> Result<ModuleBuildReport> {
        let started = Instant::now();
        let key = self.mutex_key(request.project_id);
        let log = BuildLog::new(self.layout.job_log(task.id));
        self.transition(task, request, BuildState::LockWait);

        let lock_waited = match self.acquire(task, request, &key, &log).await {
            Ok(waited) => waited,
            Err(e) => {
                self.transition(task, request, BuildState::Failed);
                return Err(e);
            }
        };

        let result = if lock_waited && self.build.skip_after_wait {
            info!(
                task_id = %task.id,
                project_id = %request.project_id,
                "lock obtained after waiting, treating concurrent build as sufficient"
            );
            log.append(&format!(
                "Project {} was built by a concurrent pipeline, skipping",
                request.project_id
            ))
            .await;
            Ok(ModuleBuildReport {
                project_id: request.project_id,
                dependency_id: request.dependency_id,
                branch: request.branch.clone(),
                commit: None,
                command_source: None,
                outcome: BuildOutcome::SkippedAfterWait,
                lock_waited,
                duration_ms: 0,
            })
        } else {
            self.build_locked(task, request, &log, lock_waited).await
        };

        let released = self.parts.mutex.unlock(&key).await;
        let result = match (result, released) {
            (Ok(report), Ok(())) => Ok(report),
            (Ok(_), Err(e)) => Err(PipelineError::Lock(e)),
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(unlock_err)) => {
                warn!(%key, error = %unlock_err, "unlock failed after build error");
                Err(e)
            }
        };

        match result {
            Ok(mut report) => {
                report.duration_ms = started.elapsed().as_millis() as u64;
                self.transition(task, request, BuildState::Done);
                Ok(report)
            }
            Err(e) => {
                self.transition(task, request, BuildState::Failed);
                Err(e)
            }
        }
    }

    fn transition(&self, task: &TaskHistory, request: &BuildRequest, state: BuildState) {
        debug!(
            task_id = %task.id,
            project_id = %request.project_id,
            dependency = request.is_dependency(),
            rollback = request.is_rollback,
            state = state.as_str(),
            "build state"
        );
    }

    /// Probe, then wait. Returns whether the lock was obtained only after
    /// waiting.
    async fn acquire(
        &self,
        task: &TaskHistory,
        request: &BuildRequest,
        key: &MutexKey,
        log: &BuildLog,
    ) -> Result<bool> {
        if self
            .parts
            .mutex
            .try_lock(key, self.build.probe_timeout())
            .await?
        {
            return Ok(false);
        }

        let wait = self.build.wait_timeout();
        let message = format!(
            "Project {} is being built by another pipeline, waiting up to {}ms (task {})",
            request.project_id,
            wait.as_millis(),
            task.id
        );
        info!(task_id = %task.id, project_id = %request.project_id, %key, "{message}");
        log.append(&message).await;

        let waiting = Instant::now();
        if !self.parts.mutex.try_lock(key, wait).await? {
            let waited_ms = (self.build.probe_timeout() + waiting.elapsed()).as_millis() as u64;
            let message = format!(
                "Gave up waiting for project {} after {}ms",
                request.project_id, waited_ms
            );
            warn!(task_id = %task.id, project_id = %request.project_id, %key, "{message}");
            log.append(&message).await;
            return Err(PipelineError::LockTimeout {
                project_id: request.project_id,
                waited_ms,
            });
        }

        info!(
            task_id = %task.id,
            project_id = %request.project_id,
            waited_ms = waiting.elapsed().as_millis() as u64,
            "lock acquired after waiting"
        );
        Ok(true)
    }

    async fn build_locked(
        &self,
        task: &TaskHistory,
        request: &BuildRequest,
        log: &BuildLog,
        lock_waited: bool,
    ) -> Result<ModuleBuildReport> {
        let project = self
            .parts
            .projects
            .get(request.project_id)
            .await?
            .ok_or(PipelineError::ProjectNotFound(request.project_id))?;
        let dir = self.layout.source_dir(&project.name);

        self.transition(task, request, BuildState::SourceSync);
        self.sync_source(task, request, &project, log).await?;
        let commit = self.parts.source.latest_commit(&dir).await?;

        if request.is_dependency() && !request.is_rollback {
            self.record_sign(task, request.project_id, &commit).await?;
            self.transition(task, request, BuildState::Signed);
        }

        self.transition(task, request, BuildState::Building);
        let (command, command_source) = self.resolve_command(task, request, &project)?;
        log.append(&format!(
            "Building project {} ({}) at {} on branch {}",
            project.id, project.name, commit, request.branch
        ))
        .await;

        let process = ProcessRequest {
            task_id: task.id,
            project_id: project.id,
            command,
            working_dir: dir,
            command_file: self.layout.command_file(task.id, &project.name),
            log_file: log.path().to_path_buf(),
            timeout: self.build.command_timeout(),
        };
        let outcome = self.parts.runner.run(&process).await?;
        if !outcome.success() {
            log.append(&format!(
                "Build of project {} failed (exit code {:?}, timed out: {})",
                project.id, outcome.exit_code, outcome.timed_out
            ))
            .await;
            return Err(PipelineError::BuildExecution {
                project_id: project.id,
                exit_code: outcome.exit_code,
                timed_out: outcome.timed_out,
            });
        }

        Ok(ModuleBuildReport {
            project_id: project.id,
            dependency_id: request.dependency_id,
            branch: request.branch.clone(),
            commit: Some(commit),
            command_source: Some(command_source),
            outcome: BuildOutcome::Built,
            lock_waited,
            duration_ms: outcome.duration_ms,
        })
    }

    async fn sync_source(
        &self,
        task: &TaskHistory,
        request: &BuildRequest,
        project: &Project,
        log: &BuildLog,
    ) -> Result<()> {
        let source = &self.parts.source;
        let dir = self.layout.source_dir(&project.name);
        let has_copy = source.has_local_copy(&dir).await;

        if request.is_rollback {
            let target = self.rollback_target(task, request).await?;
            log.append(&format!(
                "Rolling back project {} to {}",
                project.id, target
            ))
            .await;
            if !has_copy {
                source
                    .clone_repo(project.vcs, &project.remote_url, &dir, &request.branch)
                    .await?;
            }
            source.rollback(project.vcs, &dir, &target).await?;
        } else if has_copy {
            source
                .checkout_and_pull(project.vcs, &dir, &request.branch)
                .await?;
        } else {
            source
                .clone_repo(project.vcs, &project.remote_url, &dir, &request.branch)
                .await?;
        }
        Ok(())
    }

    /// Commit a rollback returns to: the recorded provenance for a
    /// dependency, the task's own target for the primary.
    async fn rollback_target(&self, task: &TaskHistory, request: &BuildRequest) -> Result<String> {
        match request.dependency_id {
            Some(dependency_id) => {
                let missing = PipelineError::MissingProvenance {
                    dependency_id,
                    ref_id: task.ref_id,
                };
                let ref_id = task.ref_id.ok_or(missing)?;
                let sign = self.parts.signs.find(dependency_id, ref_id).await?;
                sign.map(|s| s.sha_git)
                    .ok_or(PipelineError::MissingProvenance {
                        dependency_id,
                        ref_id: Some(ref_id),
                    })
            }
            None => task
                .sha_git
                .clone()
                .filter(|sha| !sha.trim().is_empty())
                .ok_or(PipelineError::MissingRollbackTarget { task_id: task.id }),
        }
    }

    async fn record_sign(
        &self,
        task: &TaskHistory,
        dependency_id: ProjectId,
        commit: &str,
    ) -> Result<()> {
        if let Some(existing) = self.parts.signs.find(dependency_id, task.id).await? {
            if existing.sha_git != commit {
                warn!(
                    task_id = %task.id,
                    %dependency_id,
                    recorded = %existing.sha_git,
                    built = commit,
                    "task sign already recorded with a different commit, keeping the first"
                );
            } else {
                debug!(task_id = %task.id, %dependency_id, "task sign already recorded");
            }
            return Ok(());
        }

        match self
            .parts
            .signs
            .insert(TaskSign::new(task.id, dependency_id, commit))
            .await
        {
            Ok(()) => {
                info!(task_id = %task.id, %dependency_id, sha = commit, "task sign recorded");
                Ok(())
            }
            Err(StorageError::DuplicateTaskSign { .. }) => {
                debug!(task_id = %task.id, %dependency_id, "task sign written concurrently");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    fn resolve_command(
        &self,
        task: &TaskHistory,
        request: &BuildRequest,
        project: &Project,
    ) -> Result<(String, CommandSource)> {
        let dir = self.layout.source_dir(&project.name);
        let ctx = PlaceholderContext::new()
            .with(command::PROJECT_ID, project.id)
            .with(command::PROJECT_NAME, &project.name)
            .with(command::PROJECT_DIR, dir.display())
            .with(command::BRANCH, &request.branch)
            .with(command::TASK_ID, task.id)
            .with(command::LOG_FILE, self.layout.job_log(task.id).display());

        if let Some(command) =
            BuildCommandResolver::resolve(request.override_command.as_deref(), &ctx)
        {
            return Ok((command, CommandSource::Override));
        }

        let template = self.defaults.command_for(project.build_kind).ok_or(
            PipelineError::NoDefaultCommand {
                project_id: project.id,
                kind: project.build_kind,
            },
        )?;
        Ok((
            BuildCommandResolver::substitute(template, &ctx),
            CommandSource::Default,
        ))
    }
}

impl std::fmt::Debug for DependencyBuildCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DependencyBuildCoordinator")
            .field("layout", &self.layout)
            .field("key_prefix", &self.key_prefix)
            .finish_non_exhaustive()
    }
}
