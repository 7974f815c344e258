//! Pipeline orchestration: every dependency, then the primary, then the
//! post-build hook.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::future::join_all;
use modci_state::{
    BuildCommandOverrideStore, Dependency, DependencyResolver, ProjectId, TaskHistory, TaskId,
};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::coordinator::{BuildOutcome, BuildRequest, DependencyBuildCoordinator, ModuleBuildReport};
use crate::error::{PipelineError, Result};
use crate::throttle::TriggerThrottle;

/// Result of a whole pipeline run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineReport {
    pub task_id: TaskId,
    pub rollback: bool,
    /// Dependencies in build order, primary last.
    pub modules: Vec<ModuleBuildReport>,
    pub duration_ms: u64,
}

impl PipelineReport {
    pub fn primary(&self) -> Option<&ModuleBuildReport> {
        self.modules.iter().find(|m| m.dependency_id.is_none())
    }

    pub fn dependencies(&self) -> impl Iterator<Item = &ModuleBuildReport> {
        self.modules.iter().filter(|m| m.dependency_id.is_some())
    }

    /// `(project, commit)` for every module that was actually built.
    pub fn commits(&self) -> Vec<(ProjectId, String)> {
        self.modules
            .iter()
            .filter(|m| m.outcome == BuildOutcome::Built)
            .filter_map(|m| m.commit.clone().map(|c| (m.project_id, c)))
            .collect()
    }
}

/// Runs once after every build of a pipeline succeeded.
#[async_trait]
pub trait PostBuildHook: Send + Sync {
    async fn post_built(&self, task: &TaskHistory, report: &PipelineReport) -> Result<()>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHook;

#[async_trait]
impl PostBuildHook for NoopHook {
    async fn post_built(&self, _task: &TaskHistory, _report: &PipelineReport) -> Result<()> {
        Ok(())
    }
}

pub struct PipelineOrchestrator {
    coordinator: Arc<DependencyBuildCoordinator>,
    resolver: Arc<dyn DependencyResolver>,
    overrides: Arc<dyn BuildCommandOverrideStore>,
    hook: Arc<dyn PostBuildHook>,
    parallel: bool,
    throttle: Option<Arc<TriggerThrottle>>,
}

impl PipelineOrchestrator {
    pub fn new(
        coordinator: Arc<DependencyBuildCoordinator>,
        resolver: Arc<dyn DependencyResolver>,
        overrides: Arc<dyn BuildCommandOverrideStore>,
    ) -> Self {
        Self {
            coordinator,
            resolver,
            overrides,
            hook: Arc::new(NoopHook),
            parallel: false,
            throttle: None,
        }
    }

    pub fn with_hook(mut self, hook: Arc<dyn PostBuildHook>) -> Self {
        self.hook = hook;
        self
    }

    /// Build sibling dependencies concurrently.
    pub fn with_parallel_dependencies(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    /// Gate [`PipelineOrchestrator::run_triggered`] behind `throttle`.
    pub fn with_throttle(mut self, throttle: Arc<TriggerThrottle>) -> Self {
        self.throttle = Some(throttle);
        self
    }

    /// Run a pipeline for an external trigger, rejecting repeats of the same
    /// trigger within the throttle window.
    pub async fn run_triggered(
        &self,
        task: &TaskHistory,
        is_rollback: bool,
    ) -> Result<PipelineReport> {
        if let Some(throttle) = &self.throttle {
            let key = trigger_key(task, is_rollback);
            if !throttle.try_admit(&key) {
                warn!(task_id = %task.id, %key, "trigger throttled");
                return Err(PipelineError::Throttled { key });
            }
        }
        self.run_pipeline(task, is_rollback).await
    }

    /// Build every dependency of the task's project, then the project
    /// itself, then fire the post-build hook. The first error aborts.
    pub async fn run_pipeline(
        &self,
        task: &TaskHistory,
        is_rollback: bool,
    ) -> Result<PipelineReport> {
        let started = Instant::now();
        let log_file = self.coordinator.layout().job_log(task.id);
        info!(
            task_id = %task.id,
            project_id = %task.project_id,
            branch = %task.branch_name,
            rollback = is_rollback,
            log = %log_file.display(),
            "pipeline started"
        );

        let dependencies = self
            .resolver
            .hierarchy_of(task.project_id, Some(task.branch_name.as_str()))
            .await?;
        let overrides: HashMap<ProjectId, String> = self
            .overrides
            .find_by_task(task.id)
            .await?
            .into_iter()
            .map(|o| (o.project_id, o.command))
            .collect();
        info!(
            task_id = %task.id,
            dependencies = dependencies.len(),
            overrides = overrides.len(),
            "resolved dependency hierarchy"
        );

        let requests: Vec<BuildRequest> = dependencies
            .iter()
            .map(|dep| dependency_request(dep, is_rollback, &overrides))
            .collect();

        let mut modules = if self.parallel {
            self.build_concurrently(task, &requests).await?
        } else {
            self.build_sequentially(task, &requests).await?
        };

        let primary = self
            .coordinator
            .build_one(task, &BuildRequest::primary(task, is_rollback))
            .await?;
        modules.push(primary);

        let report = PipelineReport {
            task_id: task.id,
            rollback: is_rollback,
            modules,
            duration_ms: started.elapsed().as_millis() as u64,
        };
        self.hook.post_built(task, &report).await?;

        info!(
            task_id = %task.id,
            modules = report.modules.len(),
            duration_ms = report.duration_ms,
            "pipeline finished"
        );
        Ok(report)
    }

    async fn build_sequentially(
        &self,
        task: &TaskHistory,
        requests: &[BuildRequest],
    ) -> Result<Vec<ModuleBuildReport>> {
        let mut reports = Vec::with_capacity(requests.len());
        for request in requests {
            reports.push(self.coordinator.build_one(task, request).await?);
        }
        Ok(reports)
    }

    /// Every sibling runs to completion so every lock is released before
    /// the first error is reported.
    async fn build_concurrently(
        &self,
        task: &TaskHistory,
        requests: &[BuildRequest],
    ) -> Result<Vec<ModuleBuildReport>> {
        let results = join_all(
            requests
                .iter()
                .map(|request| self.coordinator.build_one(task, request)),
        )
        .await;
        results.into_iter().collect()
    }
}

fn dependency_request(
    dep: &Dependency,
    is_rollback: bool,
    overrides: &HashMap<ProjectId, String>,
) -> BuildRequest {
    BuildRequest::dependency(dep, is_rollback, overrides.get(&dep.dependent_id).cloned())
}

/// Throttle key: one trigger per project, branch and direction.
pub fn trigger_key(task: &TaskHistory, is_rollback: bool) -> String {
    let direction = if is_rollback { "rollback" } else { "forward" };
    format!("{}@{}#{}", task.project_id, task.branch_name, direction)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::CommandSource;

    fn module(project: i64, dependency: bool, commit: Option<&str>, outcome: BuildOutcome) -> ModuleBuildReport {
        ModuleBuildReport {
            project_id: ProjectId(project),
            dependency_id: dependency.then_some(ProjectId(project)),
            branch: "main".to_string(),
            commit: commit.map(str::to_string),
            command_source: commit.map(|_| CommandSource::Default),
            outcome,
            lock_waited: false,
            duration_ms: 1,
        }
    }

    #[test]
    fn test_report_commits_skip_unbuilt_modules() {
        let report = PipelineReport {
            task_id: TaskId(1),
            rollback: false,
            modules: vec![
                module(2, true, Some("aaa"), BuildOutcome::Built),
                module(3, true, None, BuildOutcome::SkippedAfterWait),
                module(1, false, Some("ccc"), BuildOutcome::Built),
            ],
            duration_ms: 3,
        };

        assert_eq!(
            report.commits(),
            vec![(ProjectId(2), "aaa".to_string()), (ProjectId(1), "ccc".to_string())]
        );
        assert_eq!(report.primary().unwrap().project_id, ProjectId(1));
        assert_eq!(report.dependencies().count(), 2);
    }

    #[test]
    fn test_trigger_key_distinguishes_direction() {
        let task = TaskHistory::forward(TaskId(1), ProjectId(5), "main");
        assert_eq!(trigger_key(&task, false), "5@main#forward");
        assert_ne!(trigger_key(&task, false), trigger_key(&task, true));
    }

    #[test]
    fn test_dependency_request_picks_override_by_project() {
        let overrides: HashMap<ProjectId, String> =
            [(ProjectId(2), "make".to_string())].into_iter().collect();

        let with = dependency_request(&Dependency::new(ProjectId(2), "main"), false, &overrides);
        let without = dependency_request(&Dependency::new(ProjectId(3), "dev"), true, &overrides);

        assert_eq!(with.override_command.as_deref(), Some("make"));
        assert!(without.override_command.is_none());
        assert!(without.is_rollback);
        assert_eq!(without.branch, "dev");
    }
}
