//! Integration tests for pipeline runs against in-memory collaborators.

use std::sync::Arc;
use std::time::Duration;

use modci_core::fakes::{RecordingHook, RecordingSynchronizer, RunEvent, ScriptedRunner};
use modci_core::{
    BuildMutex, BuildOutcome, BuildRequest, CiConfig, Collaborators, CommandSource,
    DependencyBuildCoordinator, MemoryBuildMutex, MemoryReleaseNotifier, PipelineError,
    PipelineOrchestrator, ReleaseHook, TriggerThrottle,
};
use modci_state::fakes::{
    MemoryDependencyResolver, MemoryOverrideStore, MemoryProjectStore, MemoryTaskSignStore,
};
use modci_state::{
    BuildKind, Dependency, Project, ProjectId, TaskBuildCommand, TaskHistory, TaskId,
    TaskSignStore, VcsKind,
};

const P: ProjectId = ProjectId(1);
const A: ProjectId = ProjectId(2);
const B: ProjectId = ProjectId(3);

fn url(name: &str) -> String {
    format!("https://git.example/{name}.git")
}

/// P depends on A@main and B@release.
struct Fixture {
    config: CiConfig,
    projects: Arc<MemoryProjectStore>,
    signs: Arc<MemoryTaskSignStore>,
    mutex: Arc<MemoryBuildMutex>,
    source: Arc<RecordingSynchronizer>,
    runner: Arc<ScriptedRunner>,
    resolver: Arc<MemoryDependencyResolver>,
    overrides: Arc<MemoryOverrideStore>,
    _dir: tempfile::TempDir,
}

impl Fixture {
    fn new() -> Self {
        Self::with_runner(ScriptedRunner::new())
    }

    fn with_runner(runner: ScriptedRunner) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut config = CiConfig::default();
        config.workspace.root = dir.path().to_path_buf();
        config.build.probe_timeout_ms = 20;
        config.build.job_timeout_ms = 100;

        let projects = Arc::new(MemoryProjectStore::new());
        for (id, name) in [(P, "portal"), (A, "accounts"), (B, "billing")] {
            projects.put(Project {
                id,
                name: name.to_string(),
                vcs: VcsKind::Gitlab,
                remote_url: url(name),
                build_kind: BuildKind::Maven,
            });
        }

        let source = Arc::new(RecordingSynchronizer::new());
        source.set_branch_head(&url("portal"), "main", "p-1");
        source.set_branch_head(&url("accounts"), "main", "a-1");
        source.set_branch_head(&url("billing"), "release", "b-1");

        let resolver = Arc::new(MemoryDependencyResolver::new());
        resolver.add_edge(P, Dependency::new(A, "main"));
        resolver.add_edge(P, Dependency::new(B, "release"));

        Self {
            config,
            projects,
            signs: Arc::new(MemoryTaskSignStore::new()),
            mutex: Arc::new(MemoryBuildMutex::new()),
            source,
            runner: Arc::new(runner),
            resolver,
            overrides: Arc::new(MemoryOverrideStore::new()),
            _dir: dir,
        }
    }

    fn coordinator(&self) -> Arc<DependencyBuildCoordinator> {
        Arc::new(DependencyBuildCoordinator::new(
            &self.config,
            Collaborators {
                projects: self.projects.clone(),
                signs: self.signs.clone(),
                mutex: self.mutex.clone(),
                source: self.source.clone(),
                runner: self.runner.clone(),
            },
        ))
    }

    fn orchestrator(&self) -> PipelineOrchestrator {
        PipelineOrchestrator::new(
            self.coordinator(),
            self.resolver.clone(),
            self.overrides.clone(),
        )
        .with_parallel_dependencies(self.config.build.parallel_dependencies)
    }

    fn started(&self) -> Vec<ProjectId> {
        self.runner
            .events()
            .into_iter()
            .filter_map(|e| match e {
                RunEvent::Started(p) => Some(p),
                RunEvent::Finished(_) => None,
            })
            .collect()
    }
}

fn forward(id: i64) -> TaskHistory {
    TaskHistory::forward(TaskId(id), P, "main")
}

/// Test: P with {A@main, B@release}, override for A only
#[tokio::test]
async fn test_scenario_override_for_one_dependency() {
    let fx = Fixture::new();
    fx.overrides.put(TaskBuildCommand {
        task_id: TaskId(100),
        project_id: A,
        command: "mvn -q -pl core install # ${BRANCH}".to_string(),
    });
    let hook = Arc::new(RecordingHook::new());
    let orchestrator = fx.orchestrator().with_hook(hook.clone());

    let report = orchestrator.run_pipeline(&forward(100), false).await.unwrap();

    assert_eq!(report.modules.len(), 3);
    let by_project = |p: ProjectId| report.modules.iter().find(|m| m.project_id == p).unwrap();
    assert_eq!(by_project(A).command_source, Some(CommandSource::Override));
    assert_eq!(by_project(B).command_source, Some(CommandSource::Default));
    assert_eq!(by_project(P).command_source, Some(CommandSource::Default));
    assert_eq!(by_project(B).branch, "release");

    let commands: Vec<(ProjectId, String)> = fx
        .runner
        .requests()
        .into_iter()
        .map(|r| (r.project_id, r.command))
        .collect();
    assert!(commands.contains(&(A, "mvn -q -pl core install # main".to_string())));
    assert!(commands.contains(&(B, "mvn -B -U clean install -DskipTests".to_string())));

    let signs = fx.signs.list_by_task(TaskId(100)).await.unwrap();
    let signed: Vec<(ProjectId, String)> = signs
        .into_iter()
        .map(|s| (s.dependency_id, s.sha_git))
        .collect();
    assert_eq!(signed, vec![(A, "a-1".to_string()), (B, "b-1".to_string())]);

    assert_eq!(hook.calls(), 1);
    assert_eq!(fx.mutex.held_count(), 0);
}

/// Test: every dependency finishes before the primary starts
#[tokio::test]
async fn test_dependencies_before_primary() {
    let fx = Fixture::with_runner(ScriptedRunner::new().with_delay(Duration::from_millis(5)));
    fx.orchestrator().run_pipeline(&forward(1), false).await.unwrap();

    let events = fx.runner.events();
    let primary_start = events
        .iter()
        .position(|e| *e == RunEvent::Started(P))
        .unwrap();
    for dep in [A, B] {
        let finished = events
            .iter()
            .position(|e| *e == RunEvent::Finished(dep))
            .unwrap();
        assert!(finished < primary_start, "{dep} finished after primary started");
    }
}

/// Test: concurrent siblings still all finish before the primary
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_parallel_dependencies_before_primary() {
    let mut fx = Fixture::with_runner(ScriptedRunner::new().with_delay(Duration::from_millis(30)));
    fx.config.build.parallel_dependencies = true;

    let report = fx.orchestrator().run_pipeline(&forward(2), false).await.unwrap();

    let order: Vec<ProjectId> = report.modules.iter().map(|m| m.project_id).collect();
    assert_eq!(order.last(), Some(&P));
    let events = fx.runner.events();
    let primary_start = events.iter().position(|e| *e == RunEvent::Started(P)).unwrap();
    assert_eq!(
        events[..primary_start]
            .iter()
            .filter(|e| matches!(e, RunEvent::Finished(_)))
            .count(),
        2
    );
}

/// Test: a failed dependency aborts before the primary and releases every lock
#[tokio::test]
async fn test_failed_dependency_aborts_pipeline() {
    let fx = Fixture::new();
    fx.runner.fail_project(A, 2);
    let hook = Arc::new(RecordingHook::new());

    let err = fx
        .orchestrator()
        .with_hook(hook.clone())
        .run_pipeline(&forward(3), false)
        .await
        .unwrap_err();

    assert!(matches!(err, PipelineError::BuildExecution { project_id, .. } if project_id == A));
    assert!(!fx.started().contains(&P));
    assert_eq!(hook.calls(), 0);
    assert_eq!(fx.mutex.held_count(), 0);
    assert_eq!(fx.mutex.acquisitions(), fx.mutex.releases());
}

/// Test: with parallel siblings, one failure still lets the other finish and unlock
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_parallel_failure_releases_all_locks() {
    let mut fx = Fixture::with_runner(ScriptedRunner::new().with_delay(Duration::from_millis(10)));
    fx.config.build.parallel_dependencies = true;
    fx.runner.time_out_project(B);

    let err = fx
        .orchestrator()
        .run_pipeline(&forward(4), false)
        .await
        .unwrap_err();

    assert!(matches!(err, PipelineError::BuildExecution { timed_out: true, .. }));
    assert!(!fx.started().contains(&P));
    assert_eq!(fx.mutex.held_count(), 0);
    assert_eq!(fx.mutex.acquisitions(), 2);
    assert_eq!(fx.mutex.releases(), 2);
}

/// Test: a dependency locked elsewhere for the whole wait fails the run
#[tokio::test]
async fn test_lock_timeout_fails_pipeline() {
    let fx = Fixture::new();
    let coordinator = fx.coordinator();
    let key = coordinator.mutex_key(B);
    assert!(fx.mutex.try_lock(&key, Duration::ZERO).await.unwrap());
    let hook = Arc::new(RecordingHook::new());

    let err = fx
        .orchestrator()
        .with_hook(hook.clone())
        .run_pipeline(&forward(5), false)
        .await
        .unwrap_err();

    assert!(matches!(err, PipelineError::LockTimeout { project_id, .. } if project_id == B));
    assert!(!fx.started().contains(&B));
    assert!(!fx.started().contains(&P));
    assert_eq!(hook.calls(), 0);
    // Only the outside holder remains.
    assert_eq!(fx.mutex.held_count(), 1);
}

/// Test: N coordinators racing for one project never overlap
#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_mutual_exclusion_across_coordinators() {
    let mut fx = Fixture::with_runner(ScriptedRunner::new().with_delay(Duration::from_millis(15)));
    fx.config.build.job_timeout_ms = 10_000;
    fx.config.build.skip_after_wait = false;

    let mut handles = Vec::new();
    for i in 0..8 {
        // Separate coordinators, shared lock service.
        let coordinator = fx.coordinator();
        handles.push(tokio::spawn(async move {
            let task = TaskHistory::forward(TaskId(200 + i), P, "main");
            let request = BuildRequest::dependency(&Dependency::new(A, "main"), false, None);
            coordinator.build_one(&task, &request).await
        }));
    }

    for handle in handles {
        let report = handle.await.unwrap().unwrap();
        assert_eq!(report.outcome, BuildOutcome::Built);
    }
    assert_eq!(fx.runner.max_concurrent(A), 1);
    assert_eq!(fx.runner.requests().len(), 8);
    assert_eq!(fx.mutex.acquisitions(), 8);
    assert_eq!(fx.mutex.held_count(), 0);
}

/// Test: racers that only get the lock after waiting skip the build
#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_waiters_skip_concurrent_build() {
    let mut fx = Fixture::with_runner(ScriptedRunner::new().with_delay(Duration::from_millis(60)));
    fx.config.build.job_timeout_ms = 10_000;

    let mut handles = Vec::new();
    for i in 0..8 {
        let coordinator = fx.coordinator();
        handles.push(tokio::spawn(async move {
            let task = TaskHistory::forward(TaskId(300 + i), P, "main");
            let request = BuildRequest::dependency(&Dependency::new(A, "main"), false, None);
            coordinator.build_one(&task, &request).await
        }));
    }

    let mut built = 0;
    for handle in handles {
        let report = handle.await.unwrap().unwrap();
        match report.outcome {
            BuildOutcome::Built => built += 1,
            BuildOutcome::SkippedAfterWait => {
                assert!(report.lock_waited);
                assert!(report.commit.is_none());
            }
        }
    }
    assert!(built >= 1);
    assert!(built < 8);
    assert_eq!(fx.runner.requests().len(), built);
    assert_eq!(fx.runner.max_concurrent(A), 1);
    assert_eq!(fx.signs.len(), built);
    assert_eq!(fx.mutex.held_count(), 0);
}

/// Test: re-running a task never adds a second sign for the same dependency
#[tokio::test]
async fn test_provenance_recorded_once_per_dependency() {
    let fx = Fixture::new();
    let orchestrator = fx.orchestrator();
    orchestrator.run_pipeline(&forward(7), false).await.unwrap();

    fx.source.set_branch_head(&url("accounts"), "main", "a-2");
    orchestrator.run_pipeline(&forward(7), false).await.unwrap();

    let signs = fx.signs.list_by_task(TaskId(7)).await.unwrap();
    assert_eq!(signs.len(), 2);
    let a = fx.signs.find(A, TaskId(7)).await.unwrap().unwrap();
    assert_eq!(a.sha_git, "a-1");
}

/// Test: rollback restores exactly the recorded commits
#[tokio::test]
async fn test_rollback_restores_recorded_commits() {
    let fx = Fixture::new();
    let orchestrator = fx.orchestrator();
    orchestrator.run_pipeline(&forward(10), false).await.unwrap();

    // Everything moves on after the forward run.
    fx.source.set_branch_head(&url("accounts"), "main", "a-9");
    fx.source.set_branch_head(&url("billing"), "release", "b-9");
    fx.source.set_branch_head(&url("portal"), "main", "p-9");
    orchestrator.run_pipeline(&forward(11), false).await.unwrap();

    let rollback = TaskHistory::rollback_of(TaskId(12), P, "main", TaskId(10), "p-1");
    let report = orchestrator.run_pipeline(&rollback, true).await.unwrap();

    let commits = report.commits();
    assert!(commits.contains(&(A, "a-1".to_string())));
    assert!(commits.contains(&(B, "b-1".to_string())));
    assert!(commits.contains(&(P, "p-1".to_string())));

    let layout = fx.coordinator().layout().clone();
    assert_eq!(fx.source.head_of(&layout.source_dir("accounts")).as_deref(), Some("a-1"));
    assert_eq!(fx.source.head_of(&layout.source_dir("portal")).as_deref(), Some("p-1"));

    // Rollback runs add no provenance.
    assert!(fx.signs.list_by_task(TaskId(12)).await.unwrap().is_empty());
}

/// Test: rollback of a task with no recorded provenance fails before building
#[tokio::test]
async fn test_rollback_without_provenance() {
    let fx = Fixture::new();
    let rollback = TaskHistory::rollback_of(TaskId(13), P, "main", TaskId(99), "p-1");

    let err = fx
        .orchestrator()
        .run_pipeline(&rollback, true)
        .await
        .unwrap_err();

    assert!(matches!(err, PipelineError::MissingProvenance { .. }));
    assert!(fx.runner.requests().is_empty());
    assert_eq!(fx.mutex.held_count(), 0);
}

/// Test: hook failure surfaces after all builds succeeded
#[tokio::test]
async fn test_hook_failure_propagates() {
    let fx = Fixture::new();
    let hook = Arc::new(RecordingHook::failing());

    let err = fx
        .orchestrator()
        .with_hook(hook.clone())
        .run_pipeline(&forward(14), false)
        .await
        .unwrap_err();

    assert!(matches!(err, PipelineError::PostBuild(_)));
    assert_eq!(hook.calls(), 1);
    assert_eq!(fx.runner.requests().len(), 3);
}

/// Test: release hook publishes one descriptor tied to the task
#[tokio::test]
async fn test_release_descriptor_published() {
    let fx = Fixture::new();
    let notifier = Arc::new(MemoryReleaseNotifier::new());
    let hook = Arc::new(ReleaseHook::new(fx.config.release.clone(), notifier.clone()));

    let report = fx
        .orchestrator()
        .with_hook(hook)
        .run_pipeline(&forward(15), false)
        .await
        .unwrap();

    let sent = notifier.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].meta.history_id, TaskId(15));
    assert_eq!(
        sent[0].meta.version_id,
        modci_core::release::version_id(&report.commits())
    );
}

/// Test: the same trigger twice inside the TTL is rejected
#[tokio::test]
async fn test_triggered_runs_throttled() {
    let fx = Fixture::new();
    let throttle = Arc::new(TriggerThrottle::new(Duration::from_secs(60)));
    let orchestrator = fx.orchestrator().with_throttle(throttle.clone());

    orchestrator.run_triggered(&forward(16), false).await.unwrap();
    let err = orchestrator
        .run_triggered(&forward(17), false)
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::Throttled { .. }));

    // A rollback is a different trigger.
    let rollback = TaskHistory::rollback_of(TaskId(18), P, "main", TaskId(16), "p-1");
    orchestrator.run_triggered(&rollback, true).await.unwrap();
    assert_eq!(throttle.len(), 2);
}

/// Test: a leaf project builds only itself
#[tokio::test]
async fn test_project_without_dependencies() {
    let fx = Fixture::new();
    let task = TaskHistory::forward(TaskId(19), A, "main").with_build_command("make");

    let report = fx.orchestrator().run_pipeline(&task, false).await.unwrap();

    assert_eq!(report.modules.len(), 1);
    assert_eq!(report.modules[0].command_source, Some(CommandSource::Override));
    assert!(fx.signs.is_empty());
}
