//! In-memory fakes for storage traits
//!
//! Provides `MemoryTaskSignStore`, `MemoryOverrideStore`,
//! `MemoryDependencyResolver` and `MemoryProjectStore` that satisfy the trait
//! contracts without any external dependencies. The CLI also uses them to
//! serve records declared in a pipeline manifest.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::StorageError;
use crate::model::{Dependency, Project, ProjectId, TaskBuildCommand, TaskId, TaskSign};
use crate::storage_traits::*;

// ---------------------------------------------------------------------------
// MemoryTaskSignStore
// ---------------------------------------------------------------------------

/// In-memory provenance store keyed by `(task_id, dependency_id)`.
#[derive(Debug, Default)]
pub struct MemoryTaskSignStore {
    signs: Mutex<BTreeMap<(TaskId, ProjectId), TaskSign>>,
}

impl MemoryTaskSignStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of signs across all tasks.
    pub fn len(&self) -> usize {
        self.signs.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl TaskSignStore for MemoryTaskSignStore {
    async fn find(
        &self,
        dependency_id: ProjectId,
        task_id: TaskId,
    ) -> StorageResult<Option<TaskSign>> {
        let signs = self.signs.lock().unwrap();
        Ok(signs.get(&(task_id, dependency_id)).cloned())
    }

    async fn insert(&self, sign: TaskSign) -> StorageResult<()> {
        let mut signs = self.signs.lock().unwrap();
        let key = (sign.task_id, sign.dependency_id);
        if signs.contains_key(&key) {
            return Err(StorageError::DuplicateTaskSign {
                task_id: sign.task_id,
                dependency_id: sign.dependency_id,
            });
        }
        signs.insert(key, sign);
        Ok(())
    }

    async fn list_by_task(&self, task_id: TaskId) -> StorageResult<Vec<TaskSign>> {
        let signs = self.signs.lock().unwrap();
        Ok(signs
            .range((task_id, ProjectId(i64::MIN))..=(task_id, ProjectId(i64::MAX)))
            .map(|(_, sign)| sign.clone())
            .collect())
    }
}

// ---------------------------------------------------------------------------
// MemoryOverrideStore
// ---------------------------------------------------------------------------

/// In-memory build command overrides grouped by task.
#[derive(Debug, Default)]
pub struct MemoryOverrideStore {
    commands: Mutex<HashMap<TaskId, Vec<TaskBuildCommand>>>,
}

impl MemoryOverrideStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an override, replacing any previous one for the same
    /// (task, project) pair.
    pub fn put(&self, command: TaskBuildCommand) {
        let mut commands = self.commands.lock().unwrap();
        let entries = commands.entry(command.task_id).or_default();
        entries.retain(|c| c.project_id != command.project_id);
        entries.push(command);
    }
}

#[async_trait]
impl BuildCommandOverrideStore for MemoryOverrideStore {
    async fn find_by_task(&self, task_id: TaskId) -> StorageResult<Vec<TaskBuildCommand>> {
        let commands = self.commands.lock().unwrap();
        Ok(commands.get(&task_id).cloned().unwrap_or_default())
    }
}

// ---------------------------------------------------------------------------
// MemoryDependencyResolver
// ---------------------------------------------------------------------------

/// Transitive resolver over direct dependency edges.
///
/// `hierarchy_of` walks the edges depth-first and returns every reachable
/// dependency once (first edge seen wins the branch), deepest first. The
/// root project itself is never part of the result.
#[derive(Debug, Default)]
pub struct MemoryDependencyResolver {
    edges: Mutex<HashMap<ProjectId, Vec<Dependency>>>,
}

impl MemoryDependencyResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare that `project_id` directly depends on `dependency`.
    pub fn add_edge(&self, project_id: ProjectId, dependency: Dependency) {
        let mut edges = self.edges.lock().unwrap();
        edges.entry(project_id).or_default().push(dependency);
    }

    fn visit(
        edges: &HashMap<ProjectId, Vec<Dependency>>,
        project_id: ProjectId,
        visiting: &mut Vec<ProjectId>,
        seen: &mut HashSet<ProjectId>,
        out: &mut Vec<Dependency>,
    ) -> StorageResult<()> {
        visiting.push(project_id);
        for dep in edges.get(&project_id).map(Vec::as_slice).unwrap_or_default() {
            if let Some(pos) = visiting.iter().position(|p| *p == dep.dependent_id) {
                let mut projects = visiting[pos..].to_vec();
                projects.push(dep.dependent_id);
                return Err(StorageError::DependencyCycle { projects });
            }
            if seen.contains(&dep.dependent_id) {
                continue;
            }
            Self::visit(edges, dep.dependent_id, visiting, seen, out)?;
            seen.insert(dep.dependent_id);
            out.push(dep.clone());
        }
        visiting.pop();
        Ok(())
    }
}

#[async_trait]
impl DependencyResolver for MemoryDependencyResolver {
    async fn hierarchy_of(
        &self,
        project_id: ProjectId,
        _reference: Option<&str>,
    ) -> StorageResult<Vec<Dependency>> {
        let edges = self.edges.lock().unwrap();
        let mut visiting = Vec::new();
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        Self::visit(&edges, project_id, &mut visiting, &mut seen, &mut out)?;
        Ok(out)
    }
}

// ---------------------------------------------------------------------------
// MemoryProjectStore
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct MemoryProjectStore {
    projects: Mutex<HashMap<ProjectId, Project>>,
}

impl MemoryProjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, project: Project) {
        let mut projects = self.projects.lock().unwrap();
        projects.insert(project.id, project);
    }
}

#[async_trait]
impl ProjectStore for MemoryProjectStore {
    async fn get(&self, project_id: ProjectId) -> StorageResult<Option<Project>> {
        let projects = self.projects.lock().unwrap();
        Ok(projects.get(&project_id).cloned())
    }
}
