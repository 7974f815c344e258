//! Run manifests: a TOML file describing one task and the records it
//! needs, loaded into the in-memory stores.

use std::collections::HashSet;
use std::path::Path;

use anyhow::{bail, Context, Result};
use modci_state::fakes::{MemoryDependencyResolver, MemoryOverrideStore, MemoryProjectStore};
use modci_state::{
    Dependency, Project, ProjectId, TaskBuildCommand, TaskHistory, TaskId, TaskSign,
    TaskSignStore,
};
use serde::Deserialize;
use tracing::debug;

#[derive(Debug, Clone, Deserialize)]
pub struct Manifest {
    pub task: TaskHistory,
    #[serde(default)]
    pub projects: Vec<Project>,
    #[serde(default)]
    pub dependencies: Vec<DependencyEdge>,
    #[serde(default)]
    pub overrides: Vec<CommandOverride>,
    /// Provenance from earlier runs, for rollbacks without a durable store.
    #[serde(default)]
    pub signs: Vec<RecordedSign>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DependencyEdge {
    pub project_id: ProjectId,
    pub dependent_id: ProjectId,
    pub branch: String,
}

/// Build command override for one project of the manifest's task.
#[derive(Debug, Clone, Deserialize)]
pub struct CommandOverride {
    pub project_id: ProjectId,
    pub command: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RecordedSign {
    pub task_id: TaskId,
    pub dependency_id: ProjectId,
    pub sha_git: String,
}

/// The manifest loaded into in-memory stores.
pub struct ManifestStores {
    pub projects: MemoryProjectStore,
    pub resolver: MemoryDependencyResolver,
    pub overrides: MemoryOverrideStore,
}

impl Manifest {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let manifest: Manifest = toml::from_str(text).context("Invalid manifest")?;
        manifest.validate()?;
        Ok(manifest)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read manifest {}", path.display()))?;
        Self::from_toml_str(&text)
            .with_context(|| format!("Failed to load manifest {}", path.display()))
    }

    /// Every referenced project must be declared exactly once.
    pub fn validate(&self) -> Result<()> {
        let mut declared = HashSet::new();
        for project in &self.projects {
            if !declared.insert(project.id) {
                bail!("project {} declared twice", project.id);
            }
        }

        let referenced = std::iter::once(self.task.project_id)
            .chain(
                self.dependencies
                    .iter()
                    .flat_map(|edge| [edge.project_id, edge.dependent_id]),
            )
            .chain(self.overrides.iter().map(|o| o.project_id));
        for id in referenced {
            if !declared.contains(&id) {
                bail!("project {} is referenced but not declared", id);
            }
        }

        if let Some(edge) = self.dependencies.iter().find(|e| e.branch.trim().is_empty()) {
            bail!(
                "dependency {} -> {} has an empty branch",
                edge.project_id,
                edge.dependent_id
            );
        }
        Ok(())
    }

    pub fn stores(&self) -> ManifestStores {
        let projects = MemoryProjectStore::new();
        for project in &self.projects {
            projects.put(project.clone());
        }

        let resolver = MemoryDependencyResolver::new();
        for edge in &self.dependencies {
            resolver.add_edge(
                edge.project_id,
                Dependency::new(edge.dependent_id, edge.branch.clone()),
            );
        }

        let overrides = MemoryOverrideStore::new();
        for o in &self.overrides {
            overrides.put(TaskBuildCommand {
                task_id: self.task.id,
                project_id: o.project_id,
                command: o.command.clone(),
            });
        }

        ManifestStores {
            projects,
            resolver,
            overrides,
        }
    }

    /// Insert recorded signs the store does not already hold. Returns how
    /// many were added.
    pub async fn seed_signs(&self, store: &dyn TaskSignStore) -> Result<usize> {
        let mut added = 0;
        for sign in &self.signs {
            let existing = store
                .find(sign.dependency_id, sign.task_id)
                .await
                .context("Failed to look up task sign")?;
            if existing.is_some() {
                debug!(task_id = %sign.task_id, dependency_id = %sign.dependency_id, "sign already recorded");
                continue;
            }
            store
                .insert(TaskSign::new(sign.task_id, sign.dependency_id, sign.sha_git.clone()))
                .await
                .context("Failed to record task sign")?;
            added += 1;
        }
        Ok(added)
    }
}
