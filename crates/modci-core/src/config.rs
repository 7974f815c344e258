//! Orchestrator configuration.
//!
//! `CiConfig` is read from TOML with defaults for every field, then
//! overlaid with `MODCI_*` environment variables:
//!
//! | Variable                   | Field                     |
//! |----------------------------|---------------------------|
//! | `MODCI_WORKSPACE`          | `workspace.root`          |
//! | `MODCI_LOCK_BACKEND`       | `lock.backend`            |
//! | `MODCI_REDIS_URL`          | `lock.redis_url`          |
//! | `MODCI_JOB_TIMEOUT_MS`     | `build.job_timeout_ms`    |
//! | `MODCI_RELEASE_NOTIFY_URL` | `release.notify_url`      |

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use modci_state::{BuildKind, TaskId};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::release::ReleaseInstance;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config syntax: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CiConfig {
    pub workspace: WorkspaceConfig,
    pub build: BuildConfig,
    pub lock: LockConfig,
    pub release: ReleaseConfig,
    /// Per build kind replacements for the built-in default commands,
    /// keyed by kind name (`maven`, `cargo`, ...).
    pub default_commands: BTreeMap<String, String>,
    pub throttle: ThrottleConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkspaceConfig {
    /// Holds `sources/` (working copies) and `jobs/` (per-task files).
    pub root: PathBuf,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from(".modci/workspace"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildConfig {
    /// First, fast lock attempt.
    pub probe_timeout_ms: u64,
    /// Second lock attempt after the probe failed. Also the job timeout.
    pub job_timeout_ms: u64,
    /// Hard wall-clock limit on one build command.
    pub command_timeout_ms: u64,
    /// Interpreter for command files.
    pub shell: String,
    /// Build sibling dependencies concurrently.
    pub parallel_dependencies: bool,
    /// Treat a lock obtained after waiting as "someone else built it".
    /// `false` rebuilds under the lock instead.
    pub skip_after_wait: bool,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            probe_timeout_ms: 3_000,
            job_timeout_ms: 1_800_000,
            command_timeout_ms: 300_000,
            shell: "sh".to_string(),
            parallel_dependencies: false,
            skip_after_wait: true,
        }
    }
}

impl BuildConfig {
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn wait_timeout(&self) -> Duration {
        Duration::from_millis(self.job_timeout_ms)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockBackend {
    /// In-process locking; only correct on a single node.
    Memory,
    Redis,
}

impl LockBackend {
    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "memory" => Some(LockBackend::Memory),
            "redis" => Some(LockBackend::Redis),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    pub backend: LockBackend,
    pub redis_url: Option<String>,
    /// Prepended to the project id to form the lock key.
    pub key_prefix: String,
    /// Redis lease; a crashed holder's lock expires after this.
    pub lease_ms: u64,
    /// Redis retry interval while waiting for a held lock.
    pub poll_interval_ms: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            backend: LockBackend::Memory,
            redis_url: None,
            key_prefix: "modci:build:lock:".to_string(),
            lease_ms: 3_600_000,
            poll_interval_ms: 200,
        }
    }
}

impl LockConfig {
    pub fn lease(&self) -> Duration {
        Duration::from_millis(self.lease_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReleaseConfig {
    pub cluster: String,
    pub namespaces: Vec<String>,
    pub instances: Vec<ReleaseInstance>,
    /// Where release descriptors are POSTed. Unset means log only.
    pub notify_url: Option<String>,
}

impl Default for ReleaseConfig {
    fn default() -> Self {
        Self {
            cluster: "default".to_string(),
            namespaces: vec!["application".to_string()],
            instances: Vec::new(),
            notify_url: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThrottleConfig {
    pub enabled: bool,
    pub ttl_ms: u64,
    pub sweep_interval_ms: u64,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_ms: 60_000,
            sweep_interval_ms: 30_000,
        }
    }
}

impl ThrottleConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

impl CiConfig {
    /// Parse a TOML document. Missing fields take their defaults.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Read and parse a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// Overlay values from the process environment.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|name| std::env::var(name).ok())
    }

    /// Overlay values from `lookup`, keyed by `MODCI_*` variable name.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(root) = lookup("MODCI_WORKSPACE") {
            self.workspace.root = PathBuf::from(root);
        }
        if let Some(backend) = lookup("MODCI_LOCK_BACKEND") {
            self.lock.backend = LockBackend::parse(&backend).ok_or_else(|| {
                ConfigError::Invalid(format!("unknown lock backend '{backend}'"))
            })?;
        }
        if let Some(url) = lookup("MODCI_REDIS_URL") {
            self.lock.redis_url = Some(url);
        }
        if let Some(ms) = lookup("MODCI_JOB_TIMEOUT_MS") {
            self.build.job_timeout_ms = ms.trim().parse().map_err(|_| {
                ConfigError::Invalid(format!("MODCI_JOB_TIMEOUT_MS is not a number: '{ms}'"))
            })?;
        }
        if let Some(url) = lookup("MODCI_RELEASE_NOTIFY_URL") {
            self.release.notify_url = Some(url);
        }
        Ok(())
    }

    /// Check cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.build.job_timeout_ms < self.build.probe_timeout_ms {
            return Err(ConfigError::Invalid(format!(
                "build.job_timeout_ms ({}) is shorter than build.probe_timeout_ms ({})",
                self.build.job_timeout_ms, self.build.probe_timeout_ms
            )));
        }
        if self.build.shell.trim().is_empty() {
            return Err(ConfigError::Invalid("build.shell is empty".to_string()));
        }
        if self.lock.backend == LockBackend::Redis && self.lock.redis_url.is_none() {
            return Err(ConfigError::Invalid(
                "lock.backend = \"redis\" requires lock.redis_url".to_string(),
            ));
        }
        if self.lock.backend == LockBackend::Redis
            && self.lock.lease_ms <= self.build.command_timeout_ms
        {
            return Err(ConfigError::Invalid(format!(
                "lock.lease_ms ({}) must exceed build.command_timeout_ms ({})",
                self.lock.lease_ms, self.build.command_timeout_ms
            )));
        }
        if let Some(kind) = self
            .default_commands
            .keys()
            .find(|name| BuildKind::from_name(name).is_none())
        {
            return Err(ConfigError::Invalid(format!(
                "default_commands has unknown build kind '{kind}'"
            )));
        }
        Ok(())
    }

    /// Anchor a relative `workspace.root` at the current directory.
    /// Paths handed to git and the build shell must be absolute.
    pub fn resolve_workspace_root(&mut self) -> Result<(), ConfigError> {
        if self.workspace.root.is_absolute() {
            return Ok(());
        }
        let cwd = std::env::current_dir().map_err(|source| ConfigError::Io {
            path: self.workspace.root.clone(),
            source,
        })?;
        self.workspace.root = cwd.join(&self.workspace.root);
        Ok(())
    }

    pub fn layout(&self) -> JobLayout {
        JobLayout::new(&self.workspace.root)
    }
}

/// Filesystem layout under the workspace root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobLayout {
    root: PathBuf,
}

impl JobLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Working copy of a project, named after the project.
    pub fn source_dir(&self, project_name: &str) -> PathBuf {
        self.root.join("sources").join(project_name)
    }

    pub fn job_dir(&self, task_id: TaskId) -> PathBuf {
        self.root.join("jobs").join(task_id.to_string())
    }

    /// One log file per task history.
    pub fn job_log(&self, task_id: TaskId) -> PathBuf {
        self.job_dir(task_id).join("build.log")
    }

    pub fn command_file(&self, task_id: TaskId, project_name: &str) -> PathBuf {
        self.job_dir(task_id).join(format!("cmd-{project_name}.sh"))
    }
}
