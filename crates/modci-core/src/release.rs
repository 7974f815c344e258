//! Release hand-off after a successful pipeline.
//!
//! [`ReleaseHook`] turns a [`PipelineReport`] into a [`ReleaseDescriptor`]
//! and hands it to a [`ReleaseNotifier`]. Descriptors are deterministic: the
//! same builds yield the same `version_id` and fingerprint.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use modci_state::{ProjectId, TaskHistory, TaskId};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::info;

use crate::config::ReleaseConfig;
use crate::orchestrator::{PipelineReport, PostBuildHook};

#[derive(Debug, Error)]
pub enum ReleaseError {
    #[error("invalid release descriptor: {0}")]
    Invalid(String),

    #[error("release notification failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("release endpoint {url} answered {status}")]
    Rejected { url: String, status: u16 },
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ReleaseInstance {
    pub host: String,
    pub port: u16,
}

impl fmt::Display for ReleaseInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseMeta {
    pub history_id: TaskId,
    pub version_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseDescriptor {
    pub cluster: String,
    pub namespaces: BTreeSet<String>,
    pub meta: ReleaseMeta,
    /// Sorted and de-duplicated.
    pub instances: Vec<ReleaseInstance>,
}

impl ReleaseDescriptor {
    pub fn new(
        cluster: impl Into<String>,
        namespaces: impl IntoIterator<Item = String>,
        meta: ReleaseMeta,
        instances: impl IntoIterator<Item = ReleaseInstance>,
    ) -> Self {
        let instances: BTreeSet<ReleaseInstance> = instances.into_iter().collect();
        Self {
            cluster: cluster.into(),
            namespaces: namespaces.into_iter().collect(),
            meta,
            instances: instances.into_iter().collect(),
        }
    }

    pub fn from_report(config: &ReleaseConfig, report: &PipelineReport) -> Self {
        Self::new(
            config.cluster.clone(),
            config.namespaces.iter().cloned(),
            ReleaseMeta {
                history_id: report.task_id,
                version_id: version_id(&report.commits()),
            },
            config.instances.iter().cloned(),
        )
    }

    pub fn validate(&self) -> Result<(), ReleaseError> {
        if self.cluster.trim().is_empty() {
            return Err(ReleaseError::Invalid("cluster is empty".to_string()));
        }
        if self.namespaces.is_empty() {
            return Err(ReleaseError::Invalid("no namespaces".to_string()));
        }
        if self.meta.version_id.is_empty() {
            return Err(ReleaseError::Invalid("version_id is empty".to_string()));
        }
        if let Some(bad) = self
            .instances
            .iter()
            .find(|i| i.host.trim().is_empty() || i.port == 0)
        {
            return Err(ReleaseError::Invalid(format!("bad instance '{bad}'")));
        }
        Ok(())
    }

    /// SHA-256 over a canonical rendering, hex encoded.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(b"cluster=");
        hasher.update(self.cluster.as_bytes());
        for ns in &self.namespaces {
            hasher.update(b"\nnamespace=");
            hasher.update(ns.as_bytes());
        }
        hasher.update(format!("\nhistory={}", self.meta.history_id).as_bytes());
        hasher.update(b"\nversion=");
        hasher.update(self.meta.version_id.as_bytes());
        for instance in &self.instances {
            hasher.update(format!("\ninstance={instance}").as_bytes());
        }
        hex::encode(hasher.finalize())
    }
}

/// First 16 hex chars of SHA-256 over the sorted `project:commit` lines.
pub fn version_id(commits: &[(ProjectId, String)]) -> String {
    let mut sorted: Vec<&(ProjectId, String)> = commits.iter().collect();
    sorted.sort();
    let mut hasher = Sha256::new();
    for (project, commit) in sorted {
        hasher.update(format!("{project}:{commit}\n").as_bytes());
    }
    let digest = hex::encode(hasher.finalize());
    digest[..16].to_string()
}

#[async_trait]
pub trait ReleaseNotifier: Send + Sync {
    async fn notify(&self, descriptor: &ReleaseDescriptor) -> Result<(), ReleaseError>;
}

/// POSTs the descriptor as JSON.
#[derive(Debug, Clone)]
pub struct HttpReleaseNotifier {
    client: reqwest::Client,
    url: String,
}

impl HttpReleaseNotifier {
    pub fn new(url: impl Into<String>) -> Result<Self, ReleaseError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl ReleaseNotifier for HttpReleaseNotifier {
    async fn notify(&self, descriptor: &ReleaseDescriptor) -> Result<(), ReleaseError> {
        let response = self
            .client
            .post(&self.url)
            .header("x-modci-fingerprint", descriptor.fingerprint())
            .json(descriptor)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(ReleaseError::Rejected {
                url: self.url.clone(),
                status: status.as_u16(),
            });
        }
        Ok(())
    }
}

/// Logs the descriptor. Used when no endpoint is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogReleaseNotifier;

#[async_trait]
impl ReleaseNotifier for LogReleaseNotifier {
    async fn notify(&self, descriptor: &ReleaseDescriptor) -> Result<(), ReleaseError> {
        info!(
            cluster = %descriptor.cluster,
            history_id = %descriptor.meta.history_id,
            version_id = %descriptor.meta.version_id,
            fingerprint = %descriptor.fingerprint(),
            "release ready"
        );
        Ok(())
    }
}

/// Keeps every descriptor it receives.
#[derive(Debug, Default)]
pub struct MemoryReleaseNotifier {
    sent: Mutex<Vec<ReleaseDescriptor>>,
}

impl MemoryReleaseNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<ReleaseDescriptor> {
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl ReleaseNotifier for MemoryReleaseNotifier {
    async fn notify(&self, descriptor: &ReleaseDescriptor) -> Result<(), ReleaseError> {
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(descriptor.clone());
        Ok(())
    }
}

/// Post-build hook that publishes a release descriptor.
pub struct ReleaseHook {
    config: ReleaseConfig,
    notifier: Arc<dyn ReleaseNotifier>,
}

impl ReleaseHook {
    pub fn new(config: ReleaseConfig, notifier: Arc<dyn ReleaseNotifier>) -> Self {
        Self { config, notifier }
    }

    /// HTTP notifier when `notify_url` is set, log-only otherwise.
    pub fn from_config(config: &ReleaseConfig) -> Result<Self, ReleaseError> {
        let notifier: Arc<dyn ReleaseNotifier> = match &config.notify_url {
            Some(url) => Arc::new(HttpReleaseNotifier::new(url.clone())?),
            None => Arc::new(LogReleaseNotifier),
        };
        Ok(Self::new(config.clone(), notifier))
    }
}

#[async_trait]
impl PostBuildHook for ReleaseHook {
    async fn post_built(&self, task: &TaskHistory, report: &PipelineReport) -> crate::Result<()> {
        let descriptor = ReleaseDescriptor::from_report(&self.config, report);
        descriptor.validate()?;
        self.notifier.notify(&descriptor).await?;
        info!(
            task_id = %task.id,
            version_id = %descriptor.meta.version_id,
            "release descriptor published"
        );
        Ok(())
    }
}
