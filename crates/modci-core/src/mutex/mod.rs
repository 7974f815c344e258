//! Per-project build locks.
//!
//! A project is built by at most one pipeline at a time across the
//! cluster. [`BuildMutex`] is the seam; [`MemoryBuildMutex`] serves single
//! node deployments and tests, [`RedisBuildMutex`] serves clusters.

mod memory;
mod redis_lock;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use modci_state::ProjectId;
use thiserror::Error;
use tokio::time::Instant;
use tracing::info;

use crate::config::{LockBackend, LockConfig};

pub use memory::MemoryBuildMutex;
pub use redis_lock::RedisBuildMutex;

/// Name of a cluster-wide lock.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MutexKey(String);

impl MutexKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Lock guarding builds (and the working copy) of one project.
    pub fn for_project(prefix: &str, project_id: ProjectId) -> Self {
        Self(format!("{prefix}{project_id}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MutexKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Error)]
pub enum MutexError {
    /// `unlock` without a matching successful `try_lock` on this node.
    #[error("lock {key} is not held by this node")]
    NotHeld { key: String },

    /// The lease ran out and another holder may own the key now.
    #[error("lease on lock {key} expired before release")]
    LeaseExpired { key: String },

    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("lock backend misconfigured: {0}")]
    Config(String),
}

/// Cluster-wide named lock with bounded wait.
#[async_trait]
pub trait BuildMutex: Send + Sync {
    /// Try to take `key`, waiting up to `timeout`. `Ok(false)` means the
    /// lock stayed held by someone else for the whole window.
    async fn try_lock(&self, key: &MutexKey, timeout: Duration) -> Result<bool, MutexError>;

    /// Release a lock taken by a successful [`BuildMutex::try_lock`].
    async fn unlock(&self, key: &MutexKey) -> Result<(), MutexError>;
}

/// Stands in for wait timeouts too large to add to the current instant.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// `now + timeout`, saturating at [`FAR_FUTURE`].
fn deadline_after(timeout: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(timeout).unwrap_or(now + FAR_FUTURE)
}

/// Build the backend selected by `config`.
pub async fn connect(config: &LockConfig) -> Result<Arc<dyn BuildMutex>, MutexError> {
    match config.backend {
        LockBackend::Memory => {
            info!("using in-process build locks");
            Ok(Arc::new(MemoryBuildMutex::new()))
        }
        LockBackend::Redis => {
            let url = config.redis_url.as_deref().ok_or_else(|| {
                MutexError::Config("redis backend selected without redis_url".to_string())
            })?;
            let mutex = RedisBuildMutex::connect(url, config.lease(), config.poll_interval()).await?;
            info!(url, "using redis build locks");
            Ok(Arc::new(mutex))
        }
    }
}
