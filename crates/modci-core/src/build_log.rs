//! Coordinator messages in the task log.
//!
//! Build processes append their own output to the same file; these lines
//! carry a timestamp and a `[modci]` marker so they stand out.

use std::path::{Path, PathBuf};

use chrono::Utc;
use tokio::io::AsyncWriteExt;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct BuildLog {
    path: PathBuf,
}

impl BuildLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one line. Failures are logged, never propagated.
    pub async fn append(&self, message: &str) {
        if let Err(e) = self.try_append(message).await {
            warn!(path = %self.path.display(), error = %e, "failed to write build log");
        }
    }

    async fn try_append(&self, message: &str) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        let line = format!(
            "[{}] [modci] {}\n",
            Utc::now().format("%Y-%m-%d %H:%M:%S%.3f"),
            message
        );
        file.write_all(line.as_bytes()).await?;
        file.flush().await
    }
}
