//! Working copy synchronisation.
//!
//! [`SourceSynchronizer`] is the seam to the VCS. [`GitCliSynchronizer`]
//! drives the `git` binary, which covers every supported hosting flavour.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use modci_state::VcsKind;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("failed to run {program}: {source}")]
    Io {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("git {operation} failed in {}: {stderr}", .path.display())]
    Git {
        operation: String,
        path: PathBuf,
        stderr: String,
    },

    #[error("repository at {} has no commits", .0.display())]
    EmptyHead(PathBuf),
}

/// VCS operations on a project's working copy.
#[async_trait]
pub trait SourceSynchronizer: Send + Sync {
    async fn has_local_copy(&self, path: &Path) -> bool;

    /// Clone `url` into `path` with `branch` checked out.
    async fn clone_repo(
        &self,
        vcs: VcsKind,
        url: &str,
        path: &Path,
        branch: &str,
    ) -> Result<(), SyncError>;

    /// Switch the working copy to `branch` and bring it up to date.
    async fn checkout_and_pull(
        &self,
        vcs: VcsKind,
        path: &Path,
        branch: &str,
    ) -> Result<(), SyncError>;

    /// Set the working copy to exactly `commit`.
    async fn rollback(&self, vcs: VcsKind, path: &Path, commit: &str) -> Result<(), SyncError>;

    /// Commit currently checked out.
    async fn latest_commit(&self, path: &Path) -> Result<String, SyncError>;
}

/// [`SourceSynchronizer`] backed by the `git` command line.
#[derive(Debug, Clone)]
pub struct GitCliSynchronizer {
    program: String,
}

impl Default for GitCliSynchronizer {
    fn default() -> Self {
        Self {
            program: "git".to_string(),
        }
    }
}

impl GitCliSynchronizer {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    async fn git(&self, dir: &Path, args: &[&str]) -> Result<String, SyncError> {
        debug!(dir = %dir.display(), ?args, "git");
        let output = Command::new(&self.program)
            .args(args)
            .current_dir(dir)
            .env("GIT_TERMINAL_PROMPT", "0")
            .output()
            .await
            .map_err(|source| SyncError::Io {
                program: self.program.clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(SyncError::Git {
                operation: args.first().copied().unwrap_or_default().to_string(),
                path: dir.to_path_buf(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

#[async_trait]
impl SourceSynchronizer for GitCliSynchronizer {
    async fn has_local_copy(&self, path: &Path) -> bool {
        tokio::fs::metadata(path.join(".git")).await.is_ok()
    }

    async fn clone_repo(
        &self,
        vcs: VcsKind,
        url: &str,
        path: &Path,
        branch: &str,
    ) -> Result<(), SyncError> {
        let parent = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|source| SyncError::Io {
                program: self.program.clone(),
                source,
            })?;

        // git runs inside `parent`, so the target is named relative to it.
        let target = path
            .file_name()
            .map(|name| name.to_string_lossy())
            .unwrap_or_else(|| path.to_string_lossy());
        debug!(vcs = vcs.name(), url, branch, path = %path.display(), "cloning");
        self.git(parent, &["clone", "--branch", branch, url, &target])
            .await?;
        Ok(())
    }

    async fn checkout_and_pull(
        &self,
        vcs: VcsKind,
        path: &Path,
        branch: &str,
    ) -> Result<(), SyncError> {
        debug!(vcs = vcs.name(), branch, "updating working copy");
        self.git(path, &["fetch", "origin"]).await?;
        self.git(path, &["checkout", branch]).await?;
        self.git(path, &["pull", "--ff-only", "origin", branch])
            .await?;
        Ok(())
    }

    async fn rollback(&self, vcs: VcsKind, path: &Path, commit: &str) -> Result<(), SyncError> {
        debug!(vcs = vcs.name(), commit, "rolling back working copy");
        // The commit may already be local; an unreachable remote is not fatal.
        if let Err(e) = self.git(path, &["fetch", "--all"]).await {
            warn!(error = %e, "fetch before rollback failed");
        }
        self.git(path, &["reset", "--hard", commit]).await?;
        Ok(())
    }

    async fn latest_commit(&self, path: &Path) -> Result<String, SyncError> {
        let sha = self.git(path, &["rev-parse", "HEAD"]).await?;
        if sha.is_empty() {
            return Err(SyncError::EmptyHead(path.to_path_buf()));
        }
        Ok(sha)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command as StdCommand;

    fn run_git(repo_dir: &Path, args: &[&str]) -> String {
        let output = StdCommand::new("git")
            .args(args)
            .current_dir(repo_dir)
            .output()
            .unwrap();
        assert!(
            output.status.success(),
            "git {:?} failed: {}",
            args,
            String::from_utf8_lossy(&output.stderr)
        );
        String::from_utf8_lossy(&output.stdout).trim().to_string()
    }

    fn commit(repo_dir: &Path, message: &str) -> String {
        run_git(repo_dir, &["commit", "--allow-empty", "-m", message]);
        run_git(repo_dir, &["rev-parse", "HEAD"])
    }

    fn make_origin() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        run_git(dir.path(), &["init"]);
        run_git(dir.path(), &["checkout", "-b", "main"]);
        run_git(dir.path(), &["config", "user.name", "test-user"]);
        run_git(dir.path(), &["config", "user.email", "test@example.com"]);
        commit(dir.path(), "initial");
        dir
    }

    fn url(dir: &Path) -> String {
        dir.to_string_lossy().to_string()
    }

    #[tokio::test]
    async fn test_clone_and_latest_commit() {
        let origin = make_origin();
        let head = run_git(origin.path(), &["rev-parse", "HEAD"]);
        let work = tempfile::tempdir().unwrap();
        let copy = work.path().join("sources/demo");

        let sync = GitCliSynchronizer::default();
        assert!(!sync.has_local_copy(&copy).await);

        sync.clone_repo(VcsKind::Git, &url(origin.path()), &copy, "main")
            .await
            .unwrap();
        assert!(sync.has_local_copy(&copy).await);
        assert_eq!(sync.latest_commit(&copy).await.unwrap(), head);
    }

    #[tokio::test]
    async fn test_clone_into_relative_path() {
        let origin = make_origin();
        let head = run_git(origin.path(), &["rev-parse", "HEAD"]);
        let work = tempfile::tempdir_in(".").unwrap();
        assert!(work.path().is_relative());
        let copy = work.path().join("sources/demo");

        let sync = GitCliSynchronizer::default();
        sync.clone_repo(VcsKind::Git, &url(origin.path()), &copy, "main")
            .await
            .unwrap();

        assert!(sync.has_local_copy(&copy).await);
        assert_eq!(sync.latest_commit(&copy).await.unwrap(), head);
    }

    #[tokio::test]
    async fn test_checkout_and_pull_picks_up_new_commits() {
        let origin = make_origin();
        let work = tempfile::tempdir().unwrap();
        let copy = work.path().join("demo");
        let sync = GitCliSynchronizer::default();
        sync.clone_repo(VcsKind::Github, &url(origin.path()), &copy, "main")
            .await
            .unwrap();

        let newer = commit(origin.path(), "second");
        sync.checkout_and_pull(VcsKind::Github, &copy, "main")
            .await
            .unwrap();
        assert_eq!(sync.latest_commit(&copy).await.unwrap(), newer);
    }

    #[tokio::test]
    async fn test_checkout_switches_branch() {
        let origin = make_origin();
        run_git(origin.path(), &["checkout", "-b", "release"]);
        let release_head = commit(origin.path(), "release only");
        run_git(origin.path(), &["checkout", "main"]);

        let work = tempfile::tempdir().unwrap();
        let copy = work.path().join("demo");
        let sync = GitCliSynchronizer::default();
        sync.clone_repo(VcsKind::Gitlab, &url(origin.path()), &copy, "main")
            .await
            .unwrap();

        sync.checkout_and_pull(VcsKind::Gitlab, &copy, "release")
            .await
            .unwrap();
        assert_eq!(sync.latest_commit(&copy).await.unwrap(), release_head);
    }

    #[tokio::test]
    async fn test_rollback_sets_exact_commit() {
        let origin = make_origin();
        let first = run_git(origin.path(), &["rev-parse", "HEAD"]);
        commit(origin.path(), "second");

        let work = tempfile::tempdir().unwrap();
        let copy = work.path().join("demo");
        let sync = GitCliSynchronizer::default();
        sync.clone_repo(VcsKind::Git, &url(origin.path()), &copy, "main")
            .await
            .unwrap();
        assert_ne!(sync.latest_commit(&copy).await.unwrap(), first);

        sync.rollback(VcsKind::Git, &copy, &first).await.unwrap();
        assert_eq!(sync.latest_commit(&copy).await.unwrap(), first);
    }

    #[tokio::test]
    async fn test_clone_unknown_branch_fails() {
        let origin = make_origin();
        let work = tempfile::tempdir().unwrap();
        let err = GitCliSynchronizer::default()
            .clone_repo(
                VcsKind::Git,
                &url(origin.path()),
                &work.path().join("demo"),
                "no-such-branch",
            )
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Git { ref operation, .. } if operation == "clone"));
    }
}
