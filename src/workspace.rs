//! Per-task workspace provisioning.
//!
//! Each task runs in its own git worktree on its own branch, derived from the
//! base repository. The worktree shares object storage with the base, so
//! provisioning is cheap and tasks cannot trample each other's checkouts.

use std::path::{Path, PathBuf};
use std::process::Output;

use tokio::process::Command;

use crate::error::{AppError, AppResult};

/// Creates and removes task worktrees under a common parent directory.
#[derive(Debug, Clone)]
pub struct WorkspaceManager {
    base_repo: PathBuf,
    worktrees_base: PathBuf,
}

/// Turn a task title into a branch-safe slug: lowercase alphanumerics and
/// hyphens, runs collapsed, at most 20 characters.
pub fn slug(title: &str) -> String {
    let mut out = String::new();
    let mut last_dash = true;
    for c in title.chars() {
        let c = c.to_ascii_lowercase();
        if c.is_ascii_alphanumeric() {
            out.push(c);
            last_dash = false;
        } else if !last_dash {
            out.push('-');
            last_dash = true;
        }
        if out.len() >= 20 {
            break;
        }
    }
    out.truncate(20);
    while out.ends_with('-') {
        out.pop();
    }
    out
}

impl WorkspaceManager {
    pub fn new(base_repo: PathBuf, worktrees_base: PathBuf) -> Self {
        Self {
            base_repo,
            worktrees_base,
        }
    }

    /// The repository a task branches from: its override, or the base repo.
    pub fn resolve_repo(&self, repo_override: Option<&str>) -> PathBuf {
        match repo_override {
            Some(path) if !path.trim().is_empty() => PathBuf::from(path),
            _ => self.base_repo.clone(),
        }
    }

    /// Branch name and worktree path a task will be provisioned under.
    /// Deterministic, so the scheduler can record them at dispatch time.
    pub fn workspace_names(&self, task_id: i64, title: &str) -> (String, PathBuf) {
        let slug = slug(title);
        let branch = if slug.is_empty() {
            format!("task-{}", task_id)
        } else {
            format!("task-{}-{}", task_id, slug)
        };
        let path = self.worktrees_base.join(&branch);
        (branch, path)
    }

    /// Create the worktree and branch for a task. A leftover branch from an
    /// earlier attempt is pruned and force-deleted first.
    pub async fn create_workspace(
        &self,
        task_id: i64,
        title: &str,
        repo_override: Option<&str>,
    ) -> AppResult<(String, PathBuf)> {
        let repo = self.resolve_repo(repo_override);
        let (branch, path) = self.workspace_names(task_id, title);

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| AppError::workspace(format!("failed to create {}: {}", parent.display(), e)))?;
        }

        if self.branch_exists(&repo, &branch).await? {
            // Leftover from an earlier attempt at this task.
            self.prune_workspaces(repo_override).await;
            self.remove_workspace(&path, &branch, true, repo_override)
                .await;
        }

        let path_str = path.to_string_lossy().to_string();
        let out = self
            .run_git(&repo, &["worktree", "add", "-b", &branch, &path_str])
            .await?;
        if !out.status.success() {
            let stderr = String::from_utf8_lossy(&out.stderr);
            return Err(AppError::workspace(format!(
                "worktree creation failed: {}",
                stderr.trim()
            )));
        }

        Ok((branch, path))
    }

    /// Remove a task's worktree and delete its branch. Best-effort and
    /// idempotent: a missing worktree or branch is not an error.
    pub async fn remove_workspace(
        &self,
        path: &Path,
        branch: &str,
        force: bool,
        repo_override: Option<&str>,
    ) {
        let repo = self.resolve_repo(repo_override);
        let path_str = path.to_string_lossy().to_string();

        let mut removed = match self
            .run_git(&repo, &["worktree", "remove", &path_str])
            .await
        {
            Ok(out) => out.status.success(),
            Err(_) => false,
        };
        if !removed && force {
            // git refuses to drop worktrees with untracked files unless forced.
            removed = match self
                .run_git(&repo, &["worktree", "remove", "--force", &path_str])
                .await
            {
                Ok(out) => out.status.success(),
                Err(_) => false,
            };
        }
        if !removed {
            // Already-vanished worktree; clear whatever is left on disk and
            // drop the stale registration.
            if path.exists() {
                let _ = tokio::fs::remove_dir_all(path).await;
            }
            let _ = self.run_git(&repo, &["worktree", "prune"]).await;
        }

        if !branch.is_empty() {
            let _ = self.run_git(&repo, &["branch", "-D", branch]).await;
        }
    }

    /// Discard references to worktree directories that no longer exist.
    pub async fn prune_workspaces(&self, repo_override: Option<&str>) {
        let repo = self.resolve_repo(repo_override);
        let _ = self.run_git(&repo, &["worktree", "prune"]).await;
    }

    async fn branch_exists(&self, repo: &Path, branch: &str) -> AppResult<bool> {
        let reference = format!("refs/heads/{}", branch);
        let out = self
            .run_git(repo, &["rev-parse", "--verify", "--quiet", &reference])
            .await?;
        Ok(out.status.success())
    }

    async fn run_git(&self, repo: &Path, args: &[&str]) -> AppResult<Output> {
        Command::new("git")
            .args(args)
            .current_dir(repo)
            .output()
            .await
            .map_err(|e| AppError::workspace(format!("failed to run git: {}", e)))
    }
}
